// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Command-line parsing utilities.

use std::ffi::OsString;

use clap::{Command, FromArgMatches, Parser};

/// A help template for use with clap that does not include the name of the
/// binary or the version in the help output.
const NO_VERSION_HELP_TEMPLATE: &str = "{about}

USAGE:
    {usage}

{all-args}";

/// Configures command-line parsing via [`parse_args`].
#[derive(Debug, Default, Clone)]
pub struct CliConfig<'a> {
    /// An optional prefix to apply to the environment variable name for all
    /// arguments with an environment variable fallback.
    pub env_prefix: Option<&'a str>,
    /// Enable clap's built-in `--version` flag.
    pub enable_version_flag: bool,
}

/// Parses command-line arguments according to a clap `Parser` after
/// applying pgha-specific customizations.
pub fn parse_args<O>(config: CliConfig) -> O
where
    O: Parser,
{
    let command = configure(O::command(), &config);
    let matches = command.get_matches();
    match O::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(e) => e.exit(),
    }
}

/// Like [`parse_args`], but parses the provided iterator rather than the
/// process arguments, returning errors instead of exiting.
pub fn try_parse_args_from<O, I, T>(config: CliConfig, args: I) -> Result<O, clap::Error>
where
    O: Parser,
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let command = configure(O::command(), &config);
    let matches = command.try_get_matches_from(args)?;
    O::from_arg_matches(&matches)
}

fn configure(mut command: Command, config: &CliConfig) -> Command {
    if let Some(prefix) = config.env_prefix {
        command = command.mut_args(|arg| {
            let env = arg
                .get_env()
                .map(|env| format!("{prefix}{}", env.to_string_lossy()));
            match env {
                Some(env) => arg.env(env),
                None => arg,
            }
        });
    }
    command
        .disable_version_flag(!config.enable_version_flag)
        .args_override_self(true)
        .help_template(NO_VERSION_HELP_TEMPLATE)
}

/// Splits a comma-separated command-line value into its trimmed, non-empty
/// parts.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[derive(Debug, clap::Parser)]
    struct Args {
        #[clap(long, env = "NODE_NAME")]
        node_name: String,
        #[clap(long, env = "RETRIES", default_value = "3")]
        retries: u32,
    }

    #[test]
    fn explicit_flags_win() {
        let args: Args = try_parse_args_from(
            CliConfig::default(),
            ["bin", "--node-name", "etcd-1", "--retries", "5"],
        )
        .unwrap();
        assert_eq!(args.node_name, "etcd-1");
        assert_eq!(args.retries, 5);
    }

    #[test]
    fn repeated_flags_override() {
        let args: Args = try_parse_args_from(
            CliConfig::default(),
            ["bin", "--node-name", "a", "--node-name", "b"],
        )
        .unwrap();
        assert_eq!(args.node_name, "b");
    }

    #[test]
    fn missing_required_flag_is_an_error() {
        let res: Result<Args, _> = try_parse_args_from(
            CliConfig {
                env_prefix: Some("PGHA_TEST_UNSET_PREFIX_"),
                enable_version_flag: false,
            },
            ["bin"],
        );
        assert!(res.is_err());
    }

    #[test]
    fn env_prefix_rewrites_env_names() {
        let command = configure(
            Args::command(),
            &CliConfig {
                env_prefix: Some("PGHA_"),
                enable_version_flag: false,
            },
        );
        let envs: Vec<_> = command
            .get_arguments()
            .filter_map(|arg| arg.get_env())
            .map(|env| env.to_string_lossy().into_owned())
            .collect();
        assert_eq!(envs, vec!["PGHA_NODE_NAME", "PGHA_RETRIES"]);
    }

    #[test]
    fn split_list_trims_and_skips_empty() {
        assert_eq!(
            split_list(" a, b ,,c,"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(split_list("").is_empty());
    }
}
