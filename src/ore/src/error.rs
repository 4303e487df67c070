// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Error utilities.

use std::error::Error;
use std::fmt;

/// Extension methods for [`std::error::Error`].
pub trait ErrorExt: Error {
    /// Returns a type that displays the error, along with the chain of
    /// _source_ errors or causes, if there are any, separated by `: `.
    ///
    /// ```
    /// use pgha_ore::error::ErrorExt;
    ///
    /// let err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
    /// assert_eq!(err.display_with_causes().to_string(), "disk full");
    /// ```
    fn display_with_causes(&self) -> ErrorChainFormatter<&Self> {
        ErrorChainFormatter(self)
    }

    /// Like [`ErrorExt::display_with_causes`], but returns an owned string.
    fn to_string_with_causes(&self) -> String {
        self.display_with_causes().to_string()
    }
}

impl<E: Error + ?Sized> ErrorExt for E {}

/// Formats an error with its full chain of causes.
#[derive(Debug)]
pub struct ErrorChainFormatter<E>(E);

impl<E: Error> fmt::Display for ErrorChainFormatter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)?;
        let mut maybe_cause = self.0.source();
        while let Some(cause) = maybe_cause {
            write!(f, ": {}", cause)?;
            maybe_cause = cause.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("starting etcd")]
    struct Outer(#[source] Middle);

    #[derive(Debug, thiserror::Error)]
    #[error("spawning process")]
    struct Middle(#[source] std::io::Error);

    #[test]
    fn chain_is_joined() {
        let err = Outer(Middle(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        )));
        assert_eq!(
            err.to_string_with_causes(),
            "starting etcd: spawning process: no such file"
        );
    }

    #[test]
    fn works_on_anyhow_errors() {
        let err = anyhow::anyhow!("inner").context("outer");
        let boxed: Box<dyn Error + Send + Sync> = err.into();
        assert_eq!(boxed.display_with_causes().to_string(), "outer: inner");
    }
}
