// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Returns the exclusive end of the key range that covers every key starting
/// with `prefix`.
///
/// This is `prefix` with its last byte incremented, after dropping trailing
/// `0xff` bytes. A prefix made only of `0xff` bytes, or an empty prefix,
/// yields `[0]`, which the registry interprets as "every key from the start
/// key onwards".
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

pub(crate) fn encode(key: &[u8]) -> String {
    STANDARD.encode(key)
}
