// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The registry-assigned identifier of a cluster member.
///
/// The gateway encodes 64-bit integers as JSON strings; both strings and
/// numbers are accepted when decoding, and strings are produced when
/// encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(pub u64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl Serialize for MemberId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for MemberId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(U64Visitor).map(MemberId)
    }
}

/// Decodes a `u64` that may be encoded as a JSON string or number.
pub(crate) struct U64Visitor;

impl<'de> Visitor<'de> for U64Visitor {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an unsigned 64-bit integer or its decimal string form")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
        u64::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
        v.parse()
            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

/// Deserializes a gateway counter encoded as a string or a number.
pub(crate) fn deserialize_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    deserializer.deserialize_any(U64Visitor)
}

/// A member of the registry cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The member's identifier.
    #[serde(rename = "ID")]
    pub id: MemberId,
    /// The member's name. Empty until the member has started.
    #[serde(default)]
    pub name: String,
    /// The URLs on which the member talks to its peers.
    #[serde(rename = "peerURLs", default)]
    pub peer_urls: Vec<String>,
    /// The URLs on which the member serves clients. Empty until the member
    /// has started.
    #[serde(rename = "clientURLs", default)]
    pub client_urls: Vec<String>,
    /// Whether the member is a non-voting learner.
    #[serde(rename = "isLearner", default)]
    pub is_learner: bool,
}

impl Member {
    /// Reports whether this entry describes the node with the given name or
    /// peer URL. A member that has not started yet has no name, so it can
    /// only be recognized by its peer URL.
    pub fn is_node(&self, name: &str, peer_url: &str) -> bool {
        (!self.name.is_empty() && self.name == name)
            || self.peer_urls.iter().any(|u| u.trim_end_matches('/') == peer_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_gateway_member() {
        let member: Member = serde_json::from_str(
            r#"{"ID":"10501334649042878790","name":"etcd-2",
                "peerURLs":["http://etcd-2:2380"],"clientURLs":["http://etcd-2:2379"],
                "isLearner":true}"#,
        )
        .unwrap();
        assert_eq!(member.id, MemberId(10501334649042878790));
        assert!(member.is_learner);
        assert!(member.is_node("etcd-2", "http://other:2380"));
    }

    #[test]
    fn decodes_unstarted_member_with_numeric_id() {
        let member: Member =
            serde_json::from_str(r#"{"ID":42,"peerURLs":["http://etcd-3:2380/"]}"#).unwrap();
        assert_eq!(member.id, MemberId(42));
        assert_eq!(member.name, "");
        assert!(!member.is_learner);
        assert!(member.is_node("etcd-3", "http://etcd-3:2380"));
        assert!(!member.is_node("", "http://etcd-1:2380"));
    }

    #[test]
    fn encodes_id_as_string() {
        assert_eq!(
            serde_json::to_string(&MemberId(7)).unwrap(),
            r#""7""#
        );
        assert!(serde_json::from_str::<MemberId>(r#""-1""#).is_err());
    }
}
