//! Workflow graph encodings and normalization.
//!
//! A workflow arrives in one of two shapes:
//!
//! * the **editor encoding** written by the visual graph editor: an
//!   ordered `nodes` array whose inputs reference a parallel `links`
//!   table ([`EditorGraph`]);
//! * the **canonical encoding** accepted by the backend's `/prompt`
//!   endpoint: an object keyed by node id where each input names its
//!   source node and slot directly ([`CanonicalGraph`]).
//!
//! [`WorkflowGraph::from_slice`] detects which one it was given and
//! [`GraphNormalizer`] turns either into a [`CanonicalGraph`] with all
//! pass-through nodes removed.

pub mod canonical;
pub mod editor;
pub mod normalize;

use std::cmp::Ordering;
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::GraphError;

pub use canonical::{CanonicalGraph, CanonicalNode, Edge, LinkRef, NodeInput, NodeMeta};
pub use editor::{EditorGraph, EditorInput, EditorLink, EditorNode, LinkId, SlotRef};
pub use normalize::GraphNormalizer;

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Stable identifier of a graph node.
///
/// The editor encoding stores ids as integers while the canonical
/// encoding keys nodes by string, so both forms deserialize into the same
/// value. Numeric ids order numerically (`"9"` before `"10"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeIdVisitor;

        impl Visitor<'_> for NodeIdVisitor {
            type Value = NodeId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a node id as a string or a non-negative integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<NodeId, E> {
                Ok(NodeId::from(v))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<NodeId, E> {
                Ok(NodeId::from(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<NodeId, E> {
                Ok(NodeId::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<NodeId, E> {
                u64::try_from(v)
                    .map(NodeId::from)
                    .map_err(|_| E::custom(format!("negative node id {v}")))
            }
        }

        deserializer.deserialize_any(NodeIdVisitor)
    }
}

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// A workflow graph in whichever encoding it was stored.
#[derive(Debug, Clone)]
pub enum WorkflowGraph {
    Editor(EditorGraph),
    Canonical(CanonicalGraph),
}

impl WorkflowGraph {
    /// Parse raw graph bytes, detecting the encoding.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, GraphError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Classify an already-parsed JSON document.
    ///
    /// A top-level `nodes` array marks the editor encoding; any other
    /// object is read as the canonical encoding.
    pub fn from_value(value: serde_json::Value) -> Result<Self, GraphError> {
        let is_editor = value
            .get("nodes")
            .is_some_and(serde_json::Value::is_array);

        if is_editor {
            Ok(Self::Editor(serde_json::from_value(value)?))
        } else {
            Ok(Self::Canonical(CanonicalGraph::from_value(value)?))
        }
    }

    /// Short name of the encoding, for logging.
    pub fn encoding(&self) -> &'static str {
        match self {
            Self::Editor(_) => "editor",
            Self::Canonical(_) => "canonical",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_accepts_integer_and_string() {
        let a: NodeId = serde_json::from_str("42").unwrap();
        let b: NodeId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "42");
    }

    #[test]
    fn node_id_rejects_negative() {
        assert!(serde_json::from_str::<NodeId>("-1").is_err());
    }

    #[test]
    fn numeric_ids_order_numerically() {
        let mut ids = vec![NodeId::from("10"), NodeId::from("9"), NodeId::from("abc")];
        ids.sort();
        assert_eq!(ids, vec![NodeId::from("9"), NodeId::from("10"), NodeId::from("abc")]);
    }

    #[test]
    fn detects_editor_encoding() {
        let json = br#"{"nodes":[{"id":1,"type":"LoadImage"}],"links":[]}"#;
        let graph = WorkflowGraph::from_slice(json).unwrap();
        assert_eq!(graph.encoding(), "editor");
    }

    #[test]
    fn detects_canonical_encoding() {
        let json = br#"{"1":{"class_type":"LoadImage","inputs":{}}}"#;
        let graph = WorkflowGraph::from_slice(json).unwrap();
        assert_eq!(graph.encoding(), "canonical");
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(
            WorkflowGraph::from_slice(b"not json"),
            Err(GraphError::Parse(_))
        ));
    }
}
