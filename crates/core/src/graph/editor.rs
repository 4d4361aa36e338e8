//! The editor encoding: an ordered node list plus a separate link table.
//!
//! ```json
//! {
//!   "nodes": [{"id": 3, "type": "VAEDecode", "title": "...",
//!              "inputs": [{"name": "samples", "link": 7}],
//!              "widgets_values": []}],
//!   "links": [[7, 2, 0, 3, "samples", "LATENT"]]
//! }
//! ```
//!
//! Each link row is `[linkId, sourceNodeId, sourceSlot, targetNodeId,
//! targetSlot, type?]`. The target slot is an input name in hand-written
//! graphs and an input index in editor exports; both are accepted.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use super::NodeId;

/// Link identifier inside an editor graph.
pub type LinkId = u64;

/// A workflow graph in the editor encoding.
#[derive(Debug, Clone, Deserialize)]
pub struct EditorGraph {
    pub nodes: Vec<EditorNode>,
    #[serde(default)]
    pub links: Vec<EditorLink>,
}

/// One node of an editor graph.
#[derive(Debug, Clone, Deserialize)]
pub struct EditorNode {
    pub id: NodeId,
    /// Node kind (`"LoadImage"`, `"Reroute"`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub inputs: Vec<EditorInput>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub widgets_values: Vec<serde_json::Value>,
}

/// A declared input slot on an editor node.
#[derive(Debug, Clone, Deserialize)]
pub struct EditorInput {
    pub name: String,
    /// Link feeding this input, or `None` when the slot is unconnected.
    #[serde(default)]
    pub link: Option<LinkId>,
}

/// Target slot of a link: an input name or a positional index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotRef {
    Index(u32),
    Name(String),
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Name(n) => f.write_str(n),
        }
    }
}

/// A row of the editor link table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<serde_json::Value>")]
pub struct EditorLink {
    pub id: LinkId,
    pub source: NodeId,
    pub source_slot: u32,
    pub target: NodeId,
    pub target_slot: SlotRef,
    /// Data type label carried by editor exports (`"IMAGE"`, ...).
    pub data_type: Option<String>,
}

impl TryFrom<Vec<serde_json::Value>> for EditorLink {
    type Error = String;

    fn try_from(row: Vec<serde_json::Value>) -> Result<Self, Self::Error> {
        if row.len() < 5 {
            return Err(format!(
                "link row needs at least 5 elements, got {}",
                row.len()
            ));
        }

        Ok(Self {
            id: column(&row, 0, "link id")?,
            source: column(&row, 1, "source node")?,
            source_slot: column(&row, 2, "source slot")?,
            target: column(&row, 3, "target node")?,
            target_slot: column(&row, 4, "target slot")?,
            data_type: match row.get(5) {
                Some(v) if !v.is_null() => Some(column(&row, 5, "data type")?),
                _ => None,
            },
        })
    }
}

fn column<T: DeserializeOwned>(
    row: &[serde_json::Value],
    index: usize,
    what: &str,
) -> Result<T, String> {
    serde_json::from_value(row[index].clone())
        .map_err(|e| format!("invalid {what} at link column {index}: {e}"))
}

fn null_as_empty<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<serde_json::Value>, D::Error> {
    Ok(Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_link_with_named_slot() {
        let link: EditorLink = serde_json::from_str(r#"[7, 2, 0, 3, "samples"]"#).unwrap();
        assert_eq!(link.id, 7);
        assert_eq!(link.source, NodeId::from("2"));
        assert_eq!(link.target_slot, SlotRef::Name("samples".into()));
        assert!(link.data_type.is_none());
    }

    #[test]
    fn parses_export_link_with_index_and_type() {
        let link: EditorLink = serde_json::from_str(r#"[7, 2, 1, 3, 0, "IMAGE"]"#).unwrap();
        assert_eq!(link.source_slot, 1);
        assert_eq!(link.target_slot, SlotRef::Index(0));
        assert_eq!(link.data_type.as_deref(), Some("IMAGE"));
    }

    #[test]
    fn short_link_row_is_rejected() {
        assert!(serde_json::from_str::<EditorLink>("[7, 2, 0]").is_err());
    }

    #[test]
    fn null_widgets_become_empty() {
        let node: EditorNode =
            serde_json::from_str(r#"{"id": 1, "type": "Reroute", "widgets_values": null}"#)
                .unwrap();
        assert!(node.widgets_values.is_empty());
        assert!(node.inputs.is_empty());
    }
}
