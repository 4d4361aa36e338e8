//! The canonical encoding submitted to the backend's `/prompt` endpoint.
//!
//! ```json
//! {
//!   "3": {"class_type": "VAEDecode",
//!         "inputs": {"samples": ["2", 0], "vae": ["1", 2]},
//!         "widgets_values": []}
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::NodeId;
use crate::error::GraphError;

/// Reference to an output slot of another node: `[sourceNodeId, sourceSlot]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkRef(pub NodeId, pub u32);

impl LinkRef {
    pub fn node(&self) -> &NodeId {
        &self.0
    }

    pub fn slot(&self) -> u32 {
        self.1
    }
}

/// Value of a canonical input: either a link to another node's output or
/// a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeInput {
    Link(LinkRef),
    Value(serde_json::Value),
}

impl NodeInput {
    pub fn as_link(&self) -> Option<&LinkRef> {
        match self {
            Self::Link(link) => Some(link),
            Self::Value(_) => None,
        }
    }
}

/// Display metadata the backend ignores but keeps round-tripping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One node of the canonical graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalNode {
    pub class_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, NodeInput>,
    #[serde(default)]
    pub widgets_values: Vec<serde_json::Value>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<NodeMeta>,
    /// Title stored at node level by hand-edited canonical files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl CanonicalNode {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: BTreeMap::new(),
            widgets_values: Vec::new(),
            meta: None,
            title: None,
        }
    }

    /// Human-readable title from `_meta.title`, falling back to `title`.
    pub fn display_title(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|m| m.title.as_deref())
            .or(self.title.as_deref())
    }

    /// Iterate over the inputs that are links to other nodes.
    pub fn link_inputs(&self) -> impl Iterator<Item = (&String, &LinkRef)> {
        self.inputs
            .iter()
            .filter_map(|(name, input)| input.as_link().map(|link| (name, link)))
    }
}

/// A directed connection in a canonical graph, used to compare graphs
/// independently of link ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub source: NodeId,
    pub source_slot: u32,
    pub target: NodeId,
    pub target_input: String,
}

/// A workflow graph in the canonical encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CanonicalGraph {
    nodes: BTreeMap<NodeId, CanonicalNode>,
}

impl CanonicalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a canonical document.
    ///
    /// Top-level entries that are not node objects (no `class_type`), such
    /// as an `extra` block, are skipped.
    pub fn from_value(value: serde_json::Value) -> Result<Self, GraphError> {
        let serde_json::Value::Object(entries) = value else {
            return Err(GraphError::malformed(
                "canonical workflow must be a JSON object keyed by node id",
            ));
        };

        let mut nodes = BTreeMap::new();
        for (key, entry) in entries {
            if entry.get("class_type").is_none() {
                tracing::debug!(key = %key, "Skipping non-node entry in canonical workflow");
                continue;
            }
            let node: CanonicalNode = serde_json::from_value(entry)?;
            nodes.insert(NodeId::from(key), node);
        }

        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&CanonicalNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut CanonicalNode> {
        self.nodes.get_mut(id)
    }

    pub fn insert(&mut self, id: NodeId, node: CanonicalNode) -> Option<CanonicalNode> {
        self.nodes.insert(id, node)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<CanonicalNode> {
        self.nodes.remove(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &CanonicalNode)> {
        self.nodes.iter()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut CanonicalNode)> {
        self.nodes.iter_mut()
    }

    /// All link inputs as source/target pairs, sorted.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .nodes
            .iter()
            .flat_map(|(target, node)| {
                node.link_inputs().map(move |(name, link)| Edge {
                    source: link.node().clone(),
                    source_slot: link.slot(),
                    target: target.clone(),
                    target_input: name.clone(),
                })
            })
            .collect();
        edges.sort();
        edges
    }

    /// Number of nodes whose kind satisfies `pred`.
    pub fn count_kind(&self, pred: impl Fn(&str) -> bool) -> usize {
        self.nodes.values().filter(|n| pred(&n.class_type)).count()
    }

    /// Find the node of `kind` titled `title`.
    pub fn find_titled(&self, kind: &str, title: &str) -> Option<&NodeId> {
        self.nodes
            .iter()
            .find(|(_, node)| node.class_type == kind && node.display_title() == Some(title))
            .map(|(id, _)| id)
    }

    /// Write an uploaded asset's server name into the asset node titled
    /// `title`.
    ///
    /// The name goes to `widgets_values[0]`, and also replaces a literal
    /// `image` input when the node carries one. Returns the id of the
    /// updated node.
    pub fn bind_asset(
        &mut self,
        kind: &str,
        title: &str,
        server_name: &str,
    ) -> Result<NodeId, GraphError> {
        let id = self
            .find_titled(kind, title)
            .cloned()
            .ok_or_else(|| GraphError::AssetNodeMissing {
                kind: kind.to_string(),
                title: title.to_string(),
            })?;

        // Present: `find_titled` just returned this id.
        if let Some(node) = self.nodes.get_mut(&id) {
            let name = serde_json::Value::String(server_name.to_string());
            match node.widgets_values.first_mut() {
                Some(first) => *first = name.clone(),
                None => node.widgets_values.push(name.clone()),
            }
            if let Some(NodeInput::Value(value)) = node.inputs.get_mut("image") {
                *value = name;
            }
        }

        Ok(id)
    }

    /// Serialize to the JSON value placed under `prompt` on submission.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
