//! Conversion of either graph encoding into a pass-through-free
//! [`CanonicalGraph`].
//!
//! Pass-through nodes (`Reroute` in the editor) forward their single
//! input to every output. The backend refuses them, so they are elided
//! here while keeping the connectivity that ran through them.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::canonical::{CanonicalGraph, CanonicalNode, LinkRef, NodeInput, NodeMeta};
use super::editor::{EditorGraph, EditorLink, LinkId};
use super::{NodeId, WorkflowGraph};
use crate::error::GraphError;

/// Node kind the graph editor uses for wire-routing helpers.
pub const DEFAULT_PASS_THROUGH_KIND: &str = "Reroute";

/// Turns workflow graphs into canonical, execution-ready form.
#[derive(Debug, Clone)]
pub struct GraphNormalizer {
    pass_through_kinds: HashSet<String>,
}

impl Default for GraphNormalizer {
    fn default() -> Self {
        Self::new([DEFAULT_PASS_THROUGH_KIND])
    }
}

impl GraphNormalizer {
    /// Create a normalizer treating every kind in `kinds` as pass-through.
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pass_through_kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_pass_through(&self, kind: &str) -> bool {
        self.pass_through_kinds.contains(kind)
    }

    /// Parse raw bytes in either encoding and normalize them.
    pub fn normalize_bytes(&self, bytes: &[u8]) -> Result<CanonicalGraph, GraphError> {
        self.normalize(WorkflowGraph::from_slice(bytes)?)
    }

    pub fn normalize(&self, graph: WorkflowGraph) -> Result<CanonicalGraph, GraphError> {
        match graph {
            WorkflowGraph::Editor(editor) => self.normalize_editor(editor),
            WorkflowGraph::Canonical(canonical) => self.normalize_canonical(canonical),
        }
    }

    // ---- editor encoding ----

    fn normalize_editor(&self, mut graph: EditorGraph) -> Result<CanonicalGraph, GraphError> {
        validate_editor(&graph)?;

        let pass_through: Vec<NodeId> = graph
            .nodes
            .iter()
            .filter(|n| self.is_pass_through(&n.kind))
            .map(|n| n.id.clone())
            .collect();

        // One counter for the whole pass so rewired links never collide.
        let mut next_link_id: LinkId = graph.links.iter().map(|l| l.id).max().map_or(1, |m| m + 1);

        for pt in &pass_through {
            rewire_pass_through(&mut graph, pt, &mut next_link_id)?;
        }

        let removed: HashSet<&NodeId> = pass_through.iter().collect();
        graph.nodes.retain(|n| !removed.contains(&n.id));

        to_canonical(&graph)
    }

    // ---- canonical encoding ----

    /// Remove pass-through nodes from an already-canonical graph.
    ///
    /// Without a link table the only record of a pass-through node's
    /// upstream is its own link input, so every reference to it is
    /// redirected to that source (following chains). Output slots of a
    /// multi-output pass-through node are not told apart.
    fn normalize_canonical(&self, mut graph: CanonicalGraph) -> Result<CanonicalGraph, GraphError> {
        validate_canonical(&graph)?;

        let pass_through: HashSet<NodeId> = graph
            .nodes()
            .filter(|(_, n)| self.is_pass_through(&n.class_type))
            .map(|(id, _)| id.clone())
            .collect();

        if pass_through.is_empty() {
            return Ok(graph);
        }

        tracing::warn!(
            count = pass_through.len(),
            "Pass-through nodes in canonical workflow; redirecting references to their inputs",
        );

        let mut resolved: HashMap<NodeId, LinkRef> = HashMap::new();
        for id in &pass_through {
            let source = resolve_canonical_source(&graph, &pass_through, id)?;
            resolved.insert(id.clone(), source);
        }

        for id in &pass_through {
            graph.remove(id);
        }

        for (node_id, node) in graph.nodes_mut() {
            for (name, input) in node.inputs.iter_mut() {
                if let NodeInput::Link(link) = input {
                    if let Some(source) = resolved.get(link.node()) {
                        tracing::debug!(
                            node = %node_id,
                            input = %name,
                            from = %link.node(),
                            to = %source.node(),
                            "Redirected pass-through reference",
                        );
                        *link = source.clone();
                    }
                }
            }
        }

        Ok(graph)
    }
}

/// Check node id uniqueness and that every link endpoint exists.
fn validate_editor(graph: &EditorGraph) -> Result<(), GraphError> {
    let mut ids = HashSet::new();
    for node in &graph.nodes {
        if !ids.insert(&node.id) {
            return Err(GraphError::malformed(format!("duplicate node id {}", node.id)));
        }
    }

    let mut link_ids = HashSet::new();
    for link in &graph.links {
        if !link_ids.insert(link.id) {
            return Err(GraphError::malformed(format!("duplicate link id {}", link.id)));
        }
        for endpoint in [&link.source, &link.target] {
            if !ids.contains(endpoint) {
                return Err(GraphError::malformed(format!(
                    "link {} references missing node {endpoint}",
                    link.id
                )));
            }
        }
    }

    Ok(())
}

/// Replace the links through pass-through node `pt` by direct links from
/// its upstream source to each downstream target.
fn rewire_pass_through(
    graph: &mut EditorGraph,
    pt: &NodeId,
    next_link_id: &mut LinkId,
) -> Result<(), GraphError> {
    let incoming: Vec<&EditorLink> = graph.links.iter().filter(|l| &l.target == pt).collect();
    let outgoing: Vec<EditorLink> = graph
        .links
        .iter()
        .filter(|l| &l.source == pt)
        .cloned()
        .collect();

    let upstream = match incoming.as_slice() {
        [only] => (only.source.clone(), only.source_slot),
        [] => {
            return Err(GraphError::malformed(format!(
                "pass-through node {pt} has no incoming link"
            )))
        }
        many => {
            return Err(GraphError::malformed(format!(
                "pass-through node {pt} has {} incoming links",
                many.len()
            )))
        }
    };

    if outgoing.is_empty() {
        return Err(GraphError::malformed(format!(
            "pass-through node {pt} has no outgoing links"
        )));
    }

    let mut replacements: HashMap<LinkId, LinkId> = HashMap::new();
    let mut created = Vec::with_capacity(outgoing.len());
    for out in &outgoing {
        let id = *next_link_id;
        *next_link_id += 1;

        tracing::debug!(
            pass_through = %pt,
            link_id = id,
            source = %upstream.0,
            source_slot = upstream.1,
            target = %out.target,
            target_slot = %out.target_slot,
            "Rewired pass-through link",
        );

        replacements.insert(out.id, id);
        created.push(EditorLink {
            id,
            source: upstream.0.clone(),
            source_slot: upstream.1,
            target: out.target.clone(),
            target_slot: out.target_slot.clone(),
            data_type: out.data_type.clone(),
        });
    }

    graph.links.retain(|l| &l.source != pt && &l.target != pt);
    graph.links.extend(created);

    for node in &mut graph.nodes {
        for input in &mut node.inputs {
            if let Some(new_id) = input.link.and_then(|old| replacements.get(&old)) {
                input.link = Some(*new_id);
            }
        }
    }

    Ok(())
}

/// Convert a pass-through-free editor graph, resolving every connected
/// input through the link table.
fn to_canonical(graph: &EditorGraph) -> Result<CanonicalGraph, GraphError> {
    let links: HashMap<LinkId, &EditorLink> = graph.links.iter().map(|l| (l.id, l)).collect();
    let mut canonical = CanonicalGraph::new();

    for node in &graph.nodes {
        let mut inputs = BTreeMap::new();
        for input in &node.inputs {
            let Some(link_id) = input.link else {
                continue;
            };
            let link = links.get(&link_id).ok_or_else(|| {
                GraphError::malformed(format!(
                    "input '{}' of node {} references missing link {link_id}",
                    input.name, node.id
                ))
            })?;
            if link.target != node.id {
                return Err(GraphError::malformed(format!(
                    "input '{}' of node {} uses link {link_id} which targets node {}",
                    input.name, node.id, link.target
                )));
            }
            inputs.insert(
                input.name.clone(),
                NodeInput::Link(LinkRef(link.source.clone(), link.source_slot)),
            );
        }

        let mut out = CanonicalNode::new(node.kind.clone());
        out.inputs = inputs;
        out.widgets_values = node.widgets_values.clone();
        out.meta = node.title.clone().map(|title| NodeMeta { title: Some(title) });
        canonical.insert(node.id.clone(), out);
    }

    Ok(canonical)
}

/// Check that every link input names a node present in the graph.
fn validate_canonical(graph: &CanonicalGraph) -> Result<(), GraphError> {
    for (id, node) in graph.nodes() {
        for (name, link) in node.link_inputs() {
            if !graph.contains(link.node()) {
                return Err(GraphError::malformed(format!(
                    "input '{name}' of node {id} references missing node {}",
                    link.node()
                )));
            }
        }
    }
    Ok(())
}

/// Follow pass-through node `id` upstream to the first real source.
fn resolve_canonical_source(
    graph: &CanonicalGraph,
    pass_through: &HashSet<NodeId>,
    id: &NodeId,
) -> Result<LinkRef, GraphError> {
    let mut current = id.clone();
    let mut seen = HashSet::new();

    loop {
        if !seen.insert(current.clone()) {
            return Err(GraphError::malformed(format!(
                "pass-through cycle through node {current}"
            )));
        }

        let node = graph
            .get(&current)
            .ok_or_else(|| GraphError::malformed(format!("missing node {current}")))?;
        let links: Vec<&LinkRef> = node.link_inputs().map(|(_, link)| link).collect();
        let source = match links.as_slice() {
            [only] => (*only).clone(),
            [] => {
                return Err(GraphError::malformed(format!(
                    "pass-through node {current} has no incoming link"
                )))
            }
            many => {
                return Err(GraphError::malformed(format!(
                    "pass-through node {current} has {} incoming links",
                    many.len()
                )))
            }
        };

        if !pass_through.contains(source.node()) {
            return Ok(source);
        }
        current = source.node().clone();
    }
}
