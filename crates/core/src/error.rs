/// Errors raised while parsing or normalizing a workflow graph.
///
/// Every variant is fatal to the job that owns the graph and to nothing
/// else.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The bytes are not JSON, or do not match either graph encoding.
    #[error("Invalid workflow JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// The graph is structurally broken: a dangling link, a duplicate
    /// node id, or a pass-through node that cannot be rewired.
    #[error("Malformed workflow graph: {0}")]
    Malformed(String),

    /// No asset-loading node carries the requested title.
    #[error("No {kind} node titled '{title}' in workflow")]
    AssetNodeMissing { kind: String, title: String },
}

impl GraphError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}
