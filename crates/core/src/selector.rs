//! Node selection by (class identifier, ordinal).
//!
//! ComfyUI graphs commonly contain several nodes of the same class (two
//! `CLIPTextEncode` nodes for positive/negative prompts, say), so a
//! target is addressed by its class plus a 1-based ordinal among nodes
//! of that class, counted in declaration order.

use serde::Deserialize;

use crate::graph::JobGraph;

/// Addresses one node in a job graph.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeSelector {
    /// Class identifier to match.
    pub class_type: String,
    /// 1-based ordinal among nodes of that class, in declaration order.
    #[serde(default = "default_index", alias = "node_index")]
    pub index: usize,
}

fn default_index() -> usize {
    1
}

impl NodeSelector {
    pub fn new(class_type: impl Into<String>, index: usize) -> Self {
        Self {
            class_type: class_type.into(),
            index,
        }
    }
}

impl std::fmt::Display for NodeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.class_type, self.index)
    }
}

/// Errors from node selection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    /// No node matches the selector: the ordinal is below 1, the class
    /// does not occur, or fewer nodes of that class exist than asked for.
    #[error("no node {selector} in graph ({found} node(s) of class \"{class_type}\")")]
    NodeNotFound {
        selector: String,
        class_type: String,
        found: usize,
    },
}

/// Resolve a selector to a node id.
///
/// Pure: re-selecting with the same graph and selector always yields the
/// same node id.
pub fn select<'a>(graph: &'a JobGraph, selector: &NodeSelector) -> Result<&'a str, SelectError> {
    let matches: Vec<&str> = graph
        .iter()
        .filter(|(_, node)| node.class_type == selector.class_type)
        .map(|(id, _)| id)
        .collect();

    if selector.index >= 1 {
        if let Some(id) = matches.get(selector.index - 1) {
            return Ok(id);
        }
    }

    Err(SelectError::NodeNotFound {
        selector: selector.to_string(),
        class_type: selector.class_type.clone(),
        found: matches.len(),
    })
}
