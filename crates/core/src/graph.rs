//! The job graph submitted to ComfyUI for one unit of generative work.
//!
//! A graph is a flat, insertion-ordered map from node id to [`NodeSpec`].
//! This serializes exactly to ComfyUI's API workflow shape:
//! `{"<id>": {"class_type": "...", "inputs": {...}}}`. Node order matters
//! for ordinal selection, so the map is an [`IndexMap`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single node in a job graph: a class identifier plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// The node's class identifier (e.g. `"KSampler"`).
    pub class_type: String,
    /// Parameter name → value. Link inputs (`["4", 0]` pairs) live here
    /// too and are passed through untouched.
    #[serde(default)]
    pub inputs: IndexMap<String, Value>,
    /// Fields ComfyUI attaches that we do not interpret (`_meta` etc.).
    /// Preserved verbatim on round-trip.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl NodeSpec {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: IndexMap::new(),
            extra: IndexMap::new(),
        }
    }

    /// Builder-style parameter assignment, mainly for tests and demos.
    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }
}

/// An insertion-ordered job graph keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobGraph {
    nodes: IndexMap<String, NodeSpec>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, node: NodeSpec) {
        self.nodes.insert(id.into(), node);
    }

    pub fn get(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut NodeSpec> {
        self.nodes.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate nodes in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeSpec)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut NodeSpec)> {
        self.nodes.iter_mut().map(|(id, node)| (id.as_str(), node))
    }

    /// Node ids in declaration order.
    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    /// Remove every node of the given class. Returns how many were removed.
    ///
    /// Used to strip `PreviewImage` nodes before submission so the server
    /// does not spend time rendering previews nobody will see.
    pub fn remove_nodes_of_class(&mut self, class_type: &str) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, node| node.class_type != class_type);
        before - self.nodes.len()
    }
}

impl FromIterator<(String, NodeSpec)> for JobGraph {
    fn from_iter<T: IntoIterator<Item = (String, NodeSpec)>>(iter: T) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}
