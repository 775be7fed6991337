//! In-memory task descriptions.
//!
//! A task pairs a workflow template with an ordered mutation list. The
//! shape deserializes from the same JSON the legacy config files used
//! (`nodes` / `item_name` / `node_index` aliases), but producing the
//! structure — reading files, resolving template paths — is the config
//! loader's job, not ours.

use serde::Deserialize;

use crate::graph::JobGraph;
use crate::mutator::Mutation;

/// Class identifier of preview-only nodes stripped before submission.
pub const PREVIEW_CLASS: &str = "PreviewImage";

/// Malformed task description. The task is skipped; nothing is submitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value spec: {0}")]
    ValueSpec(String),

    #[error("invalid mutation {index}: {reason}")]
    Mutation { index: usize, reason: String },
}

/// One unit of work: a template graph plus the mutations to apply.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDescription {
    /// The workflow template to mutate and submit.
    #[serde(alias = "workflow")]
    pub graph: JobGraph,

    /// Ordered parameter mutations.
    #[serde(default, alias = "nodes")]
    pub mutations: Vec<Mutation>,

    /// Strip `PreviewImage` nodes before mutation and submission.
    #[serde(default = "default_true")]
    pub strip_previews: bool,
}

fn default_true() -> bool {
    true
}

impl TaskDescription {
    pub fn new(graph: JobGraph) -> Self {
        Self {
            graph,
            mutations: Vec::new(),
            strip_previews: true,
        }
    }

    /// Structural checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if mutation.selector.class_type.is_empty() {
                return Err(ConfigError::Mutation {
                    index,
                    reason: "class_type must not be empty".into(),
                });
            }
            if mutation.param.is_empty() {
                return Err(ConfigError::Mutation {
                    index,
                    reason: "parameter name must not be empty".into(),
                });
            }
            if mutation.selector.index < 1 {
                return Err(ConfigError::Mutation {
                    index,
                    reason: "node_index is 1-based and must be >= 1".into(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::NodeSelector;
    use crate::value::ValueSpec;
    use serde_json::json;

    #[test]
    fn deserializes_legacy_config_shape() {
        let task: TaskDescription = serde_json::from_value(json!({
            "workflow": {
                "1": {"class_type": "Class1", "inputs": {"param1": 0}}
            },
            "nodes": [
                {"class_type": "Class1", "item_name": "param1", "value": 42, "node_index": 1}
            ]
        }))
        .unwrap();

        assert_eq!(task.graph.len(), 1);
        assert_eq!(task.mutations.len(), 1);
        assert!(task.strip_previews);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn mutations_default_to_empty() {
        let task: TaskDescription = serde_json::from_value(json!({
            "graph": {"1": {"class_type": "Loader", "inputs": {}}}
        }))
        .unwrap();
        assert!(task.mutations.is_empty());
    }

    #[test]
    fn validate_rejects_empty_names() {
        let mut task = TaskDescription::new(JobGraph::new());
        task.mutations.push(Mutation::new(
            NodeSelector::new("", 1),
            "param",
            ValueSpec::Fixed(json!(1)),
        ));
        assert!(matches!(
            task.validate(),
            Err(ConfigError::Mutation { index: 0, .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_index() {
        let mut task = TaskDescription::new(JobGraph::new());
        task.mutations.push(Mutation::new(
            NodeSelector::new("KSampler", 0),
            "seed",
            ValueSpec::Fixed(json!(1)),
        ));
        assert!(task.validate().is_err());
    }
}
