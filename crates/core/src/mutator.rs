//! The workflow mutator: applies declarative mutations to a job graph
//! and randomizes untouched seed-like parameters.
//!
//! The template graph is never modified in place; callers reuse one
//! template across many tasks. Mutations are applied in order and the
//! first failure aborts the whole pass, so a partially-mutated graph is
//! never observable.

use std::collections::HashSet;

use rand::{Rng, RngCore};
use serde::Deserialize;
use serde_json::Value;

use crate::graph::JobGraph;
use crate::resolver::{resolve, ResolveError, ValueRegistry};
use crate::selector::{select, NodeSelector, SelectError};
use crate::value::ValueSpec;

/// Upper bound for generated seeds, matching ComfyUI's 32-bit seed space.
pub const MAX_SEED: u64 = u32::MAX as u64;

/// One declarative parameter change: which node, which parameter, and
/// how to produce the value.
#[derive(Debug, Clone, Deserialize)]
pub struct Mutation {
    #[serde(flatten)]
    pub selector: NodeSelector,
    /// Name of the parameter to overwrite in the node's inputs.
    #[serde(alias = "item_name", alias = "parameter_name")]
    pub param: String,
    pub value: ValueSpec,
}

impl Mutation {
    pub fn new(selector: NodeSelector, param: impl Into<String>, value: ValueSpec) -> Self {
        Self {
            selector,
            param: param.into(),
            value,
        }
    }
}

/// Which parameter names count as seed-like.
///
/// Any numeric parameter with one of these names that is not explicitly
/// targeted by a mutation gets a fresh random integer on every pass, so
/// repeated runs of the same task never reuse a generative seed. The
/// rule is name-based and configurable rather than tied to a node-class
/// catalog.
#[derive(Debug, Clone)]
pub struct SeedPolicy {
    names: Vec<String>,
}

impl Default for SeedPolicy {
    fn default() -> Self {
        Self {
            names: vec!["seed".into(), "noise_seed".into()],
        }
    }
}

impl SeedPolicy {
    /// Recognize exactly the given parameter names.
    pub fn with_names(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// A policy that randomizes nothing.
    pub fn disabled() -> Self {
        Self { names: Vec::new() }
    }

    pub fn is_seed_param(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// Errors from a mutation pass. The failing mutation is identified by
/// its position in the task's mutation list.
#[derive(Debug, thiserror::Error)]
pub enum MutateError {
    #[error("mutation {index} ({selector}): {source}")]
    Select {
        index: usize,
        selector: String,
        #[source]
        source: SelectError,
    },

    #[error("mutation {index} ({selector}.{param}): {source}")]
    Resolve {
        index: usize,
        selector: String,
        param: String,
        #[source]
        source: ResolveError,
    },
}

impl MutateError {
    /// Position of the offending mutation in the input list.
    pub fn mutation_index(&self) -> usize {
        match self {
            Self::Select { index, .. } | Self::Resolve { index, .. } => *index,
        }
    }
}

/// Apply `mutations` to a copy of `graph`, then randomize seed-like
/// parameters the mutations did not touch.
///
/// The returned graph contains only concrete scalars and has the same
/// node ids and class identifiers as the input.
pub fn mutate(
    graph: &JobGraph,
    mutations: &[Mutation],
    policy: &SeedPolicy,
    registry: &ValueRegistry,
    rng: &mut dyn RngCore,
) -> Result<JobGraph, MutateError> {
    let mut working = graph.clone();
    let mut touched: HashSet<(String, String)> = HashSet::new();

    for (index, mutation) in mutations.iter().enumerate() {
        let node_id = select(&working, &mutation.selector)
            .map_err(|source| MutateError::Select {
                index,
                selector: mutation.selector.to_string(),
                source,
            })?
            .to_owned();

        let value =
            resolve(&mutation.value, registry, rng).map_err(|source| MutateError::Resolve {
                index,
                selector: mutation.selector.to_string(),
                param: mutation.param.clone(),
                source,
            })?;

        // Selection succeeded, so the node exists.
        if let Some(node) = working.get_mut(&node_id) {
            tracing::debug!(
                node_id = %node_id,
                class_type = %mutation.selector.class_type,
                param = %mutation.param,
                new_value = %value,
                "Applying mutation",
            );
            node.inputs.insert(mutation.param.clone(), value);
        }
        touched.insert((node_id, mutation.param.clone()));
    }

    randomize_seeds(&mut working, policy, &touched, rng);

    Ok(working)
}

/// Overwrite every untouched, numeric, seed-like parameter with a fresh
/// random integer in `0..=MAX_SEED`.
fn randomize_seeds(
    graph: &mut JobGraph,
    policy: &SeedPolicy,
    touched: &HashSet<(String, String)>,
    rng: &mut dyn RngCore,
) {
    for (node_id, node) in graph.iter_mut() {
        for (param, value) in node.inputs.iter_mut() {
            if !policy.is_seed_param(param) {
                continue;
            }
            if touched.contains(&(node_id.to_owned(), param.clone())) {
                continue;
            }
            if !value.is_number() {
                continue;
            }

            let seed = rng.random_range(0..=MAX_SEED);
            tracing::debug!(
                node_id,
                class_type = %node.class_type,
                param = %param,
                seed,
                "Randomized seed parameter",
            );
            *value = Value::from(seed);
        }
    }
}
