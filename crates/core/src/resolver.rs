//! Resolution of [`ValueSpec`]s into concrete scalars.
//!
//! The RNG is always injected so resolution is reproducible under a
//! seeded generator in tests while production draws from `rand::rng()`.
//! Extension tags dispatch through [`ValueRegistry`], an explicit map
//! populated at process start; adding a value type means adding one
//! entry, never patching the resolver.

use std::collections::HashMap;

use indexmap::IndexMap;
use rand::seq::IndexedRandom;
use rand::{Rng, RngCore};
use serde_json::{Number, Value};

use crate::value::ValueSpec;

/// Errors from value resolution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    /// The spec's tag has no registered handler.
    #[error("unsupported value type \"{0}\"")]
    UnsupportedValueType(String),

    /// `random_range` with min > max (or a non-finite bound).
    #[error("invalid range: min {min} > max {max}")]
    InvalidRange { min: f64, max: f64 },

    /// `random_choice` with an empty choice list.
    #[error("random_choice requires a non-empty choice list")]
    EmptyChoices,

    /// A registered extension handler rejected its parameters.
    #[error("handler \"{tag}\" failed: {message}")]
    Handler { tag: String, message: String },
}

/// Resolution function for one extension tag.
///
/// Receives the spec's parameter map (everything except the `type` key)
/// and the injected RNG.
pub type ResolveFn =
    Box<dyn Fn(&IndexMap<String, Value>, &mut dyn RngCore) -> Result<Value, ResolveError> + Send + Sync>;

/// Open registry of extension tags.
#[derive(Default)]
pub struct ValueRegistry {
    handlers: HashMap<String, ResolveFn>,
}

impl ValueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a tag, replacing any previous one.
    pub fn register(
        &mut self,
        tag: impl Into<String>,
        handler: impl Fn(&IndexMap<String, Value>, &mut dyn RngCore) -> Result<Value, ResolveError>
            + Send
            + Sync
            + 'static,
    ) {
        self.handlers.insert(tag.into(), Box::new(handler));
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    fn get(&self, tag: &str) -> Option<&ResolveFn> {
        self.handlers.get(tag)
    }
}

impl std::fmt::Debug for ValueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueRegistry")
            .field("tags", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Resolve a spec into a concrete scalar.
///
/// The only side effect is consuming entropy from `rng`.
pub fn resolve(
    spec: &ValueSpec,
    registry: &ValueRegistry,
    rng: &mut dyn RngCore,
) -> Result<Value, ResolveError> {
    match spec {
        ValueSpec::Fixed(value) => Ok(value.clone()),
        ValueSpec::RandomRange { min, max } => resolve_range(min, max, rng),
        ValueSpec::RandomChoice(choices) => choices
            .as_slice()
            .choose(rng)
            .cloned()
            .ok_or(ResolveError::EmptyChoices),
        ValueSpec::Custom { tag, params } => match registry.get(tag) {
            Some(handler) => handler(params, rng),
            None => Err(ResolveError::UnsupportedValueType(tag.clone())),
        },
    }
}

/// An integer range yields an integer; a float bound yields a float
/// rounded to six decimal places. Keeping the distinction explicit
/// avoids fractional seeds where the server expects an integer.
fn resolve_range(min: &Number, max: &Number, rng: &mut dyn RngCore) -> Result<Value, ResolveError> {
    if let (Some(lo), Some(hi)) = (min.as_i64(), max.as_i64()) {
        if lo > hi {
            return Err(ResolveError::InvalidRange {
                min: lo as f64,
                max: hi as f64,
            });
        }
        return Ok(Value::from(rng.random_range(lo..=hi)));
    }

    let lo = min.as_f64().unwrap_or(f64::NAN);
    let hi = max.as_f64().unwrap_or(f64::NAN);
    if !(lo <= hi) {
        return Err(ResolveError::InvalidRange { min: lo, max: hi });
    }

    let drawn: f64 = rng.random_range(lo..=hi);
    let rounded = (drawn * 1e6).round() / 1e6;
    Number::from_f64(rounded)
        .map(Value::Number)
        .ok_or(ResolveError::InvalidRange { min: lo, max: hi })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn spec(raw: Value) -> ValueSpec {
        ValueSpec::from_wire(raw).unwrap()
    }

    #[test]
    fn fixed_passes_through_unchanged() {
        let registry = ValueRegistry::new();
        let out = resolve(&spec(json!("img.png")), &registry, &mut rng()).unwrap();
        assert_eq!(out, json!("img.png"));
    }

    #[test]
    fn integer_range_yields_integer_within_bounds() {
        let registry = ValueRegistry::new();
        let s = spec(json!({"type": "random_range", "min": 10, "max": 20}));
        let mut r = rng();
        for _ in 0..50 {
            let out = resolve(&s, &registry, &mut r).unwrap();
            let v = out.as_i64().expect("integer range must yield an integer");
            assert!((10..=20).contains(&v));
        }
    }

    #[test]
    fn float_range_yields_float_within_bounds() {
        let registry = ValueRegistry::new();
        let s = spec(json!({"type": "random_range", "min": 0.5, "max": 10.5}));
        let mut r = rng();
        for _ in 0..50 {
            let out = resolve(&s, &registry, &mut r).unwrap();
            let v = out.as_f64().unwrap();
            assert!((0.5..=10.5).contains(&v));
            // rounded to 6 decimal places
            assert!(((v * 1e6).round() / 1e6 - v).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn mixed_bounds_yield_float() {
        let registry = ValueRegistry::new();
        let s = spec(json!({"type": "random_range", "min": 1, "max": 2.0}));
        let out = resolve(&s, &registry, &mut rng()).unwrap();
        assert!(out.is_f64());
    }

    #[test]
    fn inverted_range_is_invalid() {
        let registry = ValueRegistry::new();
        let s = spec(json!({"type": "random_range", "min": 5, "max": 1}));
        assert_matches!(
            resolve(&s, &registry, &mut rng()),
            Err(ResolveError::InvalidRange { .. })
        );

        let s = spec(json!({"type": "random_range", "min": 5.5, "max": 1.5}));
        assert_matches!(
            resolve(&s, &registry, &mut rng()),
            Err(ResolveError::InvalidRange { .. })
        );
    }

    #[test]
    fn degenerate_range_yields_the_bound() {
        let registry = ValueRegistry::new();
        let s = spec(json!({"type": "random_range", "min": 3, "max": 3}));
        assert_eq!(resolve(&s, &registry, &mut rng()).unwrap(), json!(3));
    }

    #[test]
    fn choice_yields_a_member() {
        let registry = ValueRegistry::new();
        let s = spec(json!({"type": "random_choice", "choices": ["apple", "banana", "orange"]}));
        let mut r = rng();
        for _ in 0..20 {
            let out = resolve(&s, &registry, &mut r).unwrap();
            assert!(["apple", "banana", "orange"].contains(&out.as_str().unwrap()));
        }
    }

    #[test]
    fn empty_choices_is_an_error() {
        let registry = ValueRegistry::new();
        let s = ValueSpec::RandomChoice(vec![]);
        assert_matches!(
            resolve(&s, &registry, &mut rng()),
            Err(ResolveError::EmptyChoices)
        );
    }

    #[test]
    fn unregistered_tag_is_an_error_not_a_fallback() {
        let registry = ValueRegistry::new();
        let s = spec(json!({"type": "normal_distribution", "mean": 0, "stddev": 1}));
        assert_matches!(
            resolve(&s, &registry, &mut rng()),
            Err(ResolveError::UnsupportedValueType(tag)) if tag == "normal_distribution"
        );
    }

    #[test]
    fn registered_tag_dispatches_with_params_and_rng() {
        let mut registry = ValueRegistry::new();
        registry.register("coin_flip", |params, rng| {
            let heads = params
                .get("heads")
                .cloned()
                .ok_or_else(|| ResolveError::Handler {
                    tag: "coin_flip".into(),
                    message: "missing \"heads\"".into(),
                })?;
            let tails = params
                .get("tails")
                .cloned()
                .ok_or_else(|| ResolveError::Handler {
                    tag: "coin_flip".into(),
                    message: "missing \"tails\"".into(),
                })?;
            Ok(if rng.random_range(0..2) == 0 { heads } else { tails })
        });

        let s = spec(json!({"type": "coin_flip", "heads": "H", "tails": "T"}));
        let out = resolve(&s, &registry, &mut rng()).unwrap();
        assert!(out == json!("H") || out == json!("T"));

        let s = spec(json!({"type": "coin_flip", "heads": "H"}));
        assert_matches!(
            resolve(&s, &registry, &mut rng()),
            Err(ResolveError::Handler { .. })
        );
    }

    #[test]
    fn seeded_rng_makes_resolution_reproducible() {
        let registry = ValueRegistry::new();
        let s = spec(json!({"type": "random_range", "min": 0, "max": 1_000_000}));
        let a = resolve(&s, &registry, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = resolve(&s, &registry, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);
    }
}
