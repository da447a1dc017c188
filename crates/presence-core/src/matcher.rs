//! Matching an observed embedding against a reference set.

use crate::types::{Embedding, Identity, MatchResult, ReferenceSet};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default maximum distance for a positive Euclidean match.
pub const DEFAULT_TOLERANCE: f32 = 0.4;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("observed embedding has dimension {actual}, reference set dimension is {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Strategy for comparing an observed embedding against a reference set.
///
/// Implementors supply the metric; lower distances must mean closer faces.
pub trait Matcher {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32;

    /// Find the identity owning the reference vector closest to `observed`.
    ///
    /// An identity is a candidate when any of its vectors lies within
    /// `tolerance` (inclusive). The globally closest vector wins; exact ties
    /// go to the identity that comes first in the set's iteration order.
    /// Every reference vector is visited, there is no early exit.
    fn compare(
        &self,
        observed: &Embedding,
        refs: &ReferenceSet,
        tolerance: f32,
    ) -> Result<MatchResult, MatchError> {
        let Some(expected) = refs.dimension() else {
            return Ok(MatchResult::Unknown);
        };
        if observed.dimension() != expected {
            return Err(MatchError::DimensionMismatch {
                expected,
                actual: observed.dimension(),
            });
        }

        let mut best: Option<(&Identity, f32)> = None;
        for (identity, references) in refs.iter() {
            for reference in references {
                let distance = self.distance(observed, reference);
                // NaN on either side is never within tolerance.
                if !matches!(distance.partial_cmp(&tolerance), Some(Ordering::Less | Ordering::Equal)) {
                    continue;
                }
                let closer = match best {
                    None => true,
                    Some((_, best_distance)) => distance < best_distance,
                };
                if closer {
                    best = Some((identity, distance));
                }
            }
        }

        Ok(match best {
            Some((identity, distance)) => MatchResult::Identified {
                identity: identity.clone(),
                distance,
            },
            None => MatchResult::Unknown,
        })
    }
}

/// Euclidean distance matcher, the reference metric.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.euclidean_distance(b)
    }
}

/// Cosine distance matcher: `1 - cosine similarity`, in [0, 2].
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        1.0 - a.similarity(b)
    }
}

/// Distance metric selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Euclidean,
    Cosine,
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(format!("unknown metric '{other}' (expected euclidean or cosine)")),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Euclidean => f.write_str("euclidean"),
            Metric::Cosine => f.write_str("cosine"),
        }
    }
}

/// Matching parameters handed to whoever runs the matcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatcherConfig {
    pub metric: Metric,
    /// Maximum distance (inclusive) for two embeddings to be the same person.
    pub tolerance: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Euclidean,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl MatcherConfig {
    pub fn matcher(&self) -> Box<dyn Matcher + Send + Sync> {
        match self.metric {
            Metric::Euclidean => Box::new(EuclideanMatcher),
            Metric::Cosine => Box::new(CosineMatcher),
        }
    }

    /// Match `observed` with the configured metric and tolerance.
    pub fn compare(&self, observed: &Embedding, refs: &ReferenceSet) -> Result<MatchResult, MatchError> {
        self.matcher().compare(observed, refs, self.tolerance)
    }
}
