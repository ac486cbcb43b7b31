use crate::registry::{Registry, RegistryError};
use crate::types::{Embedding, Entry};
use thiserror::Error;

/// Default maximum Euclidean distance for a positive match.
pub const DEFAULT_TOLERANCE: f32 = 0.5;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("tolerance must be a finite, non-negative number (got {0})")]
pub struct InvalidTolerance(pub f32);

/// Maximum accepted distance, validated to be finite and non-negative.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Tolerance(f32);

impl Tolerance {
    pub fn new(value: f32) -> Result<Self, InvalidTolerance> {
        if value.is_finite() && value >= 0.0 {
            Ok(Self(value))
        } else {
            Err(InvalidTolerance(value))
        }
    }

    pub fn get(self) -> f32 {
        self.0
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self(DEFAULT_TOLERANCE)
    }
}

/// Result of matching a probe embedding against a group's entries.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The group has no registered entries.
    NoCandidates,
    /// Entries exist but none is within tolerance.
    NoMatch,
    Matched { entry: Entry, distance: f32 },
}

/// Strategy for comparing a probe embedding against a gallery of entries.
pub trait Matcher: Send + Sync {
    /// `gallery` is in registry creation order.
    fn compare(&self, probe: &Embedding, gallery: &[Entry], tolerance: Tolerance) -> MatchOutcome;
}

/// Returns the first entry, in creation order, whose Euclidean distance to
/// the probe is within tolerance.
///
/// This is deliberately not nearest-neighbour: with two candidates inside
/// the tolerance the earlier registration wins even if the later one is
/// closer.
pub struct FirstWithinTolerance;

impl Matcher for FirstWithinTolerance {
    fn compare(&self, probe: &Embedding, gallery: &[Entry], tolerance: Tolerance) -> MatchOutcome {
        if gallery.is_empty() {
            return MatchOutcome::NoCandidates;
        }

        gallery
            .iter()
            .map(|entry| (entry, probe.euclidean_distance(&entry.embedding)))
            .find(|(_, distance)| *distance <= tolerance.get())
            .map(|(entry, distance)| MatchOutcome::Matched {
                entry: entry.clone(),
                distance,
            })
            .unwrap_or(MatchOutcome::NoMatch)
    }
}

/// Match `query` against the entries registered in `group_id`.
///
/// Read-only with respect to the registry; safe to call concurrently.
pub async fn identify(
    registry: &Registry,
    matcher: &dyn Matcher,
    group_id: i64,
    query: &Embedding,
    tolerance: Tolerance,
) -> Result<MatchOutcome, RegistryError> {
    registry.check_embedding(query)?;
    let gallery = registry.list_entries(group_id).await?;
    let outcome = matcher.compare(query, &gallery, tolerance);
    tracing::debug!(
        group_id,
        candidates = gallery.len(),
        tolerance = tolerance.get(),
        matched = matches!(outcome, MatchOutcome::Matched { .. }),
        "identify"
    );
    Ok(outcome)
}
