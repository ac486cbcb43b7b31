//! Embedding extractor seam.
//!
//! The model that turns image bytes into embeddings is injected; the core
//! only depends on this trait so tests can feed deterministic vectors.

use crate::types::Embedding;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("image could not be decoded: {0}")]
    InvalidImage(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Converts image bytes into one embedding per detected face.
///
/// Implementations are driven from a single dedicated thread (see
/// [`crate::engine`]), so `extract` may take `&mut self` and block.
pub trait EmbeddingExtractor: Send + 'static {
    /// Canonical dimensionality of every embedding this extractor produces.
    fn dimension(&self) -> usize;

    /// Embeddings in detector order. Empty when no face was found.
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ExtractError>;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{0} faces detected, exactly one required")]
pub struct MultipleFaces(pub usize);

/// How to pick the face to use when an image contains several.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaceSelectionPolicy {
    /// Use the first face in extractor order and silently discard the rest.
    #[default]
    FirstDetected,
    /// Reject images with more than one face.
    RequireSingle,
}

impl FaceSelectionPolicy {
    /// Pick one embedding out of the extractor output. `Ok(None)` means no face.
    pub fn select(self, faces: Vec<Embedding>) -> Result<Option<Embedding>, MultipleFaces> {
        match self {
            Self::RequireSingle if faces.len() > 1 => Err(MultipleFaces(faces.len())),
            _ => Ok(faces.into_iter().next()),
        }
    }
}

impl FromStr for FaceSelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first-detected" => Ok(Self::FirstDetected),
            "single" | "require-single" => Ok(Self::RequireSingle),
            other => Err(format!("unknown face selection policy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn faces(n: usize) -> Vec<Embedding> {
        (0..n).map(|i| Embedding::new(vec![i as f32])).collect()
    }

    #[test]
    fn test_first_detected_takes_first_face() {
        let picked = FaceSelectionPolicy::FirstDetected.select(faces(3)).unwrap();
        assert_eq!(picked, Some(Embedding::new(vec![0.0])));
    }

    #[test]
    fn test_no_faces_selects_nothing() {
        assert_eq!(FaceSelectionPolicy::FirstDetected.select(vec![]).unwrap(), None);
        assert_eq!(FaceSelectionPolicy::RequireSingle.select(vec![]).unwrap(), None);
    }

    #[test]
    fn test_require_single_rejects_multiple() {
        let err = FaceSelectionPolicy::RequireSingle.select(faces(2)).unwrap_err();
        assert_eq!(err, MultipleFaces(2));
        assert!(FaceSelectionPolicy::RequireSingle.select(faces(1)).unwrap().is_some());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("first".parse(), Ok(FaceSelectionPolicy::FirstDetected));
        assert_eq!(" Single ".parse(), Ok(FaceSelectionPolicy::RequireSingle));
        assert!("nearest".parse::<FaceSelectionPolicy>().is_err());
    }
}
