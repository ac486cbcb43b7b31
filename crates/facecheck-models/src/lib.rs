//! facecheck-models: ONNX embedding extractor.
//!
//! SCRFD finds faces and their five landmarks, each face is aligned to the
//! ArcFace reference layout, and ArcFace produces one embedding per face.

pub mod alignment;
pub mod detector;
pub mod recognizer;

use facecheck_core::{Embedding, EmbeddingExtractor, ExtractError};
use std::path::PathBuf;
use thiserror::Error;

pub use detector::{DetectorError, FaceBox, FaceDetector};
pub use recognizer::{
    FaceRecognizer, RecognizerError, ARCFACE_DEFAULT_TOLERANCE, ARCFACE_EMBEDDING_DIM,
    ARCFACE_MATCH_COSINE,
};

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// `$XDG_DATA_HOME/facecheck/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facecheck")
        .join("models")
}

/// Detector + recognizer pair implementing [`EmbeddingExtractor`].
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    pub fn load(detector_path: &str, recognizer_path: &str) -> Result<Self, ModelError> {
        Ok(Self {
            detector: FaceDetector::load(detector_path)?,
            recognizer: FaceRecognizer::load(recognizer_path)?,
        })
    }

    /// Load both models from `dir` using their standard file names.
    pub fn load_dir(dir: &std::path::Path) -> Result<Self, ModelError> {
        Self::load(
            &dir.join(DETECTOR_MODEL).to_string_lossy(),
            &dir.join(RECOGNIZER_MODEL).to_string_lossy(),
        )
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ExtractError> {
        let rgb = image::load_from_memory(image)
            .map_err(|e| ExtractError::InvalidImage(e.to_string()))?
            .to_rgb8();

        let faces = self
            .detector
            .detect(&rgb)
            .map_err(|e| ExtractError::Inference(e.to_string()))?;

        faces
            .iter()
            .map(|face| {
                let aligned = alignment::align_face(&rgb, &face.landmarks);
                self.recognizer
                    .embed(&aligned)
                    .map(Embedding::new)
                    .map_err(|e| ExtractError::Inference(e.to_string()))
            })
            .collect()
    }
}
