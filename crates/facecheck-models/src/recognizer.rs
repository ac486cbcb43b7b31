//! ArcFace face recognizer via ONNX Runtime.
//!
//! Turns a 112×112 aligned RGB crop into an L2-normalized 512-dim embedding
//! (w600k_r50 model).

use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::alignment::ALIGNED_SIZE;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

/// Cosine similarity at which two ArcFace embeddings count as the same person.
pub const ARCFACE_MATCH_COSINE: f32 = 0.40;

/// Euclidean tolerance equivalent to [`ARCFACE_MATCH_COSINE`].
///
/// Embeddings are unit length, so `d = sqrt(2 - 2 * cos)`; cos 0.40 is d 1.095.
pub const ARCFACE_DEFAULT_TOLERANCE: f32 = 1.095;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download the insightface buffalo_l pack into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("aligned crop must be 112x112, got {0}x{1}")]
    BadCrop(u32, u32),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Embed an aligned face crop.
    pub fn embed(&mut self, aligned: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
        let (w, h) = aligned.dimensions();
        if (w, h) != (ALIGNED_SIZE, ALIGNED_SIZE) {
            return Err(RecognizerError::BadCrop(w, h));
        }

        let input = preprocess(aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(l2_normalize(raw.to_vec()))
    }
}

fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}

/// NCHW RGB tensor normalized to [-1, 1].
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_shape_and_range() {
        let crop = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([0, 255, 128]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert_eq!(tensor[[0, 0, 10, 10]], -1.0);
        assert_eq!(tensor[[0, 1, 10, 10]], 1.0);
        let mid = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 2, 10, 10]] - mid).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let mut crop = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
        crop.put_pixel(3, 7, Rgb([255, 0, 0]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor[[0, 0, 7, 3]], 1.0);
        assert_eq!(tensor[[0, 1, 7, 3]], -1.0);
        assert_eq!(tensor[[0, 0, 3, 7]], -1.0);
    }

    #[test]
    fn test_default_tolerance_matches_cosine_threshold() {
        let from_cosine = (2.0 - 2.0 * ARCFACE_MATCH_COSINE).sqrt();
        assert!((from_cosine - ARCFACE_DEFAULT_TOLERANCE).abs() < 1e-3);

        // Two unit vectors exactly at the cosine threshold sit on the tolerance.
        let a = l2_normalize(vec![1.0, 0.0]);
        let theta = ARCFACE_MATCH_COSINE.acos();
        let b = l2_normalize(vec![theta.cos(), theta.sin()]);
        let d = facecheck_core::Embedding::new(a).euclidean_distance(&facecheck_core::Embedding::new(b));
        assert!((d - ARCFACE_DEFAULT_TOLERANCE).abs() < 1e-3);
        assert!(d > facecheck_core::DEFAULT_TOLERANCE);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
