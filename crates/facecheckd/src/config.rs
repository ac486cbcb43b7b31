use facecheck_core::{FaceSelectionPolicy, Tolerance};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_EXTRACT_TIMEOUT_SECS: u64 = 10;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address to listen on (default: 0.0.0.0:$PORT, or 0.0.0.0:5000).
    pub bind: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory registered face images are written to.
    pub image_dir: PathBuf,
    /// Default maximum Euclidean distance for a positive match, calibrated
    /// for the ArcFace model unless overridden.
    pub tolerance: Tolerance,
    /// Upper bound on a single embedding extraction.
    pub extract_timeout_secs: u64,
    /// What to do when an image contains several faces.
    pub face_policy: FaceSelectionPolicy,
    /// Request body limit for uploads.
    pub max_upload_bytes: usize,
}

impl Config {
    /// Load configuration from `FACECHECK_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACECHECK_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facecheck_models::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facecheck");

        let db_path = std::env::var("FACECHECK_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces.db"));

        let image_dir = std::env::var("FACECHECK_IMAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces"));

        let bind = std::env::var("FACECHECK_BIND").unwrap_or_else(|_| {
            let port = std::env::var("PORT").unwrap_or_else(|_| "5000".to_string());
            format!("0.0.0.0:{port}")
        });

        let tolerance = match Tolerance::new(env_or(
            "FACECHECK_TOLERANCE",
            facecheck_models::ARCFACE_DEFAULT_TOLERANCE,
        )) {
            Ok(t) => t,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring FACECHECK_TOLERANCE");
                default_tolerance()
            }
        };

        let face_policy = match std::env::var("FACECHECK_FACE_POLICY") {
            Ok(v) => v.parse().unwrap_or_else(|err: String| {
                tracing::warn!(error = %err, "ignoring FACECHECK_FACE_POLICY");
                FaceSelectionPolicy::default()
            }),
            Err(_) => FaceSelectionPolicy::default(),
        };

        let extract_timeout_secs = nonzero_or(
            "FACECHECK_EXTRACT_TIMEOUT_SECS",
            env_or("FACECHECK_EXTRACT_TIMEOUT_SECS", DEFAULT_EXTRACT_TIMEOUT_SECS),
            DEFAULT_EXTRACT_TIMEOUT_SECS,
        );

        Self {
            bind,
            model_dir,
            db_path,
            image_dir,
            tolerance,
            extract_timeout_secs,
            face_policy,
            max_upload_bytes: env_or("FACECHECK_MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
        }
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }
}

/// Tolerance calibrated for the shipped ArcFace model.
fn default_tolerance() -> Tolerance {
    Tolerance::new(facecheck_models::ARCFACE_DEFAULT_TOLERANCE).unwrap_or_default()
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    parse_or(key, std::env::var(key).ok(), default)
}

/// Parse `raw`, warning and falling back to `default` when it is malformed.
fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparsable value, using default");
            default
        }
    }
}

fn nonzero_or(key: &str, value: u64, default: u64) -> u64 {
    if value == 0 {
        tracing::warn!(key, default, "zero is not allowed, using default");
        return default;
    }
    value
}
