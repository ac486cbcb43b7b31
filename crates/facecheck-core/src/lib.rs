//! facecheck-core: Face identity matching engine.
//!
//! Stores face embeddings per group ("event"), matches query embeddings
//! under a Euclidean distance tolerance, and orchestrates the registration
//! and identification workflows around an injected embedding extractor.

pub mod engine;
pub mod extract;
pub mod images;
pub mod matcher;
pub mod registry;
pub mod service;
pub mod types;

pub use engine::{spawn_extractor, EngineError, ExtractorHandle};
pub use extract::{EmbeddingExtractor, ExtractError, FaceSelectionPolicy, MultipleFaces};
pub use images::{purge_images, FsImageStore, ImageStore, ImageStoreError};
pub use matcher::{
    FirstWithinTolerance, InvalidTolerance, MatchOutcome, Matcher, Tolerance, DEFAULT_TOLERANCE,
};
pub use registry::{Registry, RegistryError};
pub use service::{FaceService, IdentifyOutcome, MissReason, ServiceError};
pub use types::{Embedding, Entry, EntrySummary, Group};
