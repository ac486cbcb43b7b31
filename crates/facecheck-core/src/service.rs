//! Registration and identification workflows.
//!
//! `FaceService` is an explicit instance wiring the registry, extractor
//! thread, image store and matcher together; nothing here is global.

use crate::engine::{EngineError, ExtractorHandle};
use crate::extract::{FaceSelectionPolicy, MultipleFaces};
use crate::images::{purge_images, ImageStore};
use crate::matcher::{self, FirstWithinTolerance, MatchOutcome, Matcher, Tolerance};
use crate::registry::{Registry, RegistryError};
use crate::types::{Embedding, Entry, EntrySummary, Group};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    MultipleFaces(#[from] MultipleFaces),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("display name must not be empty")]
    EmptyDisplayName,
}

/// Why an identification did not produce a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// The group has no registered entries.
    NothingRegistered,
    /// Entries exist but none is within tolerance.
    NoMatch,
}

/// Result of identifying a query image. All variants are normal outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifyOutcome {
    NoFaceDetected,
    UnknownGroup,
    NotRecognized(MissReason),
    Recognized { entry: Entry, distance: f32 },
}

pub struct FaceService {
    registry: Registry,
    extractor: ExtractorHandle,
    images: Arc<dyn ImageStore>,
    matcher: Box<dyn Matcher>,
    policy: FaceSelectionPolicy,
}

impl FaceService {
    pub fn new(registry: Registry, extractor: ExtractorHandle, images: Arc<dyn ImageStore>) -> Self {
        Self {
            registry,
            extractor,
            images,
            matcher: Box::new(FirstWithinTolerance),
            policy: FaceSelectionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: FaceSelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn policy(&self) -> FaceSelectionPolicy {
        self.policy
    }

    pub async fn create_group(&self, name: &str) -> Result<Group, ServiceError> {
        Ok(self.registry.create_group(name).await?)
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>, ServiceError> {
        Ok(self.registry.list_groups().await?)
    }

    pub async fn list_entries(&self) -> Result<Vec<EntrySummary>, ServiceError> {
        Ok(self.registry.list_all_entries().await?)
    }

    /// Delete a group, its entries, and (best effort) their stored images.
    pub async fn delete_group(&self, group_id: i64) -> Result<usize, ServiceError> {
        let removed = self.registry.delete_group(group_id).await?;
        let images = Arc::clone(&self.images);
        let count = removed.len();
        if let Err(err) =
            tokio::task::spawn_blocking(move || purge_images(images.as_ref(), &removed)).await
        {
            tracing::warn!(group_id, error = %err, "image cleanup task failed");
        }
        Ok(count)
    }

    /// Register a new entry from an image.
    ///
    /// Nothing is written unless a face was found and the group exists. The
    /// image is stored after the entry row; if that second step fails the
    /// entry stays registered (and matchable) without an image reference.
    pub async fn register(
        &self,
        group_id: i64,
        display_name: &str,
        image: Vec<u8>,
    ) -> Result<Entry, ServiceError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(ServiceError::EmptyDisplayName);
        }
        if self.registry.get_group(group_id).await?.is_none() {
            return Err(RegistryError::UnknownGroup(group_id).into());
        }

        let embedding = self
            .select_face(image.clone())
            .await?
            .ok_or(ServiceError::NoFaceDetected)?;

        let mut entry = self
            .registry
            .add_entry(group_id, display_name, embedding)
            .await?;
        tracing::info!(group_id, entry_id = entry.id, name = %entry.display_name, "entry registered");

        match self.store_image(entry.id, image).await {
            Some(reference) => entry.image_reference = Some(reference),
            None => tracing::warn!(
                entry_id = entry.id,
                "entry registered without a stored image"
            ),
        }

        Ok(entry)
    }

    /// Identify the person in `image` among the entries of `group_id`.
    pub async fn identify_from_image(
        &self,
        group_id: i64,
        image: Vec<u8>,
        tolerance: Tolerance,
    ) -> Result<IdentifyOutcome, ServiceError> {
        let Some(query) = self.select_face(image).await? else {
            return Ok(IdentifyOutcome::NoFaceDetected);
        };

        if self.registry.get_group(group_id).await?.is_none() {
            return Ok(IdentifyOutcome::UnknownGroup);
        }

        let outcome = matcher::identify(
            &self.registry,
            self.matcher.as_ref(),
            group_id,
            &query,
            tolerance,
        )
        .await?;

        Ok(match outcome {
            MatchOutcome::NoCandidates => IdentifyOutcome::NotRecognized(MissReason::NothingRegistered),
            MatchOutcome::NoMatch => IdentifyOutcome::NotRecognized(MissReason::NoMatch),
            MatchOutcome::Matched { entry, distance } => {
                tracing::info!(group_id, entry_id = entry.id, distance, "face recognized");
                IdentifyOutcome::Recognized { entry, distance }
            }
        })
    }

    async fn select_face(&self, image: Vec<u8>) -> Result<Option<Embedding>, ServiceError> {
        let faces = self.extractor.extract(image).await?;
        if faces.len() > 1 {
            tracing::debug!(faces = faces.len(), policy = ?self.policy, "multiple faces detected");
        }
        Ok(self.policy.select(faces)?)
    }

    /// Write the image and attach its reference. `None` on any failure.
    async fn store_image(&self, entry_id: i64, image: Vec<u8>) -> Option<String> {
        let images = Arc::clone(&self.images);
        let stored = tokio::task::spawn_blocking(move || images.store(entry_id, &image)).await;
        let reference = match stored {
            Ok(Ok(reference)) => reference,
            Ok(Err(err)) => {
                tracing::warn!(entry_id, error = %err, "image store write failed");
                return None;
            }
            Err(err) => {
                tracing::warn!(entry_id, error = %err, "image store task failed");
                return None;
            }
        };

        match self.registry.set_image_reference(entry_id, &reference).await {
            Ok(()) => Some(reference),
            Err(RegistryError::UnknownEntry(_)) => {
                // Group deleted while the image was being written.
                tracing::warn!(entry_id, "entry removed before its image was recorded");
                let images = Arc::clone(&self.images);
                let removed =
                    tokio::task::spawn_blocking(move || images.remove(&reference)).await;
                if !matches!(removed, Ok(Ok(()))) {
                    tracing::warn!(entry_id, "orphaned image could not be removed");
                }
                None
            }
            Err(err) => {
                tracing::warn!(entry_id, error = %err, "failed to record image reference");
                None
            }
        }
    }
}
