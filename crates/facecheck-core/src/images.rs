//! Source image persistence.
//!
//! Images are written after the entry row exists (the file name is the entry
//! id), so there is no transaction spanning both stores.

use crate::types::Entry;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageStoreError {
    #[error("image store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("reference {0:?} is outside the image directory")]
    OutsideStore(String),
}

/// Blob storage for registered face images.
pub trait ImageStore: Send + Sync {
    /// Persist `image` for `entry_id` and return an opaque reference to it.
    fn store(&self, entry_id: i64, image: &[u8]) -> Result<String, ImageStoreError>;

    /// Remove a previously stored image. Missing images are not an error.
    fn remove(&self, reference: &str) -> Result<(), ImageStoreError>;
}

/// Stores each image as `<dir>/<entry_id>.jpg`.
pub struct FsImageStore {
    dir: PathBuf,
}

impl FsImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ImageStoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ImageStore for FsImageStore {
    fn store(&self, entry_id: i64, image: &[u8]) -> Result<String, ImageStoreError> {
        let path = self.dir.join(format!("{entry_id}.jpg"));
        std::fs::write(&path, image)?;
        Ok(path.to_string_lossy().into_owned())
    }

    fn remove(&self, reference: &str) -> Result<(), ImageStoreError> {
        let path = Path::new(reference);
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if escapes || !path.starts_with(&self.dir) {
            return Err(ImageStoreError::OutsideStore(reference.to_string()));
        }
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Best-effort removal of the images belonging to deleted entries.
pub fn purge_images(store: &dyn ImageStore, entries: &[Entry]) {
    for entry in entries {
        let Some(reference) = entry.image_reference.as_deref() else {
            continue;
        };
        if let Err(err) = store.remove(reference) {
            tracing::warn!(entry_id = entry.id, reference, error = %err, "failed to remove image");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;

    #[test]
    fn test_store_writes_file_named_by_entry_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsImageStore::new(dir.path().join("faces")).unwrap();
        let reference = store.store(7, b"jpeg-bytes").unwrap();
        assert!(reference.ends_with("7.jpg"));
        assert_eq!(std::fs::read(&reference).unwrap(), b"jpeg-bytes");
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsImageStore::new(dir.path()).unwrap();
        let missing = dir.path().join("404.jpg");
        store.remove(&missing.to_string_lossy()).unwrap();
    }

    #[test]
    fn test_remove_refuses_paths_outside_dir() {
        let root = tempfile::tempdir().unwrap();
        let store = FsImageStore::new(root.path().join("faces")).unwrap();
        let outside = root.path().join("keep.txt");
        std::fs::write(&outside, b"x").unwrap();

        let err = store.remove(&outside.to_string_lossy()).unwrap_err();
        assert!(matches!(err, ImageStoreError::OutsideStore(_)));

        let sneaky = store.dir().join("..").join("keep.txt");
        let err = store.remove(&sneaky.to_string_lossy()).unwrap_err();
        assert!(matches!(err, ImageStoreError::OutsideStore(_)));
        assert!(outside.exists());
    }

    #[test]
    fn test_purge_images_removes_stored_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsImageStore::new(dir.path()).unwrap();
        let reference = store.store(1, b"a").unwrap();
        let entries = vec![
            Entry {
                id: 1,
                group_id: 1,
                display_name: "a".into(),
                embedding: Embedding::new(vec![0.0]),
                image_reference: Some(reference.clone()),
                created_at: String::new(),
            },
            Entry {
                id: 2,
                group_id: 1,
                display_name: "b".into(),
                embedding: Embedding::new(vec![0.0]),
                image_reference: None,
                created_at: String::new(),
            },
        ];
        purge_images(&store, &entries);
        assert!(!Path::new(&reference).exists());
    }
}
