use serde::{Deserialize, Serialize};

/// Face embedding vector (128-dim for dlib models, 512-dim for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean (L2) distance. This is the only metric used for matching,
    /// both against stored embeddings and at query time.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian f32 encoding used for the `entries.embedding` column.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self { values }
    }
}

/// A named scope of registered identities ("event").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

/// One registered identity within a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub group_id: i64,
    pub display_name: String,
    pub embedding: Embedding,
    /// Handle returned by the image store; `None` until the image is persisted.
    pub image_reference: Option<String>,
    pub created_at: String,
}

/// Entry listing row for administration, joined with its group's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub id: i64,
    pub display_name: String,
    pub group_id: i64,
    pub group_name: String,
    pub image_reference: Option<String>,
}
