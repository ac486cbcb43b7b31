//! Dedicated extractor thread.
//!
//! Model inference is blocking and the extractor owns `&mut` state, so it
//! lives on its own OS thread. Async callers talk to it over a bounded
//! channel and wait on a oneshot reply, bounded by a timeout.

use crate::extract::{EmbeddingExtractor, ExtractError};
use crate::types::Embedding;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("extractor error: {0}")]
    Extract(#[from] ExtractError),
    #[error("embedding extraction exceeded {0:?}")]
    Timeout(Duration),
    #[error("extractor thread exited")]
    ChannelClosed,
    #[error("failed to spawn extractor thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct ExtractRequest {
    image: Vec<u8>,
    reply: oneshot::Sender<Result<Vec<Embedding>, ExtractError>>,
}

/// Clone-safe handle to the extractor thread.
#[derive(Clone)]
pub struct ExtractorHandle {
    tx: mpsc::Sender<ExtractRequest>,
    dimension: usize,
    timeout: Duration,
}

impl ExtractorHandle {
    /// Canonical dimensionality reported by the extractor at spawn time.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Extract embeddings for every face in `image`.
    ///
    /// Fails with [`EngineError::Timeout`] when no reply arrives in time. A
    /// request still queued when its caller gives up is skipped by the
    /// extractor thread; one already running finishes and its result is
    /// dropped.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Vec<Embedding>, EngineError> {
        match tokio::time::timeout(self.timeout, self.round_trip(image)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "embedding extraction timed out");
                Err(EngineError::Timeout(self.timeout))
            }
        }
    }

    async fn round_trip(&self, image: Vec<u8>) -> Result<Vec<Embedding>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ExtractRequest {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let result = reply_rx.await.map_err(|_| EngineError::ChannelClosed)?;
        Ok(result?)
    }
}

/// Move `extractor` onto a dedicated OS thread and return a handle to it.
///
/// The thread exits once every handle has been dropped.
pub fn spawn_extractor<E: EmbeddingExtractor>(
    mut extractor: E,
    timeout: Duration,
) -> Result<ExtractorHandle, EngineError> {
    let dimension = extractor.dimension();
    let (tx, mut rx) = mpsc::channel::<ExtractRequest>(16);

    std::thread::Builder::new()
        .name("facecheck-extract".into())
        .spawn(move || {
            tracing::info!(dimension, "extractor thread started");
            while let Some(req) = rx.blocking_recv() {
                if req.reply.is_closed() {
                    tracing::debug!(bytes = req.image.len(), "skipping abandoned extraction");
                    continue;
                }
                let started = std::time::Instant::now();
                let result = extractor.extract(&req.image);
                tracing::debug!(
                    bytes = req.image.len(),
                    faces = result.as_ref().map(|f| f.len()).unwrap_or(0),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "extraction finished"
                );
                let _ = req.reply.send(result);
            }
            tracing::info!("extractor thread exiting");
        })?;

    Ok(ExtractorHandle {
        tx,
        dimension,
        timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed(Vec<Embedding>);

    impl EmbeddingExtractor for Fixed {
        fn dimension(&self) -> usize {
            2
        }

        fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ExtractError> {
            if image.is_empty() {
                return Err(ExtractError::InvalidImage("empty".into()));
            }
            Ok(self.0.clone())
        }
    }

    struct Slow;

    impl EmbeddingExtractor for Slow {
        fn dimension(&self) -> usize {
            2
        }

        fn extract(&mut self, _image: &[u8]) -> Result<Vec<Embedding>, ExtractError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(vec![])
        }
    }

    /// Sleeps per call and counts how many calls actually ran.
    struct Counting {
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl EmbeddingExtractor for Counting {
        fn dimension(&self) -> usize {
            2
        }

        fn extract(&mut self, _image: &[u8]) -> Result<Vec<Embedding>, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(vec![Embedding::new(vec![0.0, 1.0])])
        }
    }

    #[tokio::test]
    async fn test_extract_returns_extractor_output() {
        let faces = vec![Embedding::new(vec![1.0, 2.0]), Embedding::new(vec![3.0, 4.0])];
        let handle = spawn_extractor(Fixed(faces.clone()), Duration::from_secs(5)).unwrap();
        assert_eq!(handle.dimension(), 2);
        assert_eq!(handle.extract(vec![1]).await.unwrap(), faces);
    }

    #[tokio::test]
    async fn test_extract_propagates_extractor_error() {
        let handle = spawn_extractor(Fixed(vec![]), Duration::from_secs(5)).unwrap();
        let err = handle.extract(vec![]).await.unwrap_err();
        assert!(matches!(err, EngineError::Extract(ExtractError::InvalidImage(_))));
    }

    #[tokio::test]
    async fn test_extract_times_out() {
        let handle = spawn_extractor(Slow, Duration::from_millis(20)).unwrap();
        let err = handle.extract(vec![1]).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_all_answered() {
        let handle =
            spawn_extractor(Fixed(vec![Embedding::new(vec![0.5, 0.5])]), Duration::from_secs(5))
                .unwrap();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move { h.extract(vec![7]).await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_abandoned_requests_do_not_starve_later_ones() {
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = Counting {
            delay: Duration::from_millis(100),
            calls: Arc::clone(&calls),
        };
        let handle = spawn_extractor(extractor, Duration::from_millis(250)).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move { h.extract(vec![1]).await }));
        }
        let mut timed_out = 0;
        for task in tasks {
            if matches!(task.await.unwrap(), Err(EngineError::Timeout(_))) {
                timed_out += 1;
            }
        }
        assert!(timed_out > 0);

        // Only the head of the queue ran; the rest were skipped once their
        // callers gave up, so a new request is served within its deadline.
        let fresh = handle.extract(vec![1]).await;
        assert_eq!(fresh.unwrap().len(), 1);
        assert!(calls.load(Ordering::SeqCst) < 9);
    }
}
