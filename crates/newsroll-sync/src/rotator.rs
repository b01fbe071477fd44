use std::sync::Arc;

use newsroll_storage::RotationStore;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RotatorError {
    #[error("the API key pool is empty")]
    EmptyPool,
}

/// Cycles through a fixed pool of API credentials, persisting progress on every use.
pub struct KeyRotator {
    pool: Vec<String>,
    store: Arc<dyn RotationStore>,
    index: Mutex<Option<u64>>,
}

impl KeyRotator {
    pub fn new(pool: Vec<String>, store: Arc<dyn RotationStore>) -> Result<Self, RotatorError> {
        if pool.is_empty() {
            return Err(RotatorError::EmptyPool);
        }
        Ok(Self {
            pool,
            store,
            index: Mutex::new(None),
        })
    }

    /// Returns `pool[index % len]` and advances the index by one.
    ///
    /// Storage failures are logged and rotation continues from the in-memory index.
    pub async fn next(&self) -> String {
        let mut guard = self.index.lock().await;
        let index = match *guard {
            Some(index) => index,
            None => self.store.load().await.unwrap_or_else(|err| {
                warn!(error = %err, "could not load key rotation index; starting at 0");
                0
            }),
        };

        let key = self.pool[(index % self.pool.len() as u64) as usize].clone();
        let advanced = index.wrapping_add(1);
        *guard = Some(advanced);
        if let Err(err) = self.store.persist(advanced).await {
            warn!(error = %err, "could not persist key rotation index");
        }
        key
    }
}
