use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{RelayError, Result};

/// Durable home for one subscription's resumption position.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Position to resume from, or `fallback` when nothing usable is stored.
    ///
    /// Only I/O failures other than "not found" are errors.
    async fn read(&self, fallback: u64) -> Result<u64>;

    /// Persist `position`. Failures are logged and reported as `false`,
    /// never propagated.
    async fn write(&self, position: u64) -> bool;
}

/// Cursor kept in a single file as a quoted decimal string, e.g. `"123"`.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
    subscription: String,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>, subscription: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            subscription: subscription.into(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    async fn write_inner(&self, position: u64) -> io::Result<()> {
        let encoded = serde_json::to_string(&position.to_string())?;
        let temp = self.temp_path();
        if let Err(err) = tokio::fs::write(&temp, encoded).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err);
        }
        if let Err(err) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn read(&self, fallback: u64) -> Result<u64> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(
                    subscription = %self.subscription,
                    path = %self.path.display(),
                    position = fallback,
                    "no cursor file found, starting from initial position"
                );
                return Ok(fallback);
            }
            Err(source) => {
                return Err(RelayError::CursorRead {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        match parse_position(&raw) {
            Some(position) => {
                info!(subscription = %self.subscription, position, "resuming from stored cursor");
                Ok(position)
            }
            None => {
                warn!(
                    subscription = %self.subscription,
                    path = %self.path.display(),
                    position = fallback,
                    "invalid cursor file content, starting from initial position"
                );
                Ok(fallback)
            }
        }
    }

    async fn write(&self, position: u64) -> bool {
        match self.write_inner(position).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    subscription = %self.subscription,
                    path = %self.path.display(),
                    position,
                    error = %err,
                    "failed to write cursor"
                );
                false
            }
        }
    }
}

/// Accepts a JSON integer or a JSON string holding a decimal integer.
fn parse_position(raw: &[u8]) -> Option<u64> {
    match serde_json::from_slice::<serde_json::Value>(raw).ok()? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// In-memory cursor for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    writes: Mutex<Vec<u64>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(position: u64) -> Self {
        Self {
            writes: Mutex::new(vec![position]),
        }
    }

    /// Every position written so far, oldest first.
    pub async fn history(&self) -> Vec<u64> {
        self.writes.lock().await.clone()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn read(&self, fallback: u64) -> Result<u64> {
        Ok(self.writes.lock().await.last().copied().unwrap_or(fallback))
    }

    async fn write(&self, position: u64) -> bool {
        self.writes.lock().await.push(position);
        true
    }
}
