pub mod etcd;

#[cfg(test)]
pub(crate) mod mock;


use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("watch canceled by server: {0}")]
    WatchCanceled(String),

    #[error("watch stream closed")]
    WatchClosed,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A value together with the store version at which it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Create or overwrite `key`. With a `ttl` the key expires unless it is
    /// written again in time. Returns the version of the write.
    async fn write(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64, StoreError>;

    /// Delete a single key.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Wait for the next write to `key` with a version greater than `after`.
    /// Dropping the returned future cancels the wait.
    async fn watch_from(&self, key: &str, after: u64) -> Result<Versioned, StoreError>;

    /// Endpoints currently used by the client, for diagnostics.
    fn endpoints(&self) -> Vec<String>;
}
