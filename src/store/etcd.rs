use super::{Store, StoreError, Versioned};
use anyhow::Result;
use async_trait::async_trait;
use etcd_client::{Client, EventType, PutOptions, WatchOptions};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `Store` backed by an etcd v3 cluster.
///
/// TTLs map onto leases: every TTL write grants a fresh lease and attaches the
/// key to it, so the previous lease simply runs out. Versions are etcd
/// revisions.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    endpoints: Vec<String>,
}

impl EtcdStore {
    pub async fn new(endpoints: Vec<String>) -> Result<Self> {
        let client = Client::connect(&endpoints, None).await?;
        info!(endpoints = ?endpoints, "Connected to etcd");

        Ok(Self { client, endpoints })
    }

    /// Connect using `ETCD_ENDPOINTS`.
    pub async fn from_env() -> Result<Self> {
        Self::new(crate::ETCD_ENDPOINTS.to_vec()).await
    }

    // Each call gets its own handle so a pending watch never holds up writes.
    fn client(&self) -> Client {
        self.client.clone()
    }

    async fn create_lease(&self, ttl: Duration) -> Result<i64, StoreError> {
        let mut client = self.client();
        let lease = client.lease_grant(lease_seconds(ttl), None).await?;
        Ok(lease.id())
    }

    async fn current(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let mut client = self.client();
        let resp = client.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| Versioned {
            value: kv.value().to_vec(),
            version: kv.mod_revision() as u64,
        }))
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn write(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64, StoreError> {
        let options = match ttl {
            Some(ttl) => Some(PutOptions::new().with_lease(self.create_lease(ttl).await?)),
            None => None,
        };

        let mut client = self.client();
        let resp = client.put(key, value, options).await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        debug!(key, revision, "Wrote key to etcd");

        Ok(revision.max(0) as u64)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut client = self.client();
        client.delete(key, None).await?;
        debug!(key, "Deleted key from etcd");
        Ok(())
    }

    async fn watch_from(&self, key: &str, after: u64) -> Result<Versioned, StoreError> {
        let options = WatchOptions::new().with_start_revision(after as i64 + 1);
        let mut client = self.client();
        let (mut watcher, mut stream) = client.watch(key, Some(options)).await?;

        loop {
            let Some(resp) = stream.message().await? else {
                return Err(StoreError::WatchClosed);
            };

            if resp.canceled() {
                if resp.compact_revision() > 0 {
                    // The revision we asked for is gone; resume from what is there now.
                    warn!(key, after, compact_revision = resp.compact_revision(), "Watch revision compacted");
                    return match self.current(key).await? {
                        Some(current) if current.version > after => Ok(current),
                        _ => Err(StoreError::WatchCanceled(format!(
                            "revision {} compacted",
                            after + 1
                        ))),
                    };
                }
                return Err(StoreError::WatchCanceled(resp.cancel_reason().to_string()));
            }

            let change = resp
                .events()
                .iter()
                .filter(|event| event.event_type() == EventType::Put)
                .find_map(|event| event.kv())
                .map(|kv| Versioned {
                    value: kv.value().to_vec(),
                    version: kv.mod_revision() as u64,
                });

            if let Some(change) = change {
                if let Err(e) = watcher.cancel().await {
                    debug!(key, error = %e, "Failed to cancel finished watch");
                }
                return Ok(change);
            }
        }
    }

    fn endpoints(&self) -> Vec<String> {
        self.endpoints.clone()
    }
}

/// etcd leases are whole seconds; never round a TTL down to zero.
fn lease_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1) as i64
}
