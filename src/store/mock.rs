//! In-memory `Store` used by the tests: versioned keys with TTL expiry on the
//! tokio clock, scripted failures and a log of every call made through the
//! trait.

use super::{Store, StoreError, Versioned};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Write {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
        ok: bool,
        at: Instant,
    },
    Delete {
        key: String,
        ok: bool,
        at: Instant,
    },
    Watch {
        key: String,
        after: u64,
    },
}

struct Entry {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    revision: u64,
    entries: HashMap<String, Entry>,
    // every write per key, in version order
    history: HashMap<String, Vec<Versioned>>,
    ops: Vec<Op>,
    write_counts: HashMap<String, usize>,
    failing_writes: HashSet<(String, usize)>,
    failing_next_writes: HashMap<String, usize>,
    failing_deletes: usize,
    failing_watches: usize,
}

impl Inner {
    fn apply_write(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> u64 {
        self.revision += 1;
        let version = self.revision;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                version,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        self.history
            .entry(key.to_string())
            .or_default()
            .push(Versioned { value, version });
        version
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changed: Notify,
    in_flight_watches: AtomicUsize,
    max_in_flight_watches: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Write on behalf of some other party: not logged, never fails.
    pub fn publish(&self, key: &str, value: Vec<u8>) -> u64 {
        let version = self.inner.lock().unwrap().apply_write(key, value, None);
        self.changed.notify_waiters();
        version
    }

    /// Fail the `nth` (1-based) write to `key`.
    pub fn fail_write_number(&self, key: &str, nth: usize) {
        self.inner
            .lock()
            .unwrap()
            .failing_writes
            .insert((key.to_string(), nth));
    }

    /// Fail the next `count` writes to `key`.
    pub fn fail_next_writes(&self, key: &str, count: usize) {
        self.inner
            .lock()
            .unwrap()
            .failing_next_writes
            .insert(key.to_string(), count);
    }

    pub fn fail_next_deletes(&self, count: usize) {
        self.inner.lock().unwrap().failing_deletes = count;
    }

    pub fn fail_next_watches(&self, count: usize) {
        self.inner.lock().unwrap().failing_watches = count;
    }

    pub fn ops(&self) -> Vec<Op> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn writes_to(&self, key: &str) -> Vec<Op> {
        self.ops()
            .into_iter()
            .filter(|op| matches!(op, Op::Write { key: k, .. } if k == key))
            .collect()
    }

    pub fn successful_writes_to(&self, key: &str) -> Vec<Op> {
        self.writes_to(key)
            .into_iter()
            .filter(|op| matches!(op, Op::Write { ok: true, .. }))
            .collect()
    }

    pub fn deletes_of(&self, key: &str) -> Vec<Op> {
        self.ops()
            .into_iter()
            .filter(|op| matches!(op, Op::Delete { key: k, .. } if k == key))
            .collect()
    }

    /// `after` argument of every watch call on `key`, in call order.
    pub fn watch_cursors(&self, key: &str) -> Vec<u64> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Watch { key: k, after } if k == key => Some(after),
                _ => None,
            })
            .collect()
    }

    pub fn in_flight_watches(&self) -> usize {
        self.in_flight_watches.load(Ordering::SeqCst)
    }

    pub fn max_in_flight_watches(&self) -> usize {
        self.max_in_flight_watches.load(Ordering::SeqCst)
    }

    /// Whether `key` exists and its TTL, if any, has not run out.
    pub fn is_alive(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.entries.get(key) {
            Some(entry) => entry.expires_at.map_or(true, |at| Instant::now() < at),
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<Versioned> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(key).map(|entry| Versioned {
            value: entry.value.clone(),
            version: entry.version,
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn write(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64, StoreError> {
        let result = {
            let mut inner = self.inner.lock().unwrap();
            let count = inner.write_counts.entry(key.to_string()).or_default();
            *count += 1;
            let nth = *count;

            let scripted = inner.failing_writes.remove(&(key.to_string(), nth));
            let queued = match inner.failing_next_writes.get_mut(key) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };

            let result = if scripted || queued {
                Err(StoreError::Unavailable(format!("injected write failure #{}", nth)))
            } else {
                Ok(inner.apply_write(key, value.clone(), ttl))
            };

            inner.ops.push(Op::Write {
                key: key.to_string(),
                value,
                ttl,
                ok: result.is_ok(),
                at: Instant::now(),
            });
            result
        };

        if result.is_ok() {
            self.changed.notify_waiters();
        }
        result
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let fail = inner.failing_deletes > 0;
        if fail {
            inner.failing_deletes -= 1;
        } else {
            inner.entries.remove(key);
        }
        inner.ops.push(Op::Delete {
            key: key.to_string(),
            ok: !fail,
            at: Instant::now(),
        });

        if fail {
            Err(StoreError::Unavailable("injected delete failure".to_string()))
        } else {
            Ok(())
        }
    }

    async fn watch_from(&self, key: &str, after: u64) -> Result<Versioned, StoreError> {
        let now = self.in_flight_watches.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_watches.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight_watches);

        {
            let mut inner = self.inner.lock().unwrap();
            inner.ops.push(Op::Watch {
                key: key.to_string(),
                after,
            });
            if inner.failing_watches > 0 {
                inner.failing_watches -= 1;
                return Err(StoreError::Unavailable("injected watch failure".to_string()));
            }
        }

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let inner = self.inner.lock().unwrap();
                inner
                    .history
                    .get(key)
                    .and_then(|versions| versions.iter().find(|v| v.version > after).cloned())
            };
            if let Some(next) = next {
                return Ok(next);
            }

            notified.await;
        }
    }

    fn endpoints(&self) -> Vec<String> {
        vec!["memory://".to_string()]
    }
}
