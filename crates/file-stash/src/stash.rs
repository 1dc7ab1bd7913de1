//! The stash: store, access policy and eviction wired together

use crate::access::{AccessPolicy, Delivery, FollowUp};
use crate::error::Result;
use crate::id::StashId;
use crate::store::ItemStore;
use crate::sweeper::Sweeper;
use crate::types::{DeleteOutcome, StashConfig, StashStats};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Counters {
    stored: AtomicU64,
    failed_uploads: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    consumed: Arc<AtomicU64>,
    swept: Arc<AtomicU64>,
}

/// Transient file stash.
///
/// Files go in with [`Stash::put`] and come back out through
/// [`Stash::get`]. Depending on the [`AccessPolicy`] an item disappears
/// after its first complete read, or stays until the sweeper returned by
/// [`Stash::sweeper`] finds it older than the configured maximum age.
pub struct Stash {
    store: ItemStore,
    policy: AccessPolicy,
    config: StashConfig,
    counters: Arc<Counters>,
}

impl Stash {
    /// Open a stash, creating its directory if needed
    pub async fn open(config: StashConfig) -> Result<Self> {
        let store = ItemStore::new(config.stash_dir.clone());
        store.init().await?;

        let policy = AccessPolicy::from_delete_after_access(config.delete_after_access);
        info!(
            stash_dir = ?config.stash_dir,
            ?policy,
            max_item_age_ms = config.max_item_age.as_millis() as u64,
            "Stash opened"
        );

        Ok(Self {
            store,
            policy,
            config,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn policy(&self) -> AccessPolicy {
        self.policy
    }

    pub fn config(&self) -> &StashConfig {
        &self.config
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    /// Stash one file
    pub async fn put<R>(&self, name: &str, content: R) -> Result<StashId>
    where
        R: AsyncRead + Unpin,
    {
        match self.store.put(name, content).await {
            Ok(id) => {
                self.counters.stored.fetch_add(1, Ordering::Relaxed);
                Ok(id)
            }
            Err(e) => {
                self.counters.failed_uploads.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Stash several files, one slot per file in the order given.
    ///
    /// A file that cannot be stored leaves `None` in its slot and does not
    /// affect the others.
    pub async fn put_batch<I, R>(&self, parts: I) -> Vec<Option<StashId>>
    where
        I: IntoIterator<Item = (String, R)>,
        R: AsyncRead + Unpin,
    {
        let mut slots = Vec::new();
        for (name, content) in parts {
            match self.put(&name, content).await {
                Ok(id) => slots.push(Some(id)),
                Err(e) => {
                    warn!(name = %name, error = %e, "Failed to stash file");
                    slots.push(None);
                }
            }
        }
        slots
    }

    /// Open an item for delivery. Unknown, expired and already consumed
    /// ids give `None`.
    pub async fn get(&self, id: &StashId) -> Option<Delivery> {
        let item = match self.store.get(id).await {
            Ok(item) => item,
            Err(e) => {
                warn!(id = %id, error = %e, "Failed to open item");
                None
            }
        };

        let Some(item) = item else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(id = %id, "Item not found");
            return None;
        };
        self.counters.hits.fetch_add(1, Ordering::Relaxed);

        let follow_up = match self.policy {
            AccessPolicy::DeleteAfterAccess => Some(FollowUp {
                store: self.store.clone(),
                consumed: self.counters.consumed.clone(),
            }),
            AccessPolicy::RetainUntilExpired => None,
        };
        Some(Delivery::new(item, follow_up))
    }

    /// Remove an item regardless of policy
    pub async fn delete(&self, id: &StashId) -> Result<DeleteOutcome> {
        self.store.delete(id).await
    }

    /// Sweeper for this stash, configured from its settings. Call
    /// [`Sweeper::spawn`] to start it.
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.store.clone(),
            self.config.max_item_age,
            self.config.sweep_interval,
        )
        .with_counter(self.counters.swept.clone())
    }

    pub fn stats(&self) -> StashStats {
        let c = &self.counters;
        StashStats {
            stored: c.stored.load(Ordering::Relaxed),
            failed_uploads: c.failed_uploads.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            consumed: c.consumed.load(Ordering::Relaxed),
            swept: c.swept.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FailingReader;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::io::AsyncReadExt;
    use tokio::time::sleep;

    async fn open_stash(delete_after_access: bool) -> (TempDir, Stash) {
        let dir = tempdir().unwrap();
        let stash = Stash::open(StashConfig {
            stash_dir: dir.path().join("stash"),
            max_item_age: Duration::from_millis(100),
            delete_after_access,
            sweep_interval: Duration::from_millis(50),
        })
        .await
        .unwrap();
        (dir, stash)
    }

    async fn read_all(delivery: &mut Delivery) -> Vec<u8> {
        let mut data = Vec::new();
        delivery.read_to_end(&mut data).await.unwrap();
        data
    }

    #[tokio::test]
    async fn test_consumed_after_first_read() {
        let (_dir, stash) = open_stash(true).await;
        let id = stash.put("a.txt", &b"hello"[..]).await.unwrap();

        let mut delivery = stash.get(&id).await.unwrap();
        assert_eq!(delivery.name(), "a.txt");
        assert_eq!(delivery.size(), 5);
        assert_eq!(read_all(&mut delivery).await, b"hello");
        assert!(delivery.is_complete());
        drop(delivery);

        assert!(stash.get(&id).await.is_none());

        // Removal itself happens in the background
        sleep(Duration::from_millis(50)).await;
        assert!(stash.store().list().await.unwrap().is_empty());

        let stats = stash.stats();
        assert_eq!(stats.stored, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.consumed, 1);
    }

    #[tokio::test]
    async fn test_abandoned_delivery_keeps_item() {
        let (_dir, stash) = open_stash(true).await;
        let id = stash.put("a.txt", &b"hello world"[..]).await.unwrap();

        let mut delivery = stash.get(&id).await.unwrap();
        let mut head = [0u8; 5];
        delivery.read_exact(&mut head).await.unwrap();
        drop(delivery);

        let mut retry = stash.get(&id).await.unwrap();
        assert_eq!(read_all(&mut retry).await, b"hello world");
    }

    #[tokio::test]
    async fn test_retained_items_serve_repeatedly_until_swept() {
        let (_dir, stash) = open_stash(false).await;
        let payload: Vec<u8> = (0..=255).collect();
        let id = stash.put("b.bin", &payload[..]).await.unwrap();

        for _ in 0..3 {
            let mut delivery = stash.get(&id).await.unwrap();
            assert_eq!(delivery.size(), 256);
            assert_eq!(read_all(&mut delivery).await, payload);
        }

        let sweeper = stash.sweeper().spawn();
        sleep(Duration::from_millis(300)).await;
        assert!(stash.get(&id).await.is_none());
        assert_eq!(stash.stats().swept, 1);
        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_in_flight_delivery_survives_sweep() {
        let (_dir, stash) = open_stash(false).await;
        let payload: Vec<u8> = (0..32 * 1024).map(|i| (i % 253) as u8).collect();
        let id = stash.put("big.bin", &payload[..]).await.unwrap();

        let mut delivery = stash.get(&id).await.unwrap();
        let mut received = vec![0u8; 4096];
        delivery.read_exact(&mut received).await.unwrap();

        sleep(Duration::from_millis(150)).await;
        let report = stash.sweeper().sweep_once().await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.removed, 0);

        delivery.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);
        drop(delivery);

        sleep(Duration::from_millis(50)).await;
        assert!(stash.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_finished_delivery_and_waiting_sweep_remove_once() {
        let (_dir, stash) = open_stash(true).await;
        let payload: Vec<u8> = (0..32 * 1024).map(|i| (i % 241) as u8).collect();
        let id = stash.put("big.bin", &payload[..]).await.unwrap();

        let mut delivery = stash.get(&id).await.unwrap();
        let mut received = vec![0u8; 4096];
        delivery.read_exact(&mut received).await.unwrap();

        // The sweep claims the item and then waits for our reader
        sleep(Duration::from_millis(150)).await;
        let report = stash.sweeper().sweep_once().await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.removed, 0);
        assert!(stash.get(&id).await.is_none());

        delivery.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);
        assert!(delivery.is_complete());
        drop(delivery);

        sleep(Duration::from_millis(50)).await;
        assert!(stash.get(&id).await.is_none());
        assert!(stash.store().list().await.unwrap().is_empty());

        let stats = stash.stats();
        assert_eq!(stats.consumed + stats.swept, 1);
        assert_eq!(stats.swept, 1);
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_isolates_failures() {
        let (_dir, stash) = open_stash(true).await;
        let parts: Vec<(String, Box<dyn AsyncRead + Unpin + Send>)> = vec![
            ("one.txt".to_string(), Box::new(&b"one"[..])),
            ("two.txt".to_string(), Box::new(FailingReader::new(b"tw"))),
            ("three.txt".to_string(), Box::new(&b"three"[..])),
        ];

        let slots = stash.put_batch(parts).await;
        assert_eq!(slots.len(), 3);
        assert!(slots[0].is_some());
        assert!(slots[1].is_none());
        assert!(slots[2].is_some());

        let mut first = stash.get(&slots[0].unwrap()).await.unwrap();
        assert_eq!(first.name(), "one.txt");
        assert_eq!(read_all(&mut first).await, b"one");

        let mut third = stash.get(&slots[2].unwrap()).await.unwrap();
        assert_eq!(third.name(), "three.txt");
        assert_eq!(read_all(&mut third).await, b"three");

        let stats = stash.stats();
        assert_eq!(stats.stored, 2);
        assert_eq!(stats.failed_uploads, 1);
    }

    #[tokio::test]
    async fn test_explicit_delete() {
        let (_dir, stash) = open_stash(false).await;
        let id = stash.put("a.txt", &b"hello"[..]).await.unwrap();
        assert_eq!(stash.delete(&id).await.unwrap(), DeleteOutcome::Removed);
        assert_eq!(stash.delete(&id).await.unwrap(), DeleteOutcome::AlreadyGone);
        assert!(stash.get(&id).await.is_none());
    }
}
