//! File-based item store with per-item locking
//!
//! Every item lives in its own container directory, `<root>/<id>/<name>`.
//! Uploads are written under `<root>/.staging/<id>` and renamed into place
//! once complete, so a container is only ever visible with its full
//! content. Readers and deleters of the same id are serialized through a
//! per-id read/write lock; unrelated ids never contend.

use crate::error::{Result, StashError};
use crate::id::StashId;
use crate::types::{DeleteOutcome, ItemInfo, ItemState};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

const STAGING_DIR: &str = ".staging";

/// Per-id coordination state, alive while anyone is reading or deleting
struct Slot {
    state: AtomicU8,
    lock: Arc<RwLock<()>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ItemState::Present as u8),
            lock: Arc::new(RwLock::new(())),
        }
    }

    fn state(&self) -> ItemState {
        ItemState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: ItemState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move `Present -> Deleting`; on failure returns the state that won
    fn claim(&self) -> std::result::Result<(), ItemState> {
        self.state
            .compare_exchange(
                ItemState::Present as u8,
                ItemState::Deleting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(ItemState::from_u8)
    }
}

type SlotTable = Arc<Mutex<HashMap<StashId, Arc<Slot>>>>;

fn lock_slots(table: &SlotTable) -> MutexGuard<'_, HashMap<StashId, Arc<Slot>>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reference to a slot that prunes it from the table when the last one
/// goes away. Every clone and release of the inner `Arc` happens under the
/// table lock, so the strong count is exact there.
struct SlotHandle {
    id: StashId,
    slot: Option<Arc<Slot>>,
    table: SlotTable,
}

impl SlotHandle {
    fn acquire(table: &SlotTable, id: StashId) -> Self {
        let slot = lock_slots(table)
            .entry(id)
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone();
        Self {
            id,
            slot: Some(slot),
            table: table.clone(),
        }
    }

    fn slot(&self) -> &Slot {
        // Only taken in Drop
        self.slot.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.table);
        if let Some(slot) = self.slot.take() {
            // The table's reference plus ours
            let last = Arc::strong_count(&slot) == 2;
            drop(slot);
            if last {
                slots.remove(&self.id);
            }
        }
    }
}

/// Streaming reader over a stashed item's content.
///
/// Holds a shared lock on the item for as long as it lives, so the
/// container cannot be removed underneath it. Dropping the reader, at end
/// of file or half way through, releases the lock.
pub struct ItemReader {
    file: File,
    /// Bytes left before the end of the content
    remaining: u64,
    complete: bool,
    _guard: OwnedRwLockReadGuard<()>,
    _handle: SlotHandle,
}

impl ItemReader {
    /// Whether the whole content has been read
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

impl AsyncRead for ItemReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let wanted = buf.remaining() > 0;
        let before = buf.filled().len();

        match Pin::new(&mut this.file).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = (buf.filled().len() - before) as u64;
                this.remaining = this.remaining.saturating_sub(read);
                // Consumers that stop after exactly `size` bytes never see
                // the end-of-file read, so reaching the size counts too
                if this.remaining == 0 || (wanted && read == 0) {
                    this.complete = true;
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for ItemReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemReader")
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}

/// An item opened for reading
#[derive(Debug)]
pub struct StoredItem {
    pub id: StashId,
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub reader: ItemReader,
}

/// Exclusive right to remove one item, obtained from
/// [`ItemStore::begin_delete`]. Until [`DeleteTicket::finish`] succeeds the
/// item reports `Deleting`; dropping the ticket earlier hands it back.
pub struct DeleteTicket {
    id: StashId,
    store: ItemStore,
    handle: SlotHandle,
    finished: bool,
}

impl DeleteTicket {
    pub fn id(&self) -> StashId {
        self.id
    }

    /// Wait for in-flight readers, then remove the container
    pub async fn finish(mut self) -> Result<DeleteOutcome> {
        let lock = self.handle.slot().lock.clone();
        let _exclusive = lock.write_owned().await;

        let outcome = match fs::remove_dir_all(self.store.container(&self.id)).await {
            Ok(()) => DeleteOutcome::Removed,
            Err(e) if e.kind() == io::ErrorKind::NotFound => DeleteOutcome::AlreadyGone,
            Err(e) => {
                warn!(id = %self.id, error = %e, "Failed to remove item container");
                return Err(StashError::delete(e));
            }
        };

        self.store.births.write().await.remove(&self.id);
        self.handle.slot().set(ItemState::Gone);
        self.finished = true;
        debug!(id = %self.id, ?outcome, "Item deleted");
        Ok(outcome)
    }
}

impl Drop for DeleteTicket {
    fn drop(&mut self) {
        if !self.finished {
            self.handle.slot().set(ItemState::Present);
        }
    }
}

/// On-disk store of stashed items
#[derive(Clone)]
pub struct ItemStore {
    /// Directory holding one container per item
    root: PathBuf,
    /// Where uploads are assembled before being moved into `root`
    staging: PathBuf,
    /// Coordination state of ids currently being read or deleted
    slots: SlotTable,
    /// Creation times of items stored by this process
    births: Arc<RwLock<HashMap<StashId, DateTime<Utc>>>>,
}

impl ItemStore {
    pub fn new(root: PathBuf) -> Self {
        let staging = root.join(STAGING_DIR);
        Self {
            root,
            staging,
            slots: Arc::new(Mutex::new(HashMap::new())),
            births: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create the stash directory and discard uploads left over from a
    /// previous process
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        match fs::remove_dir_all(&self.staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.staging).await?;
        info!(stash_dir = ?self.root, "Item store initialized");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container(&self, id: &StashId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Store `content` under a fresh id.
    ///
    /// Either the whole content ends up stored and its id is returned, or
    /// an error is returned and nothing is left on disk.
    pub async fn put<R>(&self, name: &str, mut content: R) -> Result<StashId>
    where
        R: AsyncRead + Unpin,
    {
        let name = sanitize_name(name)?;
        let id = StashId::allocate()?;
        let staged = self.staging.join(id.to_string());

        let size = match write_staged(&staged, &name, &mut content).await {
            Ok(size) => size,
            Err(e) => {
                discard(&staged).await;
                return Err(StashError::write(e));
            }
        };

        // Registered before the rename so a concurrent listing never has
        // to guess the creation time of a container we made
        self.births.write().await.insert(id, Utc::now());

        if let Err(e) = fs::rename(&staged, self.container(&id)).await {
            self.births.write().await.remove(&id);
            discard(&staged).await;
            return Err(StashError::write(e));
        }

        debug!(id = %id, name = %name, size, "Stored item");
        Ok(id)
    }

    /// Open an item for reading. Unknown, deleted and malformed items are
    /// all `None`.
    pub async fn get(&self, id: &StashId) -> Result<Option<StoredItem>> {
        let handle = SlotHandle::acquire(&self.slots, *id);
        if handle.slot().state() != ItemState::Present {
            return Ok(None);
        }

        let guard = handle.slot().lock.clone().read_owned().await;
        // A deleter may have claimed the item while we queued for the lock
        if handle.slot().state() != ItemState::Present {
            return Ok(None);
        }

        let container = self.container(id);
        let container_meta = match fs::metadata(&container).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !container_meta.is_dir() {
            warn!(id = %id, path = ?container, "Item container is not a directory");
            return Ok(None);
        }

        let Some(name) = select_content(id, &container).await? else {
            return Ok(None);
        };

        let file = match File::open(container.join(&name)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        let created_at = self.created_at(id, &container_meta).await;

        debug!(id = %id, name = %name, size, "Opened item");
        Ok(Some(StoredItem {
            id: *id,
            name,
            size,
            created_at,
            reader: ItemReader {
                file,
                remaining: size,
                // Nothing to read, and a consumer told the length is zero
                // may never poll at all
                complete: size == 0,
                _guard: guard,
                _handle: handle,
            },
        }))
    }

    /// Claim the removal of an item without waiting for it.
    ///
    /// From the moment this returns `Some`, new reads of the id find
    /// nothing. Returns `None` when another deleter already owns the
    /// removal or the item is gone.
    pub fn begin_delete(&self, id: &StashId) -> Option<DeleteTicket> {
        let handle = SlotHandle::acquire(&self.slots, *id);
        handle.slot().claim().ok()?;
        Some(DeleteTicket {
            id: *id,
            store: self.clone(),
            handle,
            finished: false,
        })
    }

    /// Remove an item and everything in its container. Safe to call on
    /// missing ids and concurrently for the same id; only one caller
    /// performs the removal.
    pub async fn delete(&self, id: &StashId) -> Result<DeleteOutcome> {
        let handle = SlotHandle::acquire(&self.slots, *id);
        match handle.slot().claim() {
            Ok(()) => {
                let ticket = DeleteTicket {
                    id: *id,
                    store: self.clone(),
                    handle,
                    finished: false,
                };
                ticket.finish().await
            }
            Err(ItemState::Gone) => Ok(DeleteOutcome::AlreadyGone),
            Err(_) => Ok(DeleteOutcome::InProgress),
        }
    }

    /// Snapshot of all stored items. Items created or removed while the
    /// scan runs may or may not be included.
    pub async fn list(&self) -> Result<Vec<ItemInfo>> {
        let mut items = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(id) = file_name.to_str().and_then(canonical_id) else {
                if file_name != STAGING_DIR {
                    debug!(entry = ?file_name, "Skipping unrecognized stash entry");
                }
                continue;
            };

            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                // Removed since the directory was read
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !meta.is_dir() {
                debug!(entry = ?file_name, "Skipping non-directory stash entry");
                continue;
            }

            let created_at = self.created_at(&id, &meta).await;
            items.push(ItemInfo { id, created_at });
        }

        self.forget_vanished(&items).await;
        Ok(items)
    }

    /// Drop birth records of containers that were removed without going
    /// through [`ItemStore::delete`]
    async fn forget_vanished(&self, listed: &[ItemInfo]) {
        let seen: HashSet<StashId> = listed.iter().map(|item| item.id).collect();
        let unseen: Vec<StashId> = self
            .births
            .read()
            .await
            .keys()
            .filter(|id| !seen.contains(*id))
            .copied()
            .collect();

        for id in unseen {
            // Staging first: a put renames staging into place, so once the
            // staged copy is gone the container check is authoritative
            let staged = fs::try_exists(self.staging.join(id.to_string())).await;
            if !matches!(staged, Ok(false)) {
                continue;
            }
            if matches!(fs::try_exists(self.container(&id)).await, Ok(false)) {
                debug!(id = %id, "Forgetting creation time of vanished container");
                self.births.write().await.remove(&id);
            }
        }
    }

    async fn created_at(&self, id: &StashId, container_meta: &Metadata) -> DateTime<Utc> {
        if let Some(born) = self.births.read().await.get(id) {
            return *born;
        }
        // Containers from before a restart carry no birth record
        filesystem_birth(id, container_meta.created(), container_meta.modified())
    }

    #[cfg(test)]
    async fn birth_count(&self) -> usize {
        self.births.read().await.len()
    }

    #[cfg(test)]
    fn active_slots(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

/// Creation time of a container from its filesystem times. Without either
/// time the container counts as ancient, so the sweeper reaps it.
fn filesystem_birth(
    id: &StashId,
    created: io::Result<SystemTime>,
    modified: io::Result<SystemTime>,
) -> DateTime<Utc> {
    match created.or(modified) {
        Ok(time) => DateTime::<Utc>::from(time),
        Err(e) => {
            warn!(id = %id, error = %e, "Item container has no timestamps, treating it as expired");
            DateTime::<Utc>::UNIX_EPOCH
        }
    }
}

/// Reduce a caller-supplied name to a bare file name
pub fn sanitize_name(name: &str) -> Result<String> {
    let base = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return Err(StashError::InvalidName(name.to_string()));
    }
    Ok(base.to_string())
}

/// Only the canonical rendering names a container
fn canonical_id(name: &str) -> Option<StashId> {
    StashId::parse(name).filter(|id| id.to_string() == name)
}

async fn write_staged<R>(dir: &Path, name: &str, content: &mut R) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    fs::create_dir(dir).await?;
    let mut file = File::create(dir.join(name)).await?;
    let size = tokio::io::copy(content, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(size)
}

async fn discard(dir: &Path) {
    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?dir, error = %e, "Failed to discard staged upload"),
    }
}

/// Pick the content file of a container. There should be exactly one; if
/// there are several the smallest file name wins.
async fn select_content(id: &StashId, container: &Path) -> Result<Option<String>> {
    let mut entries = match fs::read_dir(container).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name());
        }
    }
    names.sort();

    match names.len() {
        0 => {
            warn!(id = %id, "Item container holds no content file");
            Ok(None)
        }
        1 => Ok(Some(names[0].to_string_lossy().into_owned())),
        count => {
            warn!(id = %id, count, chosen = ?names[0], "Item container holds several files");
            Ok(Some(names[0].to_string_lossy().into_owned()))
        }
    }
}
