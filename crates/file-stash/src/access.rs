//! Access policy and content delivery

use crate::id::StashId;
use crate::store::{ItemReader, ItemStore, StoredItem};
use crate::types::DeleteOutcome;
use chrono::{DateTime, Utc};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, warn};

/// What happens to an item once it has been read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    /// Remove the item right after its content was delivered in full
    DeleteAfterAccess,
    /// Keep serving the item until the sweeper ages it out
    RetainUntilExpired,
}

impl AccessPolicy {
    pub fn from_delete_after_access(delete_after_access: bool) -> Self {
        if delete_after_access {
            AccessPolicy::DeleteAfterAccess
        } else {
            AccessPolicy::RetainUntilExpired
        }
    }
}

/// Removal scheduled for when a delivery ends
pub(crate) struct FollowUp {
    pub(crate) store: ItemStore,
    pub(crate) consumed: Arc<AtomicU64>,
}

/// Content of an item on its way to a caller.
///
/// Reading it streams the stored file. When it is dropped after the
/// content was read to the end and a follow-up removal is attached, the
/// item is claimed for deletion on the spot (later reads find nothing)
/// and removed by a task on the current runtime, off the caller's path.
/// Dropped early, for instance because the caller went away, it only
/// releases its hold on the item.
pub struct Delivery {
    id: StashId,
    name: String,
    size: u64,
    created_at: DateTime<Utc>,
    reader: Option<ItemReader>,
    follow_up: Option<FollowUp>,
}

impl Delivery {
    pub(crate) fn new(item: StoredItem, follow_up: Option<FollowUp>) -> Self {
        Self {
            id: item.id,
            name: item.name,
            size: item.size,
            created_at: item.created_at,
            reader: Some(item.reader),
            follow_up,
        }
    }

    pub fn id(&self) -> StashId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_complete(&self) -> bool {
        self.reader.as_ref().is_some_and(ItemReader::is_complete)
    }
}

impl AsyncRead for Delivery {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.reader.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        let complete = reader.is_complete();

        let Some(follow_up) = self.follow_up.take() else {
            return;
        };
        if !complete {
            debug!(id = %self.id, "Delivery ended before end of content, keeping item");
            return;
        }

        // Claimed while our read hold is still in place, so no new reader
        // can slip in between
        let ticket = follow_up.store.begin_delete(&self.id);
        drop(reader);

        let Some(ticket) = ticket else {
            // Someone else is already removing it
            return;
        };

        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match ticket.finish().await {
                        Ok(DeleteOutcome::Removed) => {
                            follow_up.consumed.fetch_add(1, Ordering::Relaxed);
                            debug!(id = %id, "Removed item after access");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(id = %id, error = %e, "Failed to remove accessed item, leaving it to the sweeper");
                        }
                    }
                });
            }
            Err(_) => {
                warn!(id = %id, "No runtime to remove accessed item, leaving it to the sweeper");
            }
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("delete_after_access", &self.follow_up.is_some())
            .finish_non_exhaustive()
    }
}
