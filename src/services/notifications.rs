//! In-process publish channel for file events.
//!
//! Every mutation publishes one [`FileEvent`]; subscribers only ever see the
//! events of their own tenant. Nothing is persisted: a subscriber that falls
//! behind skips the events it missed.

use super::tenant::TenantContext;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileEvent {
    FolderCreated { path: String },
    FolderMoved { old_path: String, new_path: String },
    FolderDeleted { path: String },
    FileUploaded { path: String },
    FilesMoved { paths: Vec<String>, target: String },
    FileRenamed { old_path: String, new_path: String },
    FilesDeleted { paths: Vec<String> },
    MetadataSaved { path: String },
}

impl FileEvent {
    /// Event name used on the wire, e.g. `folder_created`.
    pub fn name(&self) -> &'static str {
        match self {
            FileEvent::FolderCreated { .. } => "folder_created",
            FileEvent::FolderMoved { .. } => "folder_moved",
            FileEvent::FolderDeleted { .. } => "folder_deleted",
            FileEvent::FileUploaded { .. } => "file_uploaded",
            FileEvent::FilesMoved { .. } => "files_moved",
            FileEvent::FileRenamed { .. } => "file_renamed",
            FileEvent::FilesDeleted { .. } => "files_deleted",
            FileEvent::MetadataSaved { .. } => "metadata_saved",
        }
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct Notification {
    pub tenant_id: String,
    pub actor_id: String,
    pub at: DateTime<Utc>,
    pub event: FileEvent,
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Arc<Notification>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, ctx: &TenantContext, event: FileEvent) {
        let notification = Notification {
            tenant_id: ctx.tenant_id.to_string(),
            actor_id: ctx.actor_id.clone(),
            at: Utc::now(),
            event,
        };
        // No subscribers is not an error.
        match self.tx.send(Arc::new(notification)) {
            Ok(receivers) => debug!(receivers, "published file event"),
            Err(_) => debug!("file event dropped, nobody subscribed"),
        }
    }

    pub fn subscribe(&self, ctx: &TenantContext) -> TenantEvents {
        TenantEvents {
            tenant_id: ctx.tenant_id.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

/// A subscription filtered to one tenant.
pub struct TenantEvents {
    tenant_id: String,
    rx: broadcast::Receiver<Arc<Notification>>,
}

impl TenantEvents {
    /// Next event for this tenant; `None` once the notifier is gone.
    pub async fn recv(&mut self) -> Option<Arc<Notification>> {
        loop {
            match self.rx.recv().await {
                Ok(notification) if notification.tenant_id == self.tenant_id => {
                    return Some(notification);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(tenant = %self.tenant_id, skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<Notification>> + Send {
        futures::stream::unfold(self, |mut events| async move {
            events.recv().await.map(|n| (n, events))
        })
    }
}
