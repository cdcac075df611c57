//! Bounded local notification history and the pending queue.
//!
//! [`LocalCache`] keeps the most recent notifications, newest first, and a
//! maintained unread aggregate. Every mutating entry point updates the
//! sequence and the aggregate together before returning, so readers never
//! see one without the other.
//!
//! When a path is configured the cache is written to disk after each
//! mutation (temp file + rename). Write failures are logged; the in-memory
//! state stays authoritative.
//!
//! [`PendingQueue`] holds notifications that arrived before the host could
//! present them. It is strictly FIFO.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::notification::{Notification, NotificationId};

const CACHE_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    notifications: Vec<Notification>,
}

/// Capacity-bounded notification history, most recent first.
#[derive(Debug)]
pub struct LocalCache {
    entries: VecDeque<Notification>,
    unread: usize,
    capacity: usize,
    path: Option<PathBuf>,
}

impl LocalCache {
    /// In-memory cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            unread: 0,
            capacity,
            path: None,
        }
    }

    /// Cache persisted at `path`, seeded from the file if it exists.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self, CacheError> {
        let path = path.into();
        let mut cache = Self::new(capacity);

        match fs::read_to_string(&path) {
            Ok(contents) => {
                let file: CacheFile = serde_json::from_str(&contents)?;
                for notification in file.notifications {
                    if cache.entries.len() >= cache.capacity {
                        break;
                    }
                    if cache.contains(&notification.id) {
                        continue;
                    }
                    if notification.is_unread() {
                        cache.unread += 1;
                    }
                    cache.entries.push_back(notification);
                }
                log::info!(
                    "[Cache] Loaded {} notifications ({} unread) from {}",
                    cache.entries.len(),
                    cache.unread,
                    path.display()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("[Cache] No cache file at {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        cache.path = Some(path);
        cache.check_aggregate();
        Ok(cache)
    }

    /// Insert `notification` at the front unless its id is already cached.
    ///
    /// Returns `true` if the notification was inserted. Redelivered ids are
    /// ignored and keep their position. The oldest entries are evicted when
    /// over capacity.
    pub fn upsert(&mut self, notification: Notification) -> bool {
        if self.contains(&notification.id) {
            log::debug!("[Cache] Ignoring redelivered {}", notification.id);
            return false;
        }

        if notification.is_unread() {
            self.unread += 1;
        }
        self.entries.push_front(notification);

        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_back() {
                if evicted.is_unread() {
                    self.unread -= 1;
                }
                log::trace!("[Cache] Evicted {}", evicted.id);
            }
        }

        self.check_aggregate();
        self.persist();
        true
    }

    /// Set `read_at` on `id` if it is unread. Returns `true` on change.
    pub fn mark_read(&mut self, id: &NotificationId) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|n| &n.id == id && n.is_unread())
        else {
            return false;
        };
        entry.read_at = Some(Utc::now());
        self.unread -= 1;

        self.check_aggregate();
        self.persist();
        true
    }

    /// Mark every unread entry read. Returns how many changed.
    pub fn mark_all_read(&mut self) -> usize {
        if self.unread == 0 {
            return 0;
        }
        let now = Utc::now();
        let mut changed = 0;
        for entry in self.entries.iter_mut().filter(|n| n.is_unread()) {
            entry.read_at = Some(now);
            changed += 1;
        }
        self.unread = 0;

        self.check_aggregate();
        self.persist();
        changed
    }

    /// Number of unread entries.
    pub fn unread_count(&self) -> usize {
        self.unread
    }

    /// Remove `id` from the history.
    pub fn remove(&mut self, id: &NotificationId) -> Option<Notification> {
        let index = self.entries.iter().position(|n| &n.id == id)?;
        let removed = self.entries.remove(index)?;
        if removed.is_unread() {
            self.unread -= 1;
        }

        self.check_aggregate();
        self.persist();
        Some(removed)
    }

    /// Drop the whole history.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.unread = 0;
        self.persist();
    }

    /// Cached notifications, newest first.
    pub fn list(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    /// Look up `id`.
    pub fn get(&self, id: &NotificationId) -> Option<&Notification> {
        self.entries.iter().find(|n| &n.id == id)
    }

    /// Whether `id` is cached.
    pub fn contains(&self, id: &NotificationId) -> bool {
        self.entries.iter().any(|n| &n.id == id)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Persistence path, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the cache to its path. No-op for in-memory caches.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if serialization or any file operation fails.
    pub fn save(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = CacheFile {
            version: CACHE_FILE_VERSION,
            notifications: self.entries.iter().cloned().collect(),
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            log::warn!("[Cache] Failed to persist cache: {}", e);
        }
    }

    fn check_aggregate(&self) {
        debug_assert_eq!(
            self.unread,
            self.entries.iter().filter(|n| n.is_unread()).count(),
            "unread aggregate out of sync"
        );
    }
}

/// Notifications waiting for the host to become ready, in arrival order.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: VecDeque<Notification>,
}

impl PendingQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `notification`.
    pub fn enqueue(&mut self, notification: Notification) {
        self.items.push_back(notification);
    }

    /// Upsert every queued item into `cache` in arrival order and empty the
    /// queue. Returns the newly inserted items in the same order, each with
    /// the unread count right after its own insertion.
    pub fn drain_into(&mut self, cache: &mut LocalCache) -> Vec<(Notification, usize)> {
        let mut inserted = Vec::new();
        for notification in self.items.drain(..) {
            if cache.upsert(notification.clone()) {
                inserted.push((notification, cache.unread_count()));
            }
        }
        inserted
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
