//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Quillmap.
//
// Quillmap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Quillmap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Quillmap. If not, see <http://www.gnu.org/licenses/>.

//! Caches of folder snapshots.
//!
//! A session which selects a folder builds a `FolderSnapshot` of it. When the
//! session goes idle or deselects the folder, the snapshot is written to one
//! of two partitions so that a later session (or the same one, once it wakes
//! up) can restore it without rebuilding from the store:
//!
//! - The *active* partition holds snapshots of folders whose session is still
//!   alive but has paged its state out of memory. It is bounded by recency.
//!
//! - The *inactive* partition holds snapshots of folders no session currently
//!   has selected. When a memcached server is configured it lives there so
//!   that other hosts can share it; otherwise it is the same cache as the
//!   active partition.
//!
//! Every backend treats its own failures as misses. A lost snapshot only
//! costs a rebuild.

pub mod disk;
pub mod distributed;
pub mod memcached;
pub mod recency;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::support::error::Error;
use crate::support::system_config::CacheConfig;

pub use self::disk::DiskFolderCache;
pub use self::distributed::{DistributedFolderCache, SharedCacheClient};
pub use self::memcached::MemcachedClient;
pub use self::recency::RecencyCache;

/// Identifies one cached snapshot.
///
/// `discriminator` distinguishes snapshots of the same folder taken at
/// different points of its history (e.g. `"<modseq>.<uidvalidity>"`), or
/// private to one session. Snapshots sharing `account` and `mailbox` are
/// considered versions of each other.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FolderKey {
    pub account: String,
    pub mailbox: String,
    pub discriminator: String,
}

impl FolderKey {
    pub fn new(
        account: impl Into<String>,
        mailbox: impl Into<String>,
        discriminator: impl Into<String>,
    ) -> Self {
        FolderKey {
            account: account.into(),
            mailbox: mailbox.into(),
            discriminator: discriminator.into(),
        }
    }
}

impl fmt::Display for FolderKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}#{}", self.account, self.mailbox, self.discriminator)
    }
}

/// The session-side view of a selected folder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSnapshot {
    pub uid_validity: u32,
    pub uid_next: u32,
    pub highest_modseq: u64,
    /// Flags defined in the folder.
    pub flags: Vec<String>,
    /// Messages in sequence number order.
    pub messages: Vec<SnapshotMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub uid: u32,
    pub flags: Vec<String>,
}

/// A key/value store of folder snapshots.
///
/// None of these operations fail from the caller's point of view.
/// Implementations log their errors and degrade to a miss or a no-op.
pub trait FolderCache: Send + Sync {
    /// A short name for log messages.
    fn name(&self) -> &'static str;

    fn put(&self, key: &FolderKey, snapshot: &FolderSnapshot);
    fn get(&self, key: &FolderKey) -> Option<FolderSnapshot>;
    fn remove(&self, key: &FolderKey);
    /// Mark `key` as recently used without reading it.
    fn touch(&self, key: &FolderKey);
}

/// A process-local cache, used when no durable directory is configured.
#[derive(Default)]
pub struct MemoryFolderCache {
    entries: Mutex<HashMap<FolderKey, FolderSnapshot>>,
}

impl MemoryFolderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl FolderCache for MemoryFolderCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn put(&self, key: &FolderKey, snapshot: &FolderSnapshot) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.clone(), snapshot.clone());
    }

    fn get(&self, key: &FolderKey) -> Option<FolderSnapshot> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn remove(&self, key: &FolderKey) {
        self.entries.lock().unwrap().remove(key);
    }

    fn touch(&self, _: &FolderKey) {}
}

/// Which half of `FolderCaches` a snapshot is written to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Partition {
    /// The owning session is alive but idle.
    Active,
    /// No session has the folder selected.
    Inactive,
}

/// The pair of partitions shared by every session of the server.
#[derive(Clone)]
pub struct FolderCaches {
    active: Arc<dyn FolderCache>,
    inactive: Arc<dyn FolderCache>,
}

impl FolderCaches {
    pub fn new(
        active: Arc<dyn FolderCache>,
        inactive: Arc<dyn FolderCache>,
    ) -> Self {
        FolderCaches { active, inactive }
    }

    /// Use one cache for both partitions.
    pub fn unified(cache: Arc<dyn FolderCache>) -> Self {
        FolderCaches {
            active: Arc::clone(&cache),
            inactive: cache,
        }
    }

    /// Build the partitions described by `config`.
    ///
    /// The active partition is a `RecencyCache` over the durable disk cache
    /// under `config.dir`, or over process memory if that is empty. The disk
    /// cache is swept as it is opened. The inactive partition is memcached if
    /// configured, and otherwise shares the active partition.
    pub fn from_config(config: &CacheConfig) -> Result<Self, Error> {
        let base: Arc<dyn FolderCache> = if config.dir == Path::new("") {
            Arc::new(MemoryFolderCache::new())
        } else {
            let (disk, pruned) = DiskFolderCache::open(&config.dir)?;
            info!(
                "Opened folder cache in {}, pruned {} stale entries",
                config.dir.display(),
                pruned
            );
            Arc::new(disk)
        };

        let active: Arc<dyn FolderCache> = Arc::new(RecencyCache::new(
            base,
            config.active_threshold,
            Duration::from_secs(config.idle_secs),
            Duration::from_secs(config.grace_secs),
        ));

        if config.memcached.is_empty() {
            Ok(FolderCaches::unified(active))
        } else {
            let client = MemcachedClient::new(
                config.memcached.clone(),
                Duration::from_millis(config.memcached_timeout_ms),
            );
            let inactive = Arc::new(DistributedFolderCache::new(
                Box::new(client),
                config.memcached_ttl_secs,
            ));
            Ok(FolderCaches::new(active, inactive))
        }
    }

    /// Look `key` up in the inactive partition, then the active one.
    pub fn load(&self, key: &FolderKey) -> Option<FolderSnapshot> {
        self.inactive.get(key).or_else(|| {
            if self.is_unified() {
                None
            } else {
                self.active.get(key)
            }
        })
    }

    pub fn store(
        &self,
        partition: Partition,
        key: &FolderKey,
        snapshot: &FolderSnapshot,
    ) {
        self.partition(partition).put(key, snapshot);
    }

    /// Remove `key` from `partition`, returning the snapshot it held.
    pub fn take(
        &self,
        partition: Partition,
        key: &FolderKey,
    ) -> Option<FolderSnapshot> {
        let cache = self.partition(partition);
        let snapshot = cache.get(key);
        if snapshot.is_some() {
            cache.remove(key);
        }
        snapshot
    }

    pub fn touch(&self, partition: Partition, key: &FolderKey) {
        self.partition(partition).touch(key);
    }

    /// Remove `key` from both partitions.
    pub fn invalidate(&self, key: &FolderKey) {
        self.active.remove(key);
        if !self.is_unified() {
            self.inactive.remove(key);
        }
    }

    pub fn is_unified(&self) -> bool {
        Arc::ptr_eq(&self.active, &self.inactive)
    }

    fn partition(&self, partition: Partition) -> &dyn FolderCache {
        match partition {
            Partition::Active => &*self.active,
            Partition::Inactive => &*self.inactive,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_snapshot(uid_next: u32) -> FolderSnapshot {
    FolderSnapshot {
        uid_validity: 42,
        uid_next,
        highest_modseq: u64::from(uid_next) * 3,
        flags: vec!["\\Seen".to_owned(), "\\Flagged".to_owned()],
        messages: (1..uid_next)
            .map(|uid| SnapshotMessage {
                uid,
                flags: if 0 == uid % 2 {
                    vec!["\\Seen".to_owned()]
                } else {
                    vec![]
                },
            })
            .collect(),
    }
}
