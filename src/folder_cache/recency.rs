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

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use super::{FolderCache, FolderKey, FolderSnapshot};

/// Bounds another cache by recency of use.
///
/// Every key written or touched through this wrapper is tracked with the time
/// it was last used. Once more than `threshold` keys are tracked, the least
/// recently used ones are evicted from the wrapped backend, but only while
/// they have gone unused for longer than the idle period plus the grace
/// period. A burst of recently used folders can therefore push the tracked
/// set above the threshold for a while.
pub struct RecencyCache {
    backend: Arc<dyn FolderCache>,
    threshold: usize,
    max_idle: Duration,
    state: Mutex<RecencyState>,
}

#[derive(Default)]
struct RecencyState {
    last_used: HashMap<FolderKey, Instant>,
    by_time: BTreeSet<(Instant, FolderKey)>,
}

impl RecencyState {
    fn record(&mut self, key: &FolderKey, now: Instant) {
        if let Some(prev) = self.last_used.insert(key.clone(), now) {
            self.by_time.remove(&(prev, key.clone()));
        }
        self.by_time.insert((now, key.clone()));
    }

    fn forget(&mut self, key: &FolderKey) {
        if let Some(prev) = self.last_used.remove(key) {
            self.by_time.remove(&(prev, key.clone()));
        }
    }
}

impl RecencyCache {
    pub fn new(
        backend: Arc<dyn FolderCache>,
        threshold: usize,
        idle: Duration,
        grace: Duration,
    ) -> Self {
        RecencyCache {
            backend,
            threshold,
            max_idle: idle + grace,
            state: Mutex::new(RecencyState::default()),
        }
    }

    /// The number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().last_used.len()
    }

    pub fn put_at(
        &self,
        key: &FolderKey,
        snapshot: &FolderSnapshot,
        now: Instant,
    ) {
        self.backend.put(key, snapshot);
        self.record_and_evict(key, now);
    }

    pub fn touch_at(&self, key: &FolderKey, now: Instant) {
        self.backend.touch(key);
        self.record_and_evict(key, now);
    }

    pub fn get_at(
        &self,
        key: &FolderKey,
        now: Instant,
    ) -> Option<FolderSnapshot> {
        let snapshot = self.backend.get(key);
        let mut state = self.state.lock().unwrap();
        if snapshot.is_some() {
            state.record(key, now);
        } else {
            state.forget(key);
        }
        snapshot
    }

    fn record_and_evict(&self, key: &FolderKey, now: Instant) {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            state.record(key, now);

            let mut evicted = Vec::new();
            while state.last_used.len() > self.threshold {
                let oldest = match state.by_time.iter().next() {
                    Some(&(at, ref k)) => (at, k.clone()),
                    None => break,
                };

                if now.saturating_duration_since(oldest.0) <= self.max_idle {
                    break;
                }

                state.by_time.remove(&oldest);
                state.last_used.remove(&oldest.1);
                evicted.push(oldest.1);
            }
            evicted
        };

        // Backend I/O happens outside the lock
        for key in evicted {
            debug!("Evicting idle folder {} from {}", key, self.backend.name());
            self.backend.remove(&key);
        }
    }
}

impl FolderCache for RecencyCache {
    fn name(&self) -> &'static str {
        "recency"
    }

    fn put(&self, key: &FolderKey, snapshot: &FolderSnapshot) {
        self.put_at(key, snapshot, Instant::now());
    }

    fn get(&self, key: &FolderKey) -> Option<FolderSnapshot> {
        self.get_at(key, Instant::now())
    }

    fn remove(&self, key: &FolderKey) {
        self.state.lock().unwrap().forget(key);
        self.backend.remove(key);
    }

    fn touch(&self, key: &FolderKey) {
        self.touch_at(key, Instant::now());
    }
}
