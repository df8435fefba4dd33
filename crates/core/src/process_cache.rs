//! LRU coordinator bounding the number of live importer children.
//!
//! Channels register here on every use. When a new use would push the count
//! past the bound, the least-recently-used channel is closed gracefully
//! (checkpoint, close stdin, wait) before the newcomer spawns. Entries are
//! weak: the cache never keeps a channel alive, it only orders eviction.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::channel::FastImportChannel;
use crate::config::ExportConfig;

/// Default bound on simultaneously live children.
pub const DEFAULT_MAX_LIVE: usize = 100;

/// Process-wide coordinator. Create one and hand an `Arc` of it to every
/// repository.
pub struct ProcessCache {
    max_live: usize,
    lru: Mutex<VecDeque<(String, Weak<Mutex<FastImportChannel>>)>>,
}

impl ProcessCache {
    pub fn new(max_live: usize) -> Self {
        Self {
            max_live: max_live.max(1),
            lru: Mutex::new(VecDeque::new()),
        }
    }

    /// Bound taken from the configuration.
    pub fn from_config(config: &ExportConfig) -> Self {
        Self::new(config.max_live_processes)
    }

    /// Mark `name` as most recently used, evicting least-recent channels
    /// until the bound holds.
    pub fn touch(&self, name: &str, channel: &Arc<Mutex<FastImportChannel>>) {
        let mut lru = self.lru.lock().unwrap();
        lru.retain(|(n, _)| n != name);

        while lru.len() >= self.max_live {
            if let Some((evicted, weak)) = lru.pop_front() {
                if let Some(ch) = weak.upgrade() {
                    debug!(repository = %evicted, "evicting least-recently-used fast-import");
                    ch.lock().unwrap().close();
                }
            }
        }

        lru.push_back((name.to_string(), Arc::downgrade(channel)));
    }

    /// Forget a repository during its shutdown.
    pub fn remove(&self, name: &str) {
        self.lru.lock().unwrap().retain(|(n, _)| n != name);
    }

    /// Number of registered channels (dead weak refs included until their
    /// next touch).
    pub fn len(&self) -> usize {
        self.lru.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcessCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LIVE)
    }
}
