//! Live-thread registry.
//!
//! Tracks which script threads exist, who spawned whom, and derives the
//! ancestor chain used to stitch coroutine stacks into one logical call
//! stack. Mutations come exclusively from the VM thread (the
//! user-thread callback fires there); the DAP side only reads, and only
//! through a Break episode or the `threads` request.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use luaud_vm::ThreadId;

/// Registry of live script threads and their parents.
#[derive(Debug, Default)]
pub struct VmRegistry {
    main: Option<ThreadId>,
    /// Alive threads mapped to their spawning parent (`None` for main).
    alive: HashMap<ThreadId, Option<ThreadId>>,
}

/// Row of the DAP `threads` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub key: i64,
    pub thread: ThreadId,
    pub name: String,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the VM's main state.
    pub fn register_main(&mut self, thread: ThreadId) {
        self.main = Some(thread);
        self.alive.insert(thread, None);
    }

    pub fn main(&self) -> Option<ThreadId> {
        self.main
    }

    pub fn mark_alive(&mut self, thread: ThreadId, parent: ThreadId) {
        self.alive.insert(thread, Some(parent));
    }

    pub fn mark_dead(&mut self, thread: ThreadId) {
        self.alive.remove(&thread);
    }

    pub fn is_alive(&self, thread: ThreadId) -> bool {
        self.alive.contains_key(&thread)
    }

    pub fn parent(&self, thread: ThreadId) -> Option<ThreadId> {
        self.alive.get(&thread).copied().flatten()
    }

    /// True when `thread` is a (transitive) descendant of `parent`.
    pub fn is_child(&self, thread: ThreadId, parent: ThreadId) -> bool {
        let mut current = thread;
        while let Some(p) = self.parent(current) {
            if p == parent {
                return true;
            }
            current = p;
        }
        false
    }

    /// Root of the ancestor chain (main for well-formed programs).
    pub fn root(&self, thread: ThreadId) -> ThreadId {
        let mut current = thread;
        while let Some(p) = self.parent(current) {
            current = p;
        }
        current
    }

    /// The chain `[thread, parent, grandparent, …, root]`. Only alive
    /// nodes are reachable: a dead parent terminates the walk.
    pub fn ancestors(&self, thread: ThreadId) -> Vec<ThreadId> {
        let mut chain = vec![thread];
        let mut current = thread;
        while let Some(p) = self.parent(current) {
            if !self.is_alive(p) {
                break;
            }
            chain.push(p);
            current = p;
        }
        chain
    }

    /// All live threads as DAP rows; the main thread is always id 1.
    pub fn threads(&self) -> Vec<ThreadInfo> {
        let mut rows: Vec<ThreadInfo> = self
            .alive
            .keys()
            .map(|&thread| ThreadInfo {
                key: self.thread_key(thread),
                thread,
                name: if Some(thread) == self.main {
                    "Main Thread".to_string()
                } else {
                    format!("Thread ({thread})")
                },
            })
            .collect();
        rows.sort_by_key(|row| row.key);
        rows
    }

    /// Stable 31-bit DAP id for a thread.
    pub fn thread_key(&self, thread: ThreadId) -> i64 {
        if Some(thread) == self.main {
            return 1;
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        thread.hash(&mut hasher);
        let key = (hasher.finish() & 0x7fff_ffff) as i64;
        if key <= 1 {
            key + 2
        } else {
            key
        }
    }
}
