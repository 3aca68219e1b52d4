// Debugger port allocation
//
// Local ports handed to forwarded JDWP sessions. The lowest free port is
// always reused first; when the pool runs dry the ceiling grows by one.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Free and held debugger ports. A port is never in both sets.
#[derive(Debug, Clone)]
pub struct PortPool {
    free: BTreeSet<u16>,
    held: BTreeSet<u16>,
    max_seen: u16,
}

impl PortPool {
    /// Seed the pool with `count` ports starting at `base`
    pub fn new(base: u16, count: u16) -> Self {
        let end = base.saturating_add(count);
        let free: BTreeSet<u16> = (base..end).collect();
        let max_seen = free.last().copied().unwrap_or_else(|| base.saturating_sub(1));

        Self {
            free,
            held: BTreeSet::new(),
            max_seen,
        }
    }

    /// Take the lowest free port, or synthesize the next one above every
    /// port seen so far
    pub fn acquire(&mut self) -> u16 {
        let port = match self.free.pop_first() {
            Some(port) => port,
            None => {
                self.max_seen = self.max_seen.saturating_add(1);
                self.max_seen
            }
        };

        self.held.insert(port);
        port
    }

    /// Claim a specific port. Returns false, leaving the pool untouched, when
    /// the port is already held.
    pub fn acquire_specific(&mut self, port: u16) -> bool {
        if !self.held.insert(port) {
            return false;
        }

        self.free.remove(&port);
        self.max_seen = self.max_seen.max(port);
        true
    }

    /// Return a held port to the free set. Releasing twice is harmless.
    pub fn release(&mut self, port: u16) {
        if self.held.remove(&port) {
            self.free.insert(port);
        }
    }

    pub fn is_free(&self, port: u16) -> bool {
        self.free.contains(&port)
    }

    pub fn is_held(&self, port: u16) -> bool {
        self.held.contains(&port)
    }

    pub fn free_ports(&self) -> Vec<u16> {
        self.free.iter().copied().collect()
    }
}

/// Shared handle to the pool used by every process tracker
#[derive(Debug, Clone)]
pub struct DebugPortAllocator {
    pool: Arc<Mutex<PortPool>>,
}

impl DebugPortAllocator {
    pub fn new(base: u16, count: u16) -> Self {
        Self {
            pool: Arc::new(Mutex::new(PortPool::new(base, count))),
        }
    }

    fn pool(&self) -> MutexGuard<'_, PortPool> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn acquire(&self) -> u16 {
        let port = self.pool().acquire();
        debug!(port, "Acquired debugger port");
        port
    }

    pub fn acquire_specific(&self, port: u16) -> bool {
        let claimed = self.pool().acquire_specific(port);
        debug!(port, claimed, "Claiming debugger port");
        claimed
    }

    pub fn release(&self, port: u16) {
        debug!(port, "Released debugger port");
        self.pool().release(port);
    }

    pub fn snapshot(&self) -> PortPool {
        self.pool().clone()
    }
}
