//! Reader and writer worker pools.
//!
//! Handshake and cipher work runs here, off the pumper thread. A pool
//! guarantees that a connection is processed by at most one of its workers
//! at a time: scheduling a connection that is already queued or running only
//! sets a flag, and the worker that holds it makes one more pass before
//! letting go.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::connection::Connection;

type Job = fn(&Arc<Connection>);

/// Connection ids that are queued or running, mapped to "run again".
#[derive(Debug, Default)]
struct Active {
    ids: Mutex<HashMap<u64, bool>>,
}

impl Active {
    /// Claim `id`; false if it is already claimed (a rerun is recorded).
    fn claim(&self, id: u64) -> bool {
        let mut ids = self.ids.lock();
        match ids.get_mut(&id) {
            Some(again) => {
                *again = true;
                false
            }
            None => {
                ids.insert(id, false);
                true
            }
        }
    }

    /// Release `id` unless a rerun was requested, in which case the flag is
    /// cleared and the caller keeps the claim.
    fn release(&self, id: u64) -> bool {
        let mut ids = self.ids.lock();
        match ids.get_mut(&id) {
            Some(again) if *again => {
                *again = false;
                false
            }
            _ => {
                ids.remove(&id);
                true
            }
        }
    }

    fn len(&self) -> usize {
        self.ids.lock().len()
    }
}

/// A fixed set of threads running one job per scheduled connection.
pub struct WorkerPool {
    name: &'static str,
    tx: Option<Sender<Arc<Connection>>>,
    active: Arc<Active>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers named `name-N`, each running `job`.
    pub fn new(name: &'static str, threads: usize, job: Job) -> io::Result<Self> {
        let (tx, rx) = unbounded::<Arc<Connection>>();
        let active = Arc::new(Active::default());
        let mut handles = Vec::with_capacity(threads.max(1));
        for n in 0..threads.max(1) {
            let rx = rx.clone();
            let active = active.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || work(rx, active, job))?;
            handles.push(handle);
        }
        debug!(pool = name, threads = handles.len(), "worker pool started");
        Ok(Self {
            name,
            tx: Some(tx),
            active,
            handles,
        })
    }

    /// A reader pool running [`Connection::process_read`].
    pub fn readers(threads: usize) -> io::Result<Self> {
        Self::new("ntcp-reader", threads, Connection::process_read)
    }

    /// A writer pool running [`Connection::prepare_next_write`].
    pub fn writers(threads: usize) -> io::Result<Self> {
        Self::new("ntcp-writer", threads, Connection::prepare_next_write)
    }

    /// Queue `con`, or mark it for another pass if it is already queued.
    pub fn schedule(&self, con: &Arc<Connection>) {
        if !self.active.claim(con.id()) {
            trace!(pool = self.name, id = con.id(), "coalesced");
            return;
        }
        let sent = self.tx.as_ref().is_some_and(|tx| tx.send(con.clone()).is_ok());
        if !sent {
            self.active.release(con.id());
        }
    }

    /// Connections queued or running.
    pub fn active(&self) -> usize {
        self.active.len()
    }

    /// Stop accepting work and wait for the workers to exit.
    pub fn shutdown(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!(pool = self.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.handles.len())
            .field("active", &self.active.len())
            .finish()
    }
}

fn work(rx: Receiver<Arc<Connection>>, active: Arc<Active>, job: Job) {
    while let Ok(con) = rx.recv() {
        loop {
            job(&con);
            if active.release(con.id()) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_coalesces() {
        let active = Active::default();
        assert!(active.claim(7));
        assert!(!active.claim(7));
        assert!(!active.claim(7));
        // one rerun regardless of how many requests arrived
        assert!(!active.release(7));
        assert!(active.release(7));
        assert_eq!(active.len(), 0);
        assert!(active.claim(7));
    }

    #[test]
    fn test_independent_ids() {
        let active = Active::default();
        assert!(active.claim(1));
        assert!(active.claim(2));
        assert!(active.release(1));
        assert_eq!(active.len(), 1);
    }
}
