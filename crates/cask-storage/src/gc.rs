//! Copying garbage collector.
//!
//! A pass walks everything reachable from the tree captured at its start,
//! copies each object into the inactive bucket, and flips the active bucket
//! once the walk completes. Objects left behind are never deleted here; a
//! backend may compact the inactive bucket on its own.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cask_types::{Bucket, Hash};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::index::{Index, LeafKind};
use crate::node::Node;
use crate::objects::Objects;
use crate::store::StoreInner;
use crate::tree::Tree;

/// Outcome of one completed collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcReport {
    /// Tree the pass relocated.
    pub tree_hash: Hash,
    /// Bucket that was active before the flip.
    pub from: Bucket,
    /// Bucket that is active now.
    pub to: Bucket,
    /// Objects written into `to`.
    pub copied: usize,
    /// Objects `to` already held.
    pub skipped: usize,
    pub elapsed: Duration,
}

/// Current wall-clock time in unix seconds.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Visit every object reachable from `tree_hash` exactly once: the tree,
/// each non-empty leaf, then each record the leaf names.
pub(crate) fn walk_reachable(
    objects: &Objects,
    tree_hash: &Hash,
    mut visit: impl FnMut(&Hash) -> StorageResult<()>,
) -> StorageResult<()> {
    if tree_hash.is_null() {
        return Ok(());
    }
    let mut seen = HashSet::new();
    visit(tree_hash)?;
    let tree = Tree::load(objects, tree_hash)?;
    for kind in LeafKind::ALL {
        let leaf_hash = tree.leaf_hash(kind);
        if leaf_hash.is_null() || !seen.insert(leaf_hash) {
            continue;
        }
        visit(&leaf_hash)?;
        let index = <Index as Node>::load(objects, &leaf_hash)?;
        for record in index.references() {
            if seen.insert(record) {
                visit(&record)?;
            }
        }
    }
    Ok(())
}

/// Collect every object hash reachable from `tree_hash`.
pub(crate) fn live_set(objects: &Objects, tree_hash: &Hash) -> StorageResult<Vec<Hash>> {
    let mut live = Vec::new();
    walk_reachable(objects, tree_hash, |hash| {
        live.push(*hash);
        Ok(())
    })?;
    Ok(live)
}

/// Copy everything reachable from `tree_hash` into `target`.
///
/// Checks `control` before each object and stops with
/// [`StorageError::GcAborted`] once shutdown was signalled.
pub(crate) fn relocate(
    objects: &Objects,
    tree_hash: &Hash,
    target: Bucket,
    control: &GcControl,
) -> StorageResult<(usize, usize)> {
    let mut copied = 0;
    let mut skipped = 0;
    walk_reachable(objects, tree_hash, |hash| {
        control.checkpoint()?;
        if objects.copy_to(hash, target)? {
            copied += 1;
        } else {
            skipped += 1;
        }
        Ok(())
    })?;
    Ok((copied, skipped))
}

#[derive(Default)]
struct Flags {
    shutdown: bool,
    requested: bool,
}

/// Why the worker woke up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wake {
    Requested,
    Timeout,
    Shutdown,
}

/// State shared between the store facade and the GC worker.
#[derive(Default)]
pub(crate) struct GcControl {
    flags: Mutex<Flags>,
    wake: Condvar,
}

impl GcControl {
    /// Ask the worker for a pass as soon as possible.
    pub(crate) fn request(&self) {
        self.flags.lock().requested = true;
        self.wake.notify_all();
    }

    /// Tell the worker (and any running pass) to stop.
    pub(crate) fn shutdown(&self) {
        self.flags.lock().shutdown = true;
        self.wake.notify_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.flags.lock().shutdown
    }

    pub(crate) fn checkpoint(&self) -> StorageResult<()> {
        if self.is_shutdown() {
            return Err(StorageError::GcAborted);
        }
        Ok(())
    }

    /// Sleep until requested, shut down, or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Duration) -> Wake {
        let mut flags = self.flags.lock();
        if !flags.requested && !flags.shutdown {
            self.wake.wait_for(&mut flags, timeout);
        }
        if flags.shutdown {
            Wake::Shutdown
        } else if std::mem::take(&mut flags.requested) {
            Wake::Requested
        } else {
            Wake::Timeout
        }
    }
}

/// Run one pass over `inner` and record it in the root.
///
/// The snapshot is captured under the store write lock, so every commit is
/// either part of it or lands in both buckets.
pub(crate) fn collect(inner: &StoreInner) -> StorageResult<GcReport> {
    let started = Instant::now();
    let ticket = {
        let _writer = inner.write_lock.lock();
        inner.root.begin_gc(inner.driver.as_ref())?
    };
    info!(
        tree = %ticket.tree_hash.short_hex(),
        from = %ticket.source,
        to = %ticket.target,
        "garbage collection started"
    );

    let finished = relocate(&inner.objects, &ticket.tree_hash, ticket.target, &inner.gc)
        .and_then(|counts| {
            inner.root.finish_gc(inner.driver.as_ref(), &ticket, now())?;
            Ok(counts)
        });
    let (copied, skipped) = match finished {
        Ok(counts) => counts,
        Err(e) => {
            if let Err(abort_err) = inner.root.abort_gc(inner.driver.as_ref()) {
                warn!(error = %abort_err, "failed to persist cleared garbage collection flag");
            }
            return Err(e);
        }
    };

    let report = GcReport {
        tree_hash: ticket.tree_hash,
        from: ticket.source,
        to: ticket.target,
        copied,
        skipped,
        elapsed: started.elapsed(),
    };
    info!(
        tree = %report.tree_hash.short_hex(),
        bucket = %report.to,
        copied,
        skipped,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "garbage collection finished"
    );
    Ok(report)
}

/// Handle to the background collector thread.
pub(crate) struct GcWorker {
    handle: JoinHandle<()>,
}

impl GcWorker {
    /// Start the `cask-gc` thread.
    pub(crate) fn spawn(inner: Arc<StoreInner>) -> StorageResult<Self> {
        let handle = thread::Builder::new()
            .name("cask-gc".into())
            .spawn(move || run(&inner))?;
        Ok(Self { handle })
    }

    /// Wait for the thread to exit. Shutdown must already be signalled.
    pub(crate) fn join(self) {
        if self.handle.join().is_err() {
            warn!("garbage collection worker panicked");
        }
    }
}

fn run(inner: &StoreInner) {
    let interval = inner.options.gc.interval();
    let poll = inner.options.gc.poll().min(interval).max(Duration::from_millis(10));
    debug!(interval_secs = interval.as_secs(), "garbage collection worker started");
    loop {
        match inner.gc.wait(poll) {
            Wake::Shutdown => break,
            Wake::Requested => {}
            Wake::Timeout => {
                if !inner.root.gc_due(now(), interval) {
                    continue;
                }
            }
        }
        match collect(inner) {
            Ok(_) => {}
            Err(StorageError::GcAborted) => info!("garbage collection aborted by shutdown"),
            Err(StorageError::GcInProgress) => debug!("garbage collection already running"),
            Err(e) => warn!(error = %e, "garbage collection failed; will retry"),
        }
    }
    debug!("garbage collection worker stopped");
}
