/*!
Threads requesting a write enqueue a [`Writer`] and park until the queue
leader performs their operation (possibly batched with others) or hands
them the leader role.
*/

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::batch::Batch;
use crate::db::GuardedDbFields;
use crate::errors::StrataResult;

/// Mutable completion state of a [`Writer`].
struct WriterInner {
    /// Whether the requested operation finished (successfully or not).
    completed: bool,

    /// The outcome, set when a group leader completed this writer's batch.
    result: Option<StrataResult<()>>,
}

/**
A queued write request.

The condition variable is signalled with the database mutex held, so a
parked writer always observes a consistent queue when it wakes.
*/
pub(crate) struct Writer {
    /**
    The batch of operations this writer requests.

    `None` for writers that only want to force room-making (e.g. a manual
    memtable flush).
    */
    batch: Option<Batch>,

    /// Whether the write-ahead log must be synced before acknowledging.
    sync: bool,

    /// Completion state, behind its own lock for interior mutability.
    inner: Mutex<WriterInner>,

    /// Parks and wakes the requesting thread.
    condvar: Condvar,
}

/// Crate-only methods
impl Writer {
    /// Create a new instance of [`Writer`].
    pub(crate) fn new(batch: Option<Batch>, sync: bool) -> Self {
        Self {
            batch,
            sync,
            inner: Mutex::new(WriterInner {
                completed: false,
                result: None,
            }),
            condvar: Condvar::new(),
        }
    }

    /// The batch this writer wants applied.
    pub(crate) fn batch(&self) -> Option<&Batch> {
        self.batch.as_ref()
    }

    /// Whether this writer requires a durable log before returning.
    pub(crate) fn is_sync(&self) -> bool {
        self.sync
    }

    /// Park the calling thread until it is signalled.
    pub(crate) fn wait(&self, guard: &mut MutexGuard<'_, GuardedDbFields>) {
        self.condvar.wait(guard);
    }

    /// Wake the thread parked on this writer.
    pub(crate) fn signal(&self) {
        self.condvar.notify_one();
    }

    /// Whether the operation has been completed by a group leader.
    pub(crate) fn is_completed(&self) -> bool {
        self.inner.lock().completed
    }

    /// Record the outcome of this writer's operation and mark it complete.
    pub(crate) fn complete(&self, result: StrataResult<()>) {
        let mut inner = self.inner.lock();
        inner.completed = true;
        inner.result = Some(result);
    }

    /// The outcome recorded by [`Writer::complete`].
    pub(crate) fn take_result(&self) -> StrataResult<()> {
        self.inner
            .lock()
            .result
            .take()
            .expect("Asked for the result of an incomplete writer.")
    }
}
