//! Logical time for the transport engine. All deadlines (request timeouts, segment timeouts,
//!  delayed re-sends) are computed from an injected [Clock], so that tests can drive time
//!  explicitly with a [VirtualClock] instead of sleeping.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Wall clock time. This is taken from tokio so that it follows tokio's paused time in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(u64);

type ScheduledTask = Box<dyn FnOnce() + Send>;

struct VirtualClockInner {
    elapsed: Duration,
    next_task_id: u64,
    tasks: BTreeMap<(Duration, TaskId), ScheduledTask>,
}

/// A clock that only moves when told to, with tasks scheduled for points in virtual time.
///  Tasks run on the thread calling [VirtualClock::advance], in the order of their due time,
///  and observe [Clock::now] as their due time.
pub struct VirtualClock {
    origin: Instant,
    inner: Mutex<VirtualClockInner>,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    pub fn new() -> VirtualClock {
        VirtualClock {
            origin: Instant::now(),
            inner: Mutex::new(VirtualClockInner {
                elapsed: Duration::ZERO,
                next_task_id: 0,
                tasks: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VirtualClockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// time passed since the clock was created
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TaskId {
        let mut inner = self.lock();
        let id = TaskId(inner.next_task_id);
        inner.next_task_id += 1;
        let due = inner.elapsed + delay;
        inner.tasks.insert((due, id), Box::new(task));
        id
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        let mut inner = self.lock();
        let key = inner.tasks.keys()
            .find(|(_, task_id)| *task_id == id)
            .cloned();
        match key {
            Some(key) => inner.tasks.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn num_scheduled_tasks(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Moves time forward by `by`, running all tasks that become due on the way
    pub fn advance(&self, by: Duration) {
        let target = self.lock().elapsed + by;

        loop {
            let task = {
                let mut guard = self.lock();
                let inner = &mut *guard;
                match inner.tasks.first_entry() {
                    Some(entry) if entry.key().0 <= target => {
                        let due = entry.key().0;
                        let task = entry.remove();
                        inner.elapsed = inner.elapsed.max(due);
                        task
                    }
                    _ => {
                        inner.elapsed = target;
                        break;
                    }
                }
            };
            trace!("running scheduled task at {:?}", self.elapsed());
            task();
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.origin + self.lock().elapsed
    }
}
