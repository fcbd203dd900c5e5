// hamon-core: timer job queue
// Expiry-sorted queue with one dedicated worker thread per queue. Jobs are
// tagged enum values; a job that wants a successor re-enqueues it before
// returning, so each queue is a perpetual clock.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Enqueue delay for "run now".
pub const TIMER_IMMEDIATELY: Duration = Duration::ZERO;
pub const TIMER_WAIT_100_MS: Duration = Duration::from_millis(100);
pub const TIMER_WAIT_500_MS: Duration = Duration::from_millis(500);
pub const TIMER_WAIT_A_SECOND: Duration = Duration::from_secs(1);

/// Idle sleep of a queue worker between polls.
pub const WORKER_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// A job with a human-readable label, used for rescheduling and the admin
/// jobs dump.
pub trait JobLabel {
    fn label(&self) -> &'static str;
}

struct JobEntry<J> {
    job: J,
    deadline: Instant,
}

struct JobQueueInner<J> {
    // sorted by deadline ascending; ties keep insertion order
    entries: Vec<JobEntry<J>>,
    shutdown: bool,
}

/// Deadline-ordered job queue shared between producers and one consumer.
pub struct JobQueue<J> {
    inner: Mutex<JobQueueInner<J>>,
}

impl<J: JobLabel> JobQueue<J> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(JobQueueInner {
                entries: Vec::new(),
                shutdown: false,
            }),
        }
    }

    /// Insert a job that becomes runnable after `delay`.
    pub fn enqueue(&self, job: J, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut inner = self.inner.lock();
        let pos = inner
            .entries
            .iter()
            .position(|e| e.deadline > deadline)
            .unwrap_or(inner.entries.len());
        inner.entries.insert(pos, JobEntry { job, deadline });
    }

    /// Pop the head job if its deadline has passed.
    pub fn dequeue(&self) -> Option<J> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return None;
        }
        match inner.entries.first() {
            Some(head) if head.deadline <= now => Some(inner.entries.remove(0).job),
            _ => None,
        }
    }

    /// Move the first job with the given label to a new deadline, keeping
    /// the queue sorted. No-op when no such job is pending.
    pub fn reschedule(&self, label: &str, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return;
        }
        let Some(idx) = inner.entries.iter().position(|e| e.job.label() == label) else {
            return;
        };
        let mut entry = inner.entries.remove(idx);
        entry.deadline = deadline;
        let pos = inner
            .entries
            .iter()
            .position(|e| e.deadline > deadline)
            .unwrap_or(inner.entries.len());
        inner.entries.insert(pos, entry);
    }

    /// Drop every pending job and latch the terminal flag; subsequent
    /// dequeues return None and the worker exits.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.shutdown = true;
    }

    /// Clear the terminal flag and any stale entries for re-activation.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.shutdown = false;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending entries as (label, remaining delay) for the admin dump.
    pub fn pending(&self) -> Vec<(&'static str, Duration)> {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| (e.job.label(), e.deadline.saturating_duration_since(now)))
            .collect()
    }
}

impl<J: JobLabel> Default for JobQueue<J> {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker loop: drain runnable jobs, sleep 10 ms when idle, exit on
/// queue shutdown. Jobs on one queue run strictly serially.
pub fn run_worker<J: JobLabel>(queue: &JobQueue<J>, mut handler: impl FnMut(J)) {
    while !queue.is_shutdown() {
        while let Some(job) = queue.dequeue() {
            handler(job);
        }
        std::thread::sleep(WORKER_IDLE_SLEEP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestJob {
        Tick,
        Tock,
    }

    impl JobLabel for TestJob {
        fn label(&self) -> &'static str {
            match self {
                TestJob::Tick => "tick",
                TestJob::Tock => "tock",
            }
        }
    }

    #[test]
    fn test_dequeue_respects_deadline() {
        let queue = JobQueue::new();
        queue.enqueue(TestJob::Tick, Duration::from_secs(60));
        assert_eq!(queue.dequeue(), None);

        queue.enqueue(TestJob::Tock, TIMER_IMMEDIATELY);
        assert_eq!(queue.dequeue(), Some(TestJob::Tock));
        assert_eq!(queue.dequeue(), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_queue_is_deadline_ordered() {
        let queue = JobQueue::new();
        queue.enqueue(TestJob::Tick, Duration::from_secs(60));
        queue.enqueue(TestJob::Tock, TIMER_IMMEDIATELY);

        let pending = queue.pending();
        assert_eq!(pending[0].0, "tock");
        assert_eq!(pending[1].0, "tick");
        // deadlines are non-decreasing front to back
        assert!(pending[0].1 <= pending[1].1);
    }

    #[test]
    fn test_reschedule_moves_matching_job_forward() {
        let queue = JobQueue::new();
        queue.enqueue(TestJob::Tick, Duration::from_secs(60));
        queue.enqueue(TestJob::Tock, Duration::from_secs(30));
        assert_eq!(queue.dequeue(), None);

        queue.reschedule("tick", TIMER_IMMEDIATELY);
        assert_eq!(queue.dequeue(), Some(TestJob::Tick));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_reschedule_missing_label_is_noop() {
        let queue = JobQueue::new();
        queue.enqueue(TestJob::Tock, Duration::from_secs(30));
        queue.reschedule("tick", TIMER_IMMEDIATELY);
        assert_eq!(queue.dequeue(), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_shutdown_latches_and_empties() {
        let queue = JobQueue::new();
        queue.enqueue(TestJob::Tick, TIMER_IMMEDIATELY);
        queue.shutdown();

        assert!(queue.is_shutdown());
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());

        queue.reset();
        assert!(!queue.is_shutdown());
        queue.enqueue(TestJob::Tick, TIMER_IMMEDIATELY);
        assert_eq!(queue.dequeue(), Some(TestJob::Tick));
    }
}
