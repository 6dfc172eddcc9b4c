//! Parallel-for job dispatch with a single completion event.

use std::{
    ops::Range,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bevy::tasks::{ComputeTaskPool, TaskPool};
use crossbeam_channel::{Receiver, Sender};

/// Work function invoked once per batch with the item range of that batch.
pub type BatchFn = Arc<dyn Fn(Range<usize>) + Send + Sync>;

pub trait JobScheduler: Send + Sync + 'static {
    /// Split `total_items` into batches of at most `batch_size` items and run `work` on each.
    /// The returned event is signaled once every batch has finished.
    fn dispatch(&self, total_items: usize, batch_size: usize, work: BatchFn) -> JobEvent;
}

struct JobState {
    remaining: AtomicUsize,
    completed: AtomicUsize,
    signal: Sender<()>,
}

/// Completion signal of a dispatched job.
pub struct JobEvent {
    state: Arc<JobState>,
    done: Receiver<()>,
    batches: usize,
    queue: Option<BatchQueue>,
}

/// Held by a running batch. Dropping it marks the batch as finished, including on unwind,
/// so a panicking batch can never leave the waiting thread blocked forever.
pub struct BatchToken {
    state: Arc<JobState>,
}

impl Drop for BatchToken {
    fn drop(&mut self) {
        self.state.completed.fetch_add(1, Ordering::Relaxed);
        if self.state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self.state.signal.try_send(());
        }
    }
}

struct Batch {
    range: Range<usize>,
    token: BatchToken,
}

/// Batches no worker claimed yet. Whoever receives a batch runs it.
#[derive(Clone)]
struct BatchQueue {
    batches: Receiver<Batch>,
    work: BatchFn,
}

impl BatchQueue {
    /// Run one unclaimed batch. Returns false once the queue is empty.
    fn run_one(&self) -> bool {
        let Ok(batch) = self.batches.try_recv() else {
            return false;
        };
        let _token = batch.token;
        (self.work)(batch.range);
        true
    }
}

impl JobEvent {
    /// Create an event tracking `batches` batches, and one token per batch.
    pub fn new(batches: usize) -> (Self, Vec<BatchToken>) {
        let (signal, done) = crossbeam_channel::bounded(1);
        let state = Arc::new(JobState {
            remaining: AtomicUsize::new(batches),
            completed: AtomicUsize::new(0),
            signal,
        });
        if batches == 0 {
            let _ = state.signal.try_send(());
        }
        let tokens = (0..batches)
            .map(|_| BatchToken {
                state: state.clone(),
            })
            .collect();
        (
            Self {
                state,
                done,
                batches,
                queue: None,
            },
            tokens,
        )
    }

    pub fn is_signaled(&self) -> bool {
        self.state.remaining.load(Ordering::Acquire) == 0
    }

    pub fn completed_batches(&self) -> usize {
        self.state.completed.load(Ordering::Relaxed)
    }

    pub fn batch_count(&self) -> usize {
        self.batches
    }

    /// Block the calling thread until every batch finished. Batches no worker picked up yet
    /// run on the calling thread, so waiting from inside the pool cannot starve the job.
    pub fn wait(self) {
        if let Some(queue) = &self.queue {
            while queue.run_one() {}
        }
        // The sender lives inside `state`, which we hold, so this can only return on signal.
        let _ = self.done.recv();
    }
}

fn batch_ranges(total_items: usize, batch_size: usize) -> impl Iterator<Item = Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..total_items)
        .step_by(batch_size)
        .map(move |start| start..(start + batch_size).min(total_items))
}

/// Runs every batch on bevy's compute task pool.
#[derive(Clone, Copy)]
pub struct TaskPoolScheduler {
    pool: &'static TaskPool,
}

impl TaskPoolScheduler {
    pub fn new(pool: &'static TaskPool) -> Self {
        Self { pool }
    }
    /// Uses the global [`ComputeTaskPool`], initializing it if nobody did yet.
    pub fn compute() -> Self {
        let pool: &'static TaskPool = ComputeTaskPool::get_or_init(TaskPool::default);
        Self { pool }
    }
}

impl JobScheduler for TaskPoolScheduler {
    fn dispatch(&self, total_items: usize, batch_size: usize, work: BatchFn) -> JobEvent {
        let ranges: Vec<Range<usize>> = batch_ranges(total_items, batch_size).collect();
        let (mut event, tokens) = JobEvent::new(ranges.len());
        let (sender, batches) = crossbeam_channel::unbounded();
        for (range, token) in ranges.into_iter().zip(tokens) {
            // A failed send drops the token, which still counts the batch as finished.
            let _ = sender.send(Batch { range, token });
        }
        let queue = BatchQueue { batches, work };
        for _ in 0..event.batches {
            let queue = queue.clone();
            self.pool
                .spawn(async move {
                    queue.run_one();
                })
                .detach();
        }
        event.queue = Some(queue);
        event
    }
}

/// Runs every batch immediately on the dispatching thread.
#[derive(Clone, Copy, Default)]
pub struct InlineScheduler;

impl JobScheduler for InlineScheduler {
    fn dispatch(&self, total_items: usize, batch_size: usize, work: BatchFn) -> JobEvent {
        let ranges: Vec<Range<usize>> = batch_ranges(total_items, batch_size).collect();
        let (event, tokens) = JobEvent::new(ranges.len());
        for (range, token) in ranges.into_iter().zip(tokens) {
            work(range);
            drop(token);
        }
        event
    }
}
