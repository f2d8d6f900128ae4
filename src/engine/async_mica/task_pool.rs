use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::error::Error;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

// Mainly used for file IO and other long-running tasks.
// Work submitted here runs off the calling thread; once queued it cannot be cancelled.

pub type TaskFn = Box<dyn FnOnce() -> Result<(), Box<dyn Error>> + Send>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskOutcome
{
    Succeeded,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TaskStatus
{
    Queued,
    Running,
    Finished(TaskOutcome),
}

struct QueuedTask
{
    priority: i32,
    sequence: u64, // submission order breaks priority ties
    handle: Option<TaskHandle>,
    name: String,
    work: TaskFn,
}
impl PartialEq for QueuedTask
{
    fn eq(&self, other: &Self) -> bool
    {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueuedTask { }
impl PartialOrd for QueuedTask
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for QueuedTask
{
    fn cmp(&self, other: &Self) -> Ordering
    {
        // max-heap: highest priority first, FIFO within a priority
        self.priority.cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct PoolState
{
    queue: BinaryHeap<QueuedTask>,
    running: usize,
    next_sequence: u64,
    next_handle: u64,
    statuses: HashMap<TaskHandle, TaskStatus>,
    is_shutdown: bool,
}

struct PoolShared
{
    state: Mutex<PoolState>,
    work_cond: Condvar, // workers sleep here
    idle_cond: Condvar, // wait_idle() sleeps here
}

pub struct AsyncExecutor
{
    shared: Arc<PoolShared>,
    worker_threads: Mutex<Vec<JoinHandle<()>>>,
}
impl AsyncExecutor
{
    #[must_use]
    pub fn new(num_threads: usize) -> Self
    {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(PoolShared
        {
            state: Mutex::new(PoolState::default()),
            work_cond: Condvar::new(),
            idle_cond: Condvar::new(),
        });

        let worker_threads = (0..num_threads).map(|i|
        {
            Builder::new()
                .name(format!("Async worker thread {}", i))
                .spawn(Self::worker_fn(shared.clone(), i))
                .expect("Failed to create async worker thread")
        }).collect();

        Self
        {
            shared,
            worker_threads: Mutex::new(worker_threads),
        }
    }

    fn worker_fn(shared: Arc<PoolShared>, index: usize) -> impl FnOnce() + Send + 'static
    {
        move ||
        {
            log::debug!("Starting async worker thread {index}");
            loop
            {
                let task =
                {
                    let mut state = shared.state.lock();
                    loop
                    {
                        if let Some(task) = state.queue.pop()
                        {
                            state.running += 1;
                            if let Some(handle) = task.handle
                            {
                                state.statuses.insert(handle, TaskStatus::Running);
                            }
                            break Some(task);
                        }
                        if state.is_shutdown { break None; }
                        shared.work_cond.wait(&mut state);
                    }
                };
                let Some(task) = task else { break; };

                let outcome = match (task.work)()
                {
                    Ok(()) => TaskOutcome::Succeeded,
                    Err(err) =>
                    {
                        log::error!("Async task '{}' failed: {err}", task.name);
                        TaskOutcome::Failed
                    },
                };

                let mut state = shared.state.lock();
                state.running -= 1;
                if let Some(handle) = task.handle
                {
                    state.statuses.insert(handle, TaskStatus::Finished(outcome));
                }
                if state.queue.is_empty() && state.running == 0
                {
                    shared.idle_cond.notify_all();
                }
            }
            log::debug!("Shutting down async worker thread {index}");
        }
    }

    fn enqueue(&self, name: String, priority: i32, work: TaskFn, tracked: bool) -> Option<TaskHandle>
    {
        let mut state = self.shared.state.lock();
        if state.is_shutdown
        {
            log::warn!("Dropping async task '{name}' submitted after shutdown");
            return None;
        }

        let handle = tracked.then(||
        {
            state.next_handle += 1;
            let handle = TaskHandle(state.next_handle);
            state.statuses.insert(handle, TaskStatus::Queued);
            handle
        });

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.queue.push(QueuedTask { priority, sequence, handle, name, work });
        self.shared.work_cond.notify_one();
        handle
    }

    // submit work and track its completion; pair with release_task() once the handle is done with
    pub fn submit(&self, name: impl Into<String>, priority: i32, work: TaskFn) -> Option<TaskHandle>
    {
        self.enqueue(name.into(), priority, work, true)
    }

    // fire-and-forget submission; completion is observed through the work's own side effects
    pub fn submit_detached(&self, name: impl Into<String>, priority: i32, work: TaskFn)
    {
        let _ = self.enqueue(name.into(), priority, work, false);
    }

    // true once the task has run (or for a handle already released)
    #[must_use]
    pub fn is_finished(&self, handle: TaskHandle) -> bool
    {
        match self.shared.state.lock().statuses.get(&handle)
        {
            Some(TaskStatus::Finished(_)) | None => true,
            Some(TaskStatus::Queued) | Some(TaskStatus::Running) => false,
        }
    }

    #[must_use]
    pub fn outcome(&self, handle: TaskHandle) -> Option<TaskOutcome>
    {
        match self.shared.state.lock().statuses.get(&handle)
        {
            Some(TaskStatus::Finished(outcome)) => Some(*outcome),
            _ => None,
        }
    }

    // forget a tracked task's status entry
    pub fn release_task(&self, handle: TaskHandle)
    {
        self.shared.state.lock().statuses.remove(&handle);
    }

    #[must_use]
    pub fn is_idle(&self) -> bool
    {
        let state = self.shared.state.lock();
        state.queue.is_empty() && state.running == 0
    }

    // block until the queue is empty and nothing is in flight
    pub fn wait_idle(&self)
    {
        let mut state = self.shared.state.lock();
        while !(state.queue.is_empty() && state.running == 0)
        {
            self.shared.idle_cond.wait(&mut state);
        }
    }

    // prevent new submissions; already-queued tasks still run before workers exit
    pub fn shutdown(&self)
    {
        self.shared.state.lock().is_shutdown = true;
        self.shared.work_cond.notify_all();
    }
}
impl Drop for AsyncExecutor
{
    fn drop(&mut self)
    {
        self.shutdown();
        for thread in self.worker_threads.lock().drain(..)
        {
            let _ = thread.join();
        }
    }
}
