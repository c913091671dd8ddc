//! The bounded fan-out machinery for pushing table contributions to
//! workers over the synchronous HTTP protocol.
//!
//! A fixed pool of OS threads consumes request closures from a shared
//! queue and publishes their results into per-call result queues. The
//! orchestrator submits one closure per worker and then pops exactly as
//! many results; ordering is arbitrary and responses are identified by
//! the worker name.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// A synchronized FIFO with a blocking `pop()`.
pub struct Queue<T> {
    entries: Mutex<std::collections::VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(std::collections::VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    pub fn push(&self, entry: T) {
        self.entries.lock().push_back(entry);
        self.not_empty.notify_one();
    }

    /// Block the calling thread until an entry is available.
    pub fn pop(&self) -> T {
        let mut entries = self.entries.lock();
        loop {
            if let Some(entry) = entries.pop_front() {
                return entry;
            }
            self.not_empty.wait(&mut entries);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// The completion record of one worker ingest request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestResult {
    pub worker: String,
    /// Empty on success. Closures are required not to panic; failures
    /// travel here.
    pub error: String,
}

pub type ResultQueue = Queue<IngestResult>;

/// A request closure paired with the queue its result is published to.
pub struct Request {
    processor: Box<dyn FnOnce() -> IngestResult + Send>,
    result_queue: Arc<ResultQueue>,
}

impl Request {
    pub fn new(
        processor: impl FnOnce() -> IngestResult + Send + 'static,
        result_queue: Arc<ResultQueue>,
    ) -> Self {
        Self {
            processor: Box::new(processor),
            result_queue,
        }
    }

    fn process(self) {
        self.result_queue.push((self.processor)());
    }
}

pub type RequestQueue = Queue<Request>;

/// The worker-ingest thread pool. Threads run for the lifetime of the
/// process, looping over the request queue.
pub struct Processor {
    request_queue: Arc<RequestQueue>,
}

impl Processor {
    pub fn new(num_threads: usize) -> Arc<Self> {
        let request_queue = Arc::new(RequestQueue::new());
        for _ in 0..num_threads.max(1) {
            let queue = request_queue.clone();
            std::thread::spawn(move || loop {
                queue.pop().process();
            });
        }
        Arc::new(Self { request_queue })
    }

    pub fn push(&self, request: Request) {
        self.request_queue.push(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn results_arrive_for_every_submitted_request() {
        let processor = Processor::new(4);
        let result_queue = Arc::new(ResultQueue::new());

        let workers: Vec<String> = (0..16).map(|i| format!("worker-{i}")).collect();
        for worker in &workers {
            let worker = worker.clone();
            processor.push(Request::new(
                move || IngestResult {
                    error: if worker.ends_with('3') {
                        format!("{worker} is out of disk")
                    } else {
                        String::new()
                    },
                    worker,
                },
                result_queue.clone(),
            ));
        }

        // Exactly N results; identification is by worker, not by order.
        let mut seen = HashSet::new();
        let mut errors = 0;
        for _ in 0..workers.len() {
            let result = result_queue.pop();
            assert!(seen.insert(result.worker.clone()));
            if !result.error.is_empty() {
                errors += 1;
            }
        }
        assert_eq!(seen.len(), workers.len());
        assert_eq!(errors, 2);
        assert!(result_queue.is_empty());
    }

    #[test]
    fn queue_is_fifo() {
        let queue = Queue::new();
        for i in 0..10 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 10);
        for i in 0..10 {
            assert_eq!(queue.pop(), i);
        }
    }
}
