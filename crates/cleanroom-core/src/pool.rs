use std::sync::mpsc;
use std::thread;
use tracing::debug;

/// Environment variable consulted for the worker count.
pub const THREADS_ENV: &str = "CLEANROOM_NUM_THREADS";

/// Worker count: the explicit override, else `CLEANROOM_NUM_THREADS` when it is
/// a positive integer, else the host's available parallelism.
pub fn thread_count(override_threads: Option<usize>) -> usize {
    if let Some(n) = override_threads.filter(|n| *n > 0) {
        return n;
    }
    if let Some(n) = std::env::var(THREADS_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
    {
        return n;
    }
    thread::available_parallelism().map_or(1, usize::from)
}

/// Bounded pool that runs one work item per target.
///
/// Items are dealt round-robin to at most `threads` scoped workers. Each
/// worker owns its items outright and reports results over a channel, so
/// workers never share mutable state.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    threads: usize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Apply `work` to every item and return the results in input order.
    pub fn map<T, R, F>(&self, items: Vec<T>, work: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync,
    {
        let total = items.len();
        if total <= 1 || self.threads == 1 {
            return items.into_iter().map(work).collect();
        }

        let workers = self.threads.min(total);
        let mut batches: Vec<Vec<(usize, T)>> = (0..workers).map(|_| Vec::new()).collect();
        for (index, item) in items.into_iter().enumerate() {
            batches[index % workers].push((index, item));
        }
        debug!("dispatching {total} items to {workers} workers");

        let (tx, rx) = mpsc::channel();
        let work = &work;
        thread::scope(|scope| {
            for batch in batches {
                let tx = tx.clone();
                scope.spawn(move || {
                    for (index, item) in batch {
                        if tx.send((index, work(item))).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        let mut results: Vec<(usize, R)> = rx.into_iter().collect();
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, r)| r).collect()
    }
}
