//! Sync request coalescing
//!
//! Passes never overlap. A request arriving while a pass runs is folded into
//! a single follow-up pass, however many such requests arrive.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

/// Runs sync passes one at a time
#[derive(Debug, Default)]
pub struct Coalescer {
    running: AtomicBool,
    queued: AtomicBool,
}

/// Holds the running flag and clears it however the pass ends
struct Running<'a> {
    flag: &'a AtomicBool,
    held: bool,
}

impl<'a> Running<'a> {
    fn held(flag: &'a AtomicBool) -> Self {
        Self { flag, held: true }
    }

    fn release(&mut self) {
        if self.held {
            self.flag.store(false, Ordering::SeqCst);
            self.held = false;
        }
    }

    /// Take the flag back unless another caller got it first
    fn reacquire(&mut self) -> bool {
        self.held = !self.flag.swap(true, Ordering::SeqCst);
        self.held
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a pass is in progress
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run `pass`, or queue a follow-up if one is already running
    ///
    /// Returns `None` when the request was queued behind a running pass.
    /// Otherwise returns the result of the last pass run; failures of earlier
    /// passes are logged.
    pub async fn run<F, Fut, T, E>(&self, mut pass: F) -> Option<Result<T, E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        while self.running.swap(true, Ordering::SeqCst) {
            self.queued.store(true, Ordering::SeqCst);
            if self.running.load(Ordering::SeqCst) {
                debug!("Pass in progress, queueing a follow-up");
                return None;
            }
            // The running pass ended before it could see the request
        }
        let mut running = Running::held(&self.running);

        let mut result = pass().await;
        loop {
            while self.queued.swap(false, Ordering::SeqCst) {
                if let Err(e) = &result {
                    warn!("Sync pass failed before queued follow-up: {}", e);
                }
                result = pass().await;
            }
            running.release();
            // A request may have queued between the last check and the release
            if !self.queued.load(Ordering::SeqCst) || !running.reacquire() {
                break;
            }
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    async fn yielding_pass(count: &AtomicUsize) -> Result<usize, String> {
        let n = count.fetch_add(1, Ordering::SeqCst) + 1;
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        Ok(n)
    }

    #[tokio::test]
    async fn test_requests_during_pass_coalesce() {
        let coalescer = Coalescer::new();
        let count = AtomicUsize::new(0);

        let (a, b, c, d) = tokio::join!(
            coalescer.run(|| yielding_pass(&count)),
            coalescer.run(|| yielding_pass(&count)),
            coalescer.run(|| yielding_pass(&count)),
            coalescer.run(|| yielding_pass(&count)),
        );

        assert_eq!(count.load(Ordering::SeqCst), 2);
        let results = [a, b, c, d];
        assert_eq!(results.iter().filter(|r| r.is_none()).count(), 3);
        assert!(results.contains(&Some(Ok(2))));
        assert!(!coalescer.is_running());
    }

    #[tokio::test]
    async fn test_failed_pass_clears_running() {
        let coalescer = Coalescer::new();

        let result = coalescer
            .run(|| async { Err::<(), _>("boom".to_string()) })
            .await;
        assert_eq!(result, Some(Err("boom".to_string())));
        assert!(!coalescer.is_running());

        let result = coalescer.run(|| async { Ok::<_, String>(7) }).await;
        assert_eq!(result, Some(Ok(7)));
    }

    #[tokio::test]
    async fn test_sequential_requests_each_run() {
        let coalescer = Coalescer::new();
        let count = AtomicUsize::new(0);

        coalescer.run(|| yielding_pass(&count)).await;
        coalescer.run(|| yielding_pass(&count)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    async fn stamped_pass(clock: &AtomicUsize, last_start: &AtomicUsize) -> Result<(), String> {
        last_start.fetch_max(clock.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_request_is_lost_across_threads() {
        let coalescer = Arc::new(Coalescer::new());
        let clock = Arc::new(AtomicUsize::new(0));
        let last_request = Arc::new(AtomicUsize::new(0));
        let last_start = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let coalescer = coalescer.clone();
            let clock = clock.clone();
            let last_request = last_request.clone();
            let last_start = last_start.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let at = clock.fetch_add(1, Ordering::SeqCst);
                    last_request.fetch_max(at, Ordering::SeqCst);
                    coalescer.run(|| stamped_pass(&clock, &last_start)).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Some pass started after the final request
        assert!(last_start.load(Ordering::SeqCst) > last_request.load(Ordering::SeqCst));
        assert!(!coalescer.is_running());
    }

    #[test]
    fn test_released_guard_leaves_new_holder_alone() {
        let flag = AtomicBool::new(true);
        let mut running = Running::held(&flag);
        running.release();

        // Another caller takes the flag before the guard is dropped
        assert!(!flag.swap(true, Ordering::SeqCst));
        drop(running);
        assert!(flag.load(Ordering::SeqCst));
    }
}
