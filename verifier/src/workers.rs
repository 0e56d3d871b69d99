//! Bounded worker pool over scoped threads.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use anyhow::{Result, anyhow};
use crossbeam_channel::unbounded;
use tracing::error;

/// Apply `task` to every item on at most `workers` threads.
///
/// Results arrive in completion order, not submission order. A panicking
/// task yields an error for its item without stopping the others.
pub fn parallel_map<T, R, F>(items: Vec<T>, workers: usize, task: F) -> Vec<Result<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let count = items.len();
    if count == 0 {
        return Vec::new();
    }
    let (job_tx, job_rx) = unbounded::<T>();
    let (result_tx, result_rx) = unbounded::<Result<R>>();
    for item in items {
        // Receiver is alive until the scope below ends.
        let _ = job_tx.send(item);
    }
    drop(job_tx);

    let task = &task;
    thread::scope(|scope| {
        for _ in 0..workers.clamp(1, count) {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            scope.spawn(move || {
                for item in jobs {
                    let outcome = catch_unwind(AssertUnwindSafe(|| task(item)))
                        .map_err(|payload| anyhow!("worker task panicked: {}", panic_message(&*payload)));
                    if let Err(err) = &outcome {
                        error!(error = %err, "worker task panicked");
                    }
                    if results.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);
    result_rx.into_iter().collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn maps_every_item() {
        let mut out: Vec<usize> = parallel_map((0..20).collect(), 4, |n| n * 2)
            .into_iter()
            .map(|result| result.expect("ok"))
            .collect();
        out.sort_unstable();
        assert_eq!(out, (0..20).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn bounds_concurrency() {
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let results = parallel_map((0..16).collect::<Vec<u32>>(), 3, |_| {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            current.fetch_sub(1, Ordering::SeqCst);
        });
        assert_eq!(results.len(), 16);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn panic_is_isolated_to_its_item() {
        let results = parallel_map(vec![1, 2, 3], 2, |n| {
            assert_ne!(n, 2, "boom");
            n
        });
        assert_eq!(results.iter().filter(|result| result.is_err()).count(), 1);
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 2);
    }
}
