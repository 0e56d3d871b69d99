//! Periodic cleanup of exited CI-runner containers.
//!
//! One background thread per distinct image. Registration is idempotent.

use std::collections::HashMap;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use tracing::{debug, info, warn};

use crate::io::process::run_command_with_timeout;

/// Removes exited containers of an image; returns how many were removed.
pub type ReapFn = Arc<dyn Fn(&str) -> Result<usize> + Send + Sync>;

struct Worker {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

pub struct ContainerReaper {
    interval: Duration,
    reap: ReapFn,
    workers: Mutex<HashMap<String, Worker>>,
}

impl ContainerReaper {
    pub fn new(interval: Duration, reap: ReapFn) -> Self {
        Self {
            interval,
            reap,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Reaper backed by the `docker` CLI.
    pub fn docker(interval: Duration) -> Self {
        Self::new(interval, Arc::new(docker_reap))
    }

    /// Start reaping `image`; false if it was already registered.
    pub fn register(&self, image: &str) -> bool {
        let mut workers = self.lock();
        if workers.contains_key(image) {
            return false;
        }
        let (stop, stopped) = bounded::<()>(0);
        let reap = Arc::clone(&self.reap);
        let interval = self.interval;
        let owned = image.to_string();
        let thread = thread::spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match reap(&owned) {
                        Ok(0) => {}
                        Ok(removed) => info!(image = %owned, removed, "reaped exited containers"),
                        Err(err) => warn!(image = %owned, error = %format!("{err:#}"), "reap failed"),
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(image = %owned, "reaper stopped");
        });
        workers.insert(image.to_string(), Worker { stop, thread });
        info!(image, interval_secs = interval.as_secs(), "container reaper registered");
        true
    }

    pub fn registered(&self) -> usize {
        self.lock().len()
    }

    /// Stop and join every reaper thread.
    pub fn shutdown(&self) {
        let workers: Vec<Worker> = self.lock().drain().map(|(_, worker)| worker).collect();
        for Worker { stop, thread } in workers {
            drop(stop);
            if thread.join().is_err() {
                warn!("reaper thread panicked");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Worker>> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }
}

impl Drop for ContainerReaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn docker_reap(image: &str) -> Result<usize> {
    let mut list = Command::new("docker");
    list.args(["ps", "-aq", "--filter", "status=exited", "--filter"])
        .arg(format!("ancestor={image}"));
    let output = run_command_with_timeout(list, None, Duration::from_secs(60), 1 << 20)?;
    if !output.status.success() {
        return Err(anyhow!("docker ps failed: {}", output.stderr_lossy().trim()));
    }
    let ids: Vec<String> = output
        .stdout_lossy()
        .lines()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Ok(0);
    }
    let mut remove = Command::new("docker");
    remove.arg("rm").args(&ids);
    let output = run_command_with_timeout(remove, None, Duration::from_secs(120), 1 << 20)?;
    if !output.status.success() {
        return Err(anyhow!("docker rm failed: {}", output.stderr_lossy().trim()));
    }
    Ok(ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn registration_is_idempotent_per_image() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let reaper = ContainerReaper::new(
            Duration::from_millis(10),
            Arc::new(move |_: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            }),
        );
        assert!(reaper.register("runner:latest"));
        assert!(!reaper.register("runner:latest"));
        assert!(reaper.register("other:1"));
        assert_eq!(reaper.registered(), 2);

        thread::sleep(Duration::from_millis(60));
        reaper.shutdown();
        assert_eq!(reaper.registered(), 0);
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn failing_reap_keeps_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let reaper = ContainerReaper::new(
            Duration::from_millis(5),
            Arc::new(move |_: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("docker unavailable"))
            }),
        );
        reaper.register("runner:latest");
        thread::sleep(Duration::from_millis(60));
        drop(reaper);
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
