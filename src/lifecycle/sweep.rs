//! Bounded parallel per-session sampling.
//!
//! Each session is sampled on its own thread; the sweep waits at most `timeout` for any
//! of them. A session whose sample fails or times out is reported and skipped, never
//! holding up the others.

use crate::config::types::{Result, SandboxError};
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum SampleOutcome<T> {
    Done(T),
    Failed(SandboxError),
    TimedOut,
}

/// Run `sample` for every name concurrently; results come back in input order.
pub fn sample_all<T, F>(names: &[String], timeout: Duration, sample: F) -> Vec<(String, SampleOutcome<T>)>
where
    T: Send + 'static,
    F: Fn(&str) -> Result<T> + Send + Sync + 'static,
{
    let sample = Arc::new(sample);
    let started = Instant::now();

    let pending: Vec<_> = names
        .iter()
        .map(|name| {
            let (tx, rx) = bounded::<Result<T>>(1);
            let sample = Arc::clone(&sample);
            let thread_name = name.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("sweep-{}", name))
                .spawn(move || {
                    // The receiver may be gone after a timeout
                    let _ = tx.send(sample(&thread_name));
                });
            (name.clone(), spawned.map(|_| rx))
        })
        .collect();

    pending
        .into_iter()
        .map(|(name, rx)| {
            let outcome = match rx {
                Err(e) => SampleOutcome::Failed(SandboxError::Io(e)),
                Ok(rx) => {
                    let remaining = timeout.saturating_sub(started.elapsed());
                    match rx.recv_timeout(remaining) {
                        Ok(Ok(value)) => SampleOutcome::Done(value),
                        Ok(Err(e)) => SampleOutcome::Failed(e),
                        Err(RecvTimeoutError::Timeout) => SampleOutcome::TimedOut,
                        Err(RecvTimeoutError::Disconnected) => SampleOutcome::Failed(
                            SandboxError::runtime("sample", "sampling thread panicked"),
                        ),
                    }
                }
            };
            (name, outcome)
        })
        .collect()
}
