//! Background compile worker and the lock-free status it publishes.
//!
//! The render thread owns a [`CompileController`]. Every load bumps a
//! generation counter and queues `{generation, request}` for the worker; the
//! worker answers with `{generation, result}` over a channel and flips the
//! shared status with a compare-exchange that only succeeds while its
//! generation is still current. Generation and status share one `AtomicU64`
//! so they are always observed together.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompileStatus {
    Idle = 0,
    Compiling = 1,
    Compiled = 2,
    Failed = 3,
}

impl CompileStatus {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => CompileStatus::Compiling,
            2 => CompileStatus::Compiled,
            3 => CompileStatus::Failed,
            _ => CompileStatus::Idle,
        }
    }
}

impl fmt::Display for CompileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CompileStatus::Idle => "idle",
            CompileStatus::Compiling => "compiling",
            CompileStatus::Compiled => "compiled",
            CompileStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

const STATUS_BITS: u32 = 8;

fn pack(generation: u64, status: CompileStatus) -> u64 {
    (generation << STATUS_BITS) | status as u64
}

fn unpack(word: u64) -> (u64, CompileStatus) {
    (word >> STATUS_BITS, CompileStatus::from_bits(word as u8))
}

/// `{generation, status}` packed into one atomic word.
#[derive(Debug, Default)]
pub(crate) struct StatusCell(AtomicU64);

impl StatusCell {
    pub fn load(&self) -> (u64, CompileStatus) {
        unpack(self.0.load(Ordering::Acquire))
    }

    /// Starts a new generation in `status`. Only the owning thread calls this.
    fn advance(&self, status: CompileStatus) -> u64 {
        let (generation, _) = self.load();
        let next = generation.wrapping_add(1) & (u64::MAX >> STATUS_BITS);
        self.0.store(pack(next, status), Ordering::Release);
        next
    }

    /// Moves `Compiling -> outcome` for `generation` only; stale workers lose.
    fn finish(&self, generation: u64, outcome: CompileStatus) -> bool {
        self.0
            .compare_exchange(
                pack(generation, CompileStatus::Compiling),
                pack(generation, outcome),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

struct CompileJob<R> {
    generation: u64,
    request: R,
}

struct CompileOutcome<T> {
    generation: u64,
    result: Result<T, BuildError>,
}

/// Owns the compile worker thread. `R` is what a load asks for, `T` what a
/// successful build hands back to the render thread.
pub struct CompileController<R, T> {
    status: Arc<StatusCell>,
    jobs: Option<Sender<CompileJob<R>>>,
    queued: Receiver<CompileJob<R>>,
    results: Receiver<CompileOutcome<T>>,
    worker: Option<JoinHandle<()>>,
    last_error: Option<BuildError>,
}

impl<R, T> CompileController<R, T>
where
    R: Send + 'static,
    T: Send + 'static,
{
    /// Spawns the worker. `build` runs once per non-stale request.
    pub fn spawn<F>(queue_depth: usize, mut build: F) -> std::io::Result<Self>
    where
        F: FnMut(R) -> Result<T, BuildError> + Send + 'static,
    {
        let status = Arc::new(StatusCell::default());
        let (job_tx, job_rx) = bounded::<CompileJob<R>>(queue_depth.max(1));
        let (result_tx, result_rx) = unbounded();

        let worker_status = Arc::clone(&status);
        let worker_jobs = job_rx.clone();
        let worker = thread::Builder::new()
            .name("toyview-compile".into())
            .spawn(move || {
                for job in worker_jobs.iter() {
                    let (current, _) = worker_status.load();
                    if job.generation != current {
                        debug!(
                            generation = job.generation,
                            current, "skipping stale compile request"
                        );
                        continue;
                    }
                    let request = job.request;
                    let result = panic::catch_unwind(AssertUnwindSafe(|| build(request)))
                        .unwrap_or_else(|payload| {
                            let message = panic_message(payload.as_ref());
                            warn!(generation = job.generation, %message, "compile job panicked");
                            Err(BuildError::WorkerPanicked(message))
                        });
                    let outcome = if result.is_ok() {
                        CompileStatus::Compiled
                    } else {
                        CompileStatus::Failed
                    };
                    let sent = result_tx.send(CompileOutcome {
                        generation: job.generation,
                        result,
                    });
                    if sent.is_err() {
                        break;
                    }
                    if !worker_status.finish(job.generation, outcome) {
                        debug!(generation = job.generation, "compile result superseded");
                    }
                }
            })?;

        Ok(Self {
            status,
            jobs: Some(job_tx),
            queued: job_rx,
            results: result_rx,
            worker: Some(worker),
            last_error: None,
        })
    }

    /// Queues a build and returns its generation. Anything queued or running
    /// for an older generation becomes stale.
    pub fn request(&mut self, request: R) -> u64 {
        self.drop_queued();
        self.last_error = None;
        let generation = self.status.advance(CompileStatus::Compiling);
        let job = CompileJob {
            generation,
            request,
        };
        let running = self
            .worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished());
        let delivered = running && self.jobs.as_ref().is_some_and(|jobs| jobs.send(job).is_ok());
        if !delivered {
            warn!(generation, "compile worker is not running");
            self.last_error = Some(BuildError::InvalidArgument(
                "compile worker is not running".to_string(),
            ));
            self.status.finish(generation, CompileStatus::Failed);
        }
        generation
    }

    /// Back to `Idle` under a fresh generation; in-flight work becomes stale.
    pub fn reset(&mut self) -> u64 {
        self.drop_queued();
        self.last_error = None;
        self.status.advance(CompileStatus::Idle)
    }

    pub fn status(&self) -> CompileStatus {
        self.status.load().1
    }

    pub fn generation(&self) -> u64 {
        self.status.load().0
    }

    pub fn last_error(&self) -> Option<&BuildError> {
        self.last_error.as_ref()
    }

    /// Drains finished builds. Returns the result for the current generation,
    /// if one arrived; older results are dropped.
    pub fn poll(&mut self) -> Option<Result<T, BuildError>> {
        let mut latest = None;
        while let Ok(outcome) = self.results.try_recv() {
            let current = self.generation();
            if outcome.generation != current {
                debug!(generation = outcome.generation, current, "discarding stale compile result");
                continue;
            }
            if let Err(err) = &outcome.result {
                self.last_error = Some(err.clone());
            }
            latest = Some(outcome.result);
        }
        latest
    }

    fn drop_queued(&self) {
        let mut dropped = 0usize;
        while self.queued.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "dropped queued compile requests");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl<R, T> Drop for CompileController<R, T> {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("compile worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn wait_for<R, T>(controller: &mut CompileController<R, T>) -> Result<T, BuildError>
    where
        R: Send + 'static,
        T: Send + 'static,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(result) = controller.poll() {
                return result;
            }
            assert!(Instant::now() < deadline, "compile never finished");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn wait_for_status<R, T>(controller: &CompileController<R, T>, status: CompileStatus)
    where
        R: Send + 'static,
        T: Send + 'static,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        while controller.status() != status {
            assert!(Instant::now() < deadline, "status never reached {status}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn pack_round_trips_generation_and_status() {
        for status in [
            CompileStatus::Idle,
            CompileStatus::Compiling,
            CompileStatus::Compiled,
            CompileStatus::Failed,
        ] {
            assert_eq!(unpack(pack(41, status)), (41, status));
        }
    }

    #[test]
    fn stale_worker_cannot_publish() {
        let cell = StatusCell::default();
        let first = cell.advance(CompileStatus::Compiling);
        let second = cell.advance(CompileStatus::Compiling);
        assert!(!cell.finish(first, CompileStatus::Compiled));
        assert_eq!(cell.load(), (second, CompileStatus::Compiling));
        assert!(cell.finish(second, CompileStatus::Failed));
        assert_eq!(cell.load(), (second, CompileStatus::Failed));
    }

    #[test]
    fn starts_idle_and_reaches_compiled() {
        let mut controller = CompileController::spawn(2, |value: u32| Ok(value * 2)).unwrap();
        assert_eq!(controller.status(), CompileStatus::Idle);

        let generation = controller.request(21);
        assert_eq!(generation, controller.generation());
        assert_eq!(wait_for(&mut controller).unwrap(), 42);
        wait_for_status(&controller, CompileStatus::Compiled);
        assert!(controller.last_error().is_none());
    }

    #[test]
    fn failure_is_reported_and_kept() {
        let mut controller = CompileController::spawn(2, |_: ()| -> Result<(), BuildError> {
            Err(BuildError::UnsupportedInput {
                pass: "Image".into(),
                channel: 0,
                ctype: "keyboard".into(),
            })
        })
        .unwrap();
        controller.request(());
        assert!(wait_for(&mut controller).is_err());
        wait_for_status(&controller, CompileStatus::Failed);
        assert!(matches!(
            controller.last_error(),
            Some(BuildError::UnsupportedInput { .. })
        ));

        controller.reset();
        assert_eq!(controller.status(), CompileStatus::Idle);
        assert!(controller.last_error().is_none());
    }

    #[test]
    fn panicking_build_fails_and_worker_survives() {
        let mut controller = CompileController::spawn(2, |value: u32| {
            if value == 1 {
                panic!("frontend blew up on request {value}");
            }
            Ok(value)
        })
        .unwrap();

        controller.request(1);
        match wait_for(&mut controller) {
            Err(BuildError::WorkerPanicked(message)) => assert!(message.contains("request 1")),
            other => panic!("expected a worker panic, got {other:?}"),
        }
        wait_for_status(&controller, CompileStatus::Failed);
        assert!(matches!(
            controller.last_error(),
            Some(BuildError::WorkerPanicked(_))
        ));

        let generation = controller.request(2);
        assert_eq!(wait_for(&mut controller).unwrap(), 2);
        wait_for_status(&controller, CompileStatus::Compiled);
        assert_eq!(controller.generation(), generation);
    }

    #[test]
    fn superseded_results_are_discarded() {
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let mut controller = CompileController::spawn(4, move |value: u32| {
            if value == 1 {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            }
            Ok(value)
        })
        .unwrap();

        controller.request(1);
        // Wait until the worker is blocked inside the first build.
        let deadline = Instant::now() + Duration::from_secs(10);
        while !controller.queued.is_empty() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(2));
        }
        thread::sleep(Duration::from_millis(20));

        let latest = controller.request(2);
        // The first job may already have been skipped as stale.
        let _ = gate_tx.send_timeout((), Duration::from_millis(500));

        assert_eq!(wait_for(&mut controller).unwrap(), 2);
        assert_eq!(controller.generation(), latest);
        wait_for_status(&controller, CompileStatus::Compiled);
    }

    #[test]
    fn reset_discards_in_flight_result() {
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let mut controller = CompileController::spawn(1, move |value: u32| {
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            Ok(value)
        })
        .unwrap();
        controller.request(7);
        let deadline = Instant::now() + Duration::from_secs(10);
        while !controller.queued.is_empty() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(2));
        }
        controller.reset();
        let _ = gate_tx.send_timeout((), Duration::from_millis(500));

        thread::sleep(Duration::from_millis(50));
        assert!(controller.poll().is_none());
        assert_eq!(controller.status(), CompileStatus::Idle);
    }
}
