//! Periodic sync driver.
//!
//! `start` spawns a timer thread that runs one cycle right away and then one
//! per interval on a steady cadence. `stop` only disarms the timer: a cycle
//! already in flight runs to completion and the thread exits afterwards.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::io;
use std::mem;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use crate::client::Transport;
use crate::db::models::{RunContext, SyncType};
use crate::db::store::Storage;
use crate::services::pipeline::SyncReport;
use crate::services::sync::{SyncError, SyncService};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// One unit of scheduled work.
pub trait SyncCycle: Send + Sync + 'static {
    fn run_cycle(&self, run: &RunContext) -> Result<SyncReport, SyncError>;
}

impl<S: Storage, T: Transport> SyncCycle for SyncService<S, T> {
    fn run_cycle(&self, run: &RunContext) -> Result<SyncReport, SyncError> {
        self.sync_all(run)
    }
}

pub struct Timer {
    stop_tx: Sender<()>,
    started_at: DateTime<Utc>,
}

pub enum SchedulerState {
    Stopped,
    Running(Timer),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct SyncScheduler<C: SyncCycle> {
    cycle: Arc<C>,
    interval: Duration,
    state: SchedulerState,
}

impl<C: SyncCycle> SyncScheduler<C> {
    pub fn new(cycle: Arc<C>, interval: Duration) -> Self {
        SyncScheduler {
            cycle,
            interval,
            state: SchedulerState::Stopped,
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let started_at = match &self.state {
            SchedulerState::Running(timer) => Some(timer.started_at),
            SchedulerState::Stopped => None,
        };
        SchedulerStatus {
            running: started_at.is_some(),
            interval_secs: self.interval.as_secs(),
            started_at,
        }
    }

    /// Stopped → Running. No-op when already running.
    pub fn start(&mut self) -> io::Result<SchedulerStatus> {
        if let SchedulerState::Running(_) = self.state {
            return Ok(self.status());
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let cycle = Arc::clone(&self.cycle);
        let interval = self.interval;
        thread::Builder::new()
            .name("sync-scheduler".to_string())
            .spawn(move || timer_loop(cycle.as_ref(), interval, &stop_rx))?;

        self.state = SchedulerState::Running(Timer {
            stop_tx,
            started_at: Utc::now(),
        });
        info!("Scheduler: started, interval {}s", interval.as_secs());
        Ok(self.status())
    }

    /// Running → Stopped. No-op when already stopped.
    pub fn stop(&mut self) -> SchedulerStatus {
        if let SchedulerState::Running(timer) = mem::replace(&mut self.state, SchedulerState::Stopped) {
            // the receiver is gone if the thread already exited
            let _ = timer.stop_tx.send(());
            info!("Scheduler: stopped");
        }
        self.status()
    }
}

fn timer_loop<C: SyncCycle + ?Sized>(cycle: &C, interval: Duration, stop_rx: &Receiver<()>) {
    let mut sync_type = SyncType::Auto;
    let mut next_tick = Instant::now();
    loop {
        match cycle.run_cycle(&RunContext::new(sync_type)) {
            Ok(report) => info!(
                "Scheduler: {} cycle done in {}ms ({} skipped)",
                sync_type,
                report.duration_ms,
                report.skipped.len()
            ),
            Err(SyncError::AlreadyRunning) => warn!("Scheduler: {} cycle skipped, a run is in progress", sync_type),
            Err(e) => error!("Scheduler: {} cycle failed: {}", sync_type, e),
        }

        // Maintain steady cadence; an overrun fires the next cycle at once
        let now = Instant::now();
        let wait = match next_tick.checked_add(interval) {
            Some(tick) => {
                next_tick = tick.max(now);
                next_tick.saturating_duration_since(now)
            }
            None => interval,
        };
        match stop_rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        sync_type = SyncType::Scheduled;
    }
    info!("Scheduler: timer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every cycle's sync type; optionally blocks until released.
    struct RecordingCycle {
        runs: Mutex<Vec<SyncType>>,
        done_tx: Mutex<Sender<SyncType>>,
        gate: Mutex<Option<Receiver<()>>>,
        fail: bool,
    }

    impl RecordingCycle {
        fn new(fail: bool) -> (Arc<Self>, Receiver<SyncType>) {
            let (done_tx, done_rx) = mpsc::channel();
            let cycle = RecordingCycle {
                runs: Mutex::new(Vec::new()),
                done_tx: Mutex::new(done_tx),
                gate: Mutex::new(None),
                fail,
            };
            (Arc::new(cycle), done_rx)
        }

        fn gated() -> (Arc<Self>, Receiver<SyncType>, Sender<()>) {
            let (cycle, done_rx) = Self::new(false);
            let (open_tx, open_rx) = mpsc::channel();
            *cycle.gate.lock().unwrap() = Some(open_rx);
            (cycle, done_rx, open_tx)
        }
    }

    impl SyncCycle for RecordingCycle {
        fn run_cycle(&self, run: &RunContext) -> Result<SyncReport, SyncError> {
            if let Some(gate) = self.gate.lock().unwrap().take() {
                gate.recv().unwrap();
            }
            self.runs.lock().unwrap().push(run.sync_type);
            let _ = self.done_tx.lock().unwrap().send(run.sync_type);
            if self.fail {
                Err(SyncError::AlreadyRunning)
            } else {
                Ok(SyncReport::default())
            }
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn start_runs_a_cycle_immediately() {
        let (cycle, done) = RecordingCycle::new(false);
        let mut scheduler = SyncScheduler::new(cycle, DEFAULT_INTERVAL);

        let status = scheduler.start().unwrap();
        assert!(status.running);
        assert_eq!(status.interval_secs, 24 * 60 * 60);
        assert_eq!(done.recv_timeout(WAIT).unwrap(), SyncType::Auto);
        scheduler.stop();
    }

    #[test]
    fn stop_lets_the_in_flight_cycle_finish() {
        let (cycle, done, open) = RecordingCycle::gated();
        let mut scheduler = SyncScheduler::new(Arc::clone(&cycle), Duration::from_millis(10));

        scheduler.start().unwrap();
        let status = scheduler.stop();
        assert!(!status.running);
        assert_eq!(status.started_at, None);

        open.send(()).unwrap();
        assert_eq!(done.recv_timeout(WAIT).unwrap(), SyncType::Auto);
        // disarmed: no further ticks after the in-flight one
        assert!(done.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(cycle.runs.lock().unwrap().len(), 1);
    }

    #[test]
    fn timer_keeps_ticking_through_failed_cycles() {
        let (cycle, done) = RecordingCycle::new(true);
        let mut scheduler = SyncScheduler::new(cycle, Duration::from_millis(10));
        scheduler.start().unwrap();

        let seen: Vec<SyncType> = (0..3).map(|_| done.recv_timeout(WAIT).unwrap()).collect();
        scheduler.stop();
        assert_eq!(seen, vec![SyncType::Auto, SyncType::Scheduled, SyncType::Scheduled]);
    }

    #[test]
    fn interval_past_the_clock_range_still_waits_for_stop() {
        let (cycle, done) = RecordingCycle::new(false);
        let (stop_tx, stop_rx) = mpsc::channel();
        stop_tx.send(()).unwrap();

        timer_loop(&*cycle, Duration::MAX, &stop_rx);
        assert_eq!(done.try_recv().unwrap(), SyncType::Auto);
        assert!(done.try_recv().is_err());
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let (cycle, done) = RecordingCycle::new(false);
        let mut scheduler = SyncScheduler::new(cycle, DEFAULT_INTERVAL);

        assert!(!scheduler.stop().running);
        let first = scheduler.start().unwrap();
        let second = scheduler.start().unwrap();
        assert_eq!(first, second);
        assert_eq!(done.recv_timeout(WAIT).unwrap(), SyncType::Auto);
        // a second timer would have fired its own immediate cycle
        assert!(done.recv_timeout(Duration::from_millis(100)).is_err());

        assert!(!scheduler.stop().running);
        assert!(!scheduler.stop().running);
    }
}
