//! Periodic jobs armed while the instrument is autosampling.
//!
//! Each armed job is a Tokio task that sends a [`JobFired`] into the session
//! on every tick.  Firings carry the generation they were armed under; the
//! session drops any firing whose generation is no longer current, so a tick
//! already queued when a job is disarmed never runs.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::application::ProtocolEvent;

/// Capacity of the scheduler-to-session channel.
const FIRED_CAPACITY: usize = 16;

/// The periodic jobs a session can arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledJob {
    ClockSync,
    AcquireStatus,
}

impl ScheduledJob {
    /// The protocol event a firing of this job injects.
    pub fn event(self) -> ProtocolEvent {
        match self {
            ScheduledJob::ClockSync => ProtocolEvent::ScheduledClockSync,
            ScheduledJob::AcquireStatus => ProtocolEvent::ScheduledAcquireStatus,
        }
    }
}

/// One tick of an armed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobFired {
    pub job: ScheduledJob,
    pub generation: u64,
}

/// Arms and disarms periodic jobs.
pub trait Scheduler: Send {
    /// Starts firing `job` every `interval`, replacing any earlier arming.
    fn arm(&mut self, job: ScheduledJob, interval: Duration);

    /// Stops `job`.  Firings already queued become stale.
    fn disarm(&mut self, job: ScheduledJob);

    fn disarm_all(&mut self);

    /// `true` if `fired` belongs to the job's current arming.
    fn is_current(&self, fired: &JobFired) -> bool;
}

struct ArmedJob {
    generation: u64,
    task: JoinHandle<()>,
}

/// [`Scheduler`] backed by one Tokio interval task per job.
pub struct TokioScheduler {
    tx: mpsc::Sender<JobFired>,
    armed: HashMap<ScheduledJob, ArmedJob>,
    next_generation: u64,
}

impl TokioScheduler {
    /// Creates a scheduler and the receiver its firings arrive on.
    pub fn new() -> (Self, mpsc::Receiver<JobFired>) {
        let (tx, rx) = mpsc::channel(FIRED_CAPACITY);
        (
            Self {
                tx,
                armed: HashMap::new(),
                next_generation: 1,
            },
            rx,
        )
    }

    pub fn armed_jobs(&self) -> Vec<ScheduledJob> {
        self.armed.keys().copied().collect()
    }
}

impl Scheduler for TokioScheduler {
    fn arm(&mut self, job: ScheduledJob, interval: Duration) {
        self.disarm(job);
        let generation = self.next_generation;
        self.next_generation += 1;

        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!(?job, generation, "scheduled job fired");
                if tx.send(JobFired { job, generation }).await.is_err() {
                    break;
                }
            }
        });
        info!(?job, ?interval, "scheduled job armed");
        self.armed.insert(job, ArmedJob { generation, task });
    }

    fn disarm(&mut self, job: ScheduledJob) {
        if let Some(armed) = self.armed.remove(&job) {
            armed.task.abort();
            info!(?job, "scheduled job disarmed");
        }
    }

    fn disarm_all(&mut self) {
        let jobs: Vec<_> = self.armed.keys().copied().collect();
        for job in jobs {
            self.disarm(job);
        }
    }

    fn is_current(&self, fired: &JobFired) -> bool {
        self.armed
            .get(&fired.job)
            .is_some_and(|armed| armed.generation == fired.generation)
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for armed in self.armed.values() {
            armed.task.abort();
        }
    }
}
