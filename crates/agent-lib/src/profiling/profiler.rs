//! One profiler task per (service, profile type)
//!
//! The profiler drives a worker's profile sessions: it starts profiling on
//! the first request, produces a profile every duration boundary, matches
//! queued requests to it by timestamp, and winds itself down after half a
//! duration without pending work.

use crate::error::CommandError;
use crate::models::{ProfileRequest, ProfileType, ProfilerPhase, WorkerId};
use crate::runtime::{ProfileChunk, ProfilingOptions, WorkerRuntime};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::{debug, info, warn};

const CMD_BUFFER: usize = 16;

enum ProfilerCmd {
    Request(ProfileRequest),
    Stop,
}

/// A profile produced for a set of matched requests, handed to the sink.
#[derive(Debug, Clone)]
pub struct ProducedProfile {
    pub service_id: String,
    pub profile_type: ProfileType,
    pub bytes: Vec<u8>,
    /// Matched requests in enqueue order.
    pub requests: Vec<ProfileRequest>,
}

/// Handle to a running profiler task.
pub struct ProfilerHandle {
    pub worker: WorkerId,
    pub profile_type: ProfileType,
    cmd_tx: mpsc::Sender<ProfilerCmd>,
    phase_rx: watch::Receiver<ProfilerPhase>,
    task: JoinHandle<()>,
}

impl ProfilerHandle {
    /// Enqueue a request. Returns false when the profiler already wound
    /// down, in which case the caller replaces it.
    pub async fn request(&self, request: ProfileRequest) -> bool {
        self.cmd_tx
            .send(ProfilerCmd::Request(request))
            .await
            .is_ok()
    }

    /// Ask the profiler to stop; best effort.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(ProfilerCmd::Stop).await;
    }

    pub fn phase(&self) -> ProfilerPhase {
        *self.phase_rx.borrow()
    }

    /// Wait for the task to finish winding down.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    service_id: String,
    profile_type: ProfileType,
    worker: WorkerId,
    duration: Duration,
    attempt_timeout: Duration,
    source_maps: bool,
    runtime: Arc<dyn WorkerRuntime>,
    produced_tx: mpsc::Sender<ProducedProfile>,
) -> ProfilerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_BUFFER);
    let (phase_tx, phase_rx) = watch::channel(ProfilerPhase::Idle);

    let profiler = Profiler {
        service_id,
        profile_type,
        worker: worker.clone(),
        duration,
        attempt_timeout,
        source_maps,
        runtime,
        produced_tx,
        cmd_rx,
        phase_tx,
        pending: VecDeque::new(),
        last_profile: None,
    };
    let task = tokio::spawn(profiler.run());

    ProfilerHandle {
        worker,
        profile_type,
        cmd_tx,
        phase_rx,
        task,
    }
}

struct Profiler {
    service_id: String,
    profile_type: ProfileType,
    worker: WorkerId,
    duration: Duration,
    attempt_timeout: Duration,
    source_maps: bool,
    runtime: Arc<dyn WorkerRuntime>,
    produced_tx: mpsc::Sender<ProducedProfile>,
    cmd_rx: mpsc::Receiver<ProfilerCmd>,
    phase_tx: watch::Sender<ProfilerPhase>,
    pending: VecDeque<ProfileRequest>,
    /// Profile produced in the current running cycle, handed to requests
    /// still pending at stop time.
    last_profile: Option<ProfileChunk>,
}

impl Profiler {
    async fn run(mut self) {
        let mut produce_at: Option<Instant> = None;
        let mut stop_at: Option<Instant> = None;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ProfilerCmd::Request(request)) => {
                        // any queued work cancels a pending idle-stop
                        stop_at = None;
                        if !self.ensure_running(&mut produce_at).await {
                            continue;
                        }
                        self.pending.push_back(request);
                    }
                    Some(ProfilerCmd::Stop) | None => {
                        self.wind_down().await;
                        break;
                    }
                },
                _ = deadline(produce_at), if produce_at.is_some() => {
                    self.produce().await;
                    produce_at = Some(Instant::now() + self.duration);
                    if self.pending.is_empty() {
                        stop_at = Some(Instant::now() + self.duration / 2);
                    }
                }
                _ = deadline(stop_at), if stop_at.is_some() => {
                    self.wind_down().await;
                    break;
                }
            }
        }
    }

    /// Start profiling on the worker if not already running; schedules the
    /// first production boundary.
    async fn ensure_running(&mut self, produce_at: &mut Option<Instant>) -> bool {
        if *self.phase_tx.borrow() == ProfilerPhase::Running {
            return true;
        }

        let options = ProfilingOptions {
            profile_type: self.profile_type,
            duration_millis: self.duration.as_millis() as u64,
            source_maps: self.source_maps,
        };
        match self.runtime.start_profiling(&self.worker, &options).await {
            Ok(()) => {
                self.phase_tx.send_replace(ProfilerPhase::Running);
                *produce_at = Some(Instant::now() + self.duration);
                info!(
                    worker = %self.worker,
                    profile_type = %self.profile_type,
                    duration_millis = self.duration.as_millis() as u64,
                    "Started profiling"
                );
                true
            }
            Err(e) => {
                warn!(error = %e, worker = %self.worker, "Failed to start profiling");
                false
            }
        }
    }

    /// One production boundary: fetch the profile and serve every request it
    /// covers. Requests newer than the profile stay queued for the next one.
    async fn produce(&mut self) {
        let Some(chunk) = self.fetch_profile().await else {
            return;
        };

        let mut matched = Vec::new();
        while self
            .pending
            .front()
            .is_some_and(|request| request.timestamp <= chunk.timestamp)
        {
            matched.extend(self.pending.pop_front());
        }

        self.last_profile = Some(chunk.clone());

        if matched.is_empty() {
            debug!(worker = %self.worker, "Profile produced with no matching requests");
            return;
        }

        let produced = ProducedProfile {
            service_id: self.service_id.clone(),
            profile_type: self.profile_type,
            bytes: chunk.bytes,
            requests: matched,
        };
        if self.produced_tx.send(produced).await.is_err() {
            warn!(worker = %self.worker, "Profile sink closed, dropping produced profile");
        }
    }

    /// Fetch the produced profile, waiting out `NoProfileAvailable` for up to
    /// `ceil(duration / attempt_timeout) + 1` attempts. `NotEnoughElu` ends
    /// the cycle immediately.
    async fn fetch_profile(&mut self) -> Option<ProfileChunk> {
        let duration_ms = (self.duration.as_millis() as u64).max(1);
        let attempt_ms = (self.attempt_timeout.as_millis() as u64).max(1);
        let attempts = duration_ms.div_ceil(attempt_ms) + 1;

        for attempt in 1..=attempts {
            match self
                .runtime
                .last_profile(&self.worker, self.profile_type)
                .await
            {
                Ok(chunk) => return Some(chunk),
                Err(CommandError::NoProfileAvailable) => {
                    info!(worker = %self.worker, attempt, "Profile not available yet");
                    if attempt < attempts {
                        tokio::time::sleep(self.attempt_timeout).await;
                    }
                }
                Err(CommandError::NotEnoughElu) => {
                    info!(worker = %self.worker, "Worker too idle to profile");
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, worker = %self.worker, "Failed to fetch profile");
                    return None;
                }
            }
        }

        info!(worker = %self.worker, "No profile produced within this cycle");
        None
    }

    /// Stop the session. Requests still pending receive the profile produced
    /// in this cycle if there was one.
    async fn wind_down(&mut self) {
        self.phase_tx.send_replace(ProfilerPhase::Stopping);

        match self
            .runtime
            .stop_profiling(&self.worker, self.profile_type)
            .await
        {
            Ok(()) => {}
            Err(CommandError::ProfilingNotStarted) => {
                debug!(worker = %self.worker, "Profiling session was not running");
            }
            Err(e) => warn!(error = %e, worker = %self.worker, "Failed to stop profiling"),
        }

        if !self.pending.is_empty() {
            let requests: Vec<ProfileRequest> = self.pending.drain(..).collect();
            match self.last_profile.take() {
                Some(chunk) => {
                    let produced = ProducedProfile {
                        service_id: self.service_id.clone(),
                        profile_type: self.profile_type,
                        bytes: chunk.bytes,
                        requests,
                    };
                    let _ = self.produced_tx.send(produced).await;
                }
                None => {
                    warn!(
                        count = requests.len(),
                        worker = %self.worker,
                        "Dropping profile requests; no profile was produced this cycle"
                    );
                }
            }
        }

        self.phase_tx.send_replace(ProfilerPhase::Idle);
        info!(worker = %self.worker, profile_type = %self.profile_type, "Profiler stopped");
    }
}

fn deadline(at: Option<Instant>) -> Sleep {
    // disabled branches still build their future; give them a far-off one
    sleep_until(at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)))
}
