//! Dispatcher and job queue
//!
//! A [`Cluster`] is a cheap handle to one dispatcher task. That task is the
//! only owner of the FIFO queue, the job table and the worker pool; every
//! submission, completion, timeout and worker exit is serialized through it.
//! Artifacts are published to the result store from the same task, so a job
//! that already timed out never gets a blob written.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::job::{JobId, JobState, RenderJob};
use crate::protocol::WorkerRequest;
use crate::store::ResultStore;
use crate::supervisor::{
    LinkEvent, Supervisor, WorkerHandle, WorkerHealth, WorkerId, WorkerLauncher, WorkerPool,
    WorkerSignal,
};
use crate::{Error, FailureReason, JobFailure, Result};

const EVENT_CAPACITY: usize = 256;

/// Sizing and timing of a cluster
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Number of worker units kept alive
    pub workers: usize,
    /// Concurrent jobs per worker
    pub worker_slots: usize,
    /// Jobs allowed to wait for capacity; unbounded when `None`
    pub max_queue: Option<usize>,
    /// How long a published artifact waits to be collected
    pub result_ttl: Duration,
    /// Pause before relaunching a worker that died before becoming ready
    pub restart_delay: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            worker_slots: 4,
            max_queue: None,
            result_ttl: Duration::from_secs(30),
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Lifecycle notifications, broadcast to subscribers and logged
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    WorkerStarted { worker: WorkerId, pid: u32 },
    WorkerDied { worker: WorkerId, reason: String },
    JobStarted { job: JobId, worker: WorkerId },
    JobFinished { job: JobId, state: JobState },
    Stopped,
}

/// Point-in-time view of the cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub workers: Vec<WorkerHandle>,
    pub queued: usize,
    pub in_flight: usize,
    pub stopped: bool,
}

impl ClusterStats {
    pub fn ready_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.health == WorkerHealth::Ready)
            .count()
    }
}

enum Command {
    Submit {
        job: RenderJob,
        reply: oneshot::Sender<Result<oneshot::Receiver<JobState>>>,
    },
    Expire {
        job: JobId,
    },
    Stats {
        reply: oneshot::Sender<ClusterStats>,
    },
    KillWorker {
        worker: WorkerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running cluster
#[derive(Clone)]
pub struct Cluster {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClusterEvent>,
    store: Arc<dyn ResultStore>,
}

impl Cluster {
    /// Spawn the dispatcher and launch every worker. Must be called inside a
    /// tokio runtime.
    pub fn start(
        options: ClusterOptions,
        launcher: Arc<dyn WorkerLauncher>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            "Starting render cluster with {} worker(s) x {} slot(s)",
            options.workers, options.worker_slots
        );
        let dispatcher = Dispatcher {
            pool: WorkerPool::new(options.workers, options.worker_slots),
            supervisor: Supervisor::new(launcher, signal_tx),
            store: store.clone(),
            events: events.clone(),
            jobs: HashMap::new(),
            queue: VecDeque::new(),
            stopped: false,
            options,
        };
        tokio::spawn(dispatcher.run(inbox, signals));

        Self {
            commands,
            events,
            store,
        }
    }

    /// Queue a job. Fails with `Rejected` when the queue is full and with
    /// `ClusterStopped` after [`stop`](Self::stop).
    pub async fn submit(&self, job: RenderJob) -> Result<JobHandle> {
        let id = job.id.clone();
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Submit { job, reply })
            .map_err(|_| Error::ClusterStopped)?;
        let terminal = answer.await.map_err(|_| Error::ClusterStopped)??;
        Ok(JobHandle {
            id,
            terminal,
            commands: self.commands.clone(),
            settled: false,
        })
    }

    pub async fn stats(&self) -> Result<ClusterStats> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .map_err(|_| Error::ClusterStopped)?;
        answer.await.map_err(|_| Error::ClusterStopped)
    }

    /// Terminate one worker unit; the supervisor replaces it
    pub async fn kill_worker(&self, worker: WorkerId) -> Result<()> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::KillWorker { worker, reply })
            .map_err(|_| Error::ClusterStopped)?;
        answer.await.map_err(|_| Error::ClusterStopped)?
    }

    /// Stop every worker and fail all pending jobs with `ClusterStopped`
    pub async fn stop(&self) {
        let (reply, answer) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).is_ok() {
            let _ = answer.await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }
}

/// A submitted job, awaiting its terminal state
///
/// Dropping the handle before the job finishes gives the job up: it becomes
/// `TimedOut` and its artifact is never published.
pub struct JobHandle {
    id: JobId,
    terminal: oneshot::Receiver<JobState>,
    commands: mpsc::UnboundedSender<Command>,
    settled: bool,
}

impl JobHandle {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Key the artifact is published under once the job completes
    pub fn result_key(&self) -> String {
        self.id.result_key()
    }

    /// Wait at most `deadline` for the job to finish. On expiry the job is
    /// marked `TimedOut` unless it finished in the meantime.
    pub async fn wait(mut self, deadline: Duration) -> JobState {
        let state = match tokio::time::timeout(deadline, &mut self.terminal).await {
            Ok(Ok(state)) => state,
            Ok(Err(_)) => lost_dispatcher(),
            Err(_) => {
                let _ = self.commands.send(Command::Expire {
                    job: self.id.clone(),
                });
                match (&mut self.terminal).await {
                    Ok(state) => state,
                    Err(_) => lost_dispatcher(),
                }
            }
        };
        self.settled = true;
        state
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.commands.send(Command::Expire {
                job: self.id.clone(),
            });
        }
    }
}

fn lost_dispatcher() -> JobState {
    JobState::Failed(JobFailure::new(
        FailureReason::ClusterStopped,
        "dispatcher is gone",
    ))
}

struct JobEntry {
    job: RenderJob,
    state: JobState,
    /// Worker generation holding a slot for this job
    worker: Option<(WorkerId, u64)>,
    notify: Option<oneshot::Sender<JobState>>,
}

struct Dispatcher {
    options: ClusterOptions,
    pool: WorkerPool,
    supervisor: Supervisor,
    store: Arc<dyn ResultStore>,
    events: broadcast::Sender<ClusterEvent>,
    jobs: HashMap<JobId, JobEntry>,
    queue: VecDeque<JobId>,
    stopped: bool,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<WorkerSignal>,
    ) {
        for worker in self.pool.handles().to_vec() {
            self.supervisor
                .spawn(worker.id, worker.generation, Duration::ZERO);
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(signal) = signals.recv() => self.on_signal(signal).await,
            }
        }
        debug!("Dispatcher exited");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Submit { job, reply } => {
                let _ = reply.send(self.submit(job));
            }
            Command::Expire { job } => self.expire(&job),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::KillWorker { worker, reply } => {
                let result = if worker < self.pool.len() {
                    info!("Killing worker {} on request", worker);
                    self.supervisor.kill(worker);
                    Ok(())
                } else {
                    Err(Error::UnknownWorker(worker))
                };
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
        }
    }

    fn submit(&mut self, job: RenderJob) -> Result<oneshot::Receiver<JobState>> {
        if self.stopped {
            return Err(Error::ClusterStopped);
        }
        if let Some(limit) = self.options.max_queue {
            if self.queue.len() >= limit {
                warn!("[{}] rejected, {} job(s) already waiting", job.id, self.queue.len());
                return Err(Error::Rejected(self.queue.len()));
            }
        }
        if self.jobs.contains_key(&job.id) {
            return Err(Error::DuplicateJob(job.id));
        }

        info!(
            "[{}] queued {} for {}",
            job.id,
            job.url,
            job.caller.as_deref().unwrap_or("anonymous")
        );
        let (notify, terminal) = oneshot::channel();
        let id = job.id.clone();
        self.queue.push_back(id.clone());
        self.jobs.insert(
            id,
            JobEntry {
                job,
                state: JobState::Queued,
                worker: None,
                notify: Some(notify),
            },
        );
        self.pump();
        Ok(terminal)
    }

    /// Hand queued jobs to free capacity, oldest first
    fn pump(&mut self) {
        if self.stopped {
            return;
        }
        while let Some(worker) = self.pool.pick() {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            let Some(entry) = self.jobs.get_mut(&id) else {
                continue;
            };
            if entry.state != JobState::Queued {
                continue;
            }
            let generation = self.pool.get(worker).map(|w| w.generation).unwrap_or_default();
            if !self
                .supervisor
                .send(worker, WorkerRequest::Render(entry.job.to_request()))
            {
                // link already gone; its exit signal will free the worker
                self.queue.push_front(id);
                break;
            }
            self.pool.acquire(worker);
            entry.state = JobState::Assigned;
            entry.worker = Some((worker, generation));
            debug!("[{}] assigned to worker {}", id, worker);
        }
    }

    fn stats(&self) -> ClusterStats {
        ClusterStats {
            workers: self.pool.handles().to_vec(),
            queued: self.queue.len(),
            in_flight: self.jobs.values().filter(|e| e.worker.is_some()).count(),
            stopped: self.stopped,
        }
    }

    fn expire(&mut self, id: &JobId) {
        let Some(entry) = self.jobs.get(id) else {
            return;
        };
        if entry.state.is_terminal() {
            return;
        }
        if entry.state == JobState::Queued {
            self.queue.retain(|queued| queued != id);
        }
        self.finish(id, JobState::TimedOut);
    }

    /// Move a job to a terminal state; the first terminal state wins
    fn finish(&mut self, id: &JobId, state: JobState) {
        let Some(entry) = self.jobs.get_mut(id) else {
            return;
        };
        if entry.state.is_terminal() {
            return;
        }
        entry.state = state.clone();
        if let Some(notify) = entry.notify.take() {
            let _ = notify.send(state.clone());
        }
        match &state {
            JobState::Completed => info!("[{}] completed", id),
            other => warn!("[{}] {}", id, other),
        }
        if entry.worker.is_none() {
            self.jobs.remove(id);
        }
        self.emit(ClusterEvent::JobFinished {
            job: id.clone(),
            state,
        });
    }

    async fn on_signal(&mut self, signal: WorkerSignal) {
        let WorkerSignal {
            worker,
            generation,
            event,
        } = signal;
        match event {
            LinkEvent::Ready { pid } => {
                if self.stopped || !self.pool.mark_ready(worker, generation, pid) {
                    return;
                }
                info!("Worker {} ready (pid {})", worker, pid);
                self.emit(ClusterEvent::WorkerStarted { worker, pid });
                self.pump();
            }
            LinkEvent::Started { job_id } => {
                let Some(entry) = self.jobs.get_mut(&job_id) else {
                    return;
                };
                if entry.state == JobState::Assigned && entry.worker == Some((worker, generation)) {
                    entry.state = JobState::Rendering;
                    debug!("[{}] rendering on worker {}", job_id, worker);
                    self.emit(ClusterEvent::JobStarted {
                        job: job_id,
                        worker,
                    });
                }
            }
            LinkEvent::Finished { job_id, outcome } => {
                self.on_finished(worker, generation, job_id, outcome).await;
                self.pump();
            }
            LinkEvent::Exited { reason } => self.on_exited(worker, generation, reason),
        }
    }

    async fn on_finished(
        &mut self,
        worker: WorkerId,
        generation: u64,
        id: JobId,
        outcome: std::result::Result<bytes::Bytes, JobFailure>,
    ) {
        let Some(entry) = self.jobs.get_mut(&id) else {
            return;
        };
        if entry.worker != Some((worker, generation)) {
            return;
        }
        entry.worker = None;
        let abandoned = entry.state.is_terminal();
        self.pool.release(worker, generation);

        if abandoned {
            debug!("[{}] discarding result of abandoned job", id);
            self.jobs.remove(&id);
            return;
        }

        let state = match outcome {
            Ok(bytes) => {
                let size = bytes.len();
                match self
                    .store
                    .put(&id.result_key(), bytes, self.options.result_ttl)
                    .await
                {
                    Ok(()) => {
                        debug!("[{}] published {} bytes", id, size);
                        JobState::Completed
                    }
                    Err(e) => JobState::Failed(JobFailure::new(
                        FailureReason::PublishFailed,
                        e.to_string(),
                    )),
                }
            }
            Err(failure) => JobState::Failed(failure),
        };
        self.finish(&id, state);
    }

    fn on_exited(&mut self, worker: WorkerId, generation: u64, reason: String) {
        if self.stopped {
            return;
        }
        let Some(previous) = self.pool.mark_dead(worker, generation) else {
            return;
        };
        warn!("Worker {} died: {}", worker, reason);
        self.emit(ClusterEvent::WorkerDied {
            worker,
            reason: reason.clone(),
        });

        let lost: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, entry)| entry.worker == Some((worker, generation)))
            .map(|(id, _)| id.clone())
            .collect();
        for id in lost {
            let Some(entry) = self.jobs.get_mut(&id) else {
                continue;
            };
            entry.worker = None;
            if entry.state.is_terminal() {
                self.jobs.remove(&id);
                continue;
            }
            let failure = JobFailure::new(
                FailureReason::WorkerLost,
                format!("worker {} exited: {}", worker, reason),
            );
            self.finish(&id, JobState::Failed(failure));
        }

        // a unit that never came up gets a pause before the next attempt
        let delay = match previous {
            WorkerHealth::Starting => self.options.restart_delay,
            _ => Duration::ZERO,
        };
        if let Some(next) = self.pool.restart(worker) {
            debug!("Relaunching worker {} as generation {} in {:?}", worker, next, delay);
            self.supervisor.spawn(worker, next, delay);
        }
        self.pump();
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        info!(
            "Stopping render cluster ({} queued, {} tracked)",
            self.queue.len(),
            self.jobs.len()
        );
        self.stopped = true;
        self.emit(ClusterEvent::Stopped);
        self.supervisor.shutdown();
        for worker in self.pool.handles().to_vec() {
            self.pool.mark_dead(worker.id, worker.generation);
        }

        self.queue.clear();
        let ids: Vec<JobId> = self.jobs.keys().cloned().collect();
        for id in ids {
            if let Some(entry) = self.jobs.get_mut(&id) {
                entry.worker = None;
            }
            let failure = JobFailure::new(FailureReason::ClusterStopped, "cluster stopped");
            self.finish(&id, JobState::Failed(failure));
        }
        self.jobs.clear();
    }

    fn emit(&self, event: ClusterEvent) {
        let _ = self.events.send(event);
    }
}
