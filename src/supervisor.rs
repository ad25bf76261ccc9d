//! Worker supervision
//!
//! The [`WorkerPool`] is the dispatcher's bookkeeping of worker health and
//! load. The [`Supervisor`] owns one link task per worker unit: it launches the
//! unit through a [`WorkerLauncher`], forwards requests to it and turns its
//! replies into [`WorkerSignal`]s. A link always ends with
//! [`LinkEvent::Exited`], which is how worker death is detected: by the unit's
//! output closing, not by a heartbeat.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use crate::job::JobId;
use crate::protocol::{decode_line, encode_line, WorkerReply, WorkerRequest};
use crate::worker::{self, WorkerOptions};
use crate::{Engine, Error, JobFailure, Result};

pub type WorkerId = usize;

/// Size of the in-memory pipe between a local worker and its link
const LOCAL_PIPE_CAPACITY: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerHealth {
    Starting,
    Ready,
    Dead,
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerHealth::Starting => write!(f, "starting"),
            WorkerHealth::Ready => write!(f, "ready"),
            WorkerHealth::Dead => write!(f, "dead"),
        }
    }
}

/// One worker slot in the pool
///
/// `generation` increases every time the slot is relaunched, so messages from
/// a previous incarnation can be told apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub generation: u64,
    pub pid: Option<u32>,
    pub capacity: usize,
    pub load: usize,
    pub health: WorkerHealth,
}

impl WorkerHandle {
    pub fn free_slots(&self) -> usize {
        match self.health {
            WorkerHealth::Ready => self.capacity.saturating_sub(self.load),
            _ => 0,
        }
    }
}

/// Health and load of every worker
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    pub fn new(size: usize, capacity: usize) -> Self {
        let workers = (0..size)
            .map(|id| WorkerHandle {
                id,
                generation: 0,
                pid: None,
                capacity,
                load: 0,
                health: WorkerHealth::Starting,
            })
            .collect();
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(id)
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// The Ready worker with the most free slots; ties go to the lowest id
    pub fn pick(&self) -> Option<WorkerId> {
        self.workers
            .iter()
            .filter(|w| w.free_slots() > 0)
            .max_by_key(|w| (w.free_slots(), Reverse(w.id)))
            .map(|w| w.id)
    }

    /// Take one slot on a Ready worker
    pub fn acquire(&mut self, id: WorkerId) -> bool {
        match self.workers.get_mut(id) {
            Some(w) if w.free_slots() > 0 => {
                w.load += 1;
                true
            }
            _ => false,
        }
    }

    /// Return a slot taken on the given generation of a worker
    pub fn release(&mut self, id: WorkerId, generation: u64) {
        if let Some(w) = self.current_mut(id, generation) {
            w.load = w.load.saturating_sub(1);
        }
    }

    pub fn mark_ready(&mut self, id: WorkerId, generation: u64, pid: u32) -> bool {
        match self.current_mut(id, generation) {
            Some(w) if w.health == WorkerHealth::Starting => {
                w.health = WorkerHealth::Ready;
                w.pid = Some(pid);
                true
            }
            _ => false,
        }
    }

    /// Mark the given generation dead; returns the health it had, or `None`
    /// when the generation is stale or already dead
    pub fn mark_dead(&mut self, id: WorkerId, generation: u64) -> Option<WorkerHealth> {
        let w = self.current_mut(id, generation)?;
        if w.health == WorkerHealth::Dead {
            return None;
        }
        let previous = w.health;
        w.health = WorkerHealth::Dead;
        w.load = 0;
        Some(previous)
    }

    /// Start a new generation of a worker; returns that generation
    pub fn restart(&mut self, id: WorkerId) -> Option<u64> {
        let w = self.workers.get_mut(id)?;
        w.generation += 1;
        w.health = WorkerHealth::Starting;
        w.pid = None;
        w.load = 0;
        Some(w.generation)
    }

    fn current_mut(&mut self, id: WorkerId, generation: u64) -> Option<&mut WorkerHandle> {
        self.workers
            .get_mut(id)
            .filter(|w| w.generation == generation)
    }
}

/// Keeps a launched worker unit alive; killing it must eventually close the
/// unit's output
pub trait WorkerGuard: Send {
    fn kill(&mut self);
}

/// Byte streams and lifetime guard of one launched worker unit
pub struct WorkerLink {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub guard: Box<dyn WorkerGuard>,
}

/// Starts worker units
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self, worker: WorkerId) -> Result<WorkerLink>;
}

/// Launches each worker as a child process speaking the protocol over its
/// stdin and stdout. Children are killed when their link drops.
///
/// On unix each child leads its own process group, so a Ctrl-C delivered to
/// the server's terminal does not reach the workers; they are stopped through
/// the dispatcher instead.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Relaunch the running executable with `args`
    pub fn current_exe(args: Vec<String>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

struct ChildGuard(Child);

impl WorkerGuard for ChildGuard {
    fn kill(&mut self) {
        if let Err(e) = self.0.start_kill() {
            debug!("Worker process already gone: {}", e);
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, worker: WorkerId) -> Result<WorkerLink> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--worker-id")
            .arg(worker.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::InitializationError("worker stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::InitializationError("worker stdout was not captured".into()))?;
        debug!("Spawned worker {} as pid {:?}", worker, child.id());

        Ok(WorkerLink {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            guard: Box::new(ChildGuard(child)),
        })
    }
}

/// Builds the engine of a local worker
pub type EngineFactory<E> = Arc<dyn Fn() -> BoxFuture<'static, Result<E>> + Send + Sync>;

/// Runs each worker as a task in this process, connected through an in-memory
/// pipe. Isolation is weaker than with processes; used for tests and
/// single-process deployments.
pub struct LocalLauncher<E: Engine> {
    factory: EngineFactory<E>,
    options: WorkerOptions,
}

impl<E: Engine> LocalLauncher<E> {
    pub fn new<F, Fut>(options: WorkerOptions, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<E>> + Send + 'static,
    {
        let factory: EngineFactory<E> = Arc::new(move || factory().boxed());
        Self { factory, options }
    }
}

struct TaskGuard(AbortHandle);

impl WorkerGuard for TaskGuard {
    fn kill(&mut self) {
        self.0.abort();
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl<E: Engine> WorkerLauncher for LocalLauncher<E> {
    async fn launch(&self, worker: WorkerId) -> Result<WorkerLink> {
        let (ours, theirs) = tokio::io::duplex(LOCAL_PIPE_CAPACITY);
        let factory = self.factory.clone();
        let options = self.options.clone();

        let task = tokio::spawn(async move {
            let engine = match factory().await {
                Ok(engine) => engine,
                Err(e) => {
                    error!("Worker {} failed to start its engine: {}", worker, e);
                    return;
                }
            };
            let (reader, writer) = tokio::io::split(theirs);
            if let Err(e) = worker::serve(engine, options, reader, writer).await {
                warn!("Worker {} stopped: {}", worker, e);
            }
        });

        let (reader, writer) = tokio::io::split(ours);
        Ok(WorkerLink {
            reader: Box::new(reader),
            writer: Box::new(writer),
            guard: Box::new(TaskGuard(task.abort_handle())),
        })
    }
}

/// What a link observed on its worker unit
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Ready { pid: u32 },
    Started { job_id: JobId },
    Finished {
        job_id: JobId,
        outcome: std::result::Result<Bytes, JobFailure>,
    },
    /// The unit is gone, or never came up
    Exited { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSignal {
    pub worker: WorkerId,
    pub generation: u64,
    pub event: LinkEvent,
}

enum LinkCommand {
    Send(WorkerRequest),
    Kill,
}

struct Link {
    commands: mpsc::UnboundedSender<LinkCommand>,
    task: JoinHandle<()>,
}

/// Owns the link task of every worker unit
pub struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    signals: mpsc::UnboundedSender<WorkerSignal>,
    links: HashMap<WorkerId, Link>,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, signals: mpsc::UnboundedSender<WorkerSignal>) -> Self {
        Self {
            launcher,
            signals,
            links: HashMap::new(),
        }
    }

    /// Launch `generation` of a worker after `delay`, replacing any previous link
    pub fn spawn(&mut self, worker: WorkerId, generation: u64, delay: Duration) {
        let (commands, inbox) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_link(
            worker,
            generation,
            delay,
            self.launcher.clone(),
            inbox,
            self.signals.clone(),
        ));
        if let Some(old) = self.links.insert(
            worker,
            Link { commands, task },
        ) {
            old.task.abort();
        }
    }

    /// Queue a request for a worker; false when it has no live link
    pub fn send(&self, worker: WorkerId, request: WorkerRequest) -> bool {
        self.links
            .get(&worker)
            .map(|link| link.commands.send(LinkCommand::Send(request)).is_ok())
            .unwrap_or(false)
    }

    /// Terminate a worker unit; its link reports `Exited` once it is gone
    pub fn kill(&self, worker: WorkerId) -> bool {
        self.links
            .get(&worker)
            .map(|link| link.commands.send(LinkCommand::Kill).is_ok())
            .unwrap_or(false)
    }

    /// Kill every worker unit
    pub fn shutdown(&mut self) {
        for (worker, link) in self.links.drain() {
            debug!("Stopping worker {}", worker);
            let _ = link.commands.send(LinkCommand::Kill);
        }
    }
}

async fn run_link(
    worker: WorkerId,
    generation: u64,
    delay: Duration,
    launcher: Arc<dyn WorkerLauncher>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    signals: mpsc::UnboundedSender<WorkerSignal>,
) {
    let emit = |event: LinkEvent| {
        let _ = signals.send(WorkerSignal {
            worker,
            generation,
            event,
        });
    };

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let WorkerLink {
        reader,
        mut writer,
        mut guard,
    } = match launcher.launch(worker).await {
        Ok(link) => link,
        Err(e) => {
            error!("Failed to launch worker {}: {}", worker, e);
            emit(LinkEvent::Exited {
                reason: format!("launch failed: {}", e),
            });
            return;
        }
    };
    info!("Launched worker {} (generation {})", worker, generation);

    let mut lines = BufReader::new(reader).lines();
    let mut killed = false;
    let reason = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match decode_line::<WorkerReply>(&line) {
                    Ok(WorkerReply::Ready { pid }) => emit(LinkEvent::Ready { pid }),
                    Ok(WorkerReply::Started { job_id }) => emit(LinkEvent::Started { job_id }),
                    Ok(WorkerReply::Finished { job_id, outcome }) => emit(LinkEvent::Finished {
                        job_id,
                        outcome: outcome.into_result(),
                    }),
                    Err(e) => warn!("Worker {} sent a malformed reply: {}", worker, e),
                },
                Ok(None) if killed => break "killed".to_string(),
                Ok(None) => break "output closed".to_string(),
                Err(e) => break format!("read failed: {}", e),
            },
            command = commands.recv(), if !killed => match command {
                Some(LinkCommand::Send(request)) => {
                    if let Err(e) = send_request(&mut writer, &request).await {
                        warn!("Worker {} is unreachable: {}", worker, e);
                        guard.kill();
                        killed = true;
                    }
                }
                Some(LinkCommand::Kill) | None => {
                    guard.kill();
                    killed = true;
                }
            },
        }
    };

    drop(writer);
    drop(guard);
    emit(LinkEvent::Exited { reason });
}

async fn send_request(
    writer: &mut Box<dyn AsyncWrite + Send + Unpin>,
    request: &WorkerRequest,
) -> Result<()> {
    writer.write_all(&encode_line(request)?).await?;
    writer.flush().await?;
    Ok(())
}
