//! The loop running inside one worker unit
//!
//! A worker owns one [`Engine`] and serves render requests read line by line
//! from its input, running up to `slots` executors at once. Replies go to its
//! output; in a worker process that is stdout, so logging must go to stderr.

use futures::FutureExt;
use log::{debug, error, info, warn};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::executor::Executor;
use crate::protocol::{decode_line, encode_line, RenderRequest, WireOutcome, WorkerReply, WorkerRequest};
use crate::{Engine, FailureReason, JobFailure, Result};

/// Default number of concurrent executors per worker
pub const DEFAULT_SLOTS: usize = 4;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub slots: usize,
    pub executor: Executor,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            slots: DEFAULT_SLOTS,
            executor: Executor::default(),
        }
    }
}

/// Serve requests until the input closes or a shutdown request arrives, then
/// finish in-flight jobs and close the engine.
pub async fn serve<E, R, W>(engine: E, options: WorkerOptions, reader: R, mut writer: W) -> Result<()>
where
    E: Engine,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let engine = Arc::new(engine);
    let slots = Arc::new(Semaphore::new(options.slots.max(1)));
    let (replies, mut outbox) = mpsc::unbounded_channel::<WorkerReply>();
    let mut lines = BufReader::new(reader).lines();
    let mut jobs = JoinSet::new();
    let mut draining = false;

    write_reply(&mut writer, &WorkerReply::Ready { pid: std::process::id() }).await?;
    info!(
        "Worker ready with {} slot(s), settling {:?} per page",
        options.slots,
        options.executor.settle()
    );

    let served = loop {
        if draining && jobs.is_empty() {
            break Ok(());
        }
        tokio::select! {
            line = lines.next_line(), if !draining => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match decode_line::<WorkerRequest>(&line) {
                    Ok(WorkerRequest::Render(request)) => {
                        debug!("[{}] accepted {}", request.job_id, request.url);
                        jobs.spawn(run_job(
                            engine.clone(),
                            slots.clone(),
                            options.executor.clone(),
                            request,
                            replies.clone(),
                        ));
                    }
                    Ok(WorkerRequest::Shutdown) => {
                        info!("Shutdown requested, draining {} job(s)", jobs.len());
                        draining = true;
                    }
                    Err(e) => warn!("Ignoring malformed request: {}", e),
                },
                Ok(None) => {
                    debug!("Input closed, draining {} job(s)", jobs.len());
                    draining = true;
                }
                Err(e) => break Err(e.into()),
            },
            Some(reply) = outbox.recv() => {
                if let Err(e) = write_reply(&mut writer, &reply).await {
                    break Err(e);
                }
            }
            Some(joined) = jobs.join_next() => {
                if let Err(e) = joined {
                    error!("Render task aborted: {}", e);
                }
            }
        }
    };

    if served.is_ok() {
        while let Ok(reply) = outbox.try_recv() {
            write_reply(&mut writer, &reply).await?;
        }
    } else {
        jobs.shutdown().await;
    }

    if let Err(e) = engine.close().await {
        warn!("Closing engine failed: {}", e);
    }
    served
}

async fn run_job<E: Engine>(
    engine: Arc<E>,
    slots: Arc<Semaphore>,
    executor: Executor,
    request: RenderRequest,
    replies: mpsc::UnboundedSender<WorkerReply>,
) {
    let Ok(_permit) = slots.acquire_owned().await else {
        return;
    };
    let job_id = request.job_id.clone();
    let _ = replies.send(WorkerReply::Started { job_id: job_id.clone() });

    let result = match engine.new_page().await {
        Ok(page) => AssertUnwindSafe(executor.run(page, &request))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(JobFailure::new(FailureReason::RenderFailed, "render task panicked"))
            }),
        Err(e) => Err(JobFailure::new(FailureReason::RenderFailed, e.to_string())),
    };

    match &result {
        Ok(bytes) => info!("[{}] rendered {} bytes", job_id, bytes.len()),
        Err(failure) => warn!("[{}] {}", job_id, failure),
    }
    let _ = replies.send(WorkerReply::Finished {
        job_id,
        outcome: WireOutcome::from_result(result),
    });
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &WorkerReply) -> Result<()> {
    writer.write_all(&encode_line(reply)?).await?;
    writer.flush().await?;
    Ok(())
}
