//! Shared fixtures: an in-process fake browser and a cluster wired to it.
//!
//! The fake engine decides what to do from the URL path:
//! `/hang` never finishes loading, `/broken` fails to load, `/slow` takes a
//! while, `/gated` waits for [`FakeStats::open_gate`]. Only an element with
//! id `chart` exists on any page.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use snapcluster::executor::Executor;
use snapcluster::store::MemoryStore;
use snapcluster::supervisor::LocalLauncher;
use snapcluster::target::RenderTargetSpec;
use snapcluster::worker::WorkerOptions;
use snapcluster::{
    ClipRect, Cluster, ClusterOptions, ConsoleMessage, Engine, Error, OutputFormat, OutputKind, Page,
    Result, Viewport,
};

pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
pub const PDF_MAGIC: &[u8] = b"%PDF-";
pub const SLOW_LOAD: Duration = Duration::from_millis(300);

/// What the fake pages observed, shared by every engine of a cluster
pub struct FakeStats {
    active: AtomicUsize,
    peak: AtomicUsize,
    rendered: AtomicUsize,
    gate: Semaphore,
    viewports: Mutex<Vec<Viewport>>,
    headers: Mutex<Vec<HashMap<String, String>>>,
}

impl FakeStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            rendered: AtomicUsize::new(0),
            gate: Semaphore::new(0),
            viewports: Mutex::new(Vec::new()),
            headers: Mutex::new(Vec::new()),
        })
    }

    /// Highest number of pages open at the same time
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn rendered(&self) -> usize {
        self.rendered.load(Ordering::SeqCst)
    }

    /// Let the next `count` `/gated` loads through
    pub fn open_gate(&self, count: usize) {
        self.gate.add_permits(count);
    }

    pub fn last_viewport(&self) -> Option<Viewport> {
        self.viewports.lock().unwrap().last().copied()
    }

    pub fn last_headers(&self) -> Option<HashMap<String, String>> {
        self.headers.lock().unwrap().last().cloned()
    }
}

pub struct FakeEngine {
    stats: Arc<FakeStats>,
}

#[async_trait]
impl Engine for FakeEngine {
    type Page = FakePage;

    async fn new_page(&self) -> Result<FakePage> {
        let open = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(open, Ordering::SeqCst);
        Ok(FakePage {
            stats: self.stats.clone(),
            path: String::new(),
            closed: false,
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct FakePage {
    stats: Arc<FakeStats>,
    path: String,
    closed: bool,
}

#[async_trait]
impl Page for FakePage {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        self.stats.viewports.lock().unwrap().push(viewport);
        Ok(())
    }

    async fn set_extra_headers(&mut self, headers: HashMap<String, String>) -> Result<()> {
        self.stats.headers.lock().unwrap().push(headers);
        Ok(())
    }

    async fn open(&mut self, url: &str) -> Result<()> {
        let parsed = url::Url::parse(url).map_err(|e| Error::LoadError(e.to_string()))?;
        self.path = parsed.path().to_string();
        match self.path.as_str() {
            "/hang" => std::future::pending::<()>().await,
            "/broken" => return Err(Error::LoadError("connection refused".into())),
            "/slow" => tokio::time::sleep(SLOW_LOAD).await,
            "/gated" => {
                let permit = self
                    .stats
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| Error::LoadError(e.to_string()))?;
                permit.forget();
            }
            _ => {}
        }
        Ok(())
    }

    async fn bounding_rect(&mut self, element_id: &str) -> Result<Option<ClipRect>> {
        Ok((element_id == "chart").then(|| ClipRect {
            x: 10.0,
            y: 20.0,
            width: 320.0,
            height: 240.0,
        }))
    }

    async fn render(
        &mut self,
        format: OutputFormat,
        _target: &RenderTargetSpec,
        _clip: Option<ClipRect>,
    ) -> Result<Vec<u8>> {
        self.stats.rendered.fetch_add(1, Ordering::SeqCst);
        let mut bytes = match format.kind() {
            OutputKind::Pdf => PDF_MAGIC.to_vec(),
            OutputKind::Image => PNG_MAGIC.to_vec(),
        };
        bytes.extend_from_slice(self.path.as_bytes());
        Ok(bytes)
    }

    async fn drain_console(&mut self) -> Vec<ConsoleMessage> {
        Vec::new()
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.stats.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// A cluster whose workers run the fake engine in-process
pub fn fake_cluster(options: ClusterOptions, stats: Arc<FakeStats>) -> (Cluster, Arc<MemoryStore>) {
    let worker_options = WorkerOptions {
        slots: options.worker_slots,
        executor: Executor::new(Duration::ZERO),
    };
    let launcher = LocalLauncher::new(worker_options, move || {
        let stats = stats.clone();
        async move { Ok(FakeEngine { stats }) }
    });
    let store = Arc::new(MemoryStore::new());
    let cluster = Cluster::start(options, Arc::new(launcher), store.clone());
    (cluster, store)
}

pub fn options(workers: usize, worker_slots: usize) -> ClusterOptions {
    ClusterOptions {
        workers,
        worker_slots,
        restart_delay: Duration::from_millis(50),
        ..ClusterOptions::default()
    }
}

/// Poll until `count` workers report ready
pub async fn wait_ready(cluster: &Cluster, count: usize) {
    for _ in 0..500 {
        let stats = cluster.stats().await.expect("cluster stats");
        if stats.ready_workers() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workers did not become ready");
}
