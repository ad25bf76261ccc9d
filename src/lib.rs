//! Snapcluster
//!
//! A queued rendering cluster that turns server-authenticated web pages into
//! PNG, JPEG, GIF or PDF snapshots. A small pool of out-of-process headless
//! browser workers is shared by many concurrent HTTP requests; rendered bytes
//! travel back to the HTTP side through a transient result store.
//!
//! # Pieces
//!
//! - [`target`]: size string parsing (`"800px*600px"`, `"Letter"`, ...)
//! - [`store`]: TTL blob store with atomic take
//! - [`executor`]: open → settle → clip → render for one page
//! - [`worker`] / [`protocol`]: the loop inside a worker unit and its wire format
//! - [`supervisor`]: worker handles, launchers and restart links
//! - [`cluster`]: the dispatcher and job handles
//! - [`http`]: the axum facade
//!
//! # Example
//!
//! ```no_run
//! use snapcluster::cluster::{Cluster, ClusterOptions};
//! use snapcluster::job::RenderJob;
//! use snapcluster::store::MemoryStore;
//! use snapcluster::supervisor::ProcessLauncher;
//! use snapcluster::target::{parse_target, OutputFormat};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> snapcluster::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let launcher = ProcessLauncher::current_exe(vec!["worker".into()])?;
//! let cluster = Cluster::start(ClusterOptions::default(), Arc::new(launcher), store);
//!
//! let target = parse_target(Some("800px*600px"), OutputFormat::Png.kind())?;
//! let job = RenderJob::new("https://app.example.com/dashboard", OutputFormat::Png, target, None, "token");
//! let handle = cluster.submit(job).await?;
//! let state = handle.wait(Duration::from_secs(60)).await;
//! println!("finished: {:?}", state);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub mod error;
pub use error::{Error, FailureReason, JobFailure, Result};

pub mod auth;
pub mod cluster;
pub mod config;
pub mod executor;
pub mod http;
pub mod job;
pub mod protocol;
pub mod store;
pub mod supervisor;
pub mod target;
pub mod worker;

#[cfg(feature = "cdp")]
pub mod cdp;

pub use cluster::{Cluster, ClusterEvent, ClusterOptions, ClusterStats, JobHandle};
pub use job::{JobId, JobState, RenderJob};
pub use store::{MemoryStore, ResultStore};
pub use target::{OutputFormat, OutputKind, RenderTargetSpec};

/// Configuration for a browser engine instance
///
/// One engine lives inside each worker unit and serves every page that worker
/// renders. The defaults match what the render pipeline expects from a
/// freshly launched browser.
///
/// # Examples
///
/// ```
/// let cfg = snapcluster::EngineConfig::default();
/// assert_eq!(cfg.viewport.width, 600);
/// assert!(cfg.sandbox);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// User agent override; the browser default is used when `None`
    pub user_agent: Option<String>,
    /// Initial window size before a job sets its own viewport
    pub viewport: Viewport,
    /// Timeout for page loads and single protocol calls in milliseconds
    pub timeout_ms: u64,
    /// Explicit browser binary; auto-detected when `None`
    pub chrome_path: Option<PathBuf>,
    /// Whether to keep the browser's sandbox enabled
    pub sandbox: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            viewport: Viewport::default(),
            timeout_ms: 30000,
            chrome_path: None,
            sandbox: true,
        }
    }
}

/// Viewport dimensions in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 600,
            height: 600,
        }
    }
}

/// The sub-region of the rendered surface captured into an image artifact
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ClipRect {
    /// A rectangle anchored at the page origin
    pub fn at_origin(width: f64, height: f64) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Console or load problem surfaced by a page while it rendered
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleMessage {
    /// Level such as "error" or "resource"
    pub level: String,
    /// Textual content of the message
    pub text: String,
    /// Optional source URL if the engine reported one
    pub source: Option<String>,
}

/// A headless browser that can hand out pages
///
/// Implementations must be cheap to share: a worker keeps one engine behind an
/// `Arc` and opens a page per job.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Page type produced by this engine
    type Page: Page;

    /// Open a fresh page (tab) for one job
    async fn new_page(&self) -> Result<Self::Page>;

    /// Close the engine and clean up resources
    async fn close(&self) -> Result<()>;
}

/// One browser page driven through the render pipeline
#[async_trait]
pub trait Page: Send {
    /// Resize the page's viewport
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<()>;

    /// Headers attached to every request the page makes
    async fn set_extra_headers(&mut self, headers: HashMap<String, String>) -> Result<()>;

    /// Navigate to a URL and wait until the navigation settles
    async fn open(&mut self, url: &str) -> Result<()>;

    /// Bounding rectangle of the element with the given id, in page coordinates
    async fn bounding_rect(&mut self, element_id: &str) -> Result<Option<ClipRect>>;

    /// Render the current page into artifact bytes. `clip` crops image
    /// output; PDF output prints whole pages.
    async fn render(
        &mut self,
        format: OutputFormat,
        target: &RenderTargetSpec,
        clip: Option<ClipRect>,
    ) -> Result<Vec<u8>>;

    /// Runtime and resource errors collected since the last call
    async fn drain_console(&mut self) -> Vec<ConsoleMessage>;

    /// Release the page; later calls are invalid
    async fn close(&mut self) -> Result<()>;
}
