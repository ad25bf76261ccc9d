//! Chrome DevTools Protocol engine (uses the `headless_chrome` crate)
//!
//! One [`CdpEngine`] owns a headless Chrome process; every job gets its own
//! tab. `headless_chrome` is blocking, so each protocol call runs on tokio's
//! blocking pool.

use async_trait::async_trait;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::types::{Bounds, PrintToPdfOptions};
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use crate::target::{OutputFormat, Paper, RenderTargetSpec};
use crate::{ClipRect, ConsoleMessage, Engine, EngineConfig, Error, Result, Viewport};

/// How long the browser connection may stay silent before it is considered dead
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

const JPEG_QUALITY: u32 = 90;

/// Records page errors and failed resource loads so they can be drained after
/// rendering.
const DIAGNOSTICS_SHIM: &str = r#"(function(){
    if (window.__snapclusterDiag) return;
    var diag = window.__snapclusterDiag = [];
    function push(level, text, source) {
        try { diag.push({ level: level, text: String(text), source: source || null }); } catch (e) {}
    }
    window.addEventListener('error', function(ev) {
        var t = ev.target;
        if (t && t !== window && (t.src || t.href)) {
            push('resource', 'failed to load', t.src || t.href);
        } else {
            push('error', ev.message, ev.filename);
        }
    }, true);
    window.addEventListener('unhandledrejection', function(ev) {
        push('error', 'unhandled rejection: ' + ev.reason, null);
    });
    var orig = console.error;
    console.error = function() {
        push('console', Array.prototype.map.call(arguments, String).join(' '), null);
        return orig.apply(console, arguments);
    };
})();"#;

const DRAIN_DIAGNOSTICS: &str = "JSON.stringify((window.__snapclusterDiag || []).splice(0))";

/// HTTP status of the main document; 0 when the browser does not report it
const NAVIGATION_STATUS: &str =
    "String((performance.getEntriesByType('navigation')[0] || {}).responseStatus || 0)";

const DOCUMENT_HEIGHT: &str =
    "Math.max(document.documentElement.scrollHeight, document.body ? document.body.scrollHeight : 0)";

pub struct CdpEngine {
    browser: Arc<Browser>,
    config: EngineConfig,
}

impl CdpEngine {
    /// Launch headless Chrome with the given configuration
    pub async fn launch(config: EngineConfig) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::launch_blocking(config))
            .await
            .map_err(|e| Error::InitializationError(format!("Launch task failed: {}", e)))?
    }

    fn launch_blocking(config: EngineConfig) -> Result<Self> {
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(config.sandbox)
            .path(config.chrome_path.clone())
            .window_size(Some((config.viewport.width, config.viewport.height)))
            .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
            .build()
            .map_err(|e| Error::InitializationError(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::InitializationError(format!("Failed to launch browser: {}", e)))?;
        debug!("Launched headless Chrome");

        Ok(Self {
            browser: Arc::new(browser),
            config,
        })
    }
}

#[async_trait]
impl Engine for CdpEngine {
    type Page = CdpPage;

    async fn new_page(&self) -> Result<CdpPage> {
        let browser = self.browser.clone();
        let config = self.config.clone();
        let tab = tokio::task::spawn_blocking(move || -> Result<Arc<Tab>> {
            let tab = browser
                .new_tab()
                .map_err(|e| Error::InitializationError(format!("Failed to create tab: {}", e)))?;
            tab.set_default_timeout(Duration::from_millis(config.timeout_ms));

            if let Some(user_agent) = config.user_agent.as_deref() {
                tab.set_user_agent(user_agent, None, None)
                    .map_err(|e| Error::InitializationError(format!("Failed to set user agent: {}", e)))?;
            }

            if let Err(e) = tab.call_method(Page::AddScriptToEvaluateOnNewDocument {
                source: DIAGNOSTICS_SHIM.to_string(),
                world_name: None,
                include_command_line_api: None,
                run_immediately: None,
            }) {
                warn!("Failed to inject diagnostics shim: {}", e);
            }
            Ok(tab)
        })
        .await
        .map_err(|e| Error::CdpError(format!("Tab task failed: {}", e)))??;

        Ok(CdpPage {
            tab,
            viewport: self.config.viewport,
            closed: false,
        })
    }

    async fn close(&self) -> Result<()> {
        // the Chrome process is killed when the last browser handle drops
        debug!("Closing headless Chrome");
        Ok(())
    }
}

/// One Chrome tab
pub struct CdpPage {
    tab: Arc<Tab>,
    viewport: Viewport,
    closed: bool,
}

impl CdpPage {
    async fn with_tab<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| Error::CdpError(format!("Blocking task failed: {}", e)))?
    }
}

#[derive(Deserialize)]
struct DiagEntry {
    level: String,
    text: String,
    source: Option<String>,
}

fn resize(tab: &Tab, width: u32, height: u32) -> Result<()> {
    tab.set_bounds(Bounds::Normal {
        left: Some(0),
        top: Some(0),
        width: Some(f64::from(width)),
        height: Some(f64::from(height)),
    })
    .map_err(|e| Error::CdpError(format!("Failed to resize window: {}", e)))?;
    Ok(())
}

fn evaluate_string(tab: &Tab, script: &str) -> Result<Option<String>> {
    let object = tab
        .evaluate(script, false)
        .map_err(|e| Error::ScriptError(format!("Evaluation failed: {}", e)))?;
    Ok(object
        .value
        .and_then(|v| v.as_str().map(str::to_string)))
}

fn print_options(paper: Option<&Paper>) -> PrintToPdfOptions {
    let paper = paper.cloned().unwrap_or_default();
    let (paper_width, paper_height) = paper.size_inches();
    let margin = paper.margin.inches();
    PrintToPdfOptions {
        landscape: Some(false),
        print_background: Some(true),
        paper_width: Some(paper_width),
        paper_height: Some(paper_height),
        margin_top: Some(margin),
        margin_bottom: Some(margin),
        margin_left: Some(margin),
        margin_right: Some(margin),
        ..Default::default()
    }
}

fn to_gif(png: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory_with_format(png, image::ImageFormat::Png)
        .map_err(|e| Error::RenderError(format!("Failed to decode screenshot: {}", e)))?;
    let rgba = image::DynamicImage::ImageRgba8(decoded.to_rgba8());
    let mut out = Vec::new();
    rgba.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Gif)
        .map_err(|e| Error::RenderError(format!("Failed to encode GIF: {}", e)))?;
    Ok(out)
}

#[async_trait]
impl crate::Page for CdpPage {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        self.viewport = viewport;
        self.with_tab(move |tab| resize(tab, viewport.width, viewport.height))
            .await
    }

    async fn set_extra_headers(&mut self, headers: HashMap<String, String>) -> Result<()> {
        self.with_tab(move |tab| {
            let headers: HashMap<&str, &str> = headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            tab.set_extra_http_headers(headers)
                .map_err(|e| Error::CdpError(format!("Failed to set headers: {}", e)))?;
            Ok(())
        })
        .await
    }

    async fn open(&mut self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.with_tab(move |tab| {
            tab.navigate_to(&url)
                .map_err(|e| Error::LoadError(format!("Navigation to {} failed: {}", url, e)))?;
            tab.wait_until_navigated()
                .map_err(|e| Error::LoadError(format!("Waiting for {} failed: {}", url, e)))?;
            let status = evaluate_string(tab, NAVIGATION_STATUS)?
                .and_then(|s| s.parse::<u16>().ok())
                .unwrap_or(0);
            if status >= 400 {
                return Err(Error::LoadError(format!("{} answered with status {}", url, status)));
            }
            Ok(())
        })
        .await
    }

    async fn bounding_rect(&mut self, element_id: &str) -> Result<Option<ClipRect>> {
        let id = serde_json::to_string(element_id)?;
        let script = format!(
            r#"(function(id) {{
                var el = document.getElementById(id);
                if (!el) return null;
                var r = el.getBoundingClientRect();
                return JSON.stringify({{ x: r.left + window.scrollX, y: r.top + window.scrollY, width: r.width, height: r.height }});
            }})({})"#,
            id
        );
        let raw = self.with_tab(move |tab| evaluate_string(tab, &script)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str::<ClipRect>(&json).map_err(|e| {
                Error::ScriptError(format!("Unexpected bounding rect {}: {}", json, e))
            })?)),
            None => Ok(None),
        }
    }

    async fn render(
        &mut self,
        format: OutputFormat,
        target: &RenderTargetSpec,
        clip: Option<ClipRect>,
    ) -> Result<Vec<u8>> {
        if format == OutputFormat::Pdf {
            let options = print_options(target.paper.as_ref());
            return self
                .with_tab(move |tab| {
                    tab.print_to_pdf(Some(options))
                        .map_err(|e| Error::RenderError(format!("PDF export failed: {}", e)))
                })
                .await;
        }

        let viewport = self.viewport;
        let bytes = self
            .with_tab(move |tab| {
                let (capture_format, quality) = match format {
                    OutputFormat::Jpeg => (Page::CaptureScreenshotFormatOption::Jpeg, Some(JPEG_QUALITY)),
                    _ => (Page::CaptureScreenshotFormatOption::Png, None),
                };
                let region = match clip {
                    Some(clip) => Some(Page::Viewport {
                        x: clip.x,
                        y: clip.y,
                        width: clip.width,
                        height: clip.height,
                        scale: 1.0,
                    }),
                    None => {
                        // no clip: grow the window to the whole document
                        let height = tab
                            .evaluate(DOCUMENT_HEIGHT, false)
                            .ok()
                            .and_then(|o| o.value)
                            .and_then(|v| v.as_f64())
                            .map(|h| h.ceil() as u32)
                            .unwrap_or(viewport.height)
                            .max(viewport.height);
                        resize(tab, viewport.width, height)?;
                        None
                    }
                };
                tab.capture_screenshot(capture_format, quality, region, true)
                    .map_err(|e| Error::RenderError(format!("Screenshot failed: {}", e)))
            })
            .await?;

        match format {
            OutputFormat::Gif => to_gif(&bytes),
            _ => Ok(bytes),
        }
    }

    async fn drain_console(&mut self) -> Vec<ConsoleMessage> {
        let raw = match self.with_tab(|tab| evaluate_string(tab, DRAIN_DIAGNOSTICS)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                debug!("Could not read page diagnostics: {}", e);
                return Vec::new();
            }
        };
        serde_json::from_str::<Vec<DiagEntry>>(&raw)
            .unwrap_or_default()
            .into_iter()
            .map(|d| ConsoleMessage {
                level: d.level,
                text: d.text,
                source: d.source,
            })
            .collect()
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.with_tab(|tab| {
            tab.close(true)
                .map_err(|e| Error::CdpError(format!("Failed to close tab: {}", e)))?;
            Ok(())
        })
        .await
    }
}
