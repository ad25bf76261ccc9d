//! Render job executor
//!
//! Runs one job on one page: open → settle → clip → render. The page is
//! always closed before returning, whatever the outcome.

use log::{debug, warn};
use std::collections::HashMap;
use std::time::Duration;

use crate::protocol::RenderRequest;
use crate::{ClipRect, FailureReason, JobFailure, Page};

/// Fixed delay between navigation and rendering, letting client-side
/// rendering finish
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct Executor {
    settle: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLE)
    }
}

impl Executor {
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    /// Render `request` on `page` and return the artifact bytes
    pub async fn run<P: Page>(
        &self,
        mut page: P,
        request: &RenderRequest,
    ) -> std::result::Result<Vec<u8>, JobFailure> {
        let result = self.drive(&mut page, request).await;

        for message in page.drain_console().await {
            match &message.source {
                Some(source) => warn!(
                    "[{}] page {}: {} ({})",
                    request.job_id, message.level, message.text, source
                ),
                None => warn!("[{}] page {}: {}", request.job_id, message.level, message.text),
            }
        }
        if let Err(e) = page.close().await {
            debug!("[{}] closing page failed: {}", request.job_id, e);
        }

        result
    }

    async fn drive<P: Page>(
        &self,
        page: &mut P,
        request: &RenderRequest,
    ) -> std::result::Result<Vec<u8>, JobFailure> {
        let render_failed = |e: crate::Error| JobFailure::new(FailureReason::RenderFailed, e.to_string());

        page.set_viewport(request.target.viewport)
            .await
            .map_err(render_failed)?;

        let mut headers = HashMap::new();
        headers.insert(
            "Authorization".to_string(),
            format!("Bearer {}", request.credential),
        );
        page.set_extra_headers(headers).await.map_err(render_failed)?;

        page.open(&request.url)
            .await
            .map_err(|e| JobFailure::new(FailureReason::OpenFailed, e.to_string()))?;

        tokio::time::sleep(self.settle).await;

        // PDF output prints whole pages; the clip only has to resolve
        let clip = match &request.selector {
            Some(selector) => Some(self.clip_to(page, selector).await?),
            None => request.target.clip,
        };

        let bytes = page
            .render(request.format, &request.target, clip)
            .await
            .map_err(render_failed)?;
        if bytes.is_empty() {
            return Err(JobFailure::new(
                FailureReason::RenderFailed,
                "engine produced no bytes",
            ));
        }
        Ok(bytes)
    }

    async fn clip_to<P: Page>(
        &self,
        page: &mut P,
        selector: &str,
    ) -> std::result::Result<ClipRect, JobFailure> {
        match page.bounding_rect(selector).await {
            Ok(Some(rect)) if !rect.is_empty() => Ok(rect),
            Ok(_) => Err(JobFailure::new(
                FailureReason::ClipTargetNotFound,
                format!("no visible element with id {:?}", selector),
            )),
            Err(e) => Err(JobFailure::new(FailureReason::RenderFailed, e.to_string())),
        }
    }
}
