//! Mock renderer for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

use crate::job::CancelFlag;
use crate::renderer::{RenderError, RenderOutput, RenderRequest, Renderer};

/// A recorded render call for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedRender {
    /// The request the worker sent.
    pub request: RenderRequest,
    /// Whether the call returned a result.
    pub success: bool,
}

/// Mock implementation of the Renderer trait.
///
/// Provides controllable behavior for testing:
/// - Script failures for the next calls
/// - Control render duration and number of progress ticks
/// - Ignore the cancel flag to exercise the grace period
/// - Panic inside `execute` to exercise worker isolation
/// - Track concurrency so tests can assert permit limits
///
/// # Example
///
/// ```rust,ignore
/// use framequeue_core::testing::MockRenderer;
///
/// let renderer = MockRenderer::new();
/// renderer.set_duration(Duration::from_millis(50)).await;
/// renderer.fail_next(RenderError::Network { reason: "reset".into() }).await;
///
/// // First call fails, the retry succeeds.
/// assert_eq!(renderer.render_count().await, 2);
/// ```
#[derive(Debug)]
pub struct MockRenderer {
    renders: Arc<RwLock<Vec<RecordedRender>>>,
    /// Consumed front to back; an empty script means success.
    script: Arc<RwLock<VecDeque<RenderError>>>,
    duration: Arc<RwLock<Duration>>,
    /// Progress updates sent over the course of one render.
    steps: Arc<RwLock<u32>>,
    ignore_cancel: Arc<RwLock<bool>>,
    /// Calls left that panic instead of rendering.
    panics: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl Default for MockRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the active count even when the render future is dropped.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockRenderer {
    /// Create a new mock renderer that succeeds after 20ms.
    pub fn new() -> Self {
        Self {
            renders: Arc::new(RwLock::new(Vec::new())),
            script: Arc::new(RwLock::new(VecDeque::new())),
            duration: Arc::new(RwLock::new(Duration::from_millis(20))),
            steps: Arc::new(RwLock::new(4)),
            ignore_cancel: Arc::new(RwLock::new(false)),
            panics: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get all recorded renders.
    pub async fn recorded_renders(&self) -> Vec<RecordedRender> {
        self.renders.read().await.clone()
    }

    /// Number of times `execute` was called.
    pub async fn render_count(&self) -> usize {
        self.renders.read().await.len()
    }

    /// Make the next call fail with `error`. Calls queue up in order.
    pub async fn fail_next(&self, error: RenderError) {
        self.script.write().await.push_back(error);
    }

    /// Set the simulated render duration.
    pub async fn set_duration(&self, duration: Duration) {
        *self.duration.write().await = duration;
    }

    /// Set how many progress updates a render sends.
    pub async fn set_steps(&self, steps: u32) {
        *self.steps.write().await = steps.max(1);
    }

    /// Keep rendering after the cancel flag is raised.
    pub async fn set_ignore_cancel(&self, ignore: bool) {
        *self.ignore_cancel.write().await = ignore;
    }

    /// Make the next `count` calls panic. Panicking calls are recorded as failures.
    pub fn panic_next(&self, count: usize) {
        self.panics.fetch_add(count, Ordering::SeqCst);
    }

    /// Renders in flight right now.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of renders ever in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn record(&self, request: RenderRequest, success: bool) {
        self.renders
            .write()
            .await
            .push(RecordedRender { request, success });
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(
        &self,
        request: RenderRequest,
        progress_tx: mpsc::Sender<f32>,
        cancel: CancelFlag,
    ) -> Result<RenderOutput, RenderError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(self.active.clone());

        let panicking = self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if panicking {
            self.record(request, false).await;
            panic!("mock renderer panic");
        }

        let duration = *self.duration.read().await;
        let steps = *self.steps.read().await;
        let ignore_cancel = *self.ignore_cancel.read().await;
        let tick = duration / steps;

        for step in 1..=steps {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = cancel.cancelled(), if !ignore_cancel => {
                    self.record(request, false).await;
                    return Err(RenderError::Cancelled);
                }
            }
            let _ = progress_tx.send(step as f32 * 100.0 / steps as f32).await;
        }

        let scripted = self.script.write().await.pop_front();
        match scripted {
            Some(error) => {
                self.record(request, false).await;
                Err(error)
            }
            None => {
                let result_ref = format!("mock://{}", request.job_id);
                self.record(request, true).await;
                Ok(RenderOutput::new(result_ref))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{RenderKind, RenderParameters};

    fn request() -> RenderRequest {
        RenderRequest {
            job_id: "job-1".to_string(),
            kind: RenderKind::Matrix,
            parameters: RenderParameters::defaults(RenderKind::Matrix),
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_scripted_failure_then_success() {
        let renderer = MockRenderer::new();
        renderer.set_duration(Duration::from_millis(4)).await;
        renderer
            .fail_next(RenderError::failed("boom"))
            .await;

        let (tx, _rx) = mpsc::channel(16);
        let first = renderer
            .execute(request(), tx.clone(), CancelFlag::new())
            .await;
        assert!(first.is_err());
        let second = renderer.execute(request(), tx, CancelFlag::new()).await;
        assert_eq!(second.unwrap().result_ref, "mock://job-1");
        assert_eq!(renderer.render_count().await, 2);
        assert_eq!(renderer.active(), 0);
    }

    #[tokio::test]
    async fn test_reports_progress_to_100() {
        let renderer = MockRenderer::new();
        renderer.set_duration(Duration::from_millis(4)).await;
        renderer.set_steps(4).await;

        let (tx, mut rx) = mpsc::channel(16);
        renderer
            .execute(request(), tx, CancelFlag::new())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p);
        }
        assert_eq!(seen, vec![25.0, 50.0, 75.0, 100.0]);
    }

    #[tokio::test]
    async fn test_panic_next_unwinds_once() {
        let renderer = Arc::new(MockRenderer::new());
        renderer.set_duration(Duration::from_millis(4)).await;
        renderer.panic_next(1);

        let first = {
            let renderer = renderer.clone();
            tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(16);
                renderer.execute(request(), tx, CancelFlag::new()).await
            })
        };
        assert!(first.await.unwrap_err().is_panic());
        assert_eq!(renderer.active(), 0);

        let (tx, _rx) = mpsc::channel(16);
        assert!(renderer.execute(request(), tx, CancelFlag::new()).await.is_ok());
        let renders = renderer.recorded_renders().await;
        assert_eq!(renders.len(), 2);
        assert!(!renders[0].success);
    }

    #[tokio::test]
    async fn test_honors_cancel() {
        let renderer = MockRenderer::new();
        renderer.set_duration(Duration::from_secs(10)).await;
        let cancel = CancelFlag::new();
        cancel.cancel();

        let (tx, _rx) = mpsc::channel(16);
        let result = renderer.execute(request(), tx, cancel).await;
        assert!(matches!(result, Err(RenderError::Cancelled)));
    }
}
