use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::RenderError;
use super::types::{RenderOutput, RenderRequest};
use crate::job::CancelFlag;

/// Produces one artifact per call.
///
/// Implementations send monotonically increasing percentages on
/// `progress_tx` and check `cancel` at bounded intervals, returning
/// [`RenderError::Cancelled`] once they notice it. The caller may also drop
/// the returned future at any time.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Returns the name of this renderer implementation.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        request: RenderRequest,
        progress_tx: mpsc::Sender<f32>,
        cancel: CancelFlag,
    ) -> Result<RenderOutput, RenderError>;

    /// Checks that the renderer is configured and ready.
    async fn validate(&self) -> Result<(), RenderError> {
        Ok(())
    }
}
