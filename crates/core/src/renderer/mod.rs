//! The renderer collaborator: whatever actually produces a video artifact.

mod error;
mod process;
mod traits;
mod types;

pub use error::{RenderError, RenderErrorKind};
pub use process::{parse_output_line, OutputLine, ProcessRenderer};
pub use traits::Renderer;
pub use types::{RenderOutput, RenderRequest};
