use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::{OutputFormat, RenderKind, RenderParameters};

/// Upper bounds (seconds) of the duration buckets.
const DURATION_BUCKETS: [u32; 6] = [15, 30, 60, 120, 300, 600];
/// Upper bounds (characters) of the payload-size buckets.
const PAYLOAD_BUCKETS: [u32; 6] = [0, 1_000, 5_000, 10_000, 25_000, 50_000];

/// Key grouping jobs whose render times are comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeSignature {
    pub kind: RenderKind,
    pub output_format: OutputFormat,
    /// Upper bound of the requested duration's bucket, in seconds.
    pub duration_bucket: u32,
    /// Upper bound of the payload's bucket, in characters.
    pub payload_bucket: u32,
}

fn bucket(value: u32, edges: &[u32]) -> u32 {
    edges
        .iter()
        .copied()
        .find(|&edge| value <= edge)
        .unwrap_or(value)
}

impl ShapeSignature {
    pub fn of(kind: RenderKind, params: &RenderParameters) -> Self {
        let payload = u32::try_from(params.payload_len()).unwrap_or(u32::MAX);
        Self {
            kind,
            output_format: params.output_format,
            duration_bucket: bucket(params.duration_secs, &DURATION_BUCKETS),
            payload_bucket: bucket(payload, &PAYLOAD_BUCKETS),
        }
    }
}

impl fmt::Display for ShapeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/d{}/p{}",
            self.kind,
            self.output_format.as_str(),
            self.duration_bucket,
            self.payload_bucket
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(duration_secs: u32, text: Option<&str>) -> RenderParameters {
        RenderParameters {
            duration_secs,
            custom_text: text.map(String::from),
            ..RenderParameters::defaults(RenderKind::Typing)
        }
    }

    #[test]
    fn test_durations_share_bucket() {
        let a = ShapeSignature::of(RenderKind::Typing, &params(45, None));
        let b = ShapeSignature::of(RenderKind::Typing, &params(60, None));
        let c = ShapeSignature::of(RenderKind::Typing, &params(61, None));
        assert_eq!(a, b);
        assert_ne!(b, c);
        assert_eq!(c.duration_bucket, 120);
    }

    #[test]
    fn test_payload_bucket() {
        let text = "x".repeat(1_500);
        let shape = ShapeSignature::of(RenderKind::Typing, &params(90, Some(&text)));
        assert_eq!(shape.payload_bucket, 5_000);
        assert_eq!(shape.to_string(), "typing/mp4/d120/p5000");
    }

    #[test]
    fn test_kind_separates_shapes() {
        let p = params(30, None);
        assert_ne!(
            ShapeSignature::of(RenderKind::Typing, &p),
            ShapeSignature::of(RenderKind::Matrix, &p)
        );
    }
}
