//! Versioned, schema-checked render parameters.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SchedulerError;

/// Current parameter schema version. Payloads declaring another version are rejected.
pub const PARAMETERS_SCHEMA_VERSION: u32 = 1;

const FONT_SIZE_RANGE: RangeInclusive<u32> = 8..=200;
const TYPING_SPEED_RANGE: RangeInclusive<u32> = 1..=1000;
const MAX_CUSTOM_TEXT_CHARS: usize = 50_000;

/// Renderer variant a job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderKind {
    /// Code being typed out character by character.
    Typing,
    /// Falling glyph rain.
    Matrix,
}

impl RenderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderKind::Typing => "typing",
            RenderKind::Matrix => "matrix",
        }
    }

    /// Accepted clip duration in seconds.
    pub fn duration_range(&self) -> RangeInclusive<u32> {
        match self {
            RenderKind::Typing => 10..=600,
            RenderKind::Matrix => 5..=120,
        }
    }

    pub fn default_duration(&self) -> u32 {
        match self {
            RenderKind::Typing => 90,
            RenderKind::Matrix => 15,
        }
    }
}

impl fmt::Display for RenderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "typing" => Ok(RenderKind::Typing),
            "matrix" => Ok(RenderKind::Matrix),
            other => Err(SchedulerError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Png,
    Gif,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Png => "png",
            OutputFormat::Gif => "gif",
        }
    }
}

/// Validated parameters for one render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderParameters {
    pub schema_version: u32,
    pub duration_secs: u32,
    pub output_format: OutputFormat,
    /// Text to render instead of the renderer's built-in source.
    pub custom_text: Option<String>,
    pub font_size: u32,
    /// Characters per second for typing renders.
    pub typing_speed: u32,
    /// Kind-specific settings passed through to the renderer untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Wire shape before defaults are applied.
#[derive(Debug, Deserialize)]
struct RawParameters {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    #[serde(default)]
    duration_secs: Option<u32>,
    #[serde(default)]
    output_format: Option<OutputFormat>,
    #[serde(default)]
    custom_text: Option<String>,
    #[serde(default)]
    font_size: Option<u32>,
    #[serde(default)]
    typing_speed: Option<u32>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn default_schema_version() -> u32 {
    PARAMETERS_SCHEMA_VERSION
}

impl RenderParameters {
    /// Defaults for `kind` with nothing overridden.
    pub fn defaults(kind: RenderKind) -> Self {
        Self {
            schema_version: PARAMETERS_SCHEMA_VERSION,
            duration_secs: kind.default_duration(),
            output_format: OutputFormat::default(),
            custom_text: None,
            font_size: 14,
            typing_speed: 40,
            extra: Map::new(),
        }
    }

    /// Decode and validate a JSON payload for `kind`. `null` means all defaults.
    pub fn parse(kind: RenderKind, payload: Value) -> Result<Self, SchedulerError> {
        let payload = if payload.is_null() {
            Value::Object(Map::new())
        } else {
            payload
        };
        let raw: RawParameters = serde_json::from_value(payload)
            .map_err(|e| SchedulerError::InvalidParameters(e.to_string()))?;

        let defaults = Self::defaults(kind);
        let params = Self {
            schema_version: raw.schema_version,
            duration_secs: raw.duration_secs.unwrap_or(defaults.duration_secs),
            output_format: raw.output_format.unwrap_or(defaults.output_format),
            custom_text: raw.custom_text,
            font_size: raw.font_size.unwrap_or(defaults.font_size),
            typing_speed: raw.typing_speed.unwrap_or(defaults.typing_speed),
            extra: raw.extra,
        };
        params.validate(kind)?;
        Ok(params)
    }

    pub fn validate(&self, kind: RenderKind) -> Result<(), SchedulerError> {
        let invalid = |msg: String| Err(SchedulerError::InvalidParameters(msg));

        if self.schema_version != PARAMETERS_SCHEMA_VERSION {
            return invalid(format!(
                "unsupported schema_version {} (expected {})",
                self.schema_version, PARAMETERS_SCHEMA_VERSION
            ));
        }
        let range = kind.duration_range();
        if !range.contains(&self.duration_secs) {
            return invalid(format!(
                "duration_secs must be between {} and {} for {} renders",
                range.start(),
                range.end(),
                kind
            ));
        }
        if !FONT_SIZE_RANGE.contains(&self.font_size) {
            return invalid(format!(
                "font_size must be between {} and {}",
                FONT_SIZE_RANGE.start(),
                FONT_SIZE_RANGE.end()
            ));
        }
        if !TYPING_SPEED_RANGE.contains(&self.typing_speed) {
            return invalid(format!(
                "typing_speed must be between {} and {}",
                TYPING_SPEED_RANGE.start(),
                TYPING_SPEED_RANGE.end()
            ));
        }
        if self.payload_len() > MAX_CUSTOM_TEXT_CHARS {
            return invalid(format!(
                "custom_text exceeds {} characters",
                MAX_CUSTOM_TEXT_CHARS
            ));
        }
        Ok(())
    }

    /// Size of the user supplied payload in characters.
    pub fn payload_len(&self) -> usize {
        self.custom_text
            .as_deref()
            .map(|t| t.chars().count())
            .unwrap_or(0)
    }
}
