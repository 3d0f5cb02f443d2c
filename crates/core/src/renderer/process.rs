//! Renderer backed by an external program.
//!
//! The request is written to the program's stdin as JSON. The program reports
//! on stdout, one directive per line:
//!
//! ```text
//! progress=42.5
//! result=/var/renders/3f2a.mp4
//! error=font not found
//! ```
//!
//! Anything else is ignored. A non-zero exit is a failure; stderr is kept for
//! classification.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::error::RenderError;
use super::traits::Renderer;
use super::types::{RenderOutput, RenderRequest};
use crate::config::RendererConfig;
use crate::job::CancelFlag;

/// Stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 40;

/// Value of a `progress=` directive: a number with an optional trailing `%`.
static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)?)%?$").unwrap());

/// One recognised stdout directive.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    Progress(f32),
    Result(String),
    Error(String),
}

/// Parse a stdout line from the render program.
pub fn parse_output_line(line: &str) -> Option<OutputLine> {
    let line = line.trim();
    if let Some(value) = line.strip_prefix("progress=") {
        let caps = PROGRESS_RE.captures(value.trim())?;
        let percent = caps.get(1)?.as_str().parse::<f32>().ok()?;
        return Some(OutputLine::Progress(percent.min(100.0)));
    }
    if let Some(value) = line.strip_prefix("result=") {
        let value = value.trim();
        return (!value.is_empty()).then(|| OutputLine::Result(value.to_string()));
    }
    line.strip_prefix("error=")
        .map(|value| OutputLine::Error(value.trim().to_string()))
}

pub struct ProcessRenderer {
    config: RendererConfig,
}

impl ProcessRenderer {
    pub fn new(config: RendererConfig) -> Self {
        Self { config }
    }

    fn default_result_ref(&self, request: &RenderRequest) -> PathBuf {
        self.config.output_dir.join(format!(
            "{}.{}",
            request.job_id,
            request.parameters.output_format.as_str()
        ))
    }

    fn spawn_error(&self, e: std::io::Error) -> RenderError {
        RenderError::SpawnFailed {
            program: self.config.program.clone(),
            reason: e.to_string(),
        }
    }

    async fn run(
        &self,
        request: &RenderRequest,
        progress_tx: &mpsc::Sender<f32>,
        cancel: &CancelFlag,
    ) -> Result<RenderOutput, RenderError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| RenderError::invalid_parameters(e.to_string()))?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .env("FRAMEQUEUE_JOB_ID", &request.job_id)
            .env("FRAMEQUEUE_OUTPUT_DIR", &self.config.output_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| self.spawn_error(e))?;
        debug!(job_id = %request.job_id, program = %self.config.program, "Render process started");

        if let Some(mut stdin) = child.stdin.take() {
            // The program may exit without reading its input.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(job_id = %request.job_id, "Renderer did not read stdin: {}", e);
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RenderError::failed("stdout not captured"))?;
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail).join("\n")
            })
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut last_progress = 0.0_f32;
        let mut result_ref = None;
        let mut reported_error = None;

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => match parse_output_line(&line) {
                        Some(OutputLine::Progress(p)) if p > last_progress => {
                            last_progress = p;
                            // Non-blocking; a slow consumer only misses intermediate values.
                            let _ = progress_tx.try_send(p);
                        }
                        Some(OutputLine::Result(r)) => result_ref = Some(r),
                        Some(OutputLine::Error(e)) => reported_error = Some(e),
                        _ => {}
                    },
                    None => break,
                },
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(RenderError::Cancelled);
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(RenderError::Cancelled);
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let detail = match reported_error {
                Some(e) if stderr.is_empty() => e,
                Some(e) => format!("{}\n{}", e, stderr),
                None => stderr,
            };
            return Err(RenderError::ProcessFailed {
                code: status.code(),
                stderr: detail,
            });
        }
        if let Some(e) = reported_error {
            warn!(job_id = %request.job_id, "Renderer exited cleanly but reported: {}", e);
        }

        let result_ref = result_ref
            .unwrap_or_else(|| self.default_result_ref(request).display().to_string());
        let size_bytes = tokio::fs::metadata(&result_ref).await.ok().map(|m| m.len());

        Ok(RenderOutput {
            result_ref,
            size_bytes,
        })
    }
}

/// Find `program` the way the OS would when spawning it.
fn resolve_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    })
}

#[async_trait]
impl Renderer for ProcessRenderer {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(
        &self,
        request: RenderRequest,
        progress_tx: mpsc::Sender<f32>,
        cancel: CancelFlag,
    ) -> Result<RenderOutput, RenderError> {
        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        self.run(&request, &progress_tx, &cancel).await
    }

    async fn validate(&self) -> Result<(), RenderError> {
        if resolve_program(&self.config.program).is_none() {
            return Err(RenderError::SpawnFailed {
                program: self.config.program.clone(),
                reason: "program not found".to_string(),
            });
        }
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        Ok(())
    }
}
