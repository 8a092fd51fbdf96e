//! Local synthesis process supervision.
//!
//! A [`SynthesisSupervisor`] launches one engine process per request, feeds
//! it the text on stdin, reads raw PCM from stdout in fixed windows, paces
//! the windows to playback rate, and tears the process down on every exit.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use voxrelay_core::config::TtsConfig;
use voxrelay_core::error::{RelayError, Result};

use crate::chunk::window_bytes;
use crate::{PcmStream, Synthesizer};

/// Bytes of each window inspected by [`looks_like_text`].
const TEXT_SAMPLE_BYTES: usize = 200;

/// Printable share at or above which a window is treated as text.
const TEXT_RATIO: f64 = 0.6;

const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Heuristic check for diagnostics written to the audio channel.
///
/// True when at least 60% of the first 200 bytes are printable ASCII. Real
/// PCM can score high by coincidence, so this is a safety net, not a
/// guarantee.
pub fn looks_like_text(window: &[u8]) -> bool {
    if window.is_empty() {
        return false;
    }
    let sample = &window[..window.len().min(TEXT_SAMPLE_BYTES)];
    let printable = sample.iter().filter(|b| (32..=126).contains(*b)).count();
    printable as f64 / sample.len() as f64 >= TEXT_RATIO
}

/// One synthesis call: trimmed non-empty text plus output framing.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    text: String,
    sample_rate: u32,
    chunk_ms: u32,
}

impl SynthesisRequest {
    /// Returns `None` when `text` is empty after trimming.
    pub fn new(text: &str, sample_rate: u32, chunk_ms: u32) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            text: text.to_string(),
            sample_rate,
            chunk_ms,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn window_bytes(&self) -> usize {
        window_bytes(self.sample_rate, self.chunk_ms)
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.chunk_ms))
    }
}

/// Drives a piper-compatible engine: text on stdin, raw 16-bit mono PCM on stdout.
#[derive(Debug, Clone)]
pub struct SynthesisSupervisor {
    program: PathBuf,
    args: Vec<OsString>,
    sample_rate: u32,
    chunk_ms: u32,
    exit_timeout: Duration,
}

impl SynthesisSupervisor {
    /// Resolve the engine binary on `PATH` and check the voice model exists.
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        let program = which::which(config.binary()).map_err(|_| {
            RelayError::MissingDependency(format!(
                "Synthesis binary `{}` not found in PATH",
                config.binary()
            ))
        })?;

        let model = config.model_path();
        if !model.is_file() {
            return Err(RelayError::MissingDependency(format!(
                "Voice model not found at {}",
                model.display()
            )));
        }

        info!(
            program = %program.display(),
            model = %model.display(),
            sample_rate = config.sample_rate,
            chunk_ms = config.chunk_ms,
            "Synthesis supervisor ready"
        );

        Ok(Self {
            program,
            args: vec![
                "--model".into(),
                model.into_os_string(),
                "--output_raw".into(),
            ],
            sample_rate: config.sample_rate,
            chunk_ms: config.chunk_ms,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        })
    }

    /// Supervise an arbitrary program that follows the same stdin/stdout contract.
    pub fn with_program(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
        sample_rate: u32,
        chunk_ms: u32,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            sample_rate,
            chunk_ms,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }

    /// Bound on the graceful wait before the process is killed.
    pub fn with_exit_timeout(mut self, exit_timeout: Duration) -> Self {
        self.exit_timeout = exit_timeout;
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn window_bytes(&self) -> usize {
        window_bytes(self.sample_rate, self.chunk_ms)
    }

    /// Launch a fresh process for `text` and stream its paced PCM windows.
    ///
    /// Empty text yields an empty stream without launching anything. Dropping
    /// the returned stream kills the process.
    pub fn stream_speech(&self, text: &str) -> Result<PcmStream> {
        let Some(request) = SynthesisRequest::new(text, self.sample_rate, self.chunk_ms) else {
            debug!("Empty synthesis text, not launching process");
            return Ok(Box::pin(futures::stream::empty()));
        };

        let process = SynthesisProcess::launch(&self.program, &self.args, request.text())?;
        debug!(
            pid = ?process.pid,
            text_len = request.text().len(),
            window = request.window_bytes(),
            "Synthesis process started"
        );

        let (chunk_tx, chunk_rx) = mpsc::channel(1);
        tokio::spawn(drive(process, request, chunk_tx, self.exit_timeout));
        Ok(Box::pin(ReceiverStream::new(chunk_rx)))
    }
}

#[async_trait]
impl Synthesizer for SynthesisSupervisor {
    async fn synthesize(&self, text: &str) -> Result<PcmStream> {
        self.stream_speech(text)
    }
}

/// A running engine process and the tasks attached to its pipes.
struct SynthesisProcess {
    child: Child,
    pid: Option<u32>,
    stdout: ChildStdout,
    writer: JoinHandle<()>,
    stderr: JoinHandle<Vec<u8>>,
}

struct ExitReport {
    status: Option<ExitStatus>,
    forced: bool,
    stderr: String,
}

impl SynthesisProcess {
    fn launch(program: &Path, args: &[OsString], text: &str) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => RelayError::MissingDependency(format!(
                    "Synthesis binary {} not found",
                    program.display()
                )),
                _ => RelayError::Io(e),
            })?;

        let pid = child.id();
        let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(RelayError::Other(anyhow!("synthesis process pipes not captured")));
        };

        // stdin is closed when the writer task ends.
        let input = format!("{text}\n");
        let writer = tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                warn!(%e, "Failed to write text to synthesis process");
                return;
            }
            if let Err(e) = stdin.flush().await {
                warn!(%e, "Failed to flush synthesis process stdin");
            }
        });

        let stderr = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        Ok(Self {
            child,
            pid,
            stdout,
            writer,
            stderr,
        })
    }

    /// Fill `buf` from stdout. Returns fewer bytes only at end of stream.
    ///
    /// The sampled prefix is checked after every read that lands in it, so text
    /// followed by a stall is caught without waiting for the window to fill.
    async fn read_window(&mut self, buf: &mut [u8]) -> io::Result<Window> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.stdout.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            let sampling = filled < TEXT_SAMPLE_BYTES;
            filled += n;
            if sampling && looks_like_text(&buf[..filled]) {
                return Ok(Window::Text);
            }
        }
        Ok(Window::Audio(filled))
    }

    /// Close stdin, release stdout, then wait for exit (bounded) or kill.
    ///
    /// With `force` the graceful wait is skipped.
    async fn teardown(self, force: bool, exit_timeout: Duration) -> ExitReport {
        let Self {
            mut child,
            pid,
            stdout,
            writer,
            mut stderr,
        } = self;

        writer.abort();
        let _ = writer.await;
        drop(stdout);

        let exited = if force {
            None
        } else {
            match tokio::time::timeout(exit_timeout, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    warn!(?pid, %e, "Failed to wait for synthesis process");
                    None
                }
                Err(_) => {
                    warn!(?pid, "Synthesis process did not exit in time, killing");
                    None
                }
            }
        };

        let forced = exited.is_none();
        let status = match exited {
            Some(status) => Some(status),
            None => {
                if let Err(e) = child.kill().await {
                    warn!(?pid, %e, "Failed to kill synthesis process");
                }
                child.wait().await.ok()
            }
        };

        let stderr = match tokio::time::timeout(exit_timeout, &mut stderr).await {
            Ok(Ok(buf)) => buf,
            _ => {
                stderr.abort();
                Vec::new()
            }
        };

        debug!(?pid, ?status, forced, "Synthesis process reaped");
        ExitReport {
            status,
            forced,
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        }
    }
}

enum Window {
    Audio(usize),
    Text,
}

enum Outcome {
    Finished,
    Cancelled,
    Corrupted,
    Failed(io::Error),
}

/// Pump windows from the process into `chunk_tx` until the stream ends, the
/// consumer goes away, or a window looks like text. The process is reaped
/// before the terminal item is sent.
async fn drive(
    mut process: SynthesisProcess,
    request: SynthesisRequest,
    chunk_tx: mpsc::Sender<Result<Bytes>>,
    exit_timeout: Duration,
) {
    let window = request.window_bytes();
    let pace = request.chunk_duration();
    let started = Instant::now();
    let mut chunks = 0usize;

    let outcome = loop {
        let mut buf = vec![0u8; window];
        let read = tokio::select! {
            _ = chunk_tx.closed() => break Outcome::Cancelled,
            read = process.read_window(&mut buf) => read,
        };

        let n = match read {
            Ok(Window::Audio(0)) => break Outcome::Finished,
            Ok(Window::Audio(n)) => n,
            Ok(Window::Text) => break Outcome::Corrupted,
            Err(e) => break Outcome::Failed(e),
        };
        buf.truncate(n);

        if chunks == 0 {
            debug!(
                latency_ms = started.elapsed().as_millis() as u64,
                "First synthesis window ready"
            );
        }
        chunks += 1;

        if chunk_tx.send(Ok(Bytes::from(buf))).await.is_err() {
            break Outcome::Cancelled;
        }

        tokio::select! {
            _ = chunk_tx.closed() => break Outcome::Cancelled,
            _ = tokio::time::sleep(pace) => {}
        }
    };

    let force = !matches!(outcome, Outcome::Finished);
    let pid = process.pid;
    let report = process.teardown(force, exit_timeout).await;

    let failure = match outcome {
        Outcome::Finished => match report.status {
            Some(status) if !status.success() && !report.forced => {
                warn!(?pid, %status, stderr = %report.stderr, "Synthesis process failed");
                Some(RelayError::upstream(
                    None,
                    format!("Synthesis process exited with {status}: {}", report.stderr),
                ))
            }
            _ => {
                debug!(
                    ?pid,
                    chunks,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Synthesis complete"
                );
                None
            }
        },
        Outcome::Cancelled => {
            debug!(?pid, chunks, "Synthesis consumer dropped, process torn down");
            None
        }
        Outcome::Corrupted => {
            error!(
                ?pid,
                stderr = %report.stderr,
                "Detected non-audio data on synthesis stdout"
            );
            Some(RelayError::CorruptedStream(
                "Synthesis stdout contained text instead of PCM".into(),
            ))
        }
        Outcome::Failed(e) => {
            warn!(?pid, %e, "Reading synthesis output failed");
            Some(RelayError::Io(e))
        }
    };

    if let Some(err) = failure {
        let _ = chunk_tx.send(Err(err)).await;
    }
}
