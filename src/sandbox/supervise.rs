use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ExecutionOutcome, CANCELLED_EXIT_CODE, TIMEOUT_EXIT_CODE};

/// How long output readers may keep draining after the command is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
/// How long to wait for a killed child to be reaped.
const REAP_GRACE: Duration = Duration::from_secs(5);

const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug, Clone, Copy)]
pub(crate) enum Ending {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

impl Ending {
    /// Whether the command is still running and must be killed.
    pub fn needs_kill(&self) -> bool {
        !matches!(self, Ending::Exited(_))
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

struct Capture {
    buffer: Arc<Mutex<Captured>>,
    reader: JoinHandle<()>,
}

impl Capture {
    fn start<R>(source: Option<R>, max_bytes: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Captured::default()));
        let sink = buffer.clone();
        let reader = tokio::spawn(async move {
            let Some(mut source) = source else { return };
            let mut chunk = [0u8; 8192];
            loop {
                match source.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut out = sink.lock().unwrap_or_else(|e| e.into_inner());
                        let room = max_bytes.saturating_sub(out.bytes.len());
                        let keep = n.min(room);
                        out.bytes.extend_from_slice(&chunk[..keep]);
                        if keep < n {
                            out.truncated = true;
                        }
                    }
                }
            }
        });
        Self { buffer, reader }
    }

    /// Wait briefly for EOF, then take whatever was read.
    async fn finish(mut self) -> (String, bool) {
        if tokio::time::timeout(DRAIN_GRACE, &mut self.reader)
            .await
            .is_err()
        {
            self.reader.abort();
        }
        let captured = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(|e| e.into_inner()));
        let mut text = String::from_utf8_lossy(&captured.bytes).into_owned();
        if captured.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        (text, captured.truncated)
    }
}

/// Watches one spawned command: output capture, timeout and cancellation.
/// Killing is left to the backend, which knows what "everything" means for
/// its isolation mechanism.
pub(crate) struct Supervisor {
    child: Child,
    stdout: Capture,
    stderr: Capture,
    started: Instant,
}

impl Supervisor {
    pub fn start(mut child: Child, max_output_bytes: usize) -> Self {
        let stdout = Capture::start(child.stdout.take(), max_output_bytes);
        let stderr = Capture::start(child.stderr.take(), max_output_bytes);
        Self {
            child,
            stdout,
            stderr,
            started: Instant::now(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn wait(&mut self, timeout: Duration, cancel: &CancellationToken) -> std::io::Result<Ending> {
        tokio::select! {
            status = self.child.wait() => Ok(Ending::Exited(status?)),
            _ = tokio::time::sleep(timeout) => Ok(Ending::TimedOut),
            _ = cancel.cancelled() => Ok(Ending::Cancelled),
        }
    }

    /// Reap the child and collect output. Call after the backend killed
    /// whatever `ending` left running.
    pub async fn finish(mut self, ending: Ending) -> ExecutionOutcome {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        if ending.needs_kill() {
            if tokio::time::timeout(REAP_GRACE, self.child.wait()).await.is_err() {
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }

        let (stdout, out_truncated) = self.stdout.finish().await;
        let (stderr, err_truncated) = self.stderr.finish().await;
        let (exit_code, timed_out, cancelled) = match ending {
            Ending::Exited(status) => (exit_code(status), false, false),
            Ending::TimedOut => (TIMEOUT_EXIT_CODE, true, false),
            Ending::Cancelled => (CANCELLED_EXIT_CODE, false, true),
        };

        ExecutionOutcome {
            exit_code,
            stdout,
            stderr,
            elapsed_ms,
            timed_out,
            cancelled,
            truncated: out_truncated || err_truncated,
        }
    }
}

/// Exit code, or the shell convention `128 + signal` for a signalled child.
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}
