use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use smartap_config::Config;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::Command,
    task::JoinHandle,
    time::Instant,
};
use uuid::Uuid;

use crate::{
    context::Context,
    error::GdbError,
    parser,
    prerequisites,
    result::ScriptResult,
    script::{check_host_path, Script, PAYLOAD_PARAM},
    template::{self, Params},
};

/// How long output readers may keep draining after the process is killed.
/// A grandchild that inherited the pipes can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Where captured output is mirrored while a script runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputSink {
    /// Capture only.
    Buffer,
    /// Capture and copy to this process's stdout/stderr as it arrives.
    Tee,
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl OutputSink {
    fn mirror(self, stream: Stream) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        match (self, stream) {
            (OutputSink::Buffer, _) => None,
            (OutputSink::Tee, Stream::Stdout) => Some(Box::new(tokio::io::stdout())),
            (OutputSink::Tee, Stream::Stderr) => Some(Box::new(tokio::io::stderr())),
        }
    }
}

/// Runs scripts through one debugger binary against one bridge.
pub struct Executor {
    config: Config,
}

impl Executor {
    pub fn new(config: Config) -> Self {
        Executor { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Checks the debugger and scratch directory; an unreachable bridge only warns.
    pub async fn validate_config(&self) -> Result<(), GdbError> {
        prerequisites::validate_debugger_path(&self.config.gdb_path).await?;
        prerequisites::validate_scratch_dir(&self.config.work_dir)?;
        if let Err(e) = prerequisites::validate_bridge_connection(&self.config.host, self.config.port).await {
            warn!("{e}");
        }
        Ok(())
    }

    /// Renders, runs and parses `script`.
    ///
    /// Transport and process failures are errors. A device that refused the
    /// operation inside a clean session is a non-success [`ScriptResult`].
    pub async fn execute(&self, ctx: &Context, script: &dyn Script) -> Result<ScriptResult, GdbError> {
        let started = Instant::now();
        let name = script.name();
        info!(
            "Running gdb script {name} with {} against {} (timeout {:?})",
            self.config.gdb_path.display(),
            self.config.bridge_address(),
            self.config.timeout()
        );

        if ctx.is_cancelled() {
            return Err(GdbError::Cancelled {
                script: name.to_string(),
                stdout: String::new(),
                stderr: String::new(),
                steps: Vec::new(),
            });
        }

        let scratch = ScratchFiles::reserve(&self.config.work_dir, name, script.payload().is_some());
        let rendered = self.render(script, scratch.payload.as_deref())?;
        debug!("Rendered {name} ({} bytes):\n{rendered}", rendered.len());
        scratch.materialize(&rendered, script.payload())?;
        debug!("Wrote script file {}", scratch.script.display());

        let sink = if script.streaming() {
            OutputSink::Tee
        } else {
            OutputSink::Buffer
        };
        let (stdout, stderr) = self.launch(ctx, name, &scratch.script, sink).await?;
        drop(scratch);

        let mut result = script.parse(&stdout)?;
        result.duration = started.elapsed();
        result.raw_stdout = stdout;
        result.raw_stderr = stderr;

        info!(
            "Script {name} finished in {:?}: success={} steps={} written={} read={}",
            result.duration,
            result.is_success(),
            result.total_steps(),
            result.bytes_written,
            result.bytes_read
        );
        Ok(result)
    }

    fn render(&self, script: &dyn Script, payload: Option<&Path>) -> Result<String, GdbError> {
        let mut params = script.params();
        let mut ambient = Params::new()
            .with("Host", self.config.host.as_str())
            .with("Port", u32::from(self.config.port));
        if let Some(path) = payload {
            ambient.insert(PAYLOAD_PARAM, check_host_path(script.name(), "payload file", path)?);
        }
        params.merge_missing(ambient);
        template::render(script.name(), script.template(), &params)
    }

    /// Runs gdb on `script_file`, returning its captured stdout and stderr.
    async fn launch(
        &self,
        ctx: &Context,
        name: &str,
        script_file: &Path,
        sink: OutputSink,
    ) -> Result<(String, String), GdbError> {
        let mut command = Command::new(&self.config.gdb_path);
        if sink == OutputSink::Buffer {
            command.arg("-batch");
        }
        command
            .arg("-nx")
            .arg("-x")
            .arg(script_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| GdbError::Execution {
            script: name.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            reason: Some(format!("failed to start {}: {e}", self.config.gdb_path.display())),
            steps: Vec::new(),
        })?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let mut stdout_task = spawn_drain(child.stdout.take(), stdout_buf.clone(), sink.mirror(Stream::Stdout));
        let mut stderr_task = spawn_drain(child.stderr.take(), stderr_buf.clone(), sink.mirror(Stream::Stderr));

        let timeout = match ctx.deadline() {
            Some(deadline) => self.config.timeout().min(deadline.saturating_duration_since(Instant::now())),
            None => self.config.timeout(),
        };
        let deadline = Instant::now() + timeout;

        enum Ended {
            Exited(io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }

        // Both streams are drained before the exit status is read.
        let finished = async {
            let _ = (&mut stdout_task).await;
            let _ = (&mut stderr_task).await;
            child.wait().await
        };
        let ended = tokio::select! {
            status = finished => Ended::Exited(status),
            _ = tokio::time::sleep_until(deadline) => Ended::TimedOut,
            _ = ctx.cancelled() => Ended::Cancelled,
        };

        if !matches!(ended, Ended::Exited(_)) {
            if let Err(e) = child.start_kill() {
                debug!("Could not signal gdb: {e}");
            }
            let _ = child.wait().await;
            let _ = tokio::time::timeout(DRAIN_GRACE, async {
                let _ = (&mut stdout_task).await;
                let _ = (&mut stderr_task).await;
            })
            .await;
            stdout_task.abort();
            stderr_task.abort();
        }

        let stdout = String::from_utf8_lossy(&stdout_buf.lock()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_buf.lock()).into_owned();
        debug!(
            "gdb output for {name}: {} bytes stdout, {} bytes stderr",
            stdout.len(),
            stderr.len()
        );

        match ended {
            Ended::Exited(Ok(status)) if status.success() => Ok((stdout, stderr)),
            Ended::Exited(Ok(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                debug!("gdb exited with code {exit_code}");
                Err(GdbError::Execution {
                    script: name.to_string(),
                    exit_code,
                    steps: parser::parse_steps(&stdout),
                    stdout,
                    stderr,
                    reason: status.code().is_none().then(|| "terminated by signal".to_string()),
                })
            }
            Ended::Exited(Err(e)) => Err(GdbError::Execution {
                script: name.to_string(),
                exit_code: -1,
                steps: parser::parse_steps(&stdout),
                stdout,
                stderr,
                reason: Some(format!("failed to wait for gdb: {e}")),
            }),
            Ended::TimedOut => {
                warn!("gdb script {name} timed out after {timeout:?}");
                Err(GdbError::Timeout {
                    script: name.to_string(),
                    timeout,
                    steps: parser::parse_steps(&stdout),
                    stdout,
                    stderr,
                })
            }
            Ended::Cancelled => {
                warn!("gdb script {name} was cancelled");
                Err(GdbError::Cancelled {
                    script: name.to_string(),
                    steps: parser::parse_steps(&stdout),
                    stdout,
                    stderr,
                })
            }
        }
    }
}

fn spawn_drain<R>(
    reader: Option<R>,
    capture: Arc<Mutex<Vec<u8>>>,
    mirror: Option<Box<dyn AsyncWrite + Send + Unpin>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        if let Some(reader) = reader {
            drain(reader, capture, mirror).await;
        }
    })
}

/// Copies `reader` into `capture`, and into `mirror` when there is one.
/// A failing mirror is dropped; capture continues.
async fn drain<R>(
    mut reader: R,
    capture: Arc<Mutex<Vec<u8>>>,
    mut mirror: Option<Box<dyn AsyncWrite + Send + Unpin>>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        capture.lock().extend_from_slice(&buf[..n]);

        let mirror_failed = match mirror.as_mut() {
            Some(out) => out.write_all(&buf[..n]).await.is_err() || out.flush().await.is_err(),
            None => false,
        };
        if mirror_failed {
            mirror = None;
        }
    }
}

/// The rendered script and optional payload for one run. Both are removed
/// when this is dropped, whether or not they were written.
struct ScratchFiles {
    script: PathBuf,
    payload: Option<PathBuf>,
}

impl ScratchFiles {
    fn reserve(dir: &Path, name: &str, with_payload: bool) -> Self {
        let stem = format!("smartap-gdb-{name}-{}", Uuid::new_v4().simple());
        ScratchFiles {
            script: dir.join(format!("{stem}.gdb")),
            payload: with_payload.then(|| dir.join(format!("{stem}.bin"))),
        }
    }

    fn materialize(&self, rendered: &str, payload: Option<&[u8]>) -> Result<(), GdbError> {
        if let (Some(path), Some(bytes)) = (&self.payload, payload) {
            write_new(path, bytes)?;
        }
        write_new(&self.script, rendered.as_bytes())
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in std::iter::once(&self.script).chain(self.payload.as_ref()) {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {e}", path.display()),
            }
        }
    }
}

fn write_new(path: &Path, bytes: &[u8]) -> Result<(), GdbError> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .and_then(|mut file| file.write_all(bytes))
        .map_err(|source| GdbError::ScriptFile {
            path: path.to_path_buf(),
            source,
        })
}
