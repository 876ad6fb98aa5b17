use crate::error::{Error, ProcessError, Result};
use crate::frame;
use crate::manifest::{self, ManifestFile};
use crate::progress::ProgressTracker;
use crate::request::{EncodeRequest, EncodeSettings};
use crate::util;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::io::{self, BufRead, BufReader, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub program: OsString,
    pub codec: String,
    pub pixel_format: String,
    pub preset: String,
    /// How often the worker wakes up to check for cancellation.
    pub poll_interval: Duration,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: OsString::from("ffmpeg"),
            codec: "libx264".to_string(),
            pixel_format: "yuv420p".to_string(),
            preset: "fast".to_string(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl EncoderConfig {
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    pub fn args(&self, manifest: &Path, output: &Path, settings: EncodeSettings) -> Vec<OsString> {
        let mut args: Vec<OsString> =
            ["-hide_banner", "-nostdin", "-f", "concat", "-safe", "0", "-i"]
                .into_iter()
                .map(OsString::from)
                .collect();
        args.push(manifest.as_os_str().to_os_string());
        args.extend(
            [
                "-r".to_string(),
                settings.fps.to_string(),
                "-c:v".to_string(),
                self.codec.clone(),
                "-pix_fmt".to_string(),
                self.pixel_format.clone(),
                "-crf".to_string(),
                settings.quality.to_string(),
                "-preset".to_string(),
                self.preset.clone(),
                "-y".to_string(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(output.as_os_str().to_os_string());
        args
    }
}

#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Percentage done, 0..=100, never lower than a previous event.
    Progress(u8),
    /// Sent exactly once, after the manifest is gone and the encoder reaped.
    Finished(JobOutcome),
}

#[derive(Debug, Clone, Serialize)]
pub struct EncodeSummary {
    pub output_path: PathBuf,
    pub file_size_bytes: u64,
    pub frame_count: usize,
    pub fps: u32,
    pub duration_secs: f64,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(EncodeSummary),
    Failed { message: String },
    Cancelled,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }

    /// Failure text cut down for presentation.
    pub fn display_message(&self) -> Option<String> {
        match self {
            JobOutcome::Failed { message } => Some(util::truncate_for_display(
                message,
                util::DISPLAY_MESSAGE_LIMIT,
            )),
            _ => None,
        }
    }
}

/// Runs encode jobs in the background, one at a time.
pub struct Encoder {
    config: Arc<EncoderConfig>,
    busy: Arc<AtomicBool>,
}

impl Encoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config: Arc::new(config),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Starts `request` on a worker thread. Fails with [`Error::Busy`] while a
    /// previous job has not delivered its terminal event.
    pub fn start(&self, request: EncodeRequest) -> Result<EncodeJob> {
        let slot = BusySlot::acquire(&self.busy).ok_or(Error::Busy)?;

        let id = util::random_job_id();
        let (tx, rx) = unbounded();
        let cancel = Arc::new(AtomicBool::new(false));

        let config = Arc::clone(&self.config);
        let worker_cancel = Arc::clone(&cancel);
        let worker_id = id.clone();
        let worker = thread::Builder::new()
            .name(format!("encode-{}", id))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_job(&config, &worker_id, request, &tx, &worker_cancel)
                }))
                .unwrap_or_else(|_| {
                    log::warn!("encode job {} panicked", worker_id);
                    JobOutcome::Failed {
                        message: ProcessError::WorkerPanicked.to_string(),
                    }
                });
                drop(slot);
                let _ = tx.send(JobEvent::Finished(outcome.clone()));
                outcome
            })?;

        Ok(EncodeJob {
            id,
            events: rx,
            cancel: CancelHandle(cancel),
            worker: Some(worker),
        })
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(EncoderConfig::default())
    }
}

struct BusySlot(Arc<AtomicBool>);

impl BusySlot {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for BusySlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A running job. Dropping it without [`EncodeJob::wait`] cancels the job
/// and blocks until the encoder is reaped.
pub struct EncodeJob {
    id: String,
    events: Receiver<JobEvent>,
    cancel: CancelHandle,
    worker: Option<JoinHandle<JobOutcome>>,
}

impl EncodeJob {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn events(&self) -> &Receiver<JobEvent> {
        &self.events
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Blocks until the worker is done and returns the same outcome that was
    /// sent as the terminal event.
    pub fn wait(mut self) -> JobOutcome {
        self.join()
    }

    fn join(&mut self) -> JobOutcome {
        match self.worker.take() {
            Some(worker) => worker.join().unwrap_or_else(|_| JobOutcome::Failed {
                message: ProcessError::WorkerPanicked.to_string(),
            }),
            None => JobOutcome::Cancelled,
        }
    }
}

impl Drop for EncodeJob {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.cancel.cancel();
            let _ = self.join();
        }
    }
}

enum JobStop {
    Cancelled,
    Failed(ProcessError),
}

impl From<ProcessError> for JobStop {
    fn from(e: ProcessError) -> Self {
        JobStop::Failed(e)
    }
}

fn run_job(
    config: &EncoderConfig,
    job_id: &str,
    request: EncodeRequest,
    events: &Sender<JobEvent>,
    cancel: &AtomicBool,
) -> JobOutcome {
    let started = Instant::now();
    match encode(config, job_id, request, events, cancel) {
        Ok(mut summary) => {
            summary.elapsed_secs = started.elapsed().as_secs_f64();
            log::info!(
                "encode job {} finished: {} ({} bytes)",
                job_id,
                summary.output_path.display(),
                summary.file_size_bytes
            );
            JobOutcome::Completed(summary)
        }
        Err(JobStop::Cancelled) => {
            log::info!("encode job {} cancelled", job_id);
            JobOutcome::Cancelled
        }
        Err(JobStop::Failed(e)) => {
            let message = e.to_string();
            log::warn!("encode job {} failed: {}", job_id, message);
            JobOutcome::Failed { message }
        }
    }
}

fn encode(
    config: &EncoderConfig,
    job_id: &str,
    request: EncodeRequest,
    events: &Sender<JobEvent>,
    cancel: &AtomicBool,
) -> std::result::Result<EncodeSummary, JobStop> {
    let EncodeRequest {
        mut frames,
        output,
        settings,
    } = request;
    // Selection order from the caller is not trusted.
    frame::sort_frames(&mut frames);

    let output = std::path::absolute(&output).map_err(|source| ProcessError::Metadata {
        path: output.clone(),
        source,
    })?;
    let output_dir = output.parent().map(Path::to_path_buf).unwrap_or_default();
    let manifest_path = manifest::manifest_path(&output_dir, job_id);

    log::info!(
        "encode job {}: {} frames at {} fps (crf {}) -> {}",
        job_id,
        frames.len(),
        settings.fps,
        settings.quality,
        output.display()
    );

    let manifest = manifest::render(&frames, settings.fps)
        .and_then(|text| ManifestFile::create(manifest_path.clone(), &text))
        .map_err(|source| ProcessError::Manifest {
            path: manifest_path.clone(),
            source,
        })?;

    if cancel.load(Ordering::Relaxed) {
        return Err(JobStop::Cancelled);
    }

    let mut process = EncoderProcess::spawn(config, manifest, &output, settings)?;
    let stderr = process.take_stderr();
    let (line_tx, line_rx) = unbounded::<String>();
    let reader = stderr.map(|s| spawn_stderr_reader(s, line_tx));

    let mut tracker = ProgressTracker::new(frames.len());
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut cancelled = false;
    let mut stderr_closed = reader.is_none();

    while !stderr_closed {
        if cancel.load(Ordering::Relaxed) {
            cancelled = true;
            break;
        }
        match line_rx.recv_timeout(config.poll_interval) {
            Ok(line) => {
                if let Some(pct) = tracker.observe(&line) {
                    let _ = events.send(JobEvent::Progress(pct));
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => stderr_closed = true,
        }
    }

    let status = (if cancelled {
        process.terminate()
    } else {
        process.wait_or_cancel(cancel, config.poll_interval, &mut cancelled)
    })
    .map_err(ProcessError::Wait)?;

    // Only join once the pipe is closed; a grandchild may still hold it
    // after a kill.
    if stderr_closed {
        if let Some(reader) = reader {
            let _ = reader.join();
        }
    }

    let command = process.command_line();
    // Child is already reaped; this removes the manifest.
    drop(process);

    if !status.success() {
        // An encoder that already exited on its own keeps its exit code even
        // when the kill lands afterwards.
        if cancelled && ended_by_kill(&status) {
            return Err(JobStop::Cancelled);
        }
        let stderr_tail = if tail.is_empty() {
            "<no encoder stderr>".to_string()
        } else {
            tail.into_iter().collect::<Vec<_>>().join(" | ")
        };
        return Err(match status.code() {
            Some(code) => ProcessError::Exit {
                code,
                command,
                stderr_tail,
            },
            None => ProcessError::Terminated {
                command,
                stderr_tail,
            },
        }
        .into());
    }

    let meta = match std::fs::metadata(&output) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Err(ProcessError::OutputMissing(output).into()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ProcessError::OutputMissing(output).into())
        }
        Err(source) => return Err(ProcessError::Metadata { path: output, source }.into()),
    };

    let _ = events.send(JobEvent::Progress(tracker.observe_frame(frames.len() as u64)));

    Ok(EncodeSummary {
        file_size_bytes: meta.len(),
        frame_count: frames.len(),
        fps: settings.fps,
        duration_secs: frames.len() as f64 / f64::from(settings.fps),
        elapsed_secs: 0.0,
        output_path: output,
    })
}

/// The encoder child and its manifest. Whatever way this is dropped, the
/// child is killed and reaped first and the manifest removed after.
struct EncoderProcess {
    child: Child,
    reaped: bool,
    program: OsString,
    args: Vec<OsString>,
    _manifest: ManifestFile,
}

impl EncoderProcess {
    fn spawn(
        config: &EncoderConfig,
        manifest: ManifestFile,
        output: &Path,
        settings: EncodeSettings,
    ) -> std::result::Result<Self, ProcessError> {
        let args = config.args(manifest.path(), output, settings);
        log::debug!(
            "spawning encoder: {}",
            format_command(&config.program, &args)
        );

        let child = Command::new(&config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: config.program.to_string_lossy().to_string(),
                source,
            })?;

        Ok(Self {
            child,
            reaped: false,
            program: config.program.clone(),
            args,
            _manifest: manifest,
        })
    }

    fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    fn command_line(&self) -> String {
        format_command(&self.program, &self.args)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(status)
    }

    fn terminate(&mut self) -> io::Result<ExitStatus> {
        if let Err(e) = self.child.kill() {
            // Already exited; wait() still collects the real status.
            log::debug!("kill encoder: {}", e);
        }
        self.wait()
    }

    fn wait_or_cancel(
        &mut self,
        cancel: &AtomicBool,
        poll: Duration,
        cancelled: &mut bool,
    ) -> io::Result<ExitStatus> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.reaped = true;
                return Ok(status);
            }
            if cancel.load(Ordering::Relaxed) {
                *cancelled = true;
                return self.terminate();
            }
            thread::sleep(poll);
        }
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(unix)]
fn ended_by_kill(status: &ExitStatus) -> bool {
    status.code().is_none()
}

// No signal information off unix; a killed child reports an exit code.
#[cfg(not(unix))]
fn ended_by_kill(_status: &ExitStatus) -> bool {
    true
}

fn format_command(program: &OsStr, args: &[OsString]) -> String {
    let mut out = program.to_string_lossy().to_string();
    for a in args {
        out.push(' ');
        out.push_str(&a.to_string_lossy());
    }
    out
}

fn spawn_stderr_reader(stderr: impl Read + Send + 'static, tx: Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = read_status_line(&mut reader, &mut buf).unwrap_or(0);
            if read == 0 {
                break;
            }
            let cleaned = String::from_utf8_lossy(&buf).trim().to_string();
            if cleaned.is_empty() {
                continue;
            }
            if tx.send(cleaned).is_err() {
                break;
            }
        }
    })
}

/// Like `read_until`, but ends a line at either `\n` or `\r`: ffmpeg rewrites
/// its stats line in place with carriage returns.
fn read_status_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<usize> {
    let mut read = 0;
    loop {
        let (done, used) = {
            let available = match reader.fill_buf() {
                Ok(b) => b,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                return Ok(read);
            }
            match available.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(i) => {
                    buf.extend_from_slice(&available[..i]);
                    (true, i + 1)
                }
                None => {
                    buf.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);
        read += used;
        if done {
            return Ok(read);
        }
    }
}
