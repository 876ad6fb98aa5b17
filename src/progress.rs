use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::{Duration, Instant};

const MAX_STORED_WARNINGS: usize = 32;

/// Pulls `N` out of the first `frame=<N>` token of an encoder status line.
/// ffmpeg pads the number (`frame=   12 fps=...`), so leading spaces are
/// skipped.
pub fn parse_frame_number(line: &str) -> Option<u64> {
    let (_, rest) = line.split_once("frame=")?;
    let token = rest.split_whitespace().next()?;
    token.parse().ok()
}

/// Turns encoder status lines into a percentage that never goes backwards.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_frames: u64,
    last_percent: u8,
}

impl ProgressTracker {
    pub fn new(total_frames: usize) -> Self {
        Self {
            total_frames: total_frames as u64,
            last_percent: 0,
        }
    }

    /// Returns the percentage to display for `line`, or `None` if the line
    /// carries no usable frame count.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let frame = parse_frame_number(line)?;
        Some(self.observe_frame(frame))
    }

    pub fn observe_frame(&mut self, frame: u64) -> u8 {
        let pct = percent_of(frame, self.total_frames);
        self.last_percent = self.last_percent.max(pct);
        self.last_percent
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }
}

fn percent_of(frame: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let fraction = (frame as f64 / total as f64).min(1.0);
    (fraction * 100.0).floor() as u8
}

/// How encode progress is shown on the CLI's stderr. The encoder's own stderr
/// is always captured for `frame=` parsing and never reaches the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    /// Bar on an interactive stderr, `[PROGRESS]` lines when redirected.
    Auto,
    Rich,
    /// One `[PROGRESS]` line per interval; suits CI logs and `2>file`.
    Plain,
    /// Only the summary and errors.
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedProgressMode {
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    /// Silence from the encoder (no new `frame=` count) before warning.
    pub idle_threshold: Duration,
    pub plain_interval: Duration,
    /// Fixed answer for "is stderr a terminal"; probed when `None`.
    stderr_is_tty: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            idle_threshold: Duration::from_secs(20),
            plain_interval: Duration::from_secs(2),
            stderr_is_tty: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn assume_stderr_tty(mut self, is_tty: bool) -> Self {
        self.stderr_is_tty = Some(is_tty);
        self
    }

    pub fn resolve_mode(self) -> ResolvedProgressMode {
        match self.mode {
            ProgressMode::Rich => ResolvedProgressMode::Rich,
            ProgressMode::Plain => ResolvedProgressMode::Plain,
            ProgressMode::Quiet => ResolvedProgressMode::Quiet,
            ProgressMode::Auto => {
                let tty = self
                    .stderr_is_tty
                    .unwrap_or_else(|| std::io::stderr().is_terminal());
                if tty {
                    ResolvedProgressMode::Rich
                } else {
                    ResolvedProgressMode::Plain
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub percent: u8,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

/// Renders job progress for a terminal: an indicatif bar when attached to a
/// TTY, periodic `[PROGRESS]` lines otherwise. Driven from the thread that
/// drains job events; call [`ProgressReporter::tick`] while waiting so plain
/// lines and idle warnings keep flowing when the encoder goes quiet.
pub struct ProgressReporter {
    label: String,
    mode: ResolvedProgressMode,
    idle_threshold: Duration,
    plain_interval: Duration,
    bar: Option<ProgressBar>,
    started: Instant,
    stage: String,
    percent: u8,
    last_progress: Instant,
    last_plain_emit: Instant,
    last_idle_warn: Option<Instant>,
    warnings: Vec<String>,
    finalized: bool,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, config: ProgressConfig) -> Self {
        let label = label.into();
        let mode = config.resolve_mode();
        let now = Instant::now();

        let bar = if mode == ResolvedProgressMode::Rich {
            let pb = ProgressBar::new(100);
            pb.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] {wide_bar:.cyan/blue} {pos:>3}% ETA {eta_precise} | {msg}",
                )
                .expect("valid progress template"),
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            pb.set_message(format!("{} starting", label));
            Some(pb)
        } else {
            None
        };

        Self {
            label,
            mode,
            idle_threshold: config.idle_threshold,
            plain_interval: config.plain_interval,
            bar,
            started: now,
            stage: "starting".to_string(),
            percent: 0,
            last_progress: now,
            last_plain_emit: now.checked_sub(config.plain_interval).unwrap_or(now),
            last_idle_warn: None,
            warnings: Vec::new(),
            finalized: false,
        }
    }

    pub fn set_stage(&mut self, stage: impl Into<String>) {
        self.stage = stage.into();
        if let Some(bar) = &self.bar {
            bar.set_message(self.stage.clone());
        }
        if self.mode == ResolvedProgressMode::Plain {
            self.render_plain();
        }
    }

    pub fn set_percent(&mut self, percent: u8) {
        let percent = percent.min(100);
        if percent > self.percent {
            self.last_progress = Instant::now();
        }
        self.percent = self.percent.max(percent);
        if let Some(bar) = &self.bar {
            bar.set_position(u64::from(self.percent));
        }
        self.tick();
    }

    /// Emits a plain line if one is due and raises the idle warning when no
    /// progress arrived for `idle_threshold`.
    pub fn tick(&mut self) {
        if self.mode == ResolvedProgressMode::Quiet {
            return;
        }
        let now = Instant::now();

        if self.mode == ResolvedProgressMode::Plain
            && now.duration_since(self.last_plain_emit) >= self.plain_interval
        {
            self.render_plain();
        }

        if idle_warning_due(
            now,
            self.last_progress,
            self.last_idle_warn,
            self.idle_threshold,
            self.percent,
        ) {
            self.last_idle_warn = Some(now);
            let msg = format!(
                "IDLE WARNING: no encoder progress for {}s (stage={}, at={}%)",
                now.duration_since(self.last_progress).as_secs(),
                self.stage,
                self.percent
            );
            self.push_warning(&msg);
            self.emit_message("WARN", &msg);
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit_message("INFO", &message.into());
    }

    pub fn finish(mut self, final_message: impl Into<String>) -> ProgressOutcome {
        self.finalize(Some(final_message.into()))
    }

    pub fn abandon(mut self, final_message: impl Into<String>) -> ProgressOutcome {
        let msg = final_message.into();
        if let Some(bar) = self.bar.take() {
            bar.abandon_with_message(msg.clone());
        }
        self.finalize(Some(msg))
    }

    fn finalize(&mut self, final_message: Option<String>) -> ProgressOutcome {
        if !self.finalized {
            self.finalized = true;
            match self.mode {
                ResolvedProgressMode::Quiet => {}
                ResolvedProgressMode::Plain => {
                    self.render_plain();
                    if let Some(msg) = final_message.as_deref() {
                        eprintln!("[DONE] {}: {}", self.label, msg);
                    }
                }
                ResolvedProgressMode::Rich => {
                    if let Some(bar) = self.bar.take() {
                        match final_message {
                            Some(msg) => bar.finish_with_message(msg),
                            None => bar.finish_and_clear(),
                        }
                    }
                }
            }
        }

        ProgressOutcome {
            elapsed: self.started.elapsed(),
            percent: self.percent,
            warning_count: self.warnings.len(),
            warnings: self.warnings.clone(),
        }
    }

    fn render_plain(&mut self) {
        self.last_plain_emit = Instant::now();
        let elapsed = self.started.elapsed();
        eprintln!(
            "[PROGRESS] {} elapsed={} stage={} done={}% ETA={}",
            self.label,
            format_duration(elapsed),
            self.stage,
            self.percent,
            format_eta(compute_eta(elapsed, self.percent)),
        );
    }

    fn push_warning(&mut self, message: &str) {
        if self.warnings.len() >= MAX_STORED_WARNINGS {
            self.warnings.remove(0);
        }
        self.warnings.push(message.to_string());
    }

    fn emit_message(&self, level: &str, message: &str) {
        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => {
                eprintln!("[{}] {}: {}", level, self.label, message);
            }
            ResolvedProgressMode::Rich => {
                if let Some(bar) = &self.bar {
                    bar.println(format!("[{}] {}: {}", level, self.label, message));
                } else {
                    eprintln!("[{}] {}: {}", level, self.label, message);
                }
            }
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        let _ = self.finalize(None);
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

fn format_eta(eta: Option<Duration>) -> String {
    eta.map(format_duration)
        .unwrap_or_else(|| "--:--".to_string())
}

fn compute_eta(elapsed: Duration, percent: u8) -> Option<Duration> {
    if percent == 0 || percent >= 100 {
        return None;
    }
    let per_point = elapsed.as_secs_f64() / f64::from(percent);
    Some(Duration::from_secs_f64(per_point * f64::from(100 - percent)))
}

fn idle_warning_due(
    now: Instant,
    last_progress: Instant,
    last_idle_warn: Option<Instant>,
    idle_threshold: Duration,
    percent: u8,
) -> bool {
    if percent >= 100 {
        return false;
    }
    if now.duration_since(last_progress) < idle_threshold {
        return false;
    }
    match last_idle_warn {
        Some(last_warn) => now.duration_since(last_warn) >= idle_threshold,
        None => true,
    }
}
