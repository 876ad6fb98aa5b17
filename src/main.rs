use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use framestitch::progress::{format_duration, ProgressConfig, ProgressMode, ProgressReporter};
use framestitch::request::{DEFAULT_FPS, DEFAULT_QUALITY};
use framestitch::{
    collect_frames, prepare, util, EncodeSummary, Encoder, EncoderConfig, JobEvent, JobOutcome,
    PrepareOptions,
};
use indicatif::HumanBytes;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "framestitch",
    version,
    about = "Stitch numbered image frames (frame_<N>.png, ...) into an MP4 with ffmpeg"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the frames found under a folder, in the order they will be encoded
    List {
        folder: PathBuf,

        /// Print the frame list as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Encode the frames under a folder into an MP4
    Encode {
        folder: PathBuf,

        /// Output file. Default: <folder>/output.mp4
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Frames per second.
        #[arg(long, default_value_t = DEFAULT_FPS, allow_negative_numbers = true)]
        fps: i64,

        /// Quality as x264 CRF: 18 (best, largest) to 28 (smallest).
        #[arg(long, default_value_t = DEFAULT_QUALITY, allow_negative_numbers = true)]
        quality: i64,

        /// Encode only these frames (repeatable); each must be an image found
        /// in the folder. Default: every frame found.
        #[arg(long = "select", value_name = "PATH")]
        select: Vec<PathBuf>,

        /// Encoder executable.
        #[arg(long, default_value = "ffmpeg")]
        ffmpeg: PathBuf,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,

        /// Print the encode summary as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::List { folder, json } => list_frames(&folder, json)?,

        Commands::Encode {
            folder,
            output,
            fps,
            quality,
            select,
            ffmpeg,
            progress,
            json,
        } => {
            let request = prepare(PrepareOptions {
                folder: Some(folder),
                output,
                fps,
                quality,
                selection: select,
            })?;

            util::ensure_encoder_available(ffmpeg.as_os_str())
                .with_context(|| format!("{} is not a usable encoder", ffmpeg.display()))?;

            let summary = run_encode(
                EncoderConfig::default().with_program(ffmpeg),
                request,
                ProgressConfig::new(progress),
            )?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_encode_summary(&summary);
            }
        }
    }

    Ok(())
}

fn list_frames(folder: &Path, json: bool) -> Result<()> {
    let frames = collect_frames(folder)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&frames)?);
        return Ok(());
    }
    if frames.is_empty() {
        eprintln!(
            "No PNG, JPG, JPEG or BMP images found in {}",
            folder.display()
        );
        return Ok(());
    }
    for f in &frames {
        println!("{:>8}  {}", f.index, f.path.display());
    }
    println!("{} frames", frames.len());
    Ok(())
}

fn run_encode(
    config: EncoderConfig,
    request: framestitch::EncodeRequest,
    progress: ProgressConfig,
) -> Result<EncodeSummary> {
    let frame_count = request.frame_count();
    let encoder = Encoder::new(config);
    let job = encoder.start(request)?;

    let cancel = job.cancel_handle();
    ctrlc::set_handler(move || cancel.cancel()).context("failed to install Ctrl-C handler")?;

    let mut reporter = ProgressReporter::new("encode", progress);
    reporter.set_stage(format!("encoding {} frames", frame_count));

    loop {
        match job.events().recv_timeout(Duration::from_millis(500)) {
            Ok(JobEvent::Progress(pct)) => reporter.set_percent(pct),
            Ok(JobEvent::Finished(_)) => break,
            Err(RecvTimeoutError::Timeout) => reporter.tick(),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let outcome = job.wait();
    match outcome {
        JobOutcome::Completed(summary) => {
            reporter.set_percent(100);
            reporter.finish("encode complete");
            Ok(summary)
        }
        JobOutcome::Failed { ref message } => {
            log::error!("encode failed: {}", message);
            reporter.abandon("encode failed");
            bail!(
                "encode failed: {}",
                outcome.display_message().unwrap_or_default()
            )
        }
        JobOutcome::Cancelled => {
            reporter.abandon("encode cancelled");
            bail!("encode cancelled")
        }
    }
}

fn print_encode_summary(summary: &EncodeSummary) {
    println!(
        "Encode summary: output={} size={} frames={} fps={} duration={:.1}s elapsed={}",
        summary.output_path.display(),
        HumanBytes(summary.file_size_bytes),
        summary.frame_count,
        summary.fps,
        summary.duration_secs,
        format_duration(Duration::from_secs_f64(summary.elapsed_secs)),
    );
}
