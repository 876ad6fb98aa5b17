#![cfg(unix)]

use framestitch::{
    selected_frames, EncodeRequest, EncodeSettings, Encoder, EncoderConfig, Error, JobEvent,
    JobOutcome,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// Shared preamble: finds the manifest after `-i`, the output as the last
// argument, and keeps a copy of the manifest next to the output.
const PREAMBLE: &str = r#"#!/bin/sh
manifest=""
prev=""
out=""
for a in "$@"; do
  if [ "$prev" = "-i" ]; then manifest="$a"; fi
  prev="$a"
  out="$a"
done
cp "$manifest" "$out.manifest"
"#;

struct FakeEncoders {
    _dir: TempDir,
    success: PathBuf,
    failing: PathBuf,
    no_output: PathBuf,
    self_kill: PathBuf,
    slow: PathBuf,
    exits_early: PathBuf,
}

// All scripts are written before any test spawns a process, so no child can
// inherit a script's write handle ("text file busy").
fn encoders() -> &'static FakeEncoders {
    static ENCODERS: OnceLock<FakeEncoders> = OnceLock::new();
    ENCODERS.get_or_init(|| {
        let dir = TempDir::new().expect("script dir");
        let write = |name: &str, body: &str| {
            let path = dir.path().join(name);
            fs::write(&path, format!("{PREAMBLE}{body}\n")).expect("write script");
            let mut perms = fs::metadata(&path).expect("stat script").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).expect("chmod script");
            path
        };
        FakeEncoders {
            success: write(
                "success.sh",
                r#"echo "Input #0, concat, from '$manifest':" >&2
printf 'frame=    2 fps=0.0 q=0.0 size=       0kB\r' >&2
printf 'frame=    1 fps=0.0 q=0.0 size=       0kB\r' >&2
echo "frame=garbage" >&2
printf 'frame=    4 fps=0.0 q=-1.0 Lsize=       1kB\n' >&2
printf 'fake mp4 payload' > "$out"
exit 0"#,
            ),
            failing: write(
                "failing.sh",
                r#"echo "boom: Invalid data found when processing input" >&2
exit 3"#,
            ),
            no_output: write("no_output.sh", "exit 0"),
            self_kill: write(
                "self_kill.sh",
                r#"printf 'frame=    1 fps=0.0\n' >&2
kill -9 $$"#,
            ),
            slow: write(
                "slow.sh",
                r#"printf 'frame=    1 fps=0.0\n' >&2
exec sleep 30"#,
            ),
            // Fails straight away while a background child keeps stderr open.
            exits_early: write(
                "exits_early.sh",
                r#"printf 'frame=    1 fps=0.0\n' >&2
(sleep 3) &
exit 3"#,
            ),
            _dir: dir,
        }
    })
}

fn write_frames(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|n| {
            let p = dir.join(n);
            fs::write(&p, b"not really an image").expect("write frame");
            p
        })
        .collect()
}

fn request(dir: &Path, output: PathBuf, fps: i64) -> EncodeRequest {
    let paths = write_frames(dir, &["frame_3.png", "frame_1.png", "frame_4.jpg", "frame_2.bmp"]);
    EncodeRequest::new(
        selected_frames(paths),
        output,
        EncodeSettings::new(fps, 23).expect("valid settings"),
    )
    .expect("valid request")
}

fn encoder_for(program: &Path) -> Encoder {
    let mut config = EncoderConfig::default().with_program(program);
    config.poll_interval = Duration::from_millis(20);
    Encoder::new(config)
}

fn leftover_manifests(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .expect("read dir")
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with("framestitch_list_"))
                .unwrap_or(false)
        })
        .collect()
}

/// Drains every event until the worker hangs up.
fn drain(events: &crossbeam_channel::Receiver<JobEvent>) -> (Vec<u8>, Vec<JobOutcome>) {
    let mut progress = vec![];
    let mut finished = vec![];
    for ev in events.iter() {
        match ev {
            JobEvent::Progress(p) => progress.push(p),
            JobEvent::Finished(o) => finished.push(o),
        }
    }
    (progress, finished)
}

#[test]
fn successful_job_reports_summary_and_removes_manifest() {
    let tmp = TempDir::new().expect("tempdir");
    let output = tmp.path().join("video.mp4");
    let encoder = encoder_for(&encoders().success);

    let job = encoder.start(request(tmp.path(), output.clone(), 2)).expect("start");
    let (progress, finished) = drain(job.events());
    let outcome = job.wait();

    assert_eq!(finished.len(), 1, "exactly one terminal event");
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {progress:?}");
    assert_eq!(progress.first(), Some(&50));
    assert_eq!(progress.last(), Some(&100));

    let summary = match outcome {
        JobOutcome::Completed(s) => s,
        other => panic!("expected success, got {other:?}"),
    };
    assert_eq!(summary.output_path, output);
    assert!(summary.file_size_bytes > 0);
    assert_eq!(summary.frame_count, 4);
    assert!((summary.duration_secs - 2.0).abs() < 1e-9);

    assert!(leftover_manifests(tmp.path()).is_empty());
    assert!(!encoder.is_busy());
}

#[test]
fn manifest_lists_frames_sorted_with_inverse_fps_duration() {
    let tmp = TempDir::new().expect("tempdir");
    let output = tmp.path().join("video.mp4");
    let encoder = encoder_for(&encoders().success);

    let outcome = encoder
        .start(request(tmp.path(), output.clone(), 4))
        .expect("start")
        .wait();
    assert!(outcome.is_success(), "{outcome:?}");

    let seen = fs::read_to_string(tmp.path().join("video.mp4.manifest")).expect("manifest copy");
    let lines: Vec<&str> = seen.lines().collect();
    assert_eq!(lines.len(), 8);
    let expected = ["frame_1.png", "frame_2.bmp", "frame_3.png", "frame_4.jpg"];
    for (pair, name) in lines.chunks(2).zip(expected) {
        assert_eq!(pair[0], format!("file '{}'", tmp.path().join(name).display()));
        assert_eq!(pair[1], "duration 0.250000");
    }
}

#[test]
fn non_zero_exit_fails_with_code_and_command() {
    let tmp = TempDir::new().expect("tempdir");
    let encoder = encoder_for(&encoders().failing);

    let job = encoder
        .start(request(tmp.path(), tmp.path().join("out.mp4"), 25))
        .expect("start");
    let (_, finished) = drain(job.events());
    let outcome = job.wait();

    assert_eq!(finished.len(), 1);
    match outcome {
        JobOutcome::Failed { message } => {
            assert!(message.contains("code 3"), "{message}");
            assert!(message.contains("-f concat -safe 0"), "{message}");
            assert!(message.contains("boom: Invalid data"), "{message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(leftover_manifests(tmp.path()).is_empty());
}

#[test]
fn clean_exit_without_output_is_a_failure() {
    let tmp = TempDir::new().expect("tempdir");
    let encoder = encoder_for(&encoders().no_output);

    let outcome = encoder
        .start(request(tmp.path(), tmp.path().join("out.mp4"), 25))
        .expect("start")
        .wait();
    match outcome {
        JobOutcome::Failed { message } => {
            assert!(message.contains("output not produced"), "{message}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(leftover_manifests(tmp.path()).is_empty());
}

#[test]
fn killed_encoder_fails_once_and_leaves_no_manifest() {
    let tmp = TempDir::new().expect("tempdir");
    let encoder = encoder_for(&encoders().self_kill);

    let job = encoder
        .start(request(tmp.path(), tmp.path().join("out.mp4"), 25))
        .expect("start");
    let (_, finished) = drain(job.events());
    let outcome = job.wait();

    assert_eq!(finished.len(), 1, "exactly one terminal event");
    assert!(matches!(finished[0], JobOutcome::Failed { .. }));
    match outcome {
        JobOutcome::Failed { message } => assert!(message.contains("signal"), "{message}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(leftover_manifests(tmp.path()).is_empty());
}

#[test]
fn cancel_kills_encoder_and_cleans_up() {
    let tmp = TempDir::new().expect("tempdir");
    let encoder = encoder_for(&encoders().slow);

    let job = encoder
        .start(request(tmp.path(), tmp.path().join("out.mp4"), 25))
        .expect("start");

    match job.events().recv_timeout(Duration::from_secs(10)) {
        Ok(JobEvent::Progress(p)) => assert_eq!(p, 25),
        other => panic!("expected first progress event, got {other:?}"),
    }
    assert_eq!(leftover_manifests(tmp.path()).len(), 1, "manifest exists while running");

    let started = Instant::now();
    job.cancel();
    let (_, finished) = drain(job.events());
    let outcome = job.wait();

    assert!(started.elapsed() < Duration::from_secs(10), "cancel did not kill the encoder");
    assert_eq!(finished.len(), 1);
    assert!(matches!(outcome, JobOutcome::Cancelled), "{outcome:?}");
    assert!(leftover_manifests(tmp.path()).is_empty());
    assert!(!tmp.path().join("out.mp4").exists());
}

#[test]
fn cancel_after_encoder_failed_keeps_the_failure() {
    let tmp = TempDir::new().expect("tempdir");
    let encoder = encoder_for(&encoders().exits_early);

    let job = encoder
        .start(request(tmp.path(), tmp.path().join("out.mp4"), 25))
        .expect("start");

    match job.events().recv_timeout(Duration::from_secs(10)) {
        Ok(JobEvent::Progress(p)) => assert_eq!(p, 25),
        other => panic!("expected first progress event, got {other:?}"),
    }
    // Let the encoder exit before the cancel arrives.
    std::thread::sleep(Duration::from_millis(500));
    job.cancel();
    let (_, finished) = drain(job.events());
    let outcome = job.wait();

    assert_eq!(finished.len(), 1);
    match outcome {
        JobOutcome::Failed { message } => assert!(message.contains("code 3"), "{message}"),
        other => panic!("expected the encoder failure, got {other:?}"),
    }
    assert!(leftover_manifests(tmp.path()).is_empty());
}

#[test]
fn second_job_is_rejected_while_one_runs() {
    let tmp = TempDir::new().expect("tempdir");
    let first_dir = tmp.path().join("first");
    let second_dir = tmp.path().join("second");
    fs::create_dir_all(&first_dir).unwrap();
    fs::create_dir_all(&second_dir).unwrap();
    let encoder = encoder_for(&encoders().slow);

    let job = encoder
        .start(request(&first_dir, first_dir.join("out.mp4"), 25))
        .expect("start first");
    assert!(encoder.is_busy());

    let err = encoder
        .start(request(&second_dir, second_dir.join("out.mp4"), 25))
        .err()
        .expect("second start must fail");
    assert!(matches!(err, Error::Busy));
    assert!(leftover_manifests(&second_dir).is_empty());

    job.cancel();
    assert!(matches!(job.wait(), JobOutcome::Cancelled));
    assert!(!encoder.is_busy());

    // Dropping a running job cancels and reaps it.
    let again = encoder
        .start(request(&second_dir, second_dir.join("out.mp4"), 25))
        .expect("slot released");
    drop(again);
    assert!(!encoder.is_busy());
    assert!(leftover_manifests(&second_dir).is_empty());
}

#[test]
fn missing_encoder_binary_is_a_failure() {
    let tmp = TempDir::new().expect("tempdir");
    let encoder = encoder_for(Path::new("/nonexistent/framestitch-ffmpeg"));

    let outcome = encoder
        .start(request(tmp.path(), tmp.path().join("out.mp4"), 25))
        .expect("start")
        .wait();
    match outcome {
        JobOutcome::Failed { message } => {
            assert!(message.contains("failed to spawn"), "{message}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(leftover_manifests(tmp.path()).is_empty());
}

#[test]
fn unwritable_output_folder_fails_before_spawning() {
    let tmp = TempDir::new().expect("tempdir");
    let encoder = encoder_for(&encoders().success);

    let outcome = encoder
        .start(request(tmp.path(), tmp.path().join("missing/out.mp4"), 25))
        .expect("start")
        .wait();
    match outcome {
        JobOutcome::Failed { message } => {
            assert!(message.contains("failed to write manifest"), "{message}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
}
