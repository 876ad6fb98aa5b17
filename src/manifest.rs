use crate::frame::FramePath;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

pub const MANIFEST_PREFIX: &str = "framestitch_list_";

/// Per-frame display time written to the manifest. Fixed precision keeps
/// every entry of a manifest identical.
pub fn frame_duration(fps: u32) -> String {
    format!("{:.6}", 1.0 / f64::from(fps.max(1)))
}

/// Renders a concat-demuxer manifest: one `file`/`duration` pair per frame,
/// in the order given.
pub fn render(frames: &[FramePath], fps: u32) -> io::Result<String> {
    let duration = frame_duration(fps);
    let mut out = String::with_capacity(frames.len() * 64);
    for f in frames {
        let abs = std::path::absolute(&f.path)?;
        let _ = writeln!(out, "file '{}'", escape_path(&abs));
        let _ = writeln!(out, "duration {}", duration);
    }
    Ok(out)
}

// The concat demuxer reads single-quoted strings; a literal quote has to
// close the string, be escaped, and reopen it.
fn escape_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', r"'\''")
}

pub fn manifest_path(output_dir: &Path, job_id: &str) -> PathBuf {
    output_dir.join(format!("{}{}.txt", MANIFEST_PREFIX, job_id))
}

/// A manifest on disk that is removed when dropped.
#[derive(Debug)]
pub struct ManifestFile {
    path: PathBuf,
}

impl ManifestFile {
    pub fn create(path: PathBuf, contents: &str) -> io::Result<Self> {
        std::fs::write(&path, contents.as_bytes())?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ManifestFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("removed manifest {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to remove manifest {}: {}", self.path.display(), e),
        }
    }
}
