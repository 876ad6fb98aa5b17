use crate::error::{Error, Result};
use crate::frame::{self, FramePath};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recursively finds supported images under `root`, ordered by frame index.
///
/// Entries are walked in file-name order so that frames sharing an index
/// (including every name without a `frame_<N>` token) come out in the same
/// order on every filesystem. An empty result is not an error.
pub fn collect_frames(root: &Path) -> Result<Vec<FramePath>> {
    if root.exists() && !root.is_dir() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{:?} is not a directory", root),
        )));
    }

    let mut frames = vec![];
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let e = entry.map_err(|source| Error::Scan {
            path: root.to_path_buf(),
            source,
        })?;
        if !e.file_type().is_file() {
            continue;
        }
        let p = e.path();
        if frame::is_supported_image(p) {
            frames.push(FramePath::new(p));
        }
    }

    frame::sort_frames(&mut frames);
    log::debug!("collected {} frames under {}", frames.len(), root.display());
    Ok(frames)
}

/// Wraps a user selection of previously discovered paths. The order is kept
/// as given; the encoder re-sorts before use.
pub fn selected_frames<I, P>(selection: I) -> Vec<FramePath>
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    selection.into_iter().map(FramePath::new).collect()
}
