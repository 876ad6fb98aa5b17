use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

static FRAME_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"frame_(\d+)").expect("valid frame token regex"));

/// An image on disk together with the ordering key parsed from its file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FramePath {
    pub path: PathBuf,
    pub index: u64,
}

impl FramePath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let index = frame_index(&path);
        Self { path, index }
    }
}

/// Parses the first `frame_<digits>` token of the file name (never the parent
/// directories). Names without the token sort as frame 0.
pub fn frame_index(path: &Path) -> u64 {
    let Some(name) = path.file_name() else {
        return 0;
    };
    let name = name.to_string_lossy();
    match FRAME_TOKEN.captures(&name) {
        // Only overflow can fail here: the group is all ASCII digits.
        Some(caps) => caps[1].parse::<u64>().unwrap_or(u64::MAX),
        None => 0,
    }
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Stable ascending sort by frame index; equal indices keep their current order.
pub fn sort_frames(frames: &mut [FramePath]) {
    frames.sort_by_key(|f| f.index);
}
