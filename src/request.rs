use crate::collect;
use crate::error::{InputError, Result};
use crate::frame::FramePath;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

pub const QUALITY_RANGE: RangeInclusive<i64> = 18..=28;
pub const DEFAULT_FPS: i64 = 25;
pub const DEFAULT_QUALITY: i64 = 23;
pub const DEFAULT_OUTPUT_NAME: &str = "output.mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeSettings {
    pub fps: u32,
    /// Constant rate factor; lower is better quality and a larger file.
    pub quality: u8,
}

impl EncodeSettings {
    pub fn new(fps: i64, quality: i64) -> std::result::Result<Self, InputError> {
        if !QUALITY_RANGE.contains(&quality) {
            return Err(InputError::InvalidQuality(quality));
        }
        if fps <= 0 {
            return Err(InputError::InvalidFps(fps));
        }
        let fps = u32::try_from(fps).map_err(|_| InputError::InvalidFps(fps))?;
        Ok(Self {
            fps,
            quality: quality as u8,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub frames: Vec<FramePath>,
    pub output: PathBuf,
    pub settings: EncodeSettings,
}

impl EncodeRequest {
    pub fn new(
        frames: Vec<FramePath>,
        output: impl Into<PathBuf>,
        settings: EncodeSettings,
    ) -> std::result::Result<Self, InputError> {
        let output = output.into();
        if output.as_os_str().is_empty() {
            return Err(InputError::NoOutput);
        }
        if frames.is_empty() {
            let dir = output.parent().map(Path::to_path_buf).unwrap_or_default();
            return Err(InputError::NoImages(dir));
        }
        Ok(Self {
            frames,
            output,
            settings,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

/// Everything the user filled in before pressing "encode".
#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    pub folder: Option<PathBuf>,
    /// `None` falls back to `<folder>/output.mp4`; an empty path is rejected.
    pub output: Option<PathBuf>,
    pub fps: i64,
    pub quality: i64,
    /// Paths picked from the listing. Empty means "use every frame".
    pub selection: Vec<PathBuf>,
}

pub fn default_output(folder: &Path) -> PathBuf {
    folder.join(DEFAULT_OUTPUT_NAME)
}

/// Validates user input and resolves the frame list, in the same order of
/// checks the user would hit them: folder, output, parameters, images.
pub fn prepare(opts: PrepareOptions) -> Result<EncodeRequest> {
    let folder = opts.folder.ok_or(InputError::NoFolder)?;
    let output = opts.output.unwrap_or_else(|| default_output(&folder));
    if output.as_os_str().is_empty() {
        return Err(InputError::NoOutput.into());
    }
    let settings = EncodeSettings::new(opts.fps, opts.quality)?;

    let discovered = collect::collect_frames(&folder)?;
    if discovered.is_empty() {
        return Err(InputError::NoImages(folder).into());
    }
    let frames = if opts.selection.is_empty() {
        discovered
    } else {
        pick_discovered(&discovered, opts.selection)?
    };

    Ok(EncodeRequest {
        frames,
        output,
        settings,
    })
}

/// Resolves a selection against the scanned frames. Paths are compared in
/// absolute form so `dir/x.png` and `./dir/x.png` name the same frame.
fn pick_discovered(
    discovered: &[FramePath],
    selection: Vec<PathBuf>,
) -> std::result::Result<Vec<FramePath>, InputError> {
    let known: HashSet<PathBuf> = discovered
        .iter()
        .filter_map(|f| std::path::absolute(&f.path).ok())
        .collect();
    for path in &selection {
        let found = std::path::absolute(path)
            .map(|abs| known.contains(&abs))
            .unwrap_or(false);
        if !found {
            return Err(InputError::NotDiscovered(path.clone()));
        }
    }
    Ok(collect::selected_frames(selection))
}
