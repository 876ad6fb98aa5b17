use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error("failed to scan {path:?}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("an encode job is already running")]
    Busy,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Problems with what the user asked for. Always reported before any
/// background work starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("select a folder with images first")]
    NoFolder,

    #[error("specify where to save the video")]
    NoOutput,

    #[error("fps must be positive (got {0})")]
    InvalidFps(i64),

    #[error("quality (CRF) must be between 18 and 28 (got {0})")]
    InvalidQuality(i64),

    #[error("no PNG, JPG, JPEG or BMP images found in {0:?}")]
    NoImages(PathBuf),

    #[error("{0:?} is not one of the images found in the folder")]
    NotDiscovered(PathBuf),
}

/// Terminal failures of a background encode job.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to write manifest {path:?}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for encoder: {0}")]
    Wait(#[source] std::io::Error),

    #[error("encoder exited with code {code}: `{command}` stderr_tail={stderr_tail}")]
    Exit {
        code: i32,
        command: String,
        stderr_tail: String,
    },

    #[error("encoder was terminated by a signal: `{command}` stderr_tail={stderr_tail}")]
    Terminated { command: String, stderr_tail: String },

    #[error("output not produced: {0:?}")]
    OutputMissing(PathBuf),

    #[error("failed to stat output {path:?}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encode worker panicked")]
    WorkerPanicked,
}
