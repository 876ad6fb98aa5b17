//! Stitch a folder of numbered image frames into an MP4 by driving ffmpeg.
//!
//! [`collect::collect_frames`] finds and orders the frames,
//! [`request::prepare`] validates what the user asked for, and
//! [`encoder::Encoder`] runs the encode in the background, reporting progress
//! and a single terminal [`encoder::JobOutcome`] over a channel.

pub mod collect;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod manifest;
pub mod progress;
pub mod request;
pub mod util;

pub use collect::{collect_frames, selected_frames};
pub use encoder::{
    CancelHandle, EncodeJob, EncodeSummary, Encoder, EncoderConfig, JobEvent, JobOutcome,
};
pub use error::{Error, InputError, ProcessError, Result};
pub use frame::{frame_index, FramePath};
pub use request::{prepare, EncodeRequest, EncodeSettings, PrepareOptions};
