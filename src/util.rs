use anyhow::{bail, Context, Result};
use rand::RngCore;
use std::ffi::OsStr;
use std::process::{Command, Stdio};

pub const DISPLAY_MESSAGE_LIMIT: usize = 500;

pub fn ensure_encoder_available(program: &OsStr) -> Result<()> {
    let out = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run {} -version", program.to_string_lossy()))?;
    if !out.status.success() {
        bail!(
            "{} exists but returned non-zero on -version",
            program.to_string_lossy()
        );
    }
    Ok(())
}

pub fn random_job_id() -> String {
    let mut id = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut id);
    id.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Shortens long failure text for dialogs and terminals; the full text
/// belongs in the log.
pub fn truncate_for_display(message: &str, limit: usize) -> String {
    match message.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}
