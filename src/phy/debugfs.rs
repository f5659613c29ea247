//! Constrained passthrough to per-device debug files.
//!
//! The file identifier becomes part of a filesystem path, so it is validated
//! before any filesystem access: identifiers containing a `.` or longer than
//! 64 characters are rejected outright. Reads collapse the file into a single
//! line (trailing newline trimmed, embedded newlines replaced with `,`) so
//! the result fits the one-record reply format.

use std::sync::Arc;

use crate::phy::backend::DeviceBackend;
use crate::phy::ControlError;

/// Maximum accepted debug-file identifier length.
pub const MAX_FILE_LEN: usize = 64;

/// Rejects identifiers that could escape the per-device debug directory.
/// Purely a function of the identifier string; no filesystem access.
pub fn validate_identifier(file: &str) -> Result<(), ControlError> {
    if file.is_empty() || file.len() > MAX_FILE_LEN || file.contains('.') {
        return Err(ControlError::InvalidDebugFile);
    }
    Ok(())
}

/// Reads or writes a device debug file.
///
/// With a value this writes it out and returns `None`; without one it reads
/// the file in full and returns the comma-joined content for the caller to
/// format into a reply record.
pub fn access(
    backend: &Arc<dyn DeviceBackend>,
    phy: &str,
    file: &str,
    value: Option<&str>,
) -> Result<Option<String>, ControlError> {
    validate_identifier(file)?;

    match value {
        Some(value) => {
            backend.debug_write(phy, file, value)?;
            Ok(None)
        }
        None => {
            let raw = backend.debug_read(phy, file)?;
            Ok(Some(flatten(&raw)))
        }
    }
}

/// Trims one trailing newline and joins the remaining lines with commas.
fn flatten(raw: &str) -> String {
    raw.strip_suffix('\n').unwrap_or(raw).replace('\n', ",")
}
