use std::path::Path;
use tracing::warn;

/// Writes a fatal error to the container's termination-message file so that
/// it is surfaced in the pod status.
pub(crate) fn report(path: &Path, error: &anyhow::Error) {
    if let Err(write_error) = std::fs::write(path, format!("{error:#}")) {
        warn!(path = %path.display(), error = %write_error, "Failed to write termination message");
    }
}
