//! Session persistence.
//!
//! Sessions travel as an opaque, versioned JSON blob so that a later process
//! can pick up the cookies without repeating the login handshake. The blob
//! either reproduces the exact state it was built from or is rejected whole;
//! a partially-restored session is never produced.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EchoError, Result};
use crate::types::SessionState;

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    state: SessionState,
}

#[derive(Deserialize)]
struct Probe {
    version: u32,
}

/// Serialize a session to its persistent form.
///
/// Output is deterministic for a given state (cookie maps are ordered), so
/// the same session always produces the same blob.
pub fn serialize(state: &SessionState) -> Result<Vec<u8>> {
    let envelope = Envelope {
        version: FORMAT_VERSION,
        state: state.clone(),
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

/// Reconstruct a session from a blob produced by [`serialize`].
///
/// Truncation, garbage, and unknown format versions all come back as
/// [`EchoError::CorruptSession`].
pub fn deserialize(blob: &[u8]) -> Result<SessionState> {
    let probe: Probe = serde_json::from_slice(blob)
        .map_err(|e| EchoError::CorruptSession(format!("unreadable session blob: {}", e)))?;
    if probe.version != FORMAT_VERSION {
        return Err(EchoError::CorruptSession(format!(
            "unsupported session format version {}",
            probe.version
        )));
    }
    let envelope: Envelope = serde_json::from_slice(blob)
        .map_err(|e| EchoError::CorruptSession(format!("malformed session blob: {}", e)))?;
    Ok(envelope.state)
}

/// Read and deserialize a session file
pub async fn load(path: impl AsRef<Path>) -> Result<SessionState> {
    let path = path.as_ref();
    let blob = tokio::fs::read(path)
        .await
        .map_err(|source| storage_error(path, source))?;
    deserialize(&blob)
}

/// Serialize and write a session file.
///
/// The blob is written to `<path>.tmp` and renamed into place, so a crash
/// mid-write leaves either the previous file or the new one, never a
/// truncated mixture.
pub async fn save(path: impl AsRef<Path>, state: &SessionState) -> Result<()> {
    let path = path.as_ref();
    let blob = serialize(state)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &blob)
        .await
        .map_err(|source| storage_error(&tmp, source))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| storage_error(path, source))?;

    tracing::debug!("session saved to {}", path.display());
    Ok(())
}

/// Delete a session file. Missing files are not an error.
pub async fn remove(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(storage_error(path, source)),
    }
}

fn storage_error(path: &Path, source: std::io::Error) -> EchoError {
    EchoError::StorageUnavailable {
        path: path.to_owned(),
        source,
    }
}
