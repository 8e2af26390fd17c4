//! On-disk artifacts for the vector index.
//!
//! An index is persisted as two files:
//!
//! - the vector artifact at the configured path: a 20-byte header (magic,
//!   format version, dimension, row count) followed by the rows as
//!   contiguous little-endian `f32` values;
//! - a sidecar at `<path>.metadata` holding the texts, the metadata maps and
//!   the dimension as JSON.
//!
//! Both are written to a temporary file first and renamed into place.

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Metadata;
use crate::error::{EmbeddingError, Result};

/// Magic bytes identifying a vector artifact.
const MAGIC_BYTES: &[u8; 4] = b"VEMB";

/// Current artifact format version.
const FORMAT_VERSION: u32 = 1;

/// Size of the vector artifact header in bytes.
const HEADER_SIZE: usize = 20;

/// Number of bytes per f32 value.
const BYTES_PER_F32: usize = 4;

/// Contents of the sidecar artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSidecar {
    #[serde(default)]
    pub texts: Vec<String>,

    #[serde(default)]
    pub metadata: Vec<Metadata>,

    #[serde(default)]
    pub dimension: Option<usize>,
}

/// Path of the sidecar artifact belonging to `path`.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".metadata");
    PathBuf::from(name)
}

/// Write `rows` (row-major, `dimension` values per row) to `path`.
pub fn write_vectors(path: &Path, dimension: usize, rows: &[f32]) -> Result<()> {
    let count = if dimension == 0 { 0 } else { rows.len() / dimension };
    let dimension_field = u32::try_from(dimension)
        .map_err(|_| EmbeddingError::Persistence(format!("dimension {dimension} too large")))?;

    let mut buffer = Vec::with_capacity(HEADER_SIZE + rows.len() * BYTES_PER_F32);
    buffer.extend_from_slice(MAGIC_BYTES);
    buffer.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buffer.extend_from_slice(&dimension_field.to_le_bytes());
    buffer.extend_from_slice(&(count as u64).to_le_bytes());
    for value in rows {
        buffer.extend_from_slice(&value.to_le_bytes());
    }

    write_atomic(path, &buffer)?;
    debug!("Wrote {count} vectors to {}", path.display());
    Ok(())
}

/// Read a vector artifact, returning its dimension and row-major data.
pub fn read_vectors(path: &Path) -> Result<(usize, Vec<f32>)> {
    let bytes = fs::read(path)?;
    if bytes.len() < HEADER_SIZE {
        return Err(invalid(path, "file shorter than header"));
    }
    if &bytes[0..4] != MAGIC_BYTES {
        return Err(invalid(path, "bad magic bytes"));
    }

    let version = u32::from_le_bytes(field(&bytes[4..8]));
    if version != FORMAT_VERSION {
        return Err(invalid(path, &format!("unsupported format version {version}")));
    }

    let dimension = u32::from_le_bytes(field(&bytes[8..12])) as usize;
    let count = u64::from_le_bytes(field(&bytes[12..20]));
    let expected = usize::try_from(count)
        .ok()
        .and_then(|c| c.checked_mul(dimension))
        .and_then(|v| v.checked_mul(BYTES_PER_F32))
        .ok_or_else(|| invalid(path, "row count overflows"))?;

    let body = &bytes[HEADER_SIZE..];
    if body.len() != expected {
        return Err(invalid(
            path,
            &format!("expected {expected} data bytes, found {}", body.len()),
        ));
    }

    let rows = body
        .chunks_exact(BYTES_PER_F32)
        .map(|chunk| f32::from_le_bytes(field(chunk)))
        .collect();

    Ok((dimension, rows))
}

/// Write the sidecar for the vector artifact at `path`.
pub fn write_sidecar(path: &Path, sidecar: &IndexSidecar) -> Result<()> {
    let content = serde_json::to_vec(sidecar)?;
    write_atomic(&sidecar_path(path), &content)
}

/// Read the sidecar for the vector artifact at `path`, if there is one.
pub fn read_sidecar(path: &Path) -> Result<Option<IndexSidecar>> {
    let sidecar = sidecar_path(path);
    if !sidecar.exists() {
        return Ok(None);
    }
    let content = fs::read(&sidecar)?;
    Ok(Some(serde_json::from_slice(&content)?))
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut temp_name = OsString::from(path.as_os_str());
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut file = fs::File::create(&temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    Ok(())
}

fn field<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn invalid(path: &Path, reason: &str) -> EmbeddingError {
    EmbeddingError::Persistence(format!("{}: {reason}", path.display()))
}
