//! Chunk file codec.
//!
//! One chunk file holds a 4D `u16` array `[n_volumes, n_planes, height, width]`:
//!
//! ```text
//! offset  size  field
//! 0       8     magic "DSLMSTK1"
//! 8       32    shape, 4 x u64 little-endian
//! 40      ..    LZ4 block (size-prepended) of the samples, u16 little-endian, C order
//! ```
//!
//! Files are written to a temporary name and renamed into place, so a chunk file that
//! exists is always complete.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array4, ArrayView4};

use crate::error::{AppResult, DslmError};

/// File magic.
pub const CHUNK_MAGIC: &[u8; 8] = b"DSLMSTK1";

/// Chunk file extension.
pub const CHUNK_EXTENSION: &str = "stack";

const HEADER_LEN: usize = 8 + 4 * 8;

/// Path of chunk `index` inside `dir`: `0000.stack`, `0001.stack`, ...
pub fn chunk_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("{index:04}.{CHUNK_EXTENSION}"))
}

fn storage_error(path: &Path, action: &str, e: impl std::fmt::Display) -> DslmError {
    DslmError::Storage(format!("{action} {}: {e}", path.display()))
}

/// Encode `data` into the chunk file format.
pub fn encode_chunk(data: ArrayView4<'_, u16>) -> Vec<u8> {
    let mut raw = Vec::with_capacity(data.len() * 2);
    for value in data.iter() {
        raw.extend_from_slice(&value.to_le_bytes());
    }
    let compressed = lz4_flex::compress_prepend_size(&raw);

    let mut bytes = Vec::with_capacity(HEADER_LEN + compressed.len());
    bytes.extend_from_slice(CHUNK_MAGIC);
    for dim in data.shape() {
        bytes.extend_from_slice(&(*dim as u64).to_le_bytes());
    }
    bytes.extend_from_slice(&compressed);
    bytes
}

/// Decode a chunk file's bytes.
pub fn decode_chunk(bytes: &[u8]) -> AppResult<Array4<u16>> {
    if bytes.len() < HEADER_LEN || &bytes[..8] != CHUNK_MAGIC {
        return Err(DslmError::Storage("not a chunk file".to_string()));
    }
    let mut shape = [0usize; 4];
    for (i, dim) in shape.iter_mut().enumerate() {
        let start = 8 + i * 8;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[start..start + 8]);
        *dim = u64::from_le_bytes(word) as usize;
    }

    let raw = lz4_flex::decompress_size_prepended(&bytes[HEADER_LEN..])
        .map_err(|e| DslmError::Storage(format!("corrupt chunk payload: {e}")))?;
    let expected: usize = shape.iter().product::<usize>() * 2;
    if raw.len() != expected {
        return Err(DslmError::Storage(format!(
            "chunk payload has {} bytes, shape {shape:?} needs {expected}",
            raw.len()
        )));
    }

    let values: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Array4::from_shape_vec(shape, values).map_err(|e| DslmError::Storage(e.to_string()))
}

/// Write `data` as chunk `index` in `dir`. Returns the final path.
pub fn write_chunk(dir: &Path, index: usize, data: ArrayView4<'_, u16>) -> AppResult<PathBuf> {
    let path = chunk_path(dir, index);
    let partial = path.with_extension(format!("{CHUNK_EXTENSION}.partial"));
    let bytes = encode_chunk(data);

    let file = File::create(&partial).map_err(|e| storage_error(&partial, "creating", e))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&bytes)
        .and_then(|()| writer.flush())
        .map_err(|e| storage_error(&partial, "writing", e))?;
    drop(writer);
    fs::rename(&partial, &path).map_err(|e| storage_error(&path, "renaming", e))?;

    tracing::debug!(path = %path.display(), shape = ?data.shape(), bytes = bytes.len(), "chunk written");
    Ok(path)
}

/// Read a chunk file.
pub fn read_chunk(path: &Path) -> AppResult<Array4<u16>> {
    let mut bytes = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| storage_error(path, "reading", e))?;
    decode_chunk(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_names_are_zero_padded() {
        let dir = Path::new("/data/original");
        assert_eq!(chunk_path(dir, 0), dir.join("0000.stack"));
        assert_eq!(chunk_path(dir, 12), dir.join("0012.stack"));
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let data = Array4::from_shape_fn((2, 3, 4, 5), |(v, p, y, x)| {
            (v * 1000 + p * 100 + y * 10 + x) as u16
        });
        let path = write_chunk(dir.path(), 7, data.view()).unwrap();
        assert_eq!(path.file_name().unwrap(), "0007.stack");
        assert!(!dir.path().join("0007.stack.partial").exists());
        assert_eq!(read_chunk(&path).unwrap(), data);
    }

    #[test]
    fn test_rejects_foreign_and_truncated_files() {
        assert!(matches!(
            decode_chunk(b"not a chunk at all, definitely not one"),
            Err(DslmError::Storage(_))
        ));

        let data = Array4::<u16>::ones((1, 2, 2, 2));
        let mut bytes = encode_chunk(data.view());
        bytes.truncate(bytes.len() - 3);
        assert!(decode_chunk(&bytes).is_err());
    }

    #[test]
    fn test_missing_directory_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let data = Array4::<u16>::zeros((1, 1, 2, 2));
        assert!(matches!(
            write_chunk(&missing, 0, data.view()),
            Err(DslmError::Storage(_))
        ));
    }
}
