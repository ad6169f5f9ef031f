//! Block-wise MD5 checksummer.
//!
//! Streams a file in fixed-size chunks, producing a `checksums` sidecar with
//! one line per chunk (decimal byte offset, length and MD5 hex, in ascending
//! offset order) alongside the whole-file MD5. Memory use is bounded by the
//! read buffer, not the chunk size.

use md5::{Digest, Md5};
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Streaming read buffer size (64 KiB).
const IO_CHUNK_SIZE: usize = 64 * 1024;

/// Checksummer failure kinds.
#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("checksum I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source disappeared mid-stream: {0}")]
    SourceMissing(String),

    #[error("checksumming cancelled")]
    Cancelled,

    #[error("malformed checksum record: {0}")]
    MalformedRecord(String),
}

/// Result type for checksummer operations.
pub type ChecksumResult<T> = std::result::Result<T, ChecksumError>;

/// One line of the checksum sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkChecksum {
    pub offset: u64,
    pub length: u64,
    pub md5: String,
}

/// The exact byte size of the sidecar a file of `data_size` bytes produces.
///
/// Each record is `<offset> <length> <md5>\n` with a 32-character digest and
/// two separating spaces, so the size is fully determined by the decimal
/// widths of the offsets and lengths.
pub fn checksum_file_size(data_size: u64, chunk_size: u64) -> u64 {
    assert!(chunk_size > 0);

    let mut total = 0u64;
    let mut offset = 0u64;
    while offset < data_size {
        let length = chunk_size.min(data_size - offset);
        total += decimal_width(offset) + 1 + decimal_width(length) + 1 + 32 + 1;
        offset += length;
    }
    total
}

fn decimal_width(n: u64) -> u64 {
    if n == 0 { 1 } else { n.ilog10() as u64 + 1 }
}

/// Checksum `data_path` in `chunk_size` blocks, writing the sidecar to
/// `sidecar_path` atomically (temp-and-rename) and returning the whole-file
/// MD5 hex digest.
pub async fn compute(
    data_path: &Path,
    sidecar_path: &Path,
    chunk_size: u64,
    cancel: &CancellationToken,
) -> ChecksumResult<String> {
    assert!(chunk_size > 0);

    let mut file = fs::File::open(data_path).await.map_err(|e| missing(data_path, e))?;
    let mut whole = Md5::new();
    let mut records = String::new();

    let mut offset = 0u64;
    let mut buf = vec![0u8; IO_CHUNK_SIZE];
    'chunks: loop {
        if cancel.is_cancelled() {
            return Err(ChecksumError::Cancelled);
        }

        let mut chunk = Md5::new();
        let mut chunk_len = 0u64;
        while chunk_len < chunk_size {
            let want = IO_CHUNK_SIZE.min((chunk_size - chunk_len) as usize);
            let n = file
                .read(&mut buf[..want])
                .await
                .map_err(|e| missing(data_path, e))?;
            if n == 0 {
                if chunk_len > 0 {
                    push_record(&mut records, offset, chunk_len, chunk);
                }
                break 'chunks;
            }
            chunk.update(&buf[..n]);
            whole.update(&buf[..n]);
            chunk_len += n as u64;
        }

        if chunk_len == chunk_size {
            push_record(&mut records, offset, chunk_len, chunk);
            offset += chunk_len;
        }
    }

    // Temp-and-rename so a reader never sees a partial sidecar
    let temp_path = sidecar_path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    let mut temp = fs::File::create(&temp_path).await?;
    temp.write_all(records.as_bytes()).await?;
    temp.flush().await?;
    drop(temp);
    fs::rename(&temp_path, sidecar_path).await?;

    Ok(format!("{:x}", whole.finalize()))
}

fn push_record(records: &mut String, offset: u64, length: u64, chunk: Md5) {
    use std::fmt::Write;
    writeln!(records, "{offset} {length} {:x}", chunk.finalize()).expect("write to string");
}

fn missing(path: &Path, e: std::io::Error) -> ChecksumError {
    if e.kind() == ErrorKind::NotFound {
        ChecksumError::SourceMissing(path.display().to_string())
    } else {
        ChecksumError::Io(e)
    }
}

/// Read the chunk table back from a sidecar file.
pub async fn read_sidecar(path: &Path) -> ChecksumResult<Vec<ChunkChecksum>> {
    let contents = fs::read_to_string(path).await.map_err(|e| missing(path, e))?;

    let mut table = Vec::new();
    for line in contents.lines() {
        let mut fields = line.split_ascii_whitespace();
        let record = (|| {
            let offset = fields.next()?.parse().ok()?;
            let length = fields.next()?.parse().ok()?;
            let md5 = fields.next()?;
            if fields.next().is_some() || md5.len() != 32 {
                return None;
            }
            Some(ChunkChecksum {
                offset,
                length,
                md5: md5.to_string(),
            })
        })()
        .ok_or_else(|| ChecksumError::MalformedRecord(line.to_string()))?;
        table.push(record);
    }
    Ok(table)
}
