/*!
Compression adapters for backup artifacts.

Database dumps and file archives are gzip streams. The adapter works on
whole buffers (for small payloads such as manifests) and on files, streaming
between them so large dumps never have to fit in memory.
*/

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::{BackstopError, Result};

/// Magic bytes at the start of every gzip stream
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression abstraction for artifact data
pub trait CompressionAdapter {
    /// Compress an in-memory buffer
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress an in-memory buffer
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Compress `src` into `dst`, returning the compressed size
    fn compress_file(&self, src: &Path, dst: &Path) -> Result<u64>;

    /// Decompress `src` into `dst`, returning the decompressed size
    fn decompress_file(&self, src: &Path, dst: &Path) -> Result<u64>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Gzip compression adapter
///
/// # Example
/// ```rust
/// use backstop_core::compression::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::with_level(9);
/// let data = b"INSERT INTO grades VALUES (1, 'A');".repeat(20);
/// let compressed = compressor.compress(&data)?;
/// assert_eq!(compressor.decompress(&compressed)?, data);
/// # Ok::<(), backstop_core::BackstopError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level
    ///
    /// Levels above 9 are clamped.
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    pub fn level(&self) -> u32 {
        self.compression_level.level()
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder.write_all(data).map_err(|e| {
            BackstopError::compression(format!("Failed to write data for compression: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| BackstopError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| BackstopError::compression(format!("Failed to decompress data: {e}")))?;

        Ok(decompressed)
    }

    fn compress_file(&self, src: &Path, dst: &Path) -> Result<u64> {
        let mut input = BufReader::new(File::open(src)?);
        let output = BufWriter::new(File::create(dst)?);
        let mut encoder = GzEncoder::new(output, self.compression_level);

        std::io::copy(&mut input, &mut encoder).map_err(|e| {
            BackstopError::compression(format!("Failed to compress {}: {e}", src.display()))
        })?;
        let mut output = encoder
            .finish()
            .map_err(|e| BackstopError::compression(format!("Failed to finish compression: {e}")))?;
        output.flush()?;

        Ok(std::fs::metadata(dst)?.len())
    }

    fn decompress_file(&self, src: &Path, dst: &Path) -> Result<u64> {
        let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
        let mut output = BufWriter::new(File::create(dst)?);

        let written = std::io::copy(&mut decoder, &mut output).map_err(|e| {
            BackstopError::compression(format!("Failed to decompress {}: {e}", src.display()))
        })?;
        output.flush()?;

        Ok(written)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Decompress at most `limit` bytes from the start of a gzip file
///
/// A truncated stream still yields whatever prefix could be decoded.
pub fn read_gzip_prefix(path: &Path, limit: usize) -> Result<Vec<u8>> {
    let decoder = GzDecoder::new(BufReader::new(File::open(path)?));
    let mut prefix = Vec::with_capacity(limit);
    decoder
        .take(limit as u64)
        .read_to_end(&mut prefix)
        .map_err(|e| BackstopError::compression(format!("Failed to read gzip prefix: {e}")))?;
    Ok(prefix)
}

/// True if `header` starts with the gzip magic number
pub fn is_gzip(header: &[u8]) -> bool {
    header.len() >= 2 && header[..2] == GZIP_MAGIC
}
