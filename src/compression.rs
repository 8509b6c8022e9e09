//! Streaming LZ4 block codec
//!
//! Blocks are written and read as streams so that multi-gigabyte files never
//! have to fit in memory. Each stored block starts with a fixed header:
//!
//! - 4-byte magic: `SBLZ` (LZ4 frame follows) or `SBRW` (raw bytes follow)
//! - little-endian `u64` logical (uncompressed) size
//!
//! ## Compression Strategies
//!
//! - **None**: every block is stored raw
//! - **Fast**: LZ4 for every block of at least 1 KiB (default)
//! - **Adaptive**: LZ4 above a size threshold, skipping formats that are
//!   already compressed (archives, media)
//!
//! ## Examples
//!
//! ```rust
//! use strata::compression::{BlockDecoder, BlockEncoder, CompressionEngine, CompressionStrategy};
//! use std::io::{Read, Write};
//! use std::path::Path;
//!
//! let engine = CompressionEngine::new(CompressionStrategy::Fast);
//! let data = b"texture data ".repeat(200);
//!
//! let mut encoder = engine.encoder(Vec::new(), Path::new("tex.dds"), data.len() as u64).unwrap();
//! encoder.write_all(&data).unwrap();
//! let stored = encoder.finish().unwrap();
//!
//! let (mut decoder, size) = BlockDecoder::open(&stored[..]).unwrap();
//! let mut out = Vec::new();
//! decoder.read_to_end(&mut out).unwrap();
//! assert_eq!(size, data.len() as u64);
//! assert_eq!(out, data);
//! ```

use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Magic for LZ4 frame payloads
pub const LZ4_MAGIC: &[u8; 4] = b"SBLZ";
/// Magic for raw payloads
pub const RAW_MAGIC: &[u8; 4] = b"SBRW";
/// Header length: magic + logical size
pub const HEADER_LEN: u64 = 12;

/// Blocks smaller than this are never compressed
const MIN_COMPRESS_SIZE: u64 = 1024;

/// When blocks are compressed
///
/// # Examples
///
/// ```rust
/// use strata::compression::{default_skip_extensions, CompressionStrategy};
///
/// let adaptive = CompressionStrategy::Adaptive {
///     min_size: 4096,
///     skip_extensions: default_skip_extensions(),
/// };
/// assert!(!adaptive.should_compress(std::path::Path::new("music.ogg"), 1 << 20));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionStrategy {
    /// Store everything raw
    None,
    /// LZ4 for every block of at least 1 KiB
    Fast,
    /// LZ4 above `min_size`, except for the listed extensions
    Adaptive {
        /// Skip compression for blocks smaller than this
        min_size: u64,
        /// Skip these file extensions (already compressed)
        skip_extensions: Vec<String>,
    },
}

impl Default for CompressionStrategy {
    fn default() -> Self {
        CompressionStrategy::Fast
    }
}

impl CompressionStrategy {
    /// Decide whether a block for `path` of `size` bytes gets compressed
    pub fn should_compress(&self, path: &Path, size: u64) -> bool {
        match self {
            CompressionStrategy::None => false,
            CompressionStrategy::Fast => size >= MIN_COMPRESS_SIZE,
            CompressionStrategy::Adaptive { min_size, skip_extensions } => {
                if size < (*min_size).max(MIN_COMPRESS_SIZE) {
                    return false;
                }
                match path.extension().and_then(|e| e.to_str()) {
                    Some(ext) => !skip_extensions.iter().any(|skip| skip.eq_ignore_ascii_case(ext)),
                    None => true,
                }
            }
        }
    }
}

/// Counters shared by every writer of one store
#[derive(Debug, Default)]
pub struct CompressionStats {
    blocks_compressed: AtomicU64,
    blocks_raw: AtomicU64,
}

impl CompressionStats {
    /// Blocks written through LZ4
    pub fn blocks_compressed(&self) -> u64 {
        self.blocks_compressed.load(Ordering::Relaxed)
    }

    /// Blocks written raw
    pub fn blocks_raw(&self) -> u64 {
        self.blocks_raw.load(Ordering::Relaxed)
    }
}

/// Picks a block format per payload and hands out encoders
#[derive(Debug, Default)]
pub struct CompressionEngine {
    strategy: CompressionStrategy,
    stats: CompressionStats,
}

impl CompressionEngine {
    /// Create an engine with the given strategy
    pub fn new(strategy: CompressionStrategy) -> Self {
        Self {
            strategy,
            stats: CompressionStats::default(),
        }
    }

    /// Active strategy
    pub fn strategy(&self) -> &CompressionStrategy {
        &self.strategy
    }

    /// Write counters
    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    /// Start a block for `path` with `size` logical bytes, writing the header into `writer`
    pub fn encoder<W: Write>(&self, mut writer: W, path: &Path, size: u64) -> io::Result<BlockEncoder<W>> {
        if self.strategy.should_compress(path, size) {
            trace!("Compressing block for {:?} ({} bytes)", path, size);
            writer.write_all(LZ4_MAGIC)?;
            writer.write_all(&size.to_le_bytes())?;
            self.stats.blocks_compressed.fetch_add(1, Ordering::Relaxed);
            Ok(BlockEncoder::Lz4(FrameEncoder::new(writer)))
        } else {
            writer.write_all(RAW_MAGIC)?;
            writer.write_all(&size.to_le_bytes())?;
            self.stats.blocks_raw.fetch_add(1, Ordering::Relaxed);
            Ok(BlockEncoder::Raw(writer))
        }
    }
}

/// Payload writer for a block whose header is already written
pub enum BlockEncoder<W: Write> {
    /// Bytes pass through unchanged
    Raw(W),
    /// Bytes are LZ4 framed
    Lz4(FrameEncoder<W>),
}

impl<W: Write> BlockEncoder<W> {
    /// Whether the payload is compressed
    #[cfg(test)]
    pub(crate) fn is_compressed(&self) -> bool {
        matches!(self, BlockEncoder::Lz4(_))
    }

    /// Flush the frame trailer and hand back the inner writer
    pub fn finish(self) -> io::Result<W> {
        match self {
            BlockEncoder::Raw(w) => Ok(w),
            BlockEncoder::Lz4(enc) => enc
                .finish()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}

impl<W: Write> Write for BlockEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BlockEncoder::Raw(w) => w.write(buf),
            BlockEncoder::Lz4(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BlockEncoder::Raw(w) => w.flush(),
            BlockEncoder::Lz4(enc) => enc.flush(),
        }
    }
}

/// Payload reader for a stored block
pub enum BlockDecoder<R: Read> {
    /// Raw payload
    Raw(R),
    /// LZ4 framed payload
    Lz4(FrameDecoder<R>),
}

impl<R: Read> BlockDecoder<R> {
    /// Parse the header from `reader` and return a decoder plus the logical size
    pub fn open(mut reader: R) -> io::Result<(Self, u64)> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        let mut size = [0u8; 8];
        reader.read_exact(&mut size)?;
        let size = u64::from_le_bytes(size);

        let decoder = if &magic == LZ4_MAGIC {
            BlockDecoder::Lz4(FrameDecoder::new(reader))
        } else if &magic == RAW_MAGIC {
            BlockDecoder::Raw(reader)
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown block magic {:02x?}", magic),
            ));
        };
        Ok((decoder, size))
    }
}

impl<R: Read> Read for BlockDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BlockDecoder::Raw(r) => r.read(buf),
            BlockDecoder::Lz4(dec) => dec.read(buf),
        }
    }
}

/// Extensions of formats that gain nothing from LZ4
pub fn default_skip_extensions() -> Vec<String> {
    vec![
        // Images
        "jpg", "jpeg", "png", "gif", "webp", "dds", "ktx2",
        // Video and audio
        "mp4", "mkv", "webm", "bik", "mp3", "ogg", "flac", "opus", "wem",
        // Archives and game packages
        "zip", "rar", "7z", "gz", "xz", "zst", "pak", "ba2", "bsa", "vpk",
        // Already compressed
        "lz4", "lzma", "br",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
