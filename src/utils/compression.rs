//! Magic-tagged compression containers.
//!
//! Four containers appear inside multi-message bodies:
//!
//! ```text
//! LZMA  ['L''Z''M''A'][size u32][compressed u32][props; 5][stream]
//! VZip  ['V''Z''a'][crc u32][props; 5][stream][crc u32][size u32]['z''v']
//! VZstd ['V''S''Z''a'][crc u32][zstd frame][crc u32][size u32][reserved u32]['z''s''v']
//! Gzip  [0x1F 0x8B ...] (RFC 1952, integrity by its own trailer)
//! ```
//!
//! All integers are little-endian. Every decoder enforces
//! [`MAX_DECOMPRESSION_SIZE`] before and while inflating.

use std::io::{Read, Write};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{constants, ProtocolError, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionKind {
    Lzma,
    VZip,
    VZstd,
    Gzip,
}

/// Maximum output size for decompression (align with MAX_PAYLOAD_SIZE to prevent DoS)
pub const MAX_DECOMPRESSION_SIZE: usize = MAX_PAYLOAD_SIZE;

const LZMA_MAGIC: &[u8; 4] = b"LZMA";
const LZMA_HEADER_LEN: usize = 12;
const LZMA_PROPS_LEN: usize = 5;

const VZIP_MAGIC: &[u8; 3] = b"VZa";
const VZIP_FOOTER_MAGIC: &[u8; 2] = b"zv";
const VZIP_HEADER_LEN: usize = 7;
const VZIP_FOOTER_LEN: usize = 10;

const VZSTD_MAGIC: &[u8; 4] = b"VSZa";
const VZSTD_FOOTER_MAGIC: &[u8; 3] = b"zsv";
const VZSTD_HEADER_LEN: usize = 8;
const VZSTD_FOOTER_LEN: usize = 15;

const GZIP_MAGIC: &[u8; 2] = &[0x1F, 0x8B];

const ZSTD_LEVEL: i32 = 3;

impl CompressionKind {
    /// Identify a container from its leading bytes.
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(LZMA_MAGIC) {
            Some(CompressionKind::Lzma)
        } else if data.starts_with(VZSTD_MAGIC) {
            Some(CompressionKind::VZstd)
        } else if data.starts_with(VZIP_MAGIC) {
            Some(CompressionKind::VZip)
        } else if data.starts_with(GZIP_MAGIC) {
            Some(CompressionKind::Gzip)
        } else {
            None
        }
    }
}

#[inline]
fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn check_size(size: usize) -> Result<()> {
    if size > MAX_DECOMPRESSION_SIZE {
        return Err(ProtocolError::DecompressionFailure(format!(
            "declared size {size} exceeds limit"
        )));
    }
    Ok(())
}

fn verify_crc(expected: u32, data: &[u8]) -> Result<()> {
    let actual = crc32fast::hash(data);
    if actual != expected {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Raw LZMA stream preceded by its 5 property bytes, no size field, with end marker.
fn lzma_encode(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let options = lzma_rs::compress::Options {
        unpacked_size: lzma_rs::compress::UnpackedSize::SkipWritingToHeader,
    };
    lzma_rs::lzma_compress_with_options(&mut &data[..], &mut out, &options)
        .map_err(|_| ProtocolError::CompressionFailure)?;
    Ok(out)
}

/// Decode props + stream, stopping after `size` bytes of output.
fn lzma_decode(props_and_stream: &[u8], size: usize) -> Result<Vec<u8>> {
    check_size(size)?;
    let mut out = Vec::with_capacity(size);
    let options = lzma_rs::decompress::Options {
        unpacked_size: lzma_rs::decompress::UnpackedSize::UseProvided(Some(size as u64)),
        memlimit: Some(MAX_DECOMPRESSION_SIZE),
        ..Default::default()
    };
    lzma_rs::lzma_decompress_with_options(&mut &props_and_stream[..], &mut out, &options)
        .map_err(|e| ProtocolError::DecompressionFailure(e.to_string()))?;
    if out.len() != size {
        return Err(ProtocolError::DecompressionFailure(format!(
            "expected {size} bytes, produced {}",
            out.len()
        )));
    }
    Ok(out)
}

/// Inflate through a reader, refusing to produce more than the limit.
fn read_limited<R: Read>(reader: R) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take(MAX_DECOMPRESSION_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::DecompressionFailure(e.to_string()))?;
    if out.len() > MAX_DECOMPRESSION_SIZE {
        return Err(ProtocolError::DecompressionFailure(
            "output exceeds decompression limit".to_string(),
        ));
    }
    Ok(out)
}

/// Compresses data into the given container.
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if the encoder fails
pub fn compress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    let crc = crc32fast::hash(data);
    match kind {
        CompressionKind::Lzma => {
            let encoded = lzma_encode(data)?;
            let mut out = Vec::with_capacity(LZMA_HEADER_LEN + encoded.len());
            out.extend_from_slice(LZMA_MAGIC);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&((encoded.len() - LZMA_PROPS_LEN) as u32).to_le_bytes());
            out.extend_from_slice(&encoded);
            Ok(out)
        }
        CompressionKind::VZip => {
            let encoded = lzma_encode(data)?;
            let mut out = Vec::with_capacity(VZIP_HEADER_LEN + encoded.len() + VZIP_FOOTER_LEN);
            out.extend_from_slice(VZIP_MAGIC);
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&encoded);
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(VZIP_FOOTER_MAGIC);
            Ok(out)
        }
        CompressionKind::VZstd => {
            let frame = zstd::stream::encode_all(data, ZSTD_LEVEL)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            let mut out = Vec::with_capacity(VZSTD_HEADER_LEN + frame.len() + VZSTD_FOOTER_LEN);
            out.extend_from_slice(VZSTD_MAGIC);
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&frame);
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(VZSTD_FOOTER_MAGIC);
            Ok(out)
        }
        CompressionKind::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            encoder.finish().map_err(|_| ProtocolError::CompressionFailure)
        }
    }
}

/// Decompresses a container of the given kind.
///
/// # Errors
/// - `ProtocolError::ChecksumMismatch` if a stored CRC32 does not match the output
/// - `ProtocolError::DecompressionFailure` if the container is malformed or the
///   output would exceed [`MAX_DECOMPRESSION_SIZE`]
pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lzma => {
            if data.len() < LZMA_HEADER_LEN + LZMA_PROPS_LEN || !data.starts_with(LZMA_MAGIC) {
                return Err(ProtocolError::DecompressionFailure("short LZMA container".into()));
            }
            let size = le_u32(data, 4) as usize;
            let compressed = le_u32(data, 8) as usize;
            let body = &data[LZMA_HEADER_LEN..];
            if compressed > body.len() - LZMA_PROPS_LEN {
                return Err(ProtocolError::Truncated {
                    needed: compressed + LZMA_PROPS_LEN,
                    available: body.len(),
                });
            }
            lzma_decode(&body[..LZMA_PROPS_LEN + compressed], size)
        }
        CompressionKind::VZip => {
            if data.len() < VZIP_HEADER_LEN + LZMA_PROPS_LEN + VZIP_FOOTER_LEN
                || !data.starts_with(VZIP_MAGIC)
            {
                return Err(ProtocolError::DecompressionFailure("short VZip container".into()));
            }
            let footer = data.len() - VZIP_FOOTER_LEN;
            if &data[data.len() - 2..] != VZIP_FOOTER_MAGIC {
                return Err(ProtocolError::DecompressionFailure(
                    constants::ERR_BAD_FOOTER.to_string(),
                ));
            }
            let crc = le_u32(data, footer);
            let size = le_u32(data, footer + 4) as usize;
            let out = lzma_decode(&data[VZIP_HEADER_LEN..footer], size)?;
            verify_crc(crc, &out)?;
            Ok(out)
        }
        CompressionKind::VZstd => {
            if data.len() < VZSTD_HEADER_LEN + VZSTD_FOOTER_LEN || !data.starts_with(VZSTD_MAGIC) {
                return Err(ProtocolError::DecompressionFailure("short VZstd container".into()));
            }
            let footer = data.len() - VZSTD_FOOTER_LEN;
            if &data[data.len() - 3..] != VZSTD_FOOTER_MAGIC {
                return Err(ProtocolError::DecompressionFailure(
                    constants::ERR_BAD_FOOTER.to_string(),
                ));
            }
            let header_crc = le_u32(data, 4);
            let footer_crc = le_u32(data, footer);
            if header_crc != footer_crc {
                return Err(ProtocolError::ChecksumMismatch {
                    expected: header_crc,
                    actual: footer_crc,
                });
            }
            let size = le_u32(data, footer + 4) as usize;
            check_size(size)?;

            let decoder = zstd::stream::Decoder::new(&data[VZSTD_HEADER_LEN..footer])
                .map_err(|e| ProtocolError::DecompressionFailure(e.to_string()))?;
            let out = read_limited(decoder)?;
            if out.len() != size {
                return Err(ProtocolError::DecompressionFailure(format!(
                    "expected {size} bytes, produced {}",
                    out.len()
                )));
            }
            verify_crc(header_crc, &out)?;
            Ok(out)
        }
        CompressionKind::Gzip => read_limited(flate2::read::GzDecoder::new(data)),
    }
}

/// Decompress a container identified by its magic.
pub fn decompress_detected(data: &[u8]) -> Result<Vec<u8>> {
    let kind = CompressionKind::detect(data).ok_or_else(|| {
        ProtocolError::DecompressionFailure(constants::ERR_UNKNOWN_COMPRESSION.to_string())
    })?;
    decompress(data, kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample() -> Vec<u8> {
        b"multi message body, repeated enough to compress. "
            .iter()
            .copied()
            .cycle()
            .take(4096)
            .collect()
    }

    #[rstest]
    #[case(CompressionKind::Lzma)]
    #[case(CompressionKind::VZip)]
    #[case(CompressionKind::VZstd)]
    #[case(CompressionKind::Gzip)]
    #[allow(clippy::unwrap_used)]
    fn test_container_roundtrip(#[case] kind: CompressionKind) {
        let data = sample();
        let packed = compress(&data, kind).unwrap();
        assert_eq!(CompressionKind::detect(&packed), Some(kind));
        assert_eq!(decompress_detected(&packed).unwrap(), data);
    }

    #[rstest]
    #[case(CompressionKind::VZip)]
    #[case(CompressionKind::VZstd)]
    #[allow(clippy::unwrap_used)]
    fn test_footer_crc_mismatch_detected(#[case] kind: CompressionKind) {
        let mut packed = compress(&sample(), kind).unwrap();
        let footer = packed.len()
            - match kind {
                CompressionKind::VZip => VZIP_FOOTER_LEN,
                _ => VZSTD_FOOTER_LEN,
            };
        packed[footer] ^= 0xFF;
        let err = decompress(&packed, kind).unwrap_err();
        assert!(matches!(err, ProtocolError::ChecksumMismatch { .. }));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_declared_size_over_limit_rejected() {
        let mut packed = compress(b"small", CompressionKind::Lzma).unwrap();
        packed[4..8].copy_from_slice(&((MAX_DECOMPRESSION_SIZE + 1) as u32).to_le_bytes());
        let err = decompress(&packed, CompressionKind::Lzma).unwrap_err();
        assert!(matches!(err, ProtocolError::DecompressionFailure(_)));
    }

    #[test]
    fn test_unknown_magic() {
        assert_eq!(CompressionKind::detect(b"PK\x03\x04"), None);
        assert!(decompress_detected(b"nope").is_err());
        assert!(decompress(b"VZa", CompressionKind::VZip).is_err());
    }
}
