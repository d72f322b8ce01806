//! Record batch compression.
//!
//! Codec ids follow the commit-log attribute convention (0 none, 1 gzip,
//! 2 snappy, 3 lz4) so a batch header carries its codec in one byte.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Gzip compression level (0-9).
const GZIP_LEVEL: u32 = 6;

/// Compression codec applied to a record batch payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionCodec {
    None = 0,
    Gzip = 1,
    /// Fast with a moderate ratio; the client default.
    #[default]
    Snappy = 2,
    Lz4 = 3,
}

impl CompressionCodec {
    /// Codec for a header byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Snappy),
            3 => Some(Self::Lz4),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Codec name used in configuration and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
        }
    }

    /// Parse a codec from its configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "none" | "" => Some(Self::None),
            "gzip" | "gz" => Some(Self::Gzip),
            "snappy" => Some(Self::Snappy),
            "lz4" => Some(Self::Lz4),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| Error::Config(format!("unknown compression codec: {}", s)))
    }
}

/// Compress `data` with `codec`.
pub fn compress(data: &[u8], codec: CompressionCodec) -> Result<Vec<u8>> {
    match codec {
        CompressionCodec::None => Ok(data.to_vec()),
        CompressionCodec::Gzip => compress_gzip(data),
        CompressionCodec::Snappy => compress_snappy(data),
        CompressionCodec::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
    }
}

/// Decompress `data` that was compressed with `codec`.
pub fn decompress(data: &[u8], codec: CompressionCodec) -> Result<Vec<u8>> {
    match codec {
        CompressionCodec::None => Ok(data.to_vec()),
        CompressionCodec::Gzip => decompress_gzip(data),
        CompressionCodec::Snappy => decompress_snappy(data),
        CompressionCodec::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::Serialization(format!("lz4 decompression failed: {}", e))),
    }
}

fn compress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Encoder::new()
        .compress_vec(data)
        .map_err(|e| Error::Serialization(format!("snappy compression failed: {}", e)))
}

fn decompress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(|e| Error::Serialization(format!("snappy decompression failed: {}", e)))
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(GZIP_LEVEL));
    encoder
        .write_all(data)
        .map_err(|e| Error::Serialization(format!("gzip compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Serialization(format!("gzip finish failed: {}", e)))
}

fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;

    let mut output = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut output)
        .map_err(|e| Error::Serialization(format!("gzip decompression failed: {}", e)))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = br#"{"txHash":"0xabc","amount":"12.50","contributor":"alice"}"#;

    #[test]
    fn test_all_codecs_restore_input() {
        for codec in [
            CompressionCodec::None,
            CompressionCodec::Gzip,
            CompressionCodec::Snappy,
            CompressionCodec::Lz4,
        ] {
            let compressed = compress(SAMPLE, codec).unwrap();
            assert_eq!(decompress(&compressed, codec).unwrap(), SAMPLE, "{}", codec);
        }
    }

    #[test]
    fn test_repetitive_payload_shrinks() {
        let data = SAMPLE.repeat(64);
        let compressed = compress(&data, CompressionCodec::Snappy).unwrap();
        assert!(compressed.len() < data.len());
    }

    #[test]
    fn test_garbage_fails_with_serialization_error() {
        let err = decompress(b"definitely not gzip", CompressionCodec::Gzip).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_names() {
        assert_eq!(CompressionCodec::from_name("SNAPPY"), Some(CompressionCodec::Snappy));
        assert_eq!(CompressionCodec::from_name("gz"), Some(CompressionCodec::Gzip));
        assert_eq!(CompressionCodec::from_name("zstd"), None);
        assert!("brotli".parse::<CompressionCodec>().is_err());
        assert_eq!(CompressionCodec::default(), CompressionCodec::Snappy);
    }

    #[test]
    fn test_byte_ids() {
        for byte in 0..4u8 {
            let codec = CompressionCodec::from_byte(byte).unwrap();
            assert_eq!(codec.as_byte(), byte);
        }
        assert_eq!(CompressionCodec::from_byte(9), None);
    }
}
