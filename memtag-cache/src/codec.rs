//! Payload encoding.
//!
//! Values and tag records share one encoding: the serializer output, framed
//! by a one-byte header saying whether the body is zlib-compressed.

use crate::config::ProviderOptions;
use crate::error::{CacheError, CacheResult};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Serialize, de::DeserializeOwned};
use std::io::{Read, Write};

const FRAME_PLAIN: u8 = 0x00;
const FRAME_ZLIB: u8 = 0x01;

/// Serialization hook used for cached values and tag records.
pub trait Serializer: Send + Sync + 'static {
    /// Serialize a value to bytes.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>>;

    /// Deserialize a value from bytes.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T>;
}

/// JSON serializer backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Deserialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
struct CompressionPolicy {
    threshold: usize,
    min_savings: f64,
}

/// Serializer plus optional compression.
#[derive(Debug, Clone)]
pub struct Codec<S> {
    serializer: S,
    compression: Option<CompressionPolicy>,
}

impl<S: Serializer> Codec<S> {
    /// Build a codec honoring the compression settings in `options`.
    pub fn new(serializer: S, options: &ProviderOptions) -> Self {
        let compression = options.compress.then_some(CompressionPolicy {
            threshold: options.compress_threshold,
            min_savings: options.min_savings,
        });
        Self {
            serializer,
            compression,
        }
    }

    /// Codec that never compresses.
    pub fn plain(serializer: S) -> Self {
        Self {
            serializer,
            compression: None,
        }
    }

    /// Encode a value into a framed payload.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        let body = self.serializer.serialize(value)?;

        if let Some(policy) = self.compression
            && body.len() >= policy.threshold
        {
            let compressed = deflate(&body)?;
            let ceiling = body.len() as f64 * (1.0 - policy.min_savings);
            if (compressed.len() as f64) <= ceiling {
                return Ok(frame(FRAME_ZLIB, compressed));
            }
        }

        Ok(frame(FRAME_PLAIN, body))
    }

    /// Decode a framed payload.
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> CacheResult<T> {
        match payload.split_first() {
            Some((&FRAME_PLAIN, body)) => self.serializer.deserialize(body),
            Some((&FRAME_ZLIB, body)) => self.serializer.deserialize(&inflate(body)?),
            Some((other, _)) => Err(CacheError::Deserialization(format!(
                "unknown payload frame 0x{:02x}",
                other
            ))),
            None => Err(CacheError::Deserialization("empty payload".into())),
        }
    }
}

fn frame(header: u8, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(header);
    out.extend_from_slice(&body);
    out
}

fn deflate(data: &[u8]) -> CacheResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CacheError::Compression(e.to_string()))
}

fn inflate(data: &[u8]) -> CacheResult<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    Ok(out)
}
