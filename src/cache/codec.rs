//! Value Codec and Compression
//!
//! Serializes values to bytes and back, and compresses payloads above a
//! size threshold with one of several algorithms. Decompression failures
//! always surface as errors.

use crate::cache::entry::EntryMetadata;
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub use crate::cache::entry::CompressionAlgorithm;

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Algorithm used when a payload qualifies for compression
    pub algorithm: CompressionAlgorithm,
    /// Payloads must be strictly larger than this to be compressed
    pub threshold_bytes: u64,
    /// Compression level (algorithm-specific)
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Lz4,
            threshold_bytes: 1024, // 1KB
            level: 3,
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data known to expand to at most `max_len` bytes
    ///
    /// Input claiming a larger size is rejected before the output is
    /// allocated, where the format allows it.
    fn decompress_bounded(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>> {
        let decompressed = self.decompress(data)?;
        if decompressed.len() > max_len {
            return Err(size_exceeded(self.algorithm(), decompressed.len(), max_len));
        }
        Ok(decompressed)
    }
}

fn decompress_error(algorithm: CompressionAlgorithm, reason: impl ToString) -> Error {
    Error::Decompress {
        algorithm: algorithm.to_string(),
        reason: reason.to_string(),
    }
}

fn size_exceeded(algorithm: CompressionAlgorithm, claimed: usize, max_len: usize) -> Error {
    decompress_error(
        algorithm,
        format!("payload claims {} bytes, expected at most {}", claimed, max_len),
    )
}

/// Length of the size prefix written by [`Lz4Compressor::compress`]
const LZ4_SIZE_PREFIX_LEN: usize = 4;

/// Pass-through compressor
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 compressor (fast compression)
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::Internal(format!("LZ4 compression failed: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| decompress_error(self.algorithm(), e))
    }

    fn decompress_bounded(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>> {
        if data.len() < LZ4_SIZE_PREFIX_LEN {
            return Err(decompress_error(self.algorithm(), "missing size prefix"));
        }
        let (prefix, block) = data.split_at(LZ4_SIZE_PREFIX_LEN);
        let claimed = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if claimed > max_len {
            return Err(size_exceeded(self.algorithm(), claimed, max_len));
        }
        let size = i32::try_from(claimed).map_err(|e| decompress_error(self.algorithm(), e))?;
        lz4::block::decompress(block, Some(size)).map_err(|e| decompress_error(self.algorithm(), e))
    }
}

/// Zstd compressor (balanced compression)
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Compressor for ZstdCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Zstd
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::encode_all(data, self.level)
            .map_err(|e| Error::Internal(format!("Zstd compression failed: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| decompress_error(self.algorithm(), e))
    }

    fn decompress_bounded(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(data, max_len).map_err(|e| decompress_error(self.algorithm(), e))
    }
}

/// Snappy compressor (very fast, lower ratio)
pub struct SnappyCompressor;

impl Compressor for SnappyCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Snappy
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::Internal(format!("Snappy compression failed: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| decompress_error(self.algorithm(), e))
    }

    fn decompress_bounded(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>> {
        let claimed =
            snap::raw::decompress_len(data).map_err(|e| decompress_error(self.algorithm(), e))?;
        if claimed > max_len {
            return Err(size_exceeded(self.algorithm(), claimed, max_len));
        }
        self.decompress(data)
    }
}

// =============================================================================
// Encoded Payload
// =============================================================================

/// A value ready for storage
#[derive(Debug, Clone)]
pub struct EncodedValue {
    /// The decoded form kept by the local tier
    pub value: Value,
    /// Bytes for the remote tier (compressed when `algorithm != None`)
    pub bytes: Bytes,
    /// Size of the serialized value before compression
    pub encoded_size: u64,
    pub algorithm: CompressionAlgorithm,
}

impl EncodedValue {
    pub fn is_compressed(&self) -> bool {
        self.algorithm != CompressionAlgorithm::None
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Serialization plus threshold-driven compression
pub struct Codec {
    config: CompressionConfig,
    lz4: Lz4Compressor,
    zstd: ZstdCompressor,
    snappy: SnappyCompressor,
    noop: NoopCompressor,
}

impl Codec {
    /// Create with custom config
    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            lz4: Lz4Compressor::with_level(config.level),
            zstd: ZstdCompressor::with_level(config.level),
            snappy: SnappyCompressor,
            noop: NoopCompressor,
            config,
        }
    }

    /// Get compressor for algorithm
    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Lz4 => &self.lz4,
            CompressionAlgorithm::Zstd => &self.zstd,
            CompressionAlgorithm::Snappy => &self.snappy,
        }
    }

    /// Convert a typed value to its decoded JSON form
    pub fn to_value<T: Serialize>(&self, key: &str, value: &T) -> Result<Value> {
        serde_json::to_value(value).map_err(|e| Error::Encode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Convert a decoded JSON form back to a typed value
    pub fn from_value<T: DeserializeOwned>(&self, key: &str, value: &Value) -> Result<T> {
        T::deserialize(value).map_err(|e| Error::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Deterministic serialization of a decoded value
    pub fn encode(&self, key: &str, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Encode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Reverse of [`Codec::encode`]
    pub fn decode(&self, key: &str, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Compress with the configured algorithm
    ///
    /// Returns the input untouched (with `CompressionAlgorithm::None`) when
    /// compression does not shrink it or fails.
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        let algorithm = self.config.algorithm;
        if algorithm == CompressionAlgorithm::None {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.compressor(algorithm).compress(data) {
            Ok(compressed) if compressed.len() < data.len() => (Bytes::from(compressed), algorithm),
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                warn!(algorithm = %algorithm, error = %e, "Compression failed, storing uncompressed");
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Decompress data produced by `algorithm`
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        let decompressed = self.compressor(algorithm).decompress(data)?;
        Ok(Bytes::from(decompressed))
    }

    /// Decompress data produced by `algorithm`, refusing output over `max_len` bytes
    pub fn decompress_bounded(
        &self,
        data: &[u8],
        algorithm: CompressionAlgorithm,
        max_len: usize,
    ) -> Result<Bytes> {
        let decompressed = self.compressor(algorithm).decompress_bounded(data, max_len)?;
        Ok(Bytes::from(decompressed))
    }

    /// Encode a value for both tiers, compressing when allowed and above threshold
    pub fn encode_for_storage<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        allow_compression: bool,
    ) -> Result<EncodedValue> {
        let value = self.to_value(key, value)?;
        let encoded = self.encode(key, &value)?;
        let encoded_size = encoded.len() as u64;

        let (bytes, algorithm) = if allow_compression && encoded_size > self.config.threshold_bytes {
            self.compress(&encoded)
        } else {
            (Bytes::from(encoded), CompressionAlgorithm::None)
        };

        Ok(EncodedValue {
            value,
            bytes,
            encoded_size,
            algorithm,
        })
    }

    /// Decode a remote payload, decompressing first when its metadata says so
    ///
    /// The recorded `original_size` caps the decompressed length.
    pub fn decode_from_storage(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &EntryMetadata,
    ) -> Result<Value> {
        if metadata.compressed {
            let max_len = usize::try_from(metadata.original_size)
                .map_err(|e| decompress_error(metadata.algorithm, e))?;
            let raw = self.decompress_bounded(bytes, metadata.algorithm, max_len)?;
            self.decode(key, &raw)
        } else {
            self.decode(key, bytes)
        }
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::with_config(CompressionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    fn codec(algorithm: CompressionAlgorithm, threshold_bytes: u64) -> Codec {
        Codec::with_config(CompressionConfig {
            algorithm,
            threshold_bytes,
            level: 3,
        })
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Product {
        id: u64,
        name: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_compressor_roundtrips() {
        let compressors: Vec<Box<dyn Compressor>> = vec![
            Box::new(Lz4Compressor::with_level(4)),
            Box::new(ZstdCompressor::with_level(3)),
            Box::new(SnappyCompressor),
        ];

        for compressor in compressors {
            let compressed = compressor.compress(TEST_DATA).unwrap();
            assert!(compressed.len() < TEST_DATA.len(), "{} did not shrink", compressor.algorithm());
            assert_eq!(compressor.decompress(&compressed).unwrap(), TEST_DATA);
        }
    }

    #[test]
    fn test_full_pipeline_roundtrip() {
        let codec = codec(CompressionAlgorithm::Zstd, 16);
        let product = Product {
            id: 7,
            name: "widget ".repeat(50),
            tags: vec!["a".into(), "b".into()],
        };

        let encoded = codec.encode_for_storage("p", &product, true).unwrap();
        assert!(encoded.is_compressed());

        let mut metadata = EntryMetadata::new(60, encoded.encoded_size);
        metadata.compressed = true;
        metadata.algorithm = encoded.algorithm;

        let value = codec.decode_from_storage("p", &encoded.bytes, &metadata).unwrap();
        let decoded: Product = codec.from_value("p", &value).unwrap();
        assert_eq!(decoded, product);
    }

    #[test]
    fn test_threshold_is_strict() {
        let value = json!("x".repeat(100));
        let size = serde_json::to_vec(&value).unwrap().len() as u64;

        let at_threshold = codec(CompressionAlgorithm::Lz4, size);
        assert!(!at_threshold.encode_for_storage("k", &value, true).unwrap().is_compressed());

        let below = codec(CompressionAlgorithm::Lz4, size - 1);
        assert!(below.encode_for_storage("k", &value, true).unwrap().is_compressed());
    }

    #[test]
    fn test_compression_flag_respected() {
        let codec = codec(CompressionAlgorithm::Lz4, 0);
        let encoded = codec.encode_for_storage("k", &json!("y".repeat(500)), false).unwrap();
        assert!(!encoded.is_compressed());
        assert_eq!(encoded.bytes.len() as u64, encoded.encoded_size);
    }

    #[test]
    fn test_corrupt_payload_is_an_error() {
        let codec = codec(CompressionAlgorithm::Lz4, 0);
        let mut metadata = EntryMetadata::new(60, 100);
        metadata.compressed = true;
        metadata.algorithm = CompressionAlgorithm::Lz4;

        let result = codec.decode_from_storage("k", b"\x10\x00\x00\x00garbage", &metadata);
        assert_matches!(result, Err(Error::Decompress { .. }));
    }

    #[test]
    fn test_type_mismatch_is_decode_error() {
        let codec = Codec::default();
        let result: Result<u64> = codec.from_value("k", &json!("not a number"));
        assert_matches!(result, Err(Error::Decode { .. }));
    }

    #[test]
    fn test_incompressible_data_stays_raw() {
        let codec = codec(CompressionAlgorithm::Lz4, 0);
        // 64 distinct bytes: no repeated run for LZ4 to match
        let data: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(37)).collect();
        assert!(Lz4Compressor::with_level(3).compress(&data).unwrap().len() >= data.len());

        let (result, algorithm) = codec.compress(&data);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(result.as_ref(), data.as_slice());
    }

    #[test]
    fn test_oversized_claim_is_rejected() {
        let mut metadata = EntryMetadata::new(60, 100);
        metadata.compressed = true;

        // LZ4 prefix claiming ~2 GiB
        metadata.algorithm = CompressionAlgorithm::Lz4;
        let lz4 = codec(CompressionAlgorithm::Lz4, 0);
        let result = lz4.decode_from_storage("k", b"\xff\xff\xff\x7fgarbage", &metadata);
        assert_matches!(result, Err(Error::Decompress { .. }));

        // Real payloads larger than the recorded size
        let big = "z".repeat(4096);
        for algorithm in [
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Snappy,
        ] {
            let codec = codec(algorithm, 0);
            let encoded = codec.encode_for_storage("k", &big, true).unwrap();
            assert!(encoded.is_compressed(), "{} did not compress", algorithm);

            metadata.algorithm = algorithm;
            let result = codec.decode_from_storage("k", &encoded.bytes, &metadata);
            assert_matches!(result, Err(Error::Decompress { .. }), "{} accepted oversized output", algorithm);

            let bounded = codec
                .decompress_bounded(&encoded.bytes, algorithm, encoded.encoded_size as usize)
                .unwrap();
            assert_eq!(bounded.len() as u64, encoded.encoded_size);
        }
    }
}
