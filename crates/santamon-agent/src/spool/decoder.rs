//! Telemetry file decoder
//!
//! A spool file holds either one encoded record or an encoded batch,
//! optionally gzip- or zstd-compressed (detected by magic bytes). Three
//! limits resist decompression bombs: input size, output size, and the
//! expansion ratio. At most two compression layers are peeled; a third
//! aborts.

use crate::config::DecoderConfig;
use bincode::Options;
use santamon_core::telemetry::{TelemetryBatch, TelemetryRecord};
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const MAX_COMPRESSION_DEPTH: usize = 2;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty spool file")]
    EmptyFile,

    #[error("spool file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("failed to read spool file: {0}")]
    Io(#[from] std::io::Error),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("decompressed output exceeds {limit} bytes")]
    DecompressedTooLarge { limit: u64 },

    #[error("decompression bomb suspected: expansion {ratio}x exceeds limit {limit}x")]
    BombSuspected { ratio: u64, limit: u64 },

    #[error("more than {MAX_COMPRESSION_DEPTH} compression layers")]
    DepthExceeded,

    #[error("failed to decode telemetry: {0}")]
    Decode(String),

    #[error("decoding cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Decoder {
    max_file_size: u64,
    max_decompressed_size: u64,
    max_decompression_rate: u64,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(&DecoderConfig::default())
    }
}

impl Decoder {
    pub fn new(cfg: &DecoderConfig) -> Self {
        Self {
            max_file_size: cfg.max_file_size,
            max_decompressed_size: cfg.max_decompressed_size,
            max_decompression_rate: cfg.max_decompression_rate,
        }
    }

    pub fn with_limits(
        max_file_size: u64,
        max_decompressed_size: u64,
        max_decompression_rate: u64,
    ) -> Self {
        Self {
            max_file_size,
            max_decompressed_size,
            max_decompression_rate,
        }
    }

    /// Decode a spool file into zero or more telemetry records.
    pub fn decode_file(&self, path: &Path) -> Result<Vec<TelemetryRecord>, DecodeError> {
        self.decode_file_cancellable(path, &CancellationToken::new())
    }

    pub fn decode_file_cancellable(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<TelemetryRecord>, DecodeError> {
        if cancel.is_cancelled() {
            return Err(DecodeError::Cancelled);
        }

        let meta = std::fs::metadata(path)?;
        if meta.len() == 0 {
            return Err(DecodeError::EmptyFile);
        }
        if meta.len() > self.max_file_size {
            return Err(DecodeError::TooLarge {
                size: meta.len(),
                limit: self.max_file_size,
            });
        }

        let mut data = std::fs::read(path)?;
        if data.is_empty() {
            return Err(DecodeError::EmptyFile);
        }

        for _ in 0..MAX_COMPRESSION_DEPTH {
            if !is_compressed(&data) {
                break;
            }
            data = self.decompress(&data)?;
        }
        if is_compressed(&data) {
            return Err(DecodeError::DepthExceeded);
        }

        if cancel.is_cancelled() {
            return Err(DecodeError::Cancelled);
        }

        self.decode_messages(&data, cancel)
    }

    fn decode_messages(
        &self,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<TelemetryRecord>, DecodeError> {
        // Trailing bytes are rejected so a batch cannot half-parse as a
        // single record.
        let opts = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes();
        let strict = bincode::DefaultOptions::new().with_fixint_encoding();

        if let Ok(record) = strict.deserialize::<TelemetryRecord>(data) {
            return Ok(vec![record]);
        }

        match opts.deserialize::<TelemetryBatch>(data) {
            Ok(batch) => {
                if cancel.is_cancelled() {
                    return Err(DecodeError::Cancelled);
                }
                Ok(batch.records)
            }
            Err(e) => Err(DecodeError::Decode(e.to_string())),
        }
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let reader: Box<dyn Read> = if data.starts_with(&GZIP_MAGIC) {
            Box::new(flate2::read::GzDecoder::new(data))
        } else {
            Box::new(
                zstd::stream::read::Decoder::new(data)
                    .map_err(|e| DecodeError::Decompress(e.to_string()))?,
            )
        };

        // Read one byte past the limit so overflow is detectable.
        let mut out = Vec::new();
        let limit = self.max_decompressed_size;
        reader
            .take(limit + 1)
            .read_to_end(&mut out)
            .map_err(|e| DecodeError::Decompress(e.to_string()))?;

        // The truncated output is a lower bound on the true expansion, so a
        // rate breach observed here is a genuine bomb; otherwise the breach
        // is of the absolute output cap and is reported as such.
        let ratio = (out.len() as u64) / (data.len() as u64).max(1);
        if ratio > self.max_decompression_rate {
            return Err(DecodeError::BombSuspected {
                ratio,
                limit: self.max_decompression_rate,
            });
        }
        if out.len() as u64 > limit {
            return Err(DecodeError::DecompressedTooLarge { limit });
        }

        Ok(out)
    }
}

fn is_compressed(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC) || data.starts_with(&ZSTD_MAGIC)
}

/// Encode a single record the way the sensor publishes it. Test helper and
/// the reference for the wire format.
pub fn encode_record(record: &TelemetryRecord) -> Vec<u8> {
    bincode::serialize(record).expect("record encoding cannot fail")
}

/// Encode a batch of records.
pub fn encode_batch(batch: &TelemetryBatch) -> Vec<u8> {
    bincode::serialize(batch).expect("batch encoding cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use santamon_core::telemetry::{EventPayload, Execution, TelemetryRecord};
    use std::io::Write;

    fn record(machine: &str) -> TelemetryRecord {
        TelemetryRecord {
            machine_id: machine.to_string(),
            boot_session_uuid: "boot".to_string(),
            event_time: Some(chrono::Utc::now()),
            processed_time: None,
            event: EventPayload::Execution(Execution::default()),
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn write_temp(data: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool.bin");
        std::fs::write(&path, data).unwrap();
        (dir, path)
    }

    #[test]
    fn test_single_record() {
        let (_dir, path) = write_temp(&encode_record(&record("m1")));
        let records = Decoder::default().decode_file(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].machine_id, "m1");
    }

    #[test]
    fn test_batch() {
        let batch = TelemetryBatch {
            records: vec![record("m1"), record("m2")],
        };
        let (_dir, path) = write_temp(&encode_batch(&batch));
        let records = Decoder::default().decode_file(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].machine_id, "m2");
    }

    #[test]
    fn test_gzip_compressed() {
        let (_dir, path) = write_temp(&gzip(&encode_record(&record("m1"))));
        let records = Decoder::default().decode_file(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_zstd_compressed() {
        let raw = encode_record(&record("m1"));
        let compressed = zstd::stream::encode_all(raw.as_slice(), 0).unwrap();
        let (_dir, path) = write_temp(&compressed);
        let records = Decoder::default().decode_file(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_empty_file() {
        let (_dir, path) = write_temp(&[]);
        assert!(matches!(
            Decoder::default().decode_file(&path),
            Err(DecodeError::EmptyFile)
        ));
    }

    #[test]
    fn test_input_too_large() {
        let (_dir, path) = write_temp(&[0u8; 200]);
        let decoder = Decoder::with_limits(100, 1000, 100);
        assert!(matches!(
            decoder.decode_file(&path),
            Err(DecodeError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_decompression_bomb() {
        // Highly compressible zeros: ratio far above the limit.
        let payload = vec![0u8; 4096];
        let (_dir, path) = write_temp(&gzip(&payload));
        let decoder = Decoder::with_limits(10 * 1024 * 1024, 1024, 10);
        assert!(matches!(
            decoder.decode_file(&path),
            Err(DecodeError::BombSuspected { .. })
        ));
    }

    #[test]
    fn test_size_cap_breach_without_bomb_ratio() {
        // Barely-compressible data: the expansion ratio stays around 1, so
        // only the absolute output cap is exceeded.
        let payload: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let (_dir, path) = write_temp(&gzip(&payload));
        let decoder = Decoder::with_limits(10 * 1024 * 1024, 1024, 100);
        match decoder.decode_file(&path) {
            Err(DecodeError::DecompressedTooLarge { limit }) => assert_eq!(limit, 1024),
            other => panic!("expected size-cap breach, got {:?}", other),
        }
    }

    #[test]
    fn test_ratio_bomb_under_size_limit() {
        // Stays under the absolute output cap but exceeds the ratio.
        let payload = vec![0u8; 64 * 1024];
        let (_dir, path) = write_temp(&gzip(&payload));
        let decoder = Decoder::with_limits(10 * 1024 * 1024, 1024 * 1024, 10);
        match decoder.decode_file(&path) {
            Err(DecodeError::BombSuspected { ratio, limit }) => {
                assert!(ratio > limit);
            }
            other => panic!("expected bomb, got {:?}", other),
        }
    }

    #[test]
    fn test_depth_exceeded() {
        let mut data = encode_record(&record("m1"));
        for _ in 0..3 {
            data = gzip(&data);
        }
        let (_dir, path) = write_temp(&data);
        assert!(matches!(
            Decoder::default().decode_file(&path),
            Err(DecodeError::DepthExceeded)
        ));
    }

    #[test]
    fn test_two_layers_ok() {
        let data = gzip(&gzip(&encode_record(&record("m1"))));
        let (_dir, path) = write_temp(&data);
        let records = Decoder::default().decode_file(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let (_dir, path) = write_temp(b"definitely not telemetry");
        assert!(matches!(
            Decoder::default().decode_file(&path),
            Err(DecodeError::Decode(_))
        ));
    }

    #[test]
    fn test_cancelled() {
        let (_dir, path) = write_temp(&encode_record(&record("m1")));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            Decoder::default().decode_file_cancellable(&path, &cancel),
            Err(DecodeError::Cancelled)
        ));
    }
}
