//! Gzip framing for signal payloads.
//!
//! Encoded frames carry a one-byte marker: `0x00` for raw bytes, `0x1f`
//! (the gzip magic byte) for a gzip stream. Decoding tolerates unmarked
//! input by passing it through untouched, so plain JSON from foreign
//! clients still decodes.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::SignalError;

/// Marker byte for raw data.
const MARKER_RAW: u8 = 0x00;

/// Marker byte for gzip data (also the gzip magic byte).
const MARKER_GZIP: u8 = 0x1f;

/// Frame `data`, compressing when it reaches `threshold` bytes.
///
/// Compression that fails to shrink the payload is discarded in favor of
/// the raw framing. `None` disables compression outright.
///
/// # Errors
///
/// Returns `SignalError::Compression` when gzip encoding fails.
pub fn compress_frame(data: &[u8], threshold: Option<usize>) -> Result<Vec<u8>, SignalError> {
    let raw = |data: &[u8]| {
        let mut framed = Vec::with_capacity(1 + data.len());
        framed.push(MARKER_RAW);
        framed.extend_from_slice(data);
        framed
    };

    let Some(threshold) = threshold else {
        return Ok(raw(data));
    };
    if data.len() < threshold {
        return Ok(raw(data));
    }

    let mut compressed = Vec::with_capacity(data.len());
    compressed.push(MARKER_GZIP);
    {
        let mut encoder = GzEncoder::new(&mut compressed, Compression::fast());
        encoder
            .write_all(data)
            .map_err(|e| SignalError::Compression(format!("gzip write failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| SignalError::Compression(format!("gzip finish failed: {e}")))?;
    }

    if compressed.len() < data.len() + 1 {
        Ok(compressed)
    } else {
        Ok(raw(data))
    }
}

/// Undo [`compress_frame`]. Unmarked data passes through unchanged.
///
/// # Errors
///
/// Returns `SignalError::Compression` when a gzip-marked frame does not
/// inflate.
pub fn decompress_frame(data: &[u8]) -> Result<Vec<u8>, SignalError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    match data[0] {
        MARKER_RAW => Ok(data[1..].to_vec()),
        MARKER_GZIP => {
            let mut decoder = GzDecoder::new(&data[1..]);
            let mut inflated = Vec::new();
            decoder
                .read_to_end(&mut inflated)
                .map_err(|e| SignalError::Compression(format!("gzip inflate failed: {e}")))?;
            Ok(inflated)
        }
        // No marker: raw JSON from a client that never frames.
        _ => Ok(data.to_vec()),
    }
}
