//! Encoded polyline codec as used by the directions service: deltas
//! between consecutive points, zig-zag signed, emitted as 5-bit chunks
//! offset by 63, with bit 0x20 marking continuation.

use thiserror::Error;

use crate::models::position::Coordinate;

const PRECISION: f64 = 1e5;
const CHUNK_MASK: i64 = 0x1f;
const CONTINUATION_BIT: u8 = 0x20;
const CHAR_OFFSET: u8 = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolylineError {
    #[error("invalid polyline character {byte:#04x} at offset {offset}")]
    InvalidCharacter { byte: u8, offset: usize },
    #[error("polyline truncated inside a coordinate at offset {offset}")]
    Truncated { offset: usize },
    #[error("polyline delta overflows at offset {offset}")]
    Overflow { offset: usize },
}

/// Decodes an encoded path into coordinates. An empty string decodes to
/// an empty path.
pub fn decode(encoded: &str) -> Result<Vec<Coordinate>, PolylineError> {
    let bytes = encoded.as_bytes();
    let mut coordinates = Vec::new();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lng: i64 = 0;

    while index < bytes.len() {
        lat += next_delta(bytes, &mut index)?;
        lng += next_delta(bytes, &mut index)?;
        coordinates.push(Coordinate::new(lat as f64 / PRECISION, lng as f64 / PRECISION));
    }

    Ok(coordinates)
}

fn next_delta(bytes: &[u8], index: &mut usize) -> Result<i64, PolylineError> {
    let mut shift = 0u32;
    let mut result: i64 = 0;

    loop {
        let Some(&byte) = bytes.get(*index) else {
            return Err(PolylineError::Truncated { offset: *index });
        };
        if !(CHAR_OFFSET..=126).contains(&byte) {
            return Err(PolylineError::InvalidCharacter {
                byte,
                offset: *index,
            });
        }
        *index += 1;

        if shift >= 64 {
            return Err(PolylineError::Overflow { offset: *index - 1 });
        }
        let chunk = (byte - CHAR_OFFSET) as i64;
        result |= (chunk & CHUNK_MASK) << shift;
        shift += 5;

        if chunk < CONTINUATION_BIT as i64 {
            break;
        }
    }

    if result & 1 == 1 {
        Ok(!(result >> 1))
    } else {
        Ok(result >> 1)
    }
}

/// Encodes a path into the wire form `decode` understands.
pub fn encode(coordinates: &[Coordinate]) -> String {
    let mut encoded = String::new();
    let mut prev_lat: i64 = 0;
    let mut prev_lng: i64 = 0;

    for coordinate in coordinates {
        let lat = (coordinate.latitude * PRECISION).round() as i64;
        let lng = (coordinate.longitude * PRECISION).round() as i64;
        encode_delta(lat - prev_lat, &mut encoded);
        encode_delta(lng - prev_lng, &mut encoded);
        prev_lat = lat;
        prev_lng = lng;
    }

    encoded
}

fn encode_delta(delta: i64, out: &mut String) {
    let mut value = if delta < 0 { !(delta << 1) } else { delta << 1 };

    while value >= CONTINUATION_BIT as i64 {
        let chunk = (value & CHUNK_MASK) as u8 | CONTINUATION_BIT;
        out.push((chunk + CHAR_OFFSET) as char);
        value >>= 5;
    }
    out.push((value as u8 + CHAR_OFFSET) as char);
}
