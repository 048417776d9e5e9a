//! Pluggable payload encodings.
//!
//! Every encoded entry starts with a fixed 13-byte little-endian header:
//! - 8 bytes magic (`NOVAKVST`)
//! - `u32` envelope format version
//! - `u8` codec tag
//!
//! followed by the codec-specific payload. The header lets `decode` reject foreign
//! files, files written by another codec, and truncated writes, instead of handing
//! back a partial value.

use crate::error::CodecError;
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const ENVELOPE_MAGIC: [u8; 8] = *b"NOVAKVST";
pub const ENVELOPE_FORMAT_VERSION: u32 = 1;
pub const ENVELOPE_HEADER_LEN: usize = 13;

/// Encodes and decodes entry payloads.
///
/// Implementors provide the payload encoding; the provided `encode`/`decode` wrap it
/// in the versioned envelope. `decode(encode(v)) == v` must hold for every value the
/// encoding can represent.
pub trait Codec {
    /// Tag stored in the envelope header. Must be unique per encoding.
    const TAG: u8;

    fn name(&self) -> &'static str;

    fn encode_payload<T: Serialize + ?Sized>(
        &self,
        value: &T,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError>;

    fn decode_payload<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError>;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + 64);
        out.extend_from_slice(&ENVELOPE_MAGIC);
        out.extend_from_slice(&ENVELOPE_FORMAT_VERSION.to_le_bytes());
        out.push(Self::TAG);
        self.encode_payload(value, &mut out)?;
        Ok(out)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let payload = split_envelope(bytes, Self::TAG, self.name())?;
        self.decode_payload(payload)
    }
}

fn split_envelope<'a>(
    bytes: &'a [u8],
    expected_tag: u8,
    codec: &'static str,
) -> Result<&'a [u8], CodecError> {
    if bytes.len() < ENVELOPE_HEADER_LEN {
        return Err(CodecError::Decode(format!(
            "payload too short for envelope header: {} bytes (need {ENVELOPE_HEADER_LEN})",
            bytes.len()
        )));
    }
    let (header, payload) = bytes.split_at(ENVELOPE_HEADER_LEN);

    if header[..8] != ENVELOPE_MAGIC {
        return Err(CodecError::Decode("missing envelope magic".to_string()));
    }

    let mut version = [0_u8; 4];
    version.copy_from_slice(&header[8..12]);
    let version = u32::from_le_bytes(version);
    if version != ENVELOPE_FORMAT_VERSION {
        return Err(CodecError::Decode(format!(
            "unsupported envelope format version: expected {ENVELOPE_FORMAT_VERSION}, found {version}"
        )));
    }

    let tag = header[12];
    if tag != expected_tag {
        return Err(CodecError::Decode(format!(
            "entry was written by codec tag {tag}, cannot decode with {codec} (tag {expected_tag})"
        )));
    }

    Ok(payload)
}

/// Compact binary encoding (`bincode`, fixed-int, little-endian).
///
/// Requires the target type to be known when decoding; dynamically typed values such
/// as `serde_json::Value` need [`JsonCodec`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeCodec;

fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

impl Codec for BincodeCodec {
    const TAG: u8 = 1;

    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode_payload<T: Serialize + ?Sized>(
        &self,
        value: &T,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        bincode_options()
            .serialize_into(out, value)
            .map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn decode_payload<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        // A well-formed payload never reads more bytes than it contains, so a corrupt
        // length prefix fails here instead of allocating.
        bincode_options()
            .with_limit(payload.len() as u64)
            .deserialize(payload)
            .map_err(|err| CodecError::Decode(err.to_string()))
    }
}

/// Human-readable JSON encoding (`serde_json`).
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    const TAG: u8 = 2;

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_payload<T: Serialize + ?Sized>(
        &self,
        value: &T,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        serde_json::to_writer(out, value).map_err(|err| CodecError::json_encode(&err))
    }

    fn decode_payload<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(payload).map_err(|err| CodecError::json_decode(&err))
    }
}
