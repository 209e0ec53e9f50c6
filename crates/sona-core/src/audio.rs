//! Audio transport helpers.
//!
//! Wire audio is base64-encoded 16-bit little-endian PCM, mono, 24 kHz.
//! In-memory audio is the raw decoded byte buffer.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};

/// Sample rate of all wire audio, in Hz.
pub const SAMPLE_RATE_HZ: u64 = 24_000;

/// Decoder that tolerates both padded and unpadded input — streamed audio
/// fragments arrive in arbitrary chunk lengths, usually without padding.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent),
);

/// Encode raw audio bytes for the wire.
#[must_use]
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode wire audio back into raw bytes.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    LENIENT.decode(encoded)
}

/// Convert float samples in `[-1.0, 1.0]` to 16-bit little-endian PCM bytes.
///
/// Samples are clamped; positive full scale maps to 32767, negative to -32768.
#[must_use]
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let scale = if clamped > 0.0 { 32_767.0 } else { 32_768.0 };
        let value = (clamped * scale) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Serde adapter for `Vec<u8>` fields carried as base64 strings.
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize raw bytes as a base64 string.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode_base64(bytes))
    }

    /// Deserialize a base64 string into raw bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        super::decode_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<Vec<u8>>` fields carried as base64 strings.
pub mod base64_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize optional raw bytes as a base64 string or null.
    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_str(&super::encode_base64(b)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional base64 string into raw bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|e| super::decode_base64(&e).map_err(serde::de::Error::custom))
            .transpose()
    }
}
