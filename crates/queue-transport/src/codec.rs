//! Wire format of a single queue entry.
//!
//! A transport message is stored as a UTF-8 JSON object:
//!
//! ```json
//! { "Headers": { "rbs2-msg-id": "..." }, "Body": "<base64>" }
//! ```
//!
//! A missing or `null` `Headers` member decodes as an empty header map.

use crate::error::CodecError;
use crate::message::{Headers, TransportMessage};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "Headers", default, deserialize_with = "nullable_headers")]
    headers: Headers,

    #[serde(rename = "Body", with = "bytes_serde", default)]
    body: Bytes,
}

fn nullable_headers<'de, D>(deserializer: D) -> Result<Headers, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Headers>::deserialize(deserializer)?.unwrap_or_default())
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

/// Encode a transport message into a queue payload
pub fn encode(message: &TransportMessage) -> Result<Bytes, CodecError> {
    let envelope = Envelope {
        headers: message.headers().clone(),
        body: message.body().clone(),
    };
    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

/// Decode a queue payload into a transport message
pub fn decode(payload: &[u8]) -> Result<TransportMessage, CodecError> {
    let text = std::str::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8)?;
    let envelope: Envelope = serde_json::from_str(text)?;
    Ok(TransportMessage::new(envelope.headers, envelope.body))
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
