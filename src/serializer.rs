//! Serializers for stored entries.
//!
//! A serializer encodes `(response, request, metadata)` into a single
//! payload and back. The round-trip preserves the status code, header
//! order, duplicates and byte values, the body bytes, the persisted
//! extension subset and every metadata field. The request body is not
//! part of the stored form.
//!
//! Two encodings are provided: a human-readable JSON document (the
//! default for the filesystem and SQL backends) and a compact postcard
//! binary form. [`Serializer::is_binary`] tells storage code whether the
//! payload is opaque bytes or UTF-8 text.

use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::SerializeError;
use crate::headers::Headers;
use crate::model::{
    Body, CacheMetadata, Extensions, ExtensionValue, Request, Response,
    StoredEntry,
};

/// Extension keys that survive a serializer round-trip.
///
/// `reason_phrase` and `http_version` are byte-valued; `sni_hostname` is
/// textual. Everything else in the mapping is per-dispatch state and is
/// dropped at admission.
const PERSISTED_EXTENSIONS: &[&str] =
    &["reason_phrase", "http_version", "sni_hostname"];

/// Encodes and decodes stored entries.
pub trait Serializer: Send + Sync {
    /// Encodes an entry. Fails with [`SerializeError::UnreadBody`] when the
    /// response body has not been fully materialized.
    fn dumps(
        &self,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<Vec<u8>, SerializeError>;

    /// Decodes an entry. Storage backends treat any failure here as an
    /// absent entry, not as an error.
    fn loads(&self, data: &[u8]) -> Result<StoredEntry, SerializeError>;

    /// Whether the encoded form is opaque bytes rather than UTF-8 text.
    fn is_binary(&self) -> bool;
}

// Header bytes travel as latin-1 strings: every byte maps to the code
// point of the same value, which is lossless in both directions and keeps
// the JSON form readable for ASCII headers.
fn latin1_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn latin1_decode(text: &str) -> Result<Vec<u8>, SerializeError> {
    text.chars()
        .map(|c| {
            u8::try_from(u32::from(c)).map_err(|_| {
                SerializeError::Malformed(format!(
                    "non latin-1 character {c:?} in stored header"
                ))
            })
        })
        .collect()
}

mod body_b64 {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize)]
struct ResponseData {
    status: u16,
    headers: Vec<(String, String)>,
    #[serde(with = "body_b64")]
    content: Vec<u8>,
    extensions: Vec<(String, String)>,
}

#[derive(Serialize, Deserialize)]
struct RequestData {
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    extensions: Vec<(String, String)>,
}

#[derive(Serialize, Deserialize)]
struct MetadataData {
    cache_key: String,
    created_at: (u64, u32),
    number_of_uses: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredData {
    response: ResponseData,
    request: RequestData,
    metadata: MetadataData,
}

fn encode_headers(headers: &Headers) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(n, v)| (latin1_encode(n), latin1_encode(v)))
        .collect()
}

fn decode_headers(
    pairs: Vec<(String, String)>,
) -> Result<Headers, SerializeError> {
    pairs
        .into_iter()
        .map(|(n, v)| {
            Ok((
                Bytes::from(latin1_decode(&n)?),
                Bytes::from(latin1_decode(&v)?),
            ))
        })
        .collect()
}

fn encode_extensions(extensions: &Extensions) -> Vec<(String, String)> {
    let mut encoded = Vec::new();
    for key in PERSISTED_EXTENSIONS {
        let value = match extensions.get(key) {
            Some(ExtensionValue::Str(text)) => text.clone(),
            Some(ExtensionValue::Bytes(bytes)) => latin1_encode(bytes),
            _ => continue,
        };
        encoded.push(((*key).to_string(), value));
    }
    encoded
}

fn decode_extensions(
    pairs: Vec<(String, String)>,
) -> Result<Extensions, SerializeError> {
    let mut extensions = Extensions::new();
    for (key, value) in pairs {
        if !PERSISTED_EXTENSIONS.contains(&key.as_str()) {
            continue;
        }
        // sni_hostname is textual; the rest are byte values
        let value = if key == "sni_hostname" {
            ExtensionValue::Str(value)
        } else {
            ExtensionValue::Bytes(Bytes::from(latin1_decode(&value)?))
        };
        extensions.insert(key, value);
    }
    Ok(extensions)
}

fn to_stored_data(
    response: &Response,
    request: &Request,
    metadata: &CacheMetadata,
) -> Result<StoredData, SerializeError> {
    let content = response
        .body
        .bytes()
        .ok_or(SerializeError::UnreadBody)?
        .to_vec();
    let created_at = metadata
        .created_at
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(StoredData {
        response: ResponseData {
            status: response.status,
            headers: encode_headers(&response.headers),
            content,
            extensions: encode_extensions(&response.extensions),
        },
        request: RequestData {
            method: request.method.clone(),
            url: request.url.to_string(),
            headers: encode_headers(&request.headers),
            extensions: encode_extensions(&request.extensions),
        },
        metadata: MetadataData {
            cache_key: metadata.cache_key.clone(),
            created_at: (created_at.as_secs(), created_at.subsec_nanos()),
            number_of_uses: metadata.number_of_uses,
        },
    })
}

fn from_stored_data(data: StoredData) -> Result<StoredEntry, SerializeError> {
    let url = Url::parse(&data.request.url).map_err(|err| {
        SerializeError::Malformed(format!("stored url does not parse: {err}"))
    })?;
    let response = Response {
        status: data.response.status,
        headers: decode_headers(data.response.headers)?,
        body: Body::complete(data.response.content),
        extensions: decode_extensions(data.response.extensions)?,
    };
    let request = Request {
        method: data.request.method,
        url,
        headers: decode_headers(data.request.headers)?,
        body: Body::empty(),
        extensions: decode_extensions(data.request.extensions)?,
    };
    let (secs, nanos) = data.metadata.created_at;
    let metadata = CacheMetadata {
        cache_key: data.metadata.cache_key,
        created_at: SystemTime::UNIX_EPOCH
            + Duration::new(secs, nanos),
        number_of_uses: data.metadata.number_of_uses,
    };
    Ok(StoredEntry { response, request, metadata })
}

/// The default serializer: a pretty-printed UTF-8 JSON document.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn dumps(
        &self,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<Vec<u8>, SerializeError> {
        let data = to_stored_data(response, request, metadata)?;
        Ok(serde_json::to_vec_pretty(&data)?)
    }

    fn loads(&self, data: &[u8]) -> Result<StoredEntry, SerializeError> {
        from_stored_data(serde_json::from_slice(data)?)
    }

    fn is_binary(&self) -> bool {
        false
    }
}

/// A compact binary serializer backed by postcard.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinarySerializer;

impl Serializer for BinarySerializer {
    fn dumps(
        &self,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<Vec<u8>, SerializeError> {
        let data = to_stored_data(response, request, metadata)?;
        Ok(postcard::to_allocvec(&data)?)
    }

    fn loads(&self, data: &[u8]) -> Result<StoredEntry, SerializeError> {
        from_stored_data(postcard::from_bytes(data)?)
    }

    fn is_binary(&self) -> bool {
        true
    }
}
