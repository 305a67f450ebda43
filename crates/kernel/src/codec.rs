use std::sync::Arc;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;

use crate::message::{Content, Header, Message};

pub const DELIMITER: &[u8] = b"<IDS|MSG>";
pub const SIGNATURE_SCHEME: &str = "hmac-sha256";

/// Multipart frames as they travel over a socket.
pub type Frames = Vec<Bytes>;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("content of `{msg_type}` does not match its schema: {source}")]
    SchemaViolation {
        msg_type: String,
        source: serde_json::Error,
    },
    #[error("message signature does not match")]
    Authentication,
    #[error("could not serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unsupported signature scheme `{0}`")]
    UnsupportedScheme(String),
}

/// Encodes and decodes the Jupyter wire envelope, signing with the session key.
#[derive(Clone)]
pub struct Codec {
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("signed", &self.key.is_some())
            .finish()
    }
}

impl Codec {
    /// An empty key disables signing.
    pub fn new(key: &[u8]) -> Self {
        let key = (!key.is_empty()).then(|| key.to_vec());
        Self { key }
    }

    pub fn with_scheme(scheme: &str, key: &[u8]) -> Result<Self, CodecError> {
        if !key.is_empty() && scheme != SIGNATURE_SCHEME {
            return Err(CodecError::UnsupportedScheme(scheme.to_string()));
        }
        Ok(Self::new(key))
    }

    pub fn unsigned() -> Self {
        Self { key: None }
    }

    /// Unchanged parts of a decoded message go out as the exact bytes they
    /// arrived as; everything else is serialized afresh.
    pub fn encode(&self, message: &Message) -> Result<Frames, CodecError> {
        let parts = serialize(message)?;
        let [header, parent, metadata, content] = match &message.received {
            Some(received) => received.reuse(&parts),
            None => parts,
        };

        let signature = self.sign(&[&header[..], &parent[..], &metadata[..], &content[..]]);

        let mut frames = Vec::with_capacity(message.identities.len() + 6 + message.buffers.len());
        frames.extend(message.identities.iter().cloned());
        frames.push(Bytes::from_static(DELIMITER));
        frames.push(Bytes::from(signature));
        frames.extend([header, parent, metadata, content]);
        frames.extend(message.buffers.iter().cloned());

        Ok(frames)
    }

    pub fn decode(&self, frames: Frames) -> Result<Message, CodecError> {
        let split = frames
            .iter()
            .position(|frame| frame.as_ref() == DELIMITER)
            .ok_or_else(|| CodecError::Malformed("missing <IDS|MSG> delimiter".to_string()))?;

        let mut frames = frames.into_iter();
        let identities: Vec<Bytes> = frames.by_ref().take(split).collect();
        let mut rest = frames.skip(1);

        let mut next = |name: &str| {
            rest.next()
                .ok_or_else(|| CodecError::Malformed(format!("missing {name} frame")))
        };
        let signature = next("signature")?;
        let header_raw = next("header")?;
        let parent_raw = next("parent header")?;
        let metadata_raw = next("metadata")?;
        let content_raw = next("content")?;
        let buffers: Vec<Bytes> = rest.collect();

        self.verify(
            &signature,
            &[&header_raw[..], &parent_raw[..], &metadata_raw[..], &content_raw[..]],
        )?;

        let header: Header = serde_json::from_slice(&header_raw)
            .map_err(|e| CodecError::Malformed(format!("header: {e}")))?;
        let parent_header = parse_parent(&parent_raw)?;
        let metadata: Map<String, Value> = serde_json::from_slice(&metadata_raw)
            .map_err(|e| CodecError::Malformed(format!("metadata: {e}")))?;
        let content = Content::from_json(&header.msg_type, &content_raw)?;

        let mut message = Message {
            identities,
            header,
            parent_header,
            metadata,
            content,
            buffers,
            received: None,
        };
        message.received = Some(Arc::new(ReceivedFrames {
            raw: [header_raw, parent_raw, metadata_raw, content_raw],
            parsed: serialize(&message)?,
        }));
        Ok(message)
    }

    fn sign(&self, parts: &[&[u8]]) -> String {
        match self.mac(parts) {
            Some(mac) => hex::encode(mac.finalize().into_bytes()),
            None => String::new(),
        }
    }

    fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> Result<(), CodecError> {
        let Some(mac) = self.mac(parts) else {
            return Ok(());
        };
        let signature = hex::decode(signature).map_err(|_| CodecError::Authentication)?;
        mac.verify_slice(&signature)
            .map_err(|_| CodecError::Authentication)
    }

    fn mac(&self, parts: &[&[u8]]) -> Option<HmacSha256> {
        // HMAC accepts keys of any length.
        let mut mac = self
            .key
            .as_deref()
            .and_then(|key| HmacSha256::new_from_slice(key).ok())?;
        for part in parts {
            mac.update(part);
        }
        Some(mac)
    }
}

/// The four JSON frames a message was decoded from, next to our own
/// serialization of what was parsed out of them.
#[derive(Debug)]
pub(crate) struct ReceivedFrames {
    raw: [Bytes; 4],
    parsed: [Bytes; 4],
}

impl ReceivedFrames {
    fn reuse(&self, fresh: &[Bytes; 4]) -> [Bytes; 4] {
        std::array::from_fn(|i| {
            if fresh[i] == self.parsed[i] {
                self.raw[i].clone()
            } else {
                fresh[i].clone()
            }
        })
    }
}

/// Header, parent header, metadata and content in this crate's own encoding.
fn serialize(message: &Message) -> Result<[Bytes; 4], CodecError> {
    let header = serde_json::to_vec(&message.header)?;
    let parent = match &message.parent_header {
        Some(parent) => serde_json::to_vec(parent)?,
        None => b"{}".to_vec(),
    };
    let metadata = serde_json::to_vec(&message.metadata)?;
    let content = message.content.to_json()?;
    Ok([header, parent, metadata, content].map(Bytes::from))
}

fn parse_parent(raw: &[u8]) -> Result<Option<Header>, CodecError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| CodecError::Malformed(format!("parent header: {e}")))?;
    match value {
        Value::Object(ref map) if map.is_empty() => Ok(None),
        value => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| CodecError::Malformed(format!("parent header: {e}"))),
    }
}
