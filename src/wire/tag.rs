//! Peer identity tags appended to messages returned from a fan-out call.
//!
//! A tagged message is `payload || tag json || u32 tag length`. The tag sits at
//! the end so the proxy never has to look inside the payload.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::{Code, Status};

const LEN_SUFFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTag {
    /// Target the caller named for this peer.
    pub peer: String,
    /// Whether the response belongs to a streamed method.
    #[serde(default)]
    pub streaming: bool,
    /// Set when the peer failed; the payload is empty in that case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Code>,
}

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("message too short to carry a peer tag")]
    Missing,
    #[error("malformed peer tag: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl PeerTag {
    pub fn new(peer: impl Into<String>, streaming: bool) -> Self {
        Self {
            peer: peer.into(),
            streaming,
            error: None,
            code: None,
        }
    }

    pub fn failed(peer: impl Into<String>, streaming: bool, status: &Status) -> Self {
        Self {
            peer: peer.into(),
            streaming,
            error: Some(status.message.clone()),
            code: Some(status.code),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Appends this tag to `payload`.
    pub fn append_to(&self, payload: &[u8]) -> Bytes {
        // The tag is two strings, a bool and a number; encoding cannot fail.
        let tag = serde_json::to_vec(self).unwrap_or_default();

        let mut out = BytesMut::with_capacity(payload.len() + tag.len() + LEN_SUFFIX);
        out.put_slice(payload);
        out.put_slice(&tag);
        out.put_u32(tag.len() as u32);
        out.freeze()
    }

    /// Splits a tagged message back into its tag and payload.
    pub fn split(message: &Bytes) -> Result<(PeerTag, Bytes), TagError> {
        if message.len() < LEN_SUFFIX {
            return Err(TagError::Missing);
        }
        let suffix_at = message.len() - LEN_SUFFIX;
        let tag_len = u32::from_be_bytes([
            message[suffix_at],
            message[suffix_at + 1],
            message[suffix_at + 2],
            message[suffix_at + 3],
        ]) as usize;
        if tag_len > suffix_at {
            return Err(TagError::Missing);
        }

        let tag_at = suffix_at - tag_len;
        let tag = serde_json::from_slice(&message[tag_at..suffix_at])?;
        Ok((tag, message.slice(..tag_at)))
    }
}
