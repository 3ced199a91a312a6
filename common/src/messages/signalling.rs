// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Envelopes carried as JSON text frames on the signalling stream.
//!
//! The envelope shape is fixed by the protocol:
//!
//! ```json
//! {"type":"msg","message_id":"…","session_id":"…","sender":"…",
//!  "receiver":["…"],"ref_msg_id":"…","ts":…,
//!  "message":[{"type":"content","content":"…"},…]}
//! ```
//!
//! Block content is either a plain string or a JSON-encoded object (tool
//! calls, handshake payloads). Decoding is round-trip stable for well-formed
//! envelopes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    identifiers::{AgentId, MessageId, SessionId},
    time::TimeStamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Msg,
    Invite,
    InviteAck,
    SessionCreate,
    SessionAck,
    Status,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Content,
    ToolCall,
    StreamChunk,
    Status,
    Error,
}

/// One typed content block inside an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Metadata key carrying the position of a [`BlockType::StreamChunk`] block.
pub const CHUNK_INDEX_KEY: &str = "chunk_index";

/// Chunk index of the stream terminator block.
pub const STREAM_TERMINATOR_INDEX: i64 = -1;

impl Block {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            block_type: BlockType::Content,
            status: None,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn tool_call(call: &Value) -> Self {
        Self {
            block_type: BlockType::ToolCall,
            status: None,
            content: call.to_string(),
            metadata: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            block_type: BlockType::Error,
            status: None,
            content: message.into(),
            metadata: None,
        }
    }

    /// A stream chunk at the given position. The terminator is a chunk with
    /// index [`STREAM_TERMINATOR_INDEX`] and empty content.
    pub fn stream_chunk(index: i64, content: impl Into<String>) -> Self {
        let mut metadata = Map::new();
        metadata.insert(CHUNK_INDEX_KEY.to_owned(), Value::from(index));
        Self {
            block_type: BlockType::StreamChunk,
            status: None,
            content: content.into(),
            metadata: Some(metadata),
        }
    }

    pub fn stream_terminator() -> Self {
        Self::stream_chunk(STREAM_TERMINATOR_INDEX, "")
    }

    /// The chunk index, if this is a stream chunk block.
    pub fn chunk_index(&self) -> Option<i64> {
        if self.block_type != BlockType::StreamChunk {
            return None;
        }
        self.metadata
            .as_ref()
            .and_then(|m| m.get(CHUNK_INDEX_KEY))
            .and_then(Value::as_i64)
    }

    /// The content parsed as a JSON object, for structured payloads.
    pub fn content_as_json(&self) -> Option<Value> {
        serde_json::from_str(&self.content).ok()
    }
}

/// A signalling envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub message_id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub sender: AgentId,
    #[serde(default)]
    pub receiver: Vec<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_msg_id: Option<MessageId>,
    pub ts: TimeStamp,
    #[serde(rename = "message", default)]
    pub blocks: Vec<Block>,
}

impl Envelope {
    pub fn new(
        frame_type: FrameType,
        sender: AgentId,
        receiver: Vec<AgentId>,
        blocks: Vec<Block>,
    ) -> Self {
        Self {
            frame_type,
            message_id: MessageId::random(),
            session_id: None,
            sender,
            receiver,
            ref_msg_id: None,
            ts: TimeStamp::now(),
            blocks,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// A reply envelope: sender and receiver swapped, `ref_msg_id` pointing
    /// one hop back to the replied-to message.
    pub fn reply_to(&self, sender: AgentId, blocks: Vec<Block>) -> Self {
        let mut reply = Self::new(FrameType::Msg, sender, vec![self.sender.clone()], blocks);
        reply.session_id = self.session_id.clone();
        reply.ref_msg_id = Some(self.message_id);
        reply
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Serde)
    }

    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(text).map_err(EnvelopeError::Serde)
    }

    /// Enforce the envelope invariants for outgoing message frames.
    pub fn validate(&self, max_size: usize) -> Result<(), EnvelopeError> {
        if self.blocks.is_empty() {
            return Err(EnvelopeError::EmptyContent);
        }
        if self.receiver.is_empty() {
            return Err(EnvelopeError::EmptyReceiverList);
        }
        let encoded = self.encode()?;
        if encoded.len() > max_size {
            return Err(EnvelopeError::TooLarge {
                size: encoded.len(),
                max: max_size,
            });
        }
        Ok(())
    }

    // Accessors used by message handlers.

    pub fn sender(&self) -> &AgentId {
        &self.sender
    }

    pub fn receivers(&self) -> &[AgentId] {
        &self.receiver
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// All plain-content block payloads concatenated.
    pub fn content_as_string(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| b.block_type == BlockType::Content)
            .map(|b| b.content.as_str())
            .collect()
    }

    pub fn content_blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn is_tool_call(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| b.block_type == BlockType::ToolCall)
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Envelope could not be (de)serialized: {0}")]
    Serde(#[source] serde_json::Error),
    #[error("The content vector of a message envelope must be non-empty")]
    EmptyContent,
    #[error("The receiver list of a message envelope must be non-empty")]
    EmptyReceiverList,
    #[error("Serialized envelope is {size} bytes, above the {max} byte ceiling")]
    TooLarge { size: usize, max: usize },
}

/// Payload of a `session_create` frame, JSON-encoded into its first block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreatePayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// Payload of a `session_ack` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAckPayload {
    pub session_id: SessionId,
    pub identifying_code: String,
}

/// Payload of an `invite` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitePayload {
    pub session_id: SessionId,
    pub identifying_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// Payload of an `invite_ack` frame. The ack is bound to the identifying
/// code handed out at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteAckPayload {
    pub session_id: SessionId,
    pub identifying_code: String,
    pub accept: bool,
}

/// Encode a handshake payload into a status block.
pub fn payload_block<T: Serialize>(payload: &T) -> Result<Block, EnvelopeError> {
    let content = serde_json::to_string(payload).map_err(EnvelopeError::Serde)?;
    Ok(Block {
        block_type: BlockType::Status,
        status: None,
        content,
        metadata: None,
    })
}

/// Decode a handshake payload from the first block of an envelope.
pub fn payload_from_envelope<T: for<'de> Deserialize<'de>>(
    envelope: &Envelope,
) -> Result<T, EnvelopeError> {
    let block = envelope
        .blocks
        .first()
        .ok_or(EnvelopeError::EmptyContent)?;
    serde_json::from_str(&block.content).map_err(EnvelopeError::Serde)
}

#[cfg(test)]
mod tests {
    use crate::MAX_ENVELOPE_SIZE;

    use super::*;

    fn alice() -> AgentId {
        "alice.example.com".parse().unwrap()
    }

    fn bob() -> AgentId {
        "bob.example.com".parse().unwrap()
    }

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope::new(
            FrameType::Msg,
            alice(),
            vec![bob()],
            vec![Block::content("hi"), Block::tool_call(&serde_json::json!({
                "name": "lookup",
                "arguments": {"q": "weather"},
            }))],
        )
        .with_session(SessionId::new("s-1".into()));

        let text = envelope.encode().unwrap();
        let decoded = Envelope::decode(&text).unwrap();
        assert_eq!(envelope, decoded);
        assert!(decoded.is_tool_call());
        assert_eq!(decoded.content_as_string(), "hi");
    }

    #[test]
    fn wire_shape_matches_protocol() {
        let envelope = Envelope::new(FrameType::Msg, alice(), vec![bob()], vec![
            Block::content("hi"),
        ]);
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "msg");
        assert_eq!(value["sender"], "alice.example.com");
        assert_eq!(value["receiver"][0], "bob.example.com");
        assert_eq!(value["message"][0]["type"], "content");
        assert_eq!(value["message"][0]["content"], "hi");
        assert!(value["ts"].is_i64());
    }

    #[test]
    fn validation_enforces_invariants() {
        let empty_content = Envelope::new(FrameType::Msg, alice(), vec![bob()], vec![]);
        assert!(matches!(
            empty_content.validate(MAX_ENVELOPE_SIZE),
            Err(EnvelopeError::EmptyContent)
        ));

        let no_receivers =
            Envelope::new(FrameType::Msg, alice(), vec![], vec![Block::content("x")]);
        assert!(matches!(
            no_receivers.validate(MAX_ENVELOPE_SIZE),
            Err(EnvelopeError::EmptyReceiverList)
        ));

        let oversized = Envelope::new(FrameType::Msg, alice(), vec![bob()], vec![
            Block::content("y".repeat(512)),
        ]);
        assert!(matches!(
            oversized.validate(128),
            Err(EnvelopeError::TooLarge { .. })
        ));
    }

    #[test]
    fn reply_points_one_hop_back() {
        let original = Envelope::new(FrameType::Msg, alice(), vec![bob()], vec![
            Block::content("question"),
        ])
        .with_session(SessionId::new("s-7".into()));
        let reply = original.reply_to(bob(), vec![Block::content("answer")]);
        assert_eq!(reply.ref_msg_id, Some(original.message_id));
        assert_eq!(reply.receiver, vec![alice()]);
        assert_eq!(reply.session_id, original.session_id);
    }

    #[test]
    fn stream_chunk_metadata() {
        let chunk = Block::stream_chunk(3, "abc");
        assert_eq!(chunk.chunk_index(), Some(3));
        let terminator = Block::stream_terminator();
        assert_eq!(terminator.chunk_index(), Some(STREAM_TERMINATOR_INDEX));
        // Non-chunk blocks have no chunk index.
        assert_eq!(Block::content("x").chunk_index(), None);
    }

    #[test]
    fn handshake_payload_round_trip() {
        let payload = InvitePayload {
            session_id: SessionId::new("s-9".into()),
            identifying_code: "code-123".into(),
            subject: None,
        };
        let envelope = Envelope::new(FrameType::Invite, alice(), vec![bob()], vec![
            payload_block(&payload).unwrap(),
        ]);
        let decoded: InvitePayload = payload_from_envelope(&envelope).unwrap();
        assert_eq!(decoded.identifying_code, "code-123");
        assert_eq!(decoded.session_id.as_str(), "s-9");
    }
}
