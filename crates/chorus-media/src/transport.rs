//! The RPC seam between the room client and the media server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use chorus_types::{AudioFormat, CoreResult, RoomId};

/// What kind of participant a room member is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    /// A chorus agent peer.
    Agent,
    /// A human participant.
    Human,
    /// Anything else (recorders, SIP gateways).
    Device,
}

/// One room participant as reported by the media server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub kind: ParticipantKind,
}

/// A completed audio capture from a consumer.
#[derive(Debug, Clone)]
pub struct MediaCapture {
    /// Opaque consumer id, for `stop_consume`.
    pub consumer_id: String,
    /// Captured audio in the requested format.
    pub audio: Vec<u8>,
    /// The format the audio came back in.
    pub format: AudioFormat,
}

/// Media-server operations the room client depends on.
///
/// Implementations own connection state; every call carries the media
/// timeout and fails `TransportUnavailable` when the link is down.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Join a room under a peer id.
    async fn join(&self, room: &RoomId, peer_id: &str) -> CoreResult<()>;

    /// Leave the current room.
    async fn leave(&self) -> CoreResult<()>;

    /// Open an audio producer. Returns the server-side producer id.
    async fn produce(&self, format: AudioFormat) -> CoreResult<String>;

    /// Push one audio chunk to an open producer, in generation order.
    async fn send_audio(&self, producer_id: &str, chunk: &[u8]) -> CoreResult<()>;

    /// Close a producer.
    async fn stop_produce(&self, producer_id: &str) -> CoreResult<()>;

    /// Capture audio from a peer or producer for `duration_ms`.
    async fn consume(
        &self,
        source: &str,
        duration_ms: u64,
        format: AudioFormat,
    ) -> CoreResult<MediaCapture>;

    /// Close a consumer.
    async fn stop_consume(&self, consumer_id: &str) -> CoreResult<()>;

    /// List current room participants.
    async fn list_participants(&self) -> CoreResult<Vec<Participant>>;

    /// Whether the transport link is currently up.
    fn is_connected(&self) -> bool;
}
