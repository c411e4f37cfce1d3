//! Media-room client: the per-binding handle that joins a room, produces
//! agent speech into it, and consumes room audio out of it.
//!
//! The wire side is hidden behind the [`MediaTransport`] seam; the
//! production implementation ([`ws::WsMediaTransport`]) speaks
//! request/response JSON frames over a WebSocket. [`client::RoomClient`]
//! layers the lifecycle state machine and supervised reconnection on top.

pub mod client;
pub mod transport;
pub mod ws;

pub use client::{ClientState, RoomClient, RoomClientConfig};
pub use transport::{MediaCapture, MediaTransport, Participant, ParticipantKind};
pub use ws::{WsMediaTransport, WsMediaTransportConfig};
