//! Peer transport
//!
//! Typed protocol messages and the fire-and-forget send interface. Errors
//! only report local failures; a silent peer is a watchdog concern.

pub mod memnet;

pub use memnet::{MemoryNetwork, MemoryTransport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::warn;

use crate::error::SyncError;
use crate::protocols::bvstream::BvPayload;
use crate::protocols::dagstream::DagPayload;
use crate::protocols::epstream::EpPayload;
use crate::stream::{Response, WireRequest};
use crate::types::{Event, EventId, PackInfo, PeerId, PeerProgress};

/// Protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    ProgressAnnounce(PeerProgress),
    EventAnnounce { ids: Vec<EventId> },
    GetEvents { ids: Vec<EventId> },
    Events { events: Vec<Event> },
    DagStreamRequest(WireRequest),
    DagStreamResponse(Response<DagPayload>),
    BvStreamRequest(WireRequest),
    BvStreamResponse(Response<BvPayload>),
    EpStreamRequest(WireRequest),
    EpStreamResponse(Response<EpPayload>),
    GetPackInfos { epoch: u32, indexes: Vec<u64> },
    PackInfos { epoch: u32, total_num: u64, infos: Vec<PackInfo> },
    GetPack { epoch: u32, index: u64 },
    Pack { epoch: u32, index: u64, ids: Vec<EventId> },
}

impl Message {
    /// Message name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Message::ProgressAnnounce(_) => "ProgressAnnounce",
            Message::EventAnnounce { .. } => "EventAnnounce",
            Message::GetEvents { .. } => "GetEvents",
            Message::Events { .. } => "Events",
            Message::DagStreamRequest(_) => "DagStreamRequest",
            Message::DagStreamResponse(_) => "DagStreamResponse",
            Message::BvStreamRequest(_) => "BvStreamRequest",
            Message::BvStreamResponse(_) => "BvStreamResponse",
            Message::EpStreamRequest(_) => "EpStreamRequest",
            Message::EpStreamResponse(_) => "EpStreamResponse",
            Message::GetPackInfos { .. } => "GetPackInfos",
            Message::PackInfos { .. } => "PackInfos",
            Message::GetPack { .. } => "GetPack",
            Message::Pack { .. } => "Pack",
        }
    }
}

/// Sends messages to named peers
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Our own name
    fn local_id(&self) -> &PeerId;

    /// Deliver a message to a peer
    async fn send(&self, to: &PeerId, msg: Message) -> anyhow::Result<()>;
}

/// Send on a short-lived task; failures are logged
pub fn spawn_send(transport: Arc<dyn PeerTransport>, to: PeerId, msg: Message) -> anyhow::Result<()> {
    let handle = Handle::try_current()
        .map_err(|e| SyncError::transport_error_full("no runtime to send on", to.as_str(), e.to_string()))?;
    handle.spawn(async move {
        let name = msg.name();
        if let Err(e) = transport.send(&to, msg).await {
            warn!("Failed to send {} to {}: {}", name, to, e);
        }
    });
    Ok(())
}
