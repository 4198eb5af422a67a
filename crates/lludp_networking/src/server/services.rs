//! Collaborator interfaces the dispatcher calls into.
//!
//! Everything here is implemented outside the transport (presence, chat,
//! messaging, the scene graph). Each trait has no-op defaults so callers
//! override only what they use.

use std::sync::Arc;

use uuid::Uuid;

use crate::circuit::{CircuitIdentity, CloseReason};
use crate::objects::ObjectUpdateInfo;
use crate::protocol::Message;
pub use crate::scheduler::{IdleStats, RegionStats, StatsSource};

/// Agent presence bookkeeping.
pub trait PresenceService: Send + Sync {
    /// The agent completed a logout handshake.
    fn agent_logged_out(&self, _identity: &CircuitIdentity) {}

    /// The agent's circuit closed, for any reason.
    fn circuit_closed(&self, _identity: &CircuitIdentity, _reason: CloseReason) {}
}

/// Local chat typed by a viewer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatRequest {
    /// Speaker.
    pub from: CircuitIdentity,
    /// Text.
    pub message: String,
    /// Whisper, say, shout...
    pub chat_type: u8,
    /// Channel; 0 is public.
    pub channel: i32,
}

/// Receives chat from viewers.
pub trait ChatService: Send + Sync {
    /// Handles one line of chat.
    fn chat_from_viewer(&self, _request: ChatRequest) {}
}

/// An instant message sent by a viewer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstantMessage {
    /// Sender.
    pub from: CircuitIdentity,
    /// Recipient agent.
    pub to_agent_id: Uuid,
    /// Dialog type.
    pub dialog: u8,
    /// Sender display name.
    pub from_name: String,
    /// Text.
    pub message: String,
}

/// Receives instant messages from viewers.
pub trait InstantMessageService: Send + Sync {
    /// Handles one instant message.
    fn instant_message(&self, _message: InstantMessage) {}
}

/// Read-only view of the scene used when an agent enters the region.
pub trait SceneView: Send + Sync {
    /// Every entity a newly arrived agent should be told about.
    fn entities(&self) -> Vec<ObjectUpdateInfo> {
        Vec::new()
    }

    /// The agent's own avatar, announced to everyone else.
    fn avatar(&self, _agent_id: &Uuid) -> Option<ObjectUpdateInfo> {
        None
    }
}

/// Fallback for application messages the dispatcher does not route itself.
pub trait InboundHandler: Send + Sync {
    /// Handles one message from `from`.
    fn handle(&self, from: &CircuitIdentity, message: Message);
}

/// Implements every service as a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullServices;

impl PresenceService for NullServices {}
impl ChatService for NullServices {}
impl InstantMessageService for NullServices {}
impl SceneView for NullServices {}

/// The set of collaborators a server is wired to.
#[derive(Clone)]
pub struct Services {
    /// Presence tracking.
    pub presence: Arc<dyn PresenceService>,
    /// Chat relay.
    pub chat: Arc<dyn ChatService>,
    /// Instant messaging.
    pub instant_messages: Arc<dyn InstantMessageService>,
    /// Scene enumeration for region entry.
    pub scene: Arc<dyn SceneView>,
    /// Telemetry for `SimStats`.
    pub stats: Arc<dyn StatsSource>,
    /// Everything else; unrouted messages are logged and dropped when absent.
    pub inbound: Option<Arc<dyn InboundHandler>>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            presence: Arc::new(NullServices),
            chat: Arc::new(NullServices),
            instant_messages: Arc::new(NullServices),
            scene: Arc::new(NullServices),
            stats: Arc::new(IdleStats),
            inbound: None,
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("inbound", &self.inbound.is_some())
            .finish_non_exhaustive()
    }
}
