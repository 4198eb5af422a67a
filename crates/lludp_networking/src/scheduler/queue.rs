//! Traffic classes and the per-circuit priority queues.

use std::collections::VecDeque;

use crate::circuit::OutboundMessage;
use crate::protocol::{Message, MessageId};

/// Outbound traffic class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueClass {
    /// Retransmissions of unacked packets.
    Resend,
    /// High-frequency messages not covered below.
    High,
    /// Object updates and kills.
    Object,
    /// Terrain patches.
    Terrain,
    /// Wind patches.
    Wind,
    /// Cloud and other layer patches.
    Layer,
    /// Medium-frequency messages.
    Medium,
    /// Texture transfer.
    Texture,
    /// Asset transfer.
    Asset,
    /// Low-frequency and fixed messages.
    Low,
}

impl QueueClass {
    /// Order in which a scheduler pass services the classes.
    pub const SERVICE_ORDER: [Self; 10] = [
        Self::Resend,
        Self::High,
        Self::Object,
        Self::Terrain,
        Self::Wind,
        Self::Layer,
        Self::Medium,
        Self::Texture,
        Self::Asset,
        Self::Low,
    ];

    const fn index(self) -> usize {
        match self {
            Self::Resend => 0,
            Self::High => 1,
            Self::Object => 2,
            Self::Terrain => 3,
            Self::Wind => 4,
            Self::Layer => 5,
            Self::Medium => 6,
            Self::Texture => 7,
            Self::Asset => 8,
            Self::Low => 9,
        }
    }

    /// Routes a message to its class.
    #[must_use]
    pub const fn classify(message: &Message) -> Self {
        match message {
            Message::ObjectUpdate { .. }
            | Message::ImprovedTerseObjectUpdate { .. }
            | Message::KillObject { .. } => Self::Object,
            Message::LayerData { layer_type, .. } => match *layer_type {
                b'L' => Self::Terrain,
                b'7' => Self::Wind,
                _ => Self::Layer,
            },
            Message::Generic { id, .. } => match *id {
                MessageId::IMAGE_DATA | MessageId::IMAGE_PACKET => Self::Texture,
                MessageId::TRANSFER_PACKET => Self::Asset,
                other => Self::by_frequency(other),
            },
            other => Self::by_frequency(other.id()),
        }
    }

    const fn by_frequency(id: MessageId) -> Self {
        match id {
            MessageId::High(_) => Self::High,
            MessageId::Medium(_) => Self::Medium,
            MessageId::Low(_) | MessageId::Fixed(_) => Self::Low,
        }
    }
}

/// FIFO queues, one per class. Owned by the transmit scheduler alone.
#[derive(Debug, Default)]
pub struct OutboundQueueSet {
    resend: VecDeque<u32>,
    messages: [VecDeque<OutboundMessage>; 10],
}

impl OutboundQueueSet {
    /// Creates empty queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message to its class queue and returns the class.
    pub fn push(&mut self, message: OutboundMessage) -> QueueClass {
        let class = QueueClass::classify(&message.message);
        self.messages[class.index()].push_back(message);
        class
    }

    /// Appends a retransmission request.
    pub fn push_resend(&mut self, sequence: u32) {
        self.resend.push_back(sequence);
    }

    /// Takes the next retransmission.
    pub fn pop_resend(&mut self) -> Option<u32> {
        self.resend.pop_front()
    }

    /// Takes the head of a class queue.
    pub fn pop(&mut self, class: QueueClass) -> Option<OutboundMessage> {
        self.messages[class.index()].pop_front()
    }

    /// Whether a class has work.
    #[must_use]
    pub fn has(&self, class: QueueClass) -> bool {
        match class {
            QueueClass::Resend => !self.resend.is_empty(),
            other => !self.messages[other.index()].is_empty(),
        }
    }

    /// Number of queued items in a class.
    #[must_use]
    pub fn len_of(&self, class: QueueClass) -> usize {
        match class {
            QueueClass::Resend => self.resend.len(),
            other => self.messages[other.index()].len(),
        }
    }

    /// Whether every queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resend.is_empty() && self.messages.iter().all(VecDeque::is_empty)
    }
}
