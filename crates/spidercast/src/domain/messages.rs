//! # Wire Vocabulary
//!
//! Logical protocol messages. Every message travels inside an `Envelope`
//! carrying the bus name, the sender's membership record and the intended
//! receiver; the byte framing belongs to `adapters::codec`.

use serde::{Deserialize, Serialize};

use super::attribute_table::AttributeEntry;
use super::entities::{NodeRecord, NodeVersion};
use super::value_objects::LinkType;

/// Addressed protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub bus_name: String,
    pub sender: NodeRecord,
    /// Intended receiver; `None` when the sender does not know it yet
    /// (bootstrap discovery, multicast).
    pub target: Option<String>,
    pub body: Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Topology(TopologyMessage),
    Membership(MembershipMessage),
    Metadata(MetadataMessage),
}

impl Message {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Message::Topology(msg) => msg.label(),
            Message::Membership(MembershipMessage::Update { .. }) => "membership-update",
            Message::Metadata(MetadataMessage::Update { .. }) => "metadata-update",
            Message::Metadata(MetadataMessage::Request { .. }) => "metadata-request",
            Message::Metadata(MetadataMessage::Reply { .. }) => "metadata-reply",
        }
    }
}

// =============================================================================
// TOPOLOGY
// =============================================================================

/// Transport a discovery exchange runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryTransport {
    Tcp,
    Udp,
    Multicast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TopologyMessage {
    /// Partial view of the requester, always sent as a single part.
    DiscoveryRequest {
        transport: DiscoveryTransport,
        view: Vec<NodeRecord>,
        part: u32,
        total: u32,
    },
    /// One part of the responder's view.
    DiscoveryReply {
        transport: DiscoveryTransport,
        view: Vec<NodeRecord>,
        part: u32,
        total: u32,
    },
    ConnectSuccessor,
    ConnectSuccessorOk {
        accepted: bool,
    },
    ConnectRandomRequest {
        vacancy: i32,
        urgent: bool,
    },
    ConnectRandomReply {
        accepted: bool,
        vacancy: i32,
        /// Alternative candidate proposed by a full receiver.
        redirect: Option<NodeRecord>,
    },
    ConnectStructuredRequest {
        degree: u32,
    },
    ConnectStructuredReply {
        accepted: bool,
        degree: u32,
    },
    DisconnectRequest {
        link_type: LinkType,
        vacancy: i32,
    },
    DisconnectReply {
        link_type: LinkType,
        accepted: bool,
        vacancy: i32,
    },
    NodeLeave {
        version: NodeVersion,
    },
    DegreeChanged {
        vacancy: i32,
    },
}

impl TopologyMessage {
    pub fn label(&self) -> &'static str {
        match self {
            TopologyMessage::DiscoveryRequest { .. } => "discovery-request",
            TopologyMessage::DiscoveryReply { .. } => "discovery-reply",
            TopologyMessage::ConnectSuccessor => "connect-successor",
            TopologyMessage::ConnectSuccessorOk { .. } => "connect-successor-ok",
            TopologyMessage::ConnectRandomRequest { .. } => "connect-random-request",
            TopologyMessage::ConnectRandomReply { .. } => "connect-random-reply",
            TopologyMessage::ConnectStructuredRequest { .. } => "connect-structured-request",
            TopologyMessage::ConnectStructuredReply { .. } => "connect-structured-reply",
            TopologyMessage::DisconnectRequest { .. } => "disconnect-request",
            TopologyMessage::DisconnectReply { .. } => "disconnect-reply",
            TopologyMessage::NodeLeave { .. } => "node-leave",
            TopologyMessage::DegreeChanged { .. } => "degree-changed",
        }
    }
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// Why a node left the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepartureKind {
    Leave,
    Suspect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartureRecord {
    pub name: String,
    pub version: NodeVersion,
    pub kind: DepartureKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MembershipMessage {
    Update {
        joined: Vec<NodeRecord>,
        departed: Vec<DepartureRecord>,
    },
}

// =============================================================================
// METADATA (ANTI-ENTROPY)
// =============================================================================

/// `(name, node version, table version)` triple of a digest or request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestItem {
    pub name: String,
    pub version: NodeVersion,
    pub table_version: u64,
}

/// Delta carried by a reply item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableDelta {
    /// Entries newer than the requested version; empty when already equal.
    Entries(Vec<AttributeEntry>),
    /// The responder no longer holds this incarnation.
    Invalidated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyItem {
    pub name: String,
    pub version: NodeVersion,
    pub table_version: u64,
    pub delta: TableDelta,
}

impl ReplyItem {
    /// Entry count as reported on the wire; −1 marks an invalidation.
    pub fn entry_count(&self) -> i64 {
        match &self.delta {
            TableDelta::Entries(entries) => entries.len() as i64,
            TableDelta::Invalidated => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataMessage {
    Update { digest: Vec<DigestItem> },
    Request { digest: Vec<DigestItem> },
    Reply { items: Vec<ReplyItem> },
}
