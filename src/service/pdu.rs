// =============================================================================
// Matrixon Matrix NextServer - Pdu Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 2.0.0-alpha (PostgreSQL Backend)
// License: Apache 2.0 / MIT
//
// Description:
//   The slice of a room event the sync notifier needs for routing: room,
//   sender, event type and, for m.room.member events, the membership
//   transition carried in the content.
//
// Performance Targets:
//   • 20k+ concurrent connections
//   • <50ms response latency
//   • >99% success rate
//   • Memory-efficient operation
//   • Horizontal scalability
//
// Features:
//   • Business logic implementation
//   • Service orchestration
//   • Event handling and processing
//   • State management
//   • Enterprise-grade reliability
//
// Architecture:
//   • Async/await native implementation
//   • Zero-copy operations where possible
//   • Memory pool optimization
//   • Lock-free data structures
//   • Enterprise monitoring integration
//
// Dependencies:
//   • Tokio async runtime
//   • Structured logging with tracing
//   • Error handling with anyhow/thiserror
//   • Serialization with serde
//   • Matrix protocol types with ruma
//
// References:
//   • Matrix.org specification: https://matrix.org/
//   • Synapse reference: https://github.com/element-hq/synapse
//   • Matrix spec: https://spec.matrix.org/
//   • Performance guidelines: Internal Matrixon documentation
//
// Quality Assurance:
//   • Comprehensive unit testing
//   • Integration test coverage
//   • Performance benchmarking
//   • Memory leak detection
//   • Security audit compliance
//
// =============================================================================

use std::sync::Arc;

use ruma::{
    events::{
        room::member::{MembershipState, RoomMemberEventContent},
        TimelineEventType,
    },
    EventId, OwnedRoomId, OwnedUserId, UInt,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue as RawJsonValue;

use crate::{Error, Result};

#[derive(Clone, Deserialize, Debug, Serialize)]
pub struct PduEvent {
    pub event_id: Arc<EventId>,
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    pub origin_server_ts: UInt,
    #[serde(rename = "type")]
    pub kind: TimelineEventType,
    pub content: Box<RawJsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
}

impl PduEvent {
    /// True when this is an m.room.member state event.
    pub fn is_membership_event(&self) -> bool {
        self.kind == TimelineEventType::RoomMember && self.state_key.is_some()
    }

    /// Parses the membership transition out of an m.room.member event's
    /// content.
    pub fn membership(&self) -> Result<MembershipState> {
        serde_json::from_str::<RoomMemberEventContent>(self.content.get())
            .map(|content| content.membership)
            .map_err(|e| {
                Error::BadEvent(format!(
                    "event {} has invalid m.room.member content: {e}",
                    self.event_id
                ))
            })
    }
}
