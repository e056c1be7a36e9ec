// =============================================================================
// Matrixon Matrix NextServer - Membership Index Module
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
//   Authoritative in-memory cache of which users are joined to which rooms,
//   used by the sync notifier to route room events to the right /sync
//   streams. Rebuilt from storage at startup and kept current by the room
//   event ingest path.
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

use std::collections::{HashMap, HashSet};

use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};

/// room_id => set of joined user_ids.
///
/// Only the room event ingest path mutates this; every access happens under
/// the notifier's stream lock.
#[derive(Debug, Default)]
pub struct RoomMembershipIndex {
    joined: HashMap<OwnedRoomId, HashSet<OwnedUserId>>,
}

impl RoomMembershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-marks the given users as joined to the given rooms. Additive:
    /// rooms already present keep the members they have.
    pub fn set_bulk(&mut self, room_to_users: HashMap<OwnedRoomId, Vec<OwnedUserId>>) {
        for (room_id, user_ids) in room_to_users {
            self.joined.entry(room_id).or_default().extend(user_ids);
        }
    }

    pub fn add_joined(&mut self, room_id: &RoomId, user_id: &UserId) {
        self.joined
            .entry(room_id.to_owned())
            .or_default()
            .insert(user_id.to_owned());
    }

    pub fn remove_joined(&mut self, room_id: &RoomId, user_id: &UserId) {
        if let Some(users) = self.joined.get_mut(room_id) {
            users.remove(user_id);
        }
    }

    /// Snapshot of the users currently joined to `room_id`. Order is
    /// unspecified.
    pub fn joined_users(&self, room_id: &RoomId) -> Vec<OwnedUserId> {
        self.joined
            .get(room_id)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty()
    }

    pub fn len(&self) -> usize {
        self.joined.len()
    }
}
