// =============================================================================
// Matrixon Matrix NextServer - Streaming Token Module
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
//   Composite streaming position token for the sync notifier. Carries one
//   monotonic position per event stream so that producers can publish the
//   dimension they own without reading global state first.
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

use std::{cmp, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Composite sync position, one monotonic counter per event stream.
///
/// A zero in any dimension means "no update for this stream": merging keeps
/// the other side's position, so a producer only ever fills in the dimension
/// it owns. There is no total order across the composite; readers compare on
/// the dimension(s) they care about.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingToken {
    /// Position in the room (PDU) event stream.
    pub pdu_position: u64,

    /// Position in the send-to-device stream.
    pub send_to_device_position: u64,

    /// Position in the device key change stream.
    pub key_change_position: u64,
}

impl StreamingToken {
    pub fn new(
        pdu_position: u64,
        send_to_device_position: u64,
        key_change_position: u64,
    ) -> Self {
        Self {
            pdu_position,
            send_to_device_position,
            key_change_position,
        }
    }

    /// Returns a copy of this token with all positions advanced to the
    /// maximum of both sides. Positions only move forward, so a zero on
    /// either side never wins against a real position.
    pub fn with_updates(self, other: StreamingToken) -> StreamingToken {
        StreamingToken {
            pdu_position: cmp::max(self.pdu_position, other.pdu_position),
            send_to_device_position: cmp::max(
                self.send_to_device_position,
                other.send_to_device_position,
            ),
            key_change_position: cmp::max(self.key_change_position, other.key_change_position),
        }
    }

    /// True when `self` is strictly ahead of `other` on at least one stream.
    pub fn is_after(&self, other: &StreamingToken) -> bool {
        self.pdu_position > other.pdu_position
            || self.send_to_device_position > other.send_to_device_position
            || self.key_change_position > other.key_change_position
    }

    /// True when no stream carries a position.
    pub fn is_empty(&self) -> bool {
        *self == StreamingToken::default()
    }
}

impl fmt::Display for StreamingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.pdu_position, self.send_to_device_position, self.key_change_position
        )
    }
}

impl FromStr for StreamingToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut positions = s.split('_').map(|part| {
            part.parse::<u64>()
                .map_err(|_| Error::BadToken(s.to_owned()))
        });

        let token = StreamingToken {
            pdu_position: positions.next().ok_or_else(|| Error::BadToken(s.to_owned()))??,
            send_to_device_position: positions
                .next()
                .ok_or_else(|| Error::BadToken(s.to_owned()))??,
            key_change_position: positions
                .next()
                .ok_or_else(|| Error::BadToken(s.to_owned()))??,
        };

        if positions.next().is_some() {
            return Err(Error::BadToken(s.to_owned()));
        }

        Ok(token)
    }
}
