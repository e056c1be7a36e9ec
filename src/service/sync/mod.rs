// =============================================================================
// Matrixon Matrix NextServer - Sync Notifier Module
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
//   Wakes sleeping /sync requests when there is new data. The notifier
//   never hands out event payloads, only the sync position readers use to
//   query storage; this prevents races whereby the caller is told about an
//   event after the position has already advanced past it, resulting in
//   missed events.
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

mod data;
pub mod membership;
pub mod stream;
pub mod token;

pub use data::Data;
pub use membership::RoomMembershipIndex;
pub use stream::{UserDeviceStream, UserDeviceStreamListener};
pub use token::StreamingToken;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use ruma::{
    events::room::member::MembershipState, DeviceId, OwnedDeviceId, OwnedUserId, RoomId, UserId,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{service::pdu::PduEvent, utils, Result};

/// Tuning knobs for the device stream registry.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Minimum interval between two idle-stream sweeps.
    pub cleanup_interval: Duration,

    /// How long a stream may sit without forward progress (and without
    /// being handed to a reader) before the sweep evicts it.
    pub stream_idle_timeout: Duration,

    /// Hard cap on the number of device streams. On overflow the oldest
    /// idle stream is dropped to make room.
    pub max_streams: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            stream_idle_timeout: Duration::from_secs(5 * 60),
            max_streams: 65_536,
        }
    }
}

/// Who a room event wakeup is addressed to.
///
/// Room event producers know the event, internal callers sometimes only
/// know the room or the exact users. Making the three shapes explicit keeps
/// membership bookkeeping on the one path that actually carries an event.
#[derive(Debug)]
pub enum EventAudience<'a> {
    /// Fan out to everyone joined to the event's room, applying any
    /// membership transition the event carries.
    Event(&'a PduEvent),

    /// Fan out to everyone joined to the room.
    Room(&'a RoomId),

    /// Fan out to exactly these users.
    Users(&'a [OwnedUserId]),
}

/// What the long-poll handler knows about one /sync request.
#[derive(Debug)]
pub struct SyncRequest {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,

    /// Fired by the handler when the request's deadline passes or the
    /// connection goes away.
    pub cancel: CancellationToken,

    /// The reader's previous cursor. The handler uses it to decide whether
    /// to wait at all; the notifier does not consume it.
    pub since: Option<StreamingToken>,
}

/// Registry, routing table and current position, guarded by the stream lock.
struct NotifierInner {
    /// The latest sync position.
    current_position: StreamingToken,

    /// room_id => joined users; mutated only on the room event ingest path.
    membership: RoomMembershipIndex,

    /// user_id => device_id => stream that wakes that device's /sync.
    streams: HashMap<OwnedUserId, HashMap<OwnedDeviceId, Arc<UserDeviceStream>>>,

    /// Total stream count across all users, kept for the registry cap.
    stream_count: usize,

    /// When the idle sweep last ran.
    last_cleanup: Instant,
}

/// Wakes up sleeping /sync requests when there is new data.
///
/// Producers push position updates in, long-poll readers take listeners
/// out. The position is always advanced before any stream is woken, and
/// both happen under one lock, so a woken reader can never observe a
/// position older than the data that woke it.
pub struct Notifier {
    inner: Mutex<NotifierInner>,
    config: NotifierConfig,
}

impl Notifier {
    /// Creates a notifier starting at the given sync position. To be of any
    /// use it must be told who is joined where via [`Notifier::load`]
    /// before the first room event arrives.
    pub fn new(current_position: StreamingToken) -> Self {
        Self::with_config(current_position, NotifierConfig::default())
    }

    pub fn with_config(current_position: StreamingToken, config: NotifierConfig) -> Self {
        Self {
            inner: Mutex::new(NotifierInner {
                current_position,
                membership: RoomMembershipIndex::new(),
                streams: HashMap::new(),
                stream_count: 0,
                last_cleanup: Instant::now(),
            }),
            config,
        }
    }

    /// Bulk-populates the membership index from storage. Must complete
    /// before any call to [`Notifier::on_new_event`], otherwise events in
    /// rooms whose membership has not been learned yet wake nobody.
    #[instrument(level = "debug", skip(self, db))]
    pub async fn load(&self, db: &dyn Data) -> Result<()> {
        let room_to_users = db.all_joined_users_in_rooms().await?;

        let mut inner = self.inner.lock().unwrap();
        inner.membership.set_bulk(room_to_users);
        info!("🏠 Loaded joined membership for {} rooms", inner.membership.len());
        Ok(())
    }

    /// Called by the room event consumer when a new event arrives. Must
    /// only be invoked from a single task at a time: concurrent callers
    /// could commit membership transitions out of order.
    ///
    /// `pos_update` carries the latest position for the stream(s) the
    /// caller owns, zeros elsewhere.
    #[instrument(level = "debug", skip(self, audience))]
    pub fn on_new_event(&self, audience: EventAudience<'_>, pos_update: StreamingToken) {
        // The position must be committed before anyone wakes, as woken
        // readers will immediately read it back.
        let mut inner = self.inner.lock().unwrap();
        inner.current_position = inner.current_position.with_updates(pos_update);
        let latest = inner.current_position;

        self.remove_idle_streams(&mut inner);

        match audience {
            EventAudience::Event(pdu) => {
                let mut users_to_wake = inner.membership.joined_users(&pdu.room_id);

                if pdu.is_membership_event() {
                    let state_key = pdu.state_key.as_deref().unwrap_or_default();
                    match (UserId::parse(state_key), pdu.membership()) {
                        (Ok(target), Ok(membership)) => match membership {
                            MembershipState::Invite => {
                                // The invitee must learn about the invite
                                // before they are joined to anything.
                                users_to_wake.push(target);
                            }
                            MembershipState::Join => {
                                inner.membership.add_joined(&pdu.room_id, &target);
                                users_to_wake.push(target);
                            }
                            MembershipState::Leave | MembershipState::Ban => {
                                inner.membership.remove_joined(&pdu.room_id, &target);
                            }
                            _ => {}
                        },
                        (Err(e), _) => {
                            error!(
                                "⏰ [{}] ❌ Member event {} has invalid state_key: {}",
                                utils::millis_since_unix_epoch(),
                                pdu.event_id,
                                e
                            );
                        }
                        (_, Err(e)) => {
                            error!(
                                "⏰ [{}] ❌ Failed to parse member event: {}",
                                utils::millis_since_unix_epoch(),
                                e
                            );
                        }
                    }
                }

                Self::wake_users(&inner, &users_to_wake, latest);
            }
            EventAudience::Room(room_id) => {
                let users_to_wake = inner.membership.joined_users(room_id);
                Self::wake_users(&inner, &users_to_wake, latest);
            }
            EventAudience::Users(user_ids) if !user_ids.is_empty() => {
                Self::wake_users(&inner, user_ids, latest);
            }
            EventAudience::Users(_) => {
                warn!(
                    "⏰ [{}] ⚠️ Room event notification for position {} carried no user to wake up",
                    utils::millis_since_unix_epoch(),
                    latest
                );
            }
        }
    }

    /// Called by the send-to-device consumer. Wakes only the named devices
    /// of the named user; send-to-device traffic is explicitly addressed,
    /// so room membership plays no part.
    #[instrument(level = "debug", skip(self))]
    pub fn on_new_send_to_device(
        &self,
        user_id: &UserId,
        device_ids: &[OwnedDeviceId],
        pos_update: StreamingToken,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.current_position = inner.current_position.with_updates(pos_update);
        let latest = inner.current_position;

        let Some(devices) = inner.streams.get(user_id) else {
            return;
        };
        for device_id in device_ids {
            if let Some(stream) = devices.get(device_id) {
                stream.broadcast(latest);
            }
        }
    }

    /// Called by the device key change consumer. Wakes every device of
    /// `wake_user_id`; `key_change_user_id` is whose keys changed, which
    /// readers use to filter their response, not the notifier to route.
    #[instrument(level = "debug", skip(self))]
    pub fn on_new_key_change(
        &self,
        pos_update: StreamingToken,
        wake_user_id: &UserId,
        key_change_user_id: &UserId,
    ) {
        debug!("🔑 Key change for {key_change_user_id} waking {wake_user_id}");

        let mut inner = self.inner.lock().unwrap();
        inner.current_position = inner.current_position.with_updates(pos_update);
        let latest = inner.current_position;

        Self::wake_users(&inner, &[wake_user_id.to_owned()], latest);
    }

    /// Returns a listener a /sync request can wait on for updates to this
    /// device. The listener observes every broadcast from this call on, so
    /// a wakeup racing the request cannot be missed.
    #[instrument(level = "debug", skip(self, request))]
    pub fn get_listener(&self, request: &SyncRequest) -> UserDeviceStreamListener {
        let mut inner = self.inner.lock().unwrap();

        self.remove_idle_streams(&mut inner);

        let stream =
            self.fetch_or_create_stream(&mut inner, &request.user_id, &request.device_id);
        // Keep the sweep away from a stream that is about to be waited on.
        stream.touch();
        stream.listener(request.cancel.clone())
    }

    /// The latest sync position.
    pub fn current_position(&self) -> StreamingToken {
        self.inner.lock().unwrap().current_position
    }

    /// Wakes every stream without advancing any position, so in-flight
    /// long-polls return promptly with the current token. Fired by the
    /// host when it wants sync workers to drain, e.g. at shutdown.
    pub fn interrupt_all(&self) {
        let inner = self.inner.lock().unwrap();
        info!("Interrupting {} device streams", inner.stream_count);
        for devices in inner.streams.values() {
            for stream in devices.values() {
                stream.interrupt();
            }
        }
    }

    /// Wakes every device stream of every listed user. Streams are only
    /// ever touched under the stream lock, which the caller holds.
    fn wake_users(inner: &NotifierInner, user_ids: &[OwnedUserId], latest: StreamingToken) {
        for user_id in user_ids {
            if let Some(devices) = inner.streams.get(user_id) {
                for stream in devices.values() {
                    stream.broadcast(latest);
                }
            }
        }
    }

    /// Fetches the stream for this device, creating it at the current
    /// position if the device has none yet.
    fn fetch_or_create_stream(
        &self,
        inner: &mut NotifierInner,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Arc<UserDeviceStream> {
        let current = inner.current_position;

        let exists = inner
            .streams
            .get(user_id)
            .is_some_and(|devices| devices.contains_key(device_id));
        if !exists && inner.stream_count >= self.config.max_streams {
            Self::evict_oldest_idle(inner);
        }

        let devices = inner.streams.entry(user_id.to_owned()).or_default();
        if let Some(stream) = devices.get(device_id) {
            Arc::clone(stream)
        } else {
            debug!("Creating device stream for {user_id}/{device_id}");
            let stream =
                UserDeviceStream::new(user_id.to_owned(), device_id.to_owned(), current);
            devices.insert(device_id.to_owned(), Arc::clone(&stream));
            inner.stream_count += 1;
            stream
        }
    }

    /// Sweeps out streams that have sat idle past the eviction threshold.
    /// Runs at most once per cleanup interval; the caller holds the stream
    /// lock. A stream handed to a reader is touched first, so a sweep can
    /// never remove a stream someone is about to wait on.
    fn remove_idle_streams(&self, inner: &mut NotifierInner) {
        let now = Instant::now();
        if now.duration_since(inner.last_cleanup) < self.config.cleanup_interval {
            return;
        }
        inner.last_cleanup = now;

        let threshold = self.config.stream_idle_timeout;
        let before = inner.stream_count;
        inner.streams.retain(|_, devices| {
            devices.retain(|_, stream| {
                now.duration_since(stream.time_of_last_non_empty()) <= threshold
            });
            !devices.is_empty()
        });
        inner.stream_count = inner.streams.values().map(|devices| devices.len()).sum();

        if inner.stream_count < before {
            debug!("Swept {} idle device streams", before - inner.stream_count);
        }
    }

    /// Drops the stream that has gone longest without activity, to make
    /// room when the registry is full.
    fn evict_oldest_idle(inner: &mut NotifierInner) {
        let oldest = inner
            .streams
            .iter()
            .flat_map(|(user_id, devices)| {
                devices.iter().map(move |(device_id, stream)| {
                    (
                        user_id.clone(),
                        device_id.clone(),
                        stream.time_of_last_non_empty(),
                    )
                })
            })
            .min_by_key(|(_, _, last_non_empty)| *last_non_empty);

        let Some((user_id, device_id, _)) = oldest else {
            return;
        };
        warn!(
            "⚠️ Device stream registry is full, dropping the oldest idle stream {}/{}",
            user_id, device_id
        );
        if let Some(devices) = inner.streams.get_mut(&user_id) {
            devices.remove(&device_id);
            if devices.is_empty() {
                inner.streams.remove(&user_id);
            }
        }
        inner.stream_count -= 1;
    }
}
