// =============================================================================
// Matrixon Matrix NextServer - User Device Stream Module
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
//   Per-(user, device) wake primitive for long-polling /sync requests. A
//   stream stores the latest sync position it has seen and a broadcast
//   generation counter; listeners suspend until the generation advances or
//   their request is cancelled, then read the current position.
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

use std::sync::{Arc, Mutex};

use ruma::{OwnedDeviceId, OwnedUserId};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use super::token::StreamingToken;

/// State shared by a stream and its listeners, guarded by the stream lock.
#[derive(Debug)]
struct StreamState {
    /// Latest sync position broadcast on this stream.
    token: StreamingToken,

    /// Bumped on every broadcast. Listeners detect wakeups that raced their
    /// creation by comparing against the generation they subscribed at.
    generation: u64,

    /// Last time a broadcast moved the position forward (or the stream was
    /// handed to a reader). Drives idle eviction.
    last_non_empty: Instant,
}

/// Wakes every /sync request long-polling for one device of one user.
///
/// Owned exclusively by the notifier's stream registry; listeners hold a
/// non-owning handle. Broadcasting never blocks and never fails.
#[derive(Debug)]
pub struct UserDeviceStream {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    state: Mutex<StreamState>,

    // Generation signal. Receivers subscribed before a send observe the
    // change, which is what makes a broadcast between listener creation and
    // wait() impossible to miss.
    wake: watch::Sender<u64>,
}

impl UserDeviceStream {
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        current: StreamingToken,
    ) -> Arc<Self> {
        let (wake, _) = watch::channel(0);
        Arc::new(Self {
            user_id,
            device_id,
            state: Mutex::new(StreamState {
                token: current,
                generation: 0,
                last_non_empty: Instant::now(),
            }),
            wake,
        })
    }

    /// Advances the stored position to `pos` and wakes every waiter.
    ///
    /// The position is merged per stream dimension, so a stale `pos` leaves
    /// the stored token untouched; the generation still advances and waiters
    /// are still woken, they simply observe the unchanged current position.
    pub fn broadcast(&self, pos: StreamingToken) {
        let generation = {
            let mut state = self.state.lock().unwrap();
            let merged = state.token.with_updates(pos);
            if merged != state.token {
                state.token = merged;
                state.last_non_empty = Instant::now();
            }
            state.generation += 1;
            state.generation
        };
        // The token is committed before anyone wakes.
        self.wake.send_replace(generation);
    }

    /// Wakes every waiter without advancing any position. Used when the host
    /// wants in-flight long-polls to return early, e.g. on shutdown.
    pub fn interrupt(&self) {
        let generation = {
            let mut state = self.state.lock().unwrap();
            state.generation += 1;
            state.generation
        };
        self.wake.send_replace(generation);
    }

    /// Returns a listener bound to `cancel`. The listener captures the
    /// stream's generation at this point: any broadcast after this call is
    /// observed by the first `wait`, even one racing it.
    pub fn listener(self: &Arc<Self>, cancel: CancellationToken) -> UserDeviceStreamListener {
        UserDeviceStreamListener {
            stream: Arc::clone(self),
            wake: self.wake.subscribe(),
            cancel,
            woken: false,
        }
    }

    /// Latest sync position broadcast on this stream.
    pub fn current_token(&self) -> StreamingToken {
        self.state.lock().unwrap().token
    }

    /// Last instant the stream made forward progress or was handed to a
    /// reader. Streams idle past the eviction threshold get swept.
    pub fn time_of_last_non_empty(&self) -> Instant {
        self.state.lock().unwrap().last_non_empty
    }

    /// Marks the stream as recently used so the sweep leaves it alone while
    /// a reader it was just handed to is still waiting.
    pub(crate) fn touch(&self) {
        self.state.lock().unwrap().last_non_empty = Instant::now();
    }

    pub fn user_id(&self) -> &OwnedUserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &OwnedDeviceId {
        &self.device_id
    }
}

/// Handle that a long-polling request suspends on until its device stream
/// is woken or the request is cancelled.
#[derive(Debug)]
pub struct UserDeviceStreamListener {
    stream: Arc<UserDeviceStream>,
    wake: watch::Receiver<u64>,
    cancel: CancellationToken,
    woken: bool,
}

impl UserDeviceStreamListener {
    /// Suspends until the stream's generation advances past the one captured
    /// at listener creation, or until the cancellation signal fires. Either
    /// way the stream's current position is returned. Calling `wait` again
    /// after it returned once yields the current position immediately.
    pub async fn wait(&mut self) -> StreamingToken {
        if !self.woken {
            tokio::select! {
                _ = self.wake.changed() => {}
                _ = self.cancel.cancelled() => {}
            }
            self.woken = true;
        }
        self.stream.current_token()
    }

    /// The stream this listener is subscribed to.
    pub fn stream(&self) -> &Arc<UserDeviceStream> {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::{device_id, user_id};
    use std::sync::Once;
    use std::time::Duration;

    static INIT: Once = Once::new();

    /// Initialize test environment
    fn init_test_env() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter("debug")
                .try_init();
        });
    }

    fn test_stream(current: StreamingToken) -> Arc<UserDeviceStream> {
        UserDeviceStream::new(
            user_id!("@alice:matrixon.local").to_owned(),
            device_id!("ALICEPHONE").to_owned(),
            current,
        )
    }

    /// Test: a broadcast wakes a suspended waiter with the new position
    #[tokio::test]
    async fn test_broadcast_wakes_waiter() {
        init_test_env();
        let stream = test_stream(StreamingToken::default());
        let mut listener = stream.listener(CancellationToken::new());

        let waiter = tokio::spawn(async move { listener.wait().await });
        tokio::task::yield_now().await;

        stream.broadcast(StreamingToken::new(5, 0, 0));

        let token = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake after broadcast")
            .expect("waiter task must not panic");
        assert_eq!(token, StreamingToken::new(5, 0, 0));
    }

    /// Test: a broadcast racing listener creation is not lost
    ///
    /// The broadcast lands after the listener exists but before wait() is
    /// called; the first wait must return immediately.
    #[tokio::test]
    async fn test_broadcast_before_wait_is_observed() {
        init_test_env();
        let stream = test_stream(StreamingToken::default());
        let mut listener = stream.listener(CancellationToken::new());

        stream.broadcast(StreamingToken::new(1, 0, 0));

        let token = tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .expect("wait must not block once a broadcast already happened");
        assert_eq!(token, StreamingToken::new(1, 0, 0));
    }

    /// Test: a broadcast before listener creation is NOT delivered
    ///
    /// The listener captures the generation at creation; the reader is
    /// expected to have compared its since-token against the current
    /// position before suspending.
    #[tokio::test]
    async fn test_broadcast_before_listener_creation_not_delivered() {
        init_test_env();
        let stream = test_stream(StreamingToken::default());
        stream.broadcast(StreamingToken::new(1, 0, 0));

        let mut listener = stream.listener(CancellationToken::new());
        let result =
            tokio::time::timeout(Duration::from_millis(50), listener.wait()).await;
        assert!(result.is_err(), "Listener must wait for the next generation");
    }

    /// Test: cancellation returns the current position immediately
    #[tokio::test]
    async fn test_cancellation_returns_current_token() {
        init_test_env();
        let stream = test_stream(StreamingToken::new(3, 1, 0));
        let cancel = CancellationToken::new();
        let mut listener = stream.listener(cancel.clone());

        cancel.cancel();

        let token = tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .expect("cancellation must be observable");
        assert_eq!(token, StreamingToken::new(3, 1, 0));
    }

    /// Test: wait is idempotent once it fired
    #[tokio::test]
    async fn test_second_wait_returns_immediately() {
        init_test_env();
        let stream = test_stream(StreamingToken::default());
        let mut listener = stream.listener(CancellationToken::new());

        stream.broadcast(StreamingToken::new(2, 0, 0));
        let first = listener.wait().await;

        let second = tokio::time::timeout(Duration::from_millis(50), listener.wait())
            .await
            .expect("second wait must not suspend");
        assert_eq!(first, second);
    }

    /// Test: every waiter outstanding at broadcast time wakes
    #[tokio::test]
    async fn test_broadcast_wakes_all_waiters() {
        init_test_env();
        let stream = test_stream(StreamingToken::default());

        let mut waiters = Vec::new();
        for _ in 0..8 {
            let mut listener = stream.listener(CancellationToken::new());
            waiters.push(tokio::spawn(async move { listener.wait().await }));
        }
        tokio::task::yield_now().await;

        stream.broadcast(StreamingToken::new(9, 0, 0));

        for waiter in waiters {
            let token = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("every waiter must wake")
                .expect("waiter task must not panic");
            assert_eq!(token, StreamingToken::new(9, 0, 0));
        }
    }

    /// Test: stale broadcasts wake waiters but do not move the position
    #[tokio::test]
    async fn test_stale_broadcast_keeps_position() {
        init_test_env();
        let stream = test_stream(StreamingToken::new(10, 0, 0));
        let before = stream.time_of_last_non_empty();

        let mut listener = stream.listener(CancellationToken::new());
        stream.broadcast(StreamingToken::new(4, 0, 0));

        let token = listener.wait().await;
        assert_eq!(token, StreamingToken::new(10, 0, 0));
        assert_eq!(
            stream.time_of_last_non_empty(),
            before,
            "No forward progress, so the idle clock must not reset"
        );
    }

    /// Test: interrupt wakes waiters without advancing the position
    #[tokio::test]
    async fn test_interrupt_wakes_without_progress() {
        init_test_env();
        let stream = test_stream(StreamingToken::new(6, 0, 0));
        let mut listener = stream.listener(CancellationToken::new());

        let waiter = tokio::spawn(async move { listener.wait().await });
        tokio::task::yield_now().await;

        stream.interrupt();

        let token = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("interrupt must wake the waiter")
            .expect("waiter task must not panic");
        assert_eq!(token, StreamingToken::new(6, 0, 0));
    }
}
