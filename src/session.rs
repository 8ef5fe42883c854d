//! Reconnect-supervised chat session.
//!
//! [`ChatSession`] wraps a [`Connect`] factory with the subscription
//! lifecycle: it owns the single live connection, watches heartbeat
//! liveness, and recovers from transport drops with bounded exponential
//! backoff. Every reconnect attempt opens a brand-new connection, which
//! fetches a fresh credential, so retry loops caused purely by token expiry
//! cannot happen.
//!
//! Events reach the consumer over an unbounded channel of [`SessionEvent`]s
//! read by a single task. The channel closing marks the end of the session;
//! at most one terminal [`SessionEvent::Error`] precedes it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{Connect, EventStream};
use crate::error::Error;
use crate::observability::{
    SESSION_CONNECTS, SESSION_HEARTBEAT_TIMEOUTS, SESSION_RECONNECTS, SESSION_RETRY_BACKOFF,
    SESSION_TERMINAL_ERRORS, STREAM_DECODE_ERRORS, STREAM_FRAGMENTS,
};
use crate::types::StreamEvent;

/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default backoff base delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
/// Default client-side heartbeat timeout, sized against the server's 15s cadence.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(120);

///////////////////////////////////////////// RetryPolicy ////////////////////////////////////////////

/// Bounded exponential backoff policy for reconnect attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of reconnect attempts before the session reports a
    /// terminal error.
    pub max_retries: u32,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// The delay scheduled before the given 1-indexed reconnect attempt:
    /// `base_delay * 2^(attempt - 1)`.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

//////////////////////////////////////////// SessionEvent ////////////////////////////////////////////

/// An event surfaced to the session's consumer.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// The subscription is live. Resets the backoff schedule.
    Connected,
    /// One incremental piece of bot text, in arrival order.
    Fragment(String),
    /// The current bot turn is complete.
    Done,
    /// Terminal failure; the channel closes after this event.
    Error(Error),
}

///////////////////////////////////////////// ChatSession ////////////////////////////////////////////

/// A chat session supervised by the reconnection controller.
///
/// There is never more than one live connection per session: `subscribe`
/// tears down any previous supervision task before spawning a new one, and
/// the supervision task owns its connection exclusively.
pub struct ChatSession<C: Connect> {
    connector: Arc<C>,
    policy: RetryPolicy,
    heartbeat_timeout: Duration,
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<C: Connect> ChatSession<C> {
    /// Creates a session around a connection factory with default policy.
    pub fn new(connector: C) -> Self {
        ChatSession {
            connector: Arc::new(connector),
            policy: RetryPolicy::default(),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            task: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Starts (or restarts) the subscription and returns the event receiver.
    ///
    /// Idempotent in the sense required by the protocol: any existing
    /// connection is closed first, so at most one connection is ever live.
    /// The previous receiver, if any, observes its channel closing.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.disconnect();
        self.cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::clone(&self.connector);
        let policy = self.policy;
        let heartbeat_timeout = self.heartbeat_timeout;
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(async move {
            supervise(connector, policy, heartbeat_timeout, tx, cancel).await;
        }));
        rx
    }

    /// Terminates the session.
    ///
    /// Cancels the live connection and any pending backoff sleep; no further
    /// reconnect fires even if one was already scheduled. Cancellation is
    /// total: there is no mode that stops retrying but keeps the current
    /// connection open. Idempotent, and also runs on drop.
    pub fn disconnect(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<C: Connect> Drop for ChatSession<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

//////////////////////////////////////////// supervision /////////////////////////////////////////////

enum DrainOutcome {
    Cancelled,
    Transport(Error),
}

/// The supervision loop: connect, drain, back off, reconnect.
async fn supervise<C: Connect>(
    connector: Arc<C>,
    policy: RetryPolicy,
    heartbeat_timeout: Duration,
    tx: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut retry_count: u32 = 0;
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connector.connect() => result,
        };

        match connected {
            Ok(stream) => {
                SESSION_CONNECTS.click();
                match drain(stream, heartbeat_timeout, &tx, &cancel, &mut retry_count).await {
                    DrainOutcome::Cancelled => return,
                    DrainOutcome::Transport(_) => {}
                }
            }
            Err(err) if !err.is_retryable() => {
                // Credential unavailable or rejected; retrying cannot help.
                SESSION_TERMINAL_ERRORS.click();
                let _ = tx.send(SessionEvent::Error(err));
                return;
            }
            Err(_) => {}
        }

        if retry_count >= policy.max_retries {
            SESSION_TERMINAL_ERRORS.click();
            let _ = tx.send(SessionEvent::Error(Error::retries_exhausted(
                retry_count,
                "transport kept failing; giving up on this session",
            )));
            return;
        }

        retry_count += 1;
        SESSION_RECONNECTS.click();
        let delay = policy.delay_before_attempt(retry_count);
        SESSION_RETRY_BACKOFF.add(delay.as_secs_f64());
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Reads one connection until it dies, forwarding events to the consumer.
///
/// A heartbeat timeout, a stream error, or the server closing the stream all
/// count as transport failure. Frames that fail to decode are skipped; the
/// transport is still alive and delivery stays in arrival order.
async fn drain(
    mut stream: EventStream,
    heartbeat_timeout: Duration,
    tx: &mpsc::UnboundedSender<SessionEvent>,
    cancel: &CancellationToken,
    retry_count: &mut u32,
) -> DrainOutcome {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return DrainOutcome::Cancelled,
            next = tokio::time::timeout(heartbeat_timeout, stream.next()) => next,
        };
        match next {
            Err(_elapsed) => {
                SESSION_HEARTBEAT_TIMEOUTS.click();
                return DrainOutcome::Transport(Error::timeout(
                    "no heartbeat from server",
                    Some(heartbeat_timeout.as_secs_f64()),
                ));
            }
            Ok(None) => {
                return DrainOutcome::Transport(Error::streaming(
                    "stream closed by server",
                    None,
                ));
            }
            Ok(Some(Ok(event))) => match event {
                StreamEvent::Connected => {
                    *retry_count = 0;
                    let _ = tx.send(SessionEvent::Connected);
                }
                StreamEvent::Message(message) => {
                    STREAM_FRAGMENTS.click();
                    let _ = tx.send(SessionEvent::Fragment(message.content));
                }
                StreamEvent::Done => {
                    let _ = tx.send(SessionEvent::Done);
                }
                StreamEvent::Heartbeat => {}
            },
            Ok(Some(Err(err))) if err.is_retryable() => {
                return DrainOutcome::Transport(err);
            }
            Ok(Some(Err(_))) => {
                // Malformed frame; the connection itself is still healthy.
                STREAM_DECODE_ERRORS.click();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::stream;
    use tokio::time::Instant;

    use crate::error::Result;
    use crate::types::MessageEvent;

    enum Outcome {
        Fail(Error),
        Stream(Vec<Result<StreamEvent>>),
        /// A stream that delivers its events and then hangs forever.
        StallAfter(Vec<Result<StreamEvent>>),
    }

    /// Connector that replays a script of connect outcomes and records when
    /// each connect happened.
    struct Scripted {
        outcomes: Mutex<VecDeque<Outcome>>,
        connects: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Outcome>) -> Self {
            Scripted {
                outcomes: Mutex::new(outcomes.into()),
                connects: Mutex::new(Vec::new()),
            }
        }

        fn connect_instants(&self) -> Vec<Instant> {
            self.connects.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connect for Arc<Scripted> {
        async fn connect(&self) -> Result<EventStream> {
            self.connects.lock().unwrap().push(Instant::now());
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Outcome::Fail(Error::connection("script exhausted", None)));
            match outcome {
                Outcome::Fail(err) => Err(err),
                Outcome::Stream(events) => Ok(Box::pin(stream::iter(events))),
                Outcome::StallAfter(events) => {
                    Ok(Box::pin(stream::iter(events).chain(stream::pending())))
                }
            }
        }
    }

    fn message(text: &str) -> StreamEvent {
        StreamEvent::Message(MessageEvent {
            content: text.to_string(),
        })
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn default_policy_matches_protocol() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_before_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_before_attempt(3), Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_after_exactly_max_retries() {
        let script = Arc::new(Scripted::new(vec![
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
        ]));
        let mut session = ChatSession::new(Arc::clone(&script));
        let rx = session.subscribe();

        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::Error(Error::RetriesExhausted { attempts, .. }) => {
                assert_eq!(*attempts, 3);
            }
            other => panic!("expected retries-exhausted, got {other:?}"),
        }

        // Initial connect plus three reconnect attempts, spaced 1s/2s/4s apart.
        let instants = script.connect_instants();
        assert_eq!(instants.len(), 4);
        assert_eq!(instants[1] - instants[0], Duration::from_millis(1000));
        assert_eq!(instants[2] - instants[1], Duration::from_millis(2000));
        assert_eq!(instants[3] - instants[2], Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn fragments_flow_in_arrival_order() {
        let script = Arc::new(Scripted::new(vec![
            Outcome::Stream(vec![
                Ok(StreamEvent::Connected),
                Ok(message("Hel")),
                Ok(message("lo")),
                Ok(StreamEvent::Done),
            ]),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
        ]));
        let mut session = ChatSession::new(Arc::clone(&script));
        let events = collect(session.subscribe()).await;

        assert!(matches!(events[0], SessionEvent::Connected));
        assert!(matches!(&events[1], SessionEvent::Fragment(f) if f == "Hel"));
        assert!(matches!(&events[2], SessionEvent::Fragment(f) if f == "lo"));
        assert!(matches!(events[3], SessionEvent::Done));
        assert!(matches!(events[4], SessionEvent::Error(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn connected_resets_backoff_schedule() {
        let script = Arc::new(Scripted::new(vec![
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Stream(vec![Ok(StreamEvent::Connected)]),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
        ]));
        let mut session = ChatSession::new(Arc::clone(&script));
        let events = collect(session.subscribe()).await;

        assert!(matches!(events[0], SessionEvent::Connected));
        assert!(matches!(
            events[1],
            SessionEvent::Error(Error::RetriesExhausted { attempts: 3, .. })
        ));

        // The successful connect resets the counter, so the retry after it
        // starts back at the base delay rather than continuing to double.
        let instants = script.connect_instants();
        assert_eq!(instants.len(), 5);
        assert_eq!(instants[1] - instants[0], Duration::from_millis(1000));
        assert_eq!(instants[2] - instants[1], Duration::from_millis(1000));
        assert_eq!(instants[3] - instants[2], Duration::from_millis(2000));
        assert_eq!(instants[4] - instants[3], Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn credential_failure_is_terminal_without_retry() {
        let script = Arc::new(Scripted::new(vec![Outcome::Fail(Error::authentication(
            "no credential available",
        ))]));
        let mut session = ChatSession::new(Arc::clone(&script));
        let events = collect(session.subscribe()).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SessionEvent::Error(err) if err.is_authentication()
        ));
        assert_eq!(script.connect_instants().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_triggers_reconnect() {
        let script = Arc::new(Scripted::new(vec![
            Outcome::StallAfter(vec![Ok(StreamEvent::Connected)]),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
        ]));
        let mut session = ChatSession::new(Arc::clone(&script));
        let events = collect(session.subscribe()).await;

        assert!(matches!(events[0], SessionEvent::Connected));
        let instants = script.connect_instants();
        // 120s of silence, then the first backoff delay.
        assert_eq!(
            instants[1] - instants[0],
            DEFAULT_HEARTBEAT_TIMEOUT + Duration::from_millis(1000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_the_connection_alive() {
        let mut live = vec![Ok(StreamEvent::Connected)];
        for _ in 0..10 {
            live.push(Ok(StreamEvent::Heartbeat));
        }
        let script = Arc::new(Scripted::new(vec![
            Outcome::Stream(live),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
        ]));
        let mut session = ChatSession::new(Arc::clone(&script));
        let events = collect(session.subscribe()).await;

        // Heartbeats are liveness only; the consumer never sees them.
        assert!(matches!(events[0], SessionEvent::Connected));
        assert!(matches!(events[1], SessionEvent::Error(_)));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let script = Arc::new(Scripted::new(vec![
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
        ]));
        let mut session = ChatSession::new(Arc::clone(&script)).with_retry_policy(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(3600),
        });
        let mut rx = session.subscribe();

        // Let the first connect fail and the backoff sleep get scheduled.
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.disconnect();

        // Far past the scheduled reconnect; it must never fire.
        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(script.connect_instants().len(), 1);

        // Channel closes without a terminal error.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_closes_previous_receiver() {
        let script = Arc::new(Scripted::new(vec![
            Outcome::StallAfter(vec![Ok(StreamEvent::Connected)]),
            Outcome::StallAfter(vec![Ok(StreamEvent::Connected)]),
        ]));
        let mut session = ChatSession::new(Arc::clone(&script));

        let mut first = session.subscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(first.recv().await, Some(SessionEvent::Connected)));

        let mut second = session.subscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The old channel drains and closes; the new connection is live.
        assert!(first.recv().await.is_none());
        assert!(matches!(second.recv().await, Some(SessionEvent::Connected)));
        assert_eq!(script.connect_instants().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_errors_do_not_drop_the_connection() {
        let script = Arc::new(Scripted::new(vec![
            Outcome::Stream(vec![
                Ok(StreamEvent::Connected),
                Err(Error::serialization("Unknown SSE event type: typing", None)),
                Ok(message("still here")),
                Ok(StreamEvent::Done),
            ]),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
            Outcome::Fail(Error::connection("refused", None)),
        ]));
        let mut session = ChatSession::new(Arc::clone(&script));
        let events = collect(session.subscribe()).await;

        assert!(matches!(events[0], SessionEvent::Connected));
        assert!(matches!(&events[1], SessionEvent::Fragment(f) if f == "still here"));
        assert!(matches!(events[2], SessionEvent::Done));
    }
}
