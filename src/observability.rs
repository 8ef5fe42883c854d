use biometrics::{Collector, Counter, Moments};

pub(crate) static SUBSCRIBES: Counter = Counter::new("tutorstream.client.subscribes");
pub(crate) static SENDS: Counter = Counter::new("tutorstream.client.sends");
pub(crate) static SEND_ERRORS: Counter = Counter::new("tutorstream.client.send_errors");

pub(crate) static STREAM_EVENTS: Counter = Counter::new("tutorstream.stream.events");
pub(crate) static STREAM_BYTES: Counter = Counter::new("tutorstream.stream.bytes");
pub(crate) static STREAM_FRAGMENTS: Counter = Counter::new("tutorstream.stream.fragments");
pub(crate) static STREAM_DECODE_ERRORS: Counter = Counter::new("tutorstream.stream.decode_errors");

pub(crate) static SESSION_CONNECTS: Counter = Counter::new("tutorstream.session.connects");
pub(crate) static SESSION_RECONNECTS: Counter = Counter::new("tutorstream.session.reconnects");
pub(crate) static SESSION_HEARTBEAT_TIMEOUTS: Counter =
    Counter::new("tutorstream.session.heartbeat_timeouts");
pub(crate) static SESSION_RETRY_BACKOFF: Moments =
    Moments::new("tutorstream.session.retry_backoff_seconds");
pub(crate) static SESSION_TERMINAL_ERRORS: Counter =
    Counter::new("tutorstream.session.terminal_errors");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&SUBSCRIBES);
    collector.register_counter(&SENDS);
    collector.register_counter(&SEND_ERRORS);

    collector.register_counter(&STREAM_EVENTS);
    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_FRAGMENTS);
    collector.register_counter(&STREAM_DECODE_ERRORS);

    collector.register_counter(&SESSION_CONNECTS);
    collector.register_counter(&SESSION_RECONNECTS);
    collector.register_counter(&SESSION_HEARTBEAT_TIMEOUTS);
    collector.register_moments(&SESSION_RETRY_BACKOFF);
    collector.register_counter(&SESSION_TERMINAL_ERRORS);
}
