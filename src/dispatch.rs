//! Hand-off point for published messages.
//!
//! The server frames PUB payloads but does not route them; subscription
//! delivery plugs in here.

use bytes::Bytes;
use tracing::trace;

/// A fully framed PUB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

/// Receives every message published on any connection.
pub trait Dispatch: Send + Sync {
    fn publish(&self, connection: u64, message: Message);
}

/// Drops every message.
#[derive(Debug, Default)]
pub struct Discard;

impl Dispatch for Discard {
    fn publish(&self, connection: u64, message: Message) {
        trace!(
            client = connection,
            subject = %message.subject,
            bytes = message.payload.len(),
            "Discarding published message"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records published messages for assertions.
    #[derive(Debug, Default)]
    pub struct Recorder {
        pub messages: Mutex<Vec<(u64, Message)>>,
    }

    impl Dispatch for Recorder {
        fn publish(&self, connection: u64, message: Message) {
            self.messages.lock().unwrap().push((connection, message));
        }
    }
}
