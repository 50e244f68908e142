//! Connection state machine for a single client session.
//!
//! Each connection owns its socket halves, its read buffer and its
//! current state. Nothing here is shared with other connections except the
//! dispatcher, which only ever receives finished messages.

use crate::dispatch::{Dispatch, Message};
use crate::protocol::{self, Command, ProtocolError};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tracing::{debug, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Current state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted; INFO not yet sent.
    Greeting,
    /// Waiting for the next control line.
    AwaitingCommand,
    /// A PUB line was read; its frame is next on the wire.
    ReadingPayload {
        subject: String,
        reply_to: Option<String>,
        size: usize,
    },
    /// Terminal.
    Closed,
}

/// A single client connection.
pub struct Connection<S> {
    id: u64,
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    line: Vec<u8>,
    state: ConnState,
    max_payload: usize,
    dispatch: Arc<dyn Dispatch>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Create a new connection in the greeting state.
    pub fn new(id: u64, stream: S, max_payload: usize, dispatch: Arc<dyn Dispatch>) -> Self {
        let (reader, writer) = tokio::io::split(stream);

        Self {
            id,
            reader: BufReader::with_capacity(BUFFER_SIZE, reader),
            writer,
            line: Vec::with_capacity(protocol::MAX_CONTROL_LINE),
            state: ConnState::Greeting,
            max_payload,
            dispatch,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drive the session until the peer disconnects or misbehaves.
    ///
    /// `Ok(())` means the peer closed the stream between commands. Any error
    /// is fatal to this session only; the connection is `Closed` either way.
    pub async fn run(&mut self) -> Result<(), ProtocolError> {
        let result = self.drive().await;

        if self.state != ConnState::Closed {
            trace!(client = self.id, from = ?self.state, "Closing after error");
            self.state = ConnState::Closed;
        }

        // Peer may already be gone
        let _ = self.writer.shutdown().await;

        result
    }

    async fn drive(&mut self) -> Result<(), ProtocolError> {
        while self.state != ConnState::Closed {
            let next = self.step().await?;
            trace!(client = self.id, from = ?self.state, to = ?next, "State transition");
            self.state = next;
        }
        Ok(())
    }

    async fn step(&mut self) -> Result<ConnState, ProtocolError> {
        match self.state.clone() {
            ConnState::Greeting => {
                debug!(client = self.id, "Sending INFO");
                let info = protocol::encode_info(self.max_payload);
                self.send(&info).await?;
                Ok(ConnState::AwaitingCommand)
            }

            ConnState::AwaitingCommand => self.await_command().await,

            ConnState::ReadingPayload {
                subject,
                reply_to,
                size,
            } => {
                let payload = protocol::read_payload(&mut self.reader, size).await?;
                trace!(client = self.id, subject = %subject, size, "Received payload");

                self.dispatch.publish(
                    self.id,
                    Message {
                        subject,
                        reply_to,
                        payload,
                    },
                );
                Ok(ConnState::AwaitingCommand)
            }

            ConnState::Closed => Ok(ConnState::Closed),
        }
    }

    async fn await_command(&mut self) -> Result<ConnState, ProtocolError> {
        let Some(line) = protocol::read_line(&mut self.reader, &mut self.line).await? else {
            debug!(client = self.id, "Socket closed");
            return Ok(ConnState::Closed);
        };

        trace!(client = self.id, line = %line, "Received line");

        match protocol::decode_line(&line)? {
            Command::Connect(params) => {
                trace!(client = self.id, params = %params, "Received CONNECT");
                Ok(ConnState::AwaitingCommand)
            }

            Command::Ping => {
                trace!(client = self.id, "Received PING");
                self.send(protocol::encode_pong()).await?;
                Ok(ConnState::AwaitingCommand)
            }

            Command::Pub {
                subject,
                reply_to,
                size,
                ..
            } => {
                protocol::check_payload_size(size, self.max_payload)?;
                Ok(ConnState::ReadingPayload {
                    subject,
                    reply_to,
                    size,
                })
            }

            Command::Unrecognized(line) => Err(ProtocolError::Unrecognized(line)),
        }
    }

    /// Write and flush immediately so replies are never held back.
    async fn send(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
