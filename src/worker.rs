//! Worker-side endpoint.
//!
//! A [`Worker`] wraps the channel a sandboxed process shares with the
//! coordinator. It numbers outgoing messages per destination, correlates
//! responses with outstanding requests, answers liveness pings, and hands
//! everything else to the worker body through [`Worker::recv`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerRequestBody, BrokerResponseBody, OpResult, PrivilegedOp};
use crate::errors::{ChannelError, RequestError, SchemaError};
use crate::models::{Message, MessageKind, ProcessId, ProcessRole, RouteTarget};
use crate::router::{PendingTable, RequestId};
use crate::schema::{self, SchemaRegistry};
use crate::transport::{connect_local, Channel, ChannelLimits};
use crate::{AppError, Result};

/// Environment variable carrying the coordinator's socket name.
pub const ENV_BUS_NAME: &str = "PRIVSEP_BUS_NAME";
/// Environment variable carrying the worker's process identifier.
pub const ENV_PROCESS_ID: &str = "PRIVSEP_PROCESS_ID";
/// Environment variable carrying the one-time launch token.
pub const ENV_LAUNCH_TOKEN: &str = "PRIVSEP_LAUNCH_TOKEN";
/// Environment variable carrying the worker's role as JSON.
pub const ENV_ROLE: &str = "PRIVSEP_ROLE";

const INBOX_DEPTH: usize = 256;

struct Shared {
    id: ProcessId,
    channel: Channel,
    sequences: Mutex<HashMap<RouteTarget, u64>>,
    pending: PendingTable,
}

impl Shared {
    fn next_sequence(&self, destination: RouteTarget) -> u64 {
        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        let next = sequences.entry(destination).or_insert(0);
        *next += 1;
        *next
    }

    fn send(&self, message: &Message) -> std::result::Result<(), ChannelError> {
        self.channel.send(schema::encode(message))
    }
}

/// Worker end of a coordinator channel.
pub struct Worker {
    shared: Arc<Shared>,
    role: ProcessRole,
    inbox: mpsc::Receiver<Message>,
    cancel: CancellationToken,
}

impl Worker {
    /// Wrap an established channel and start reading from it.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(id: ProcessId, role: ProcessRole, channel: Channel, registry: SchemaRegistry) -> Self {
        let shared = Arc::new(Shared {
            id,
            channel,
            sequences: Mutex::new(HashMap::new()),
            pending: PendingTable::new(),
        });
        let (inbox_tx, inbox) = mpsc::channel(INBOX_DEPTH);
        let cancel = CancellationToken::new();
        tokio::spawn(pump(
            Arc::clone(&shared),
            registry,
            inbox_tx,
            cancel.clone(),
        ));
        Self {
            shared,
            role,
            inbox,
            cancel,
        }
    }

    /// Connect to the coordinator's socket and complete the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the connection or the `Hello` fails.
    pub async fn connect(
        name: &str,
        id: ProcessId,
        role: ProcessRole,
        token: &str,
        limits: ChannelLimits,
    ) -> std::result::Result<Self, ChannelError> {
        let channel = connect_local(name, id, token, limits).await?;
        info!(%id, %role, "connected to coordinator");
        Ok(Self::new(id, role, channel, SchemaRegistry::standard()))
    }

    /// Connect using the variables the coordinator's launcher sets.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when a variable is missing or invalid,
    /// and [`AppError::Channel`] when the connection fails.
    pub async fn from_env(limits: ChannelLimits) -> Result<Self> {
        let var = |key: &str| {
            std::env::var(key).map_err(|_| AppError::Config(format!("{key} is not set")))
        };
        let name = var(ENV_BUS_NAME)?;
        let id = var(ENV_PROCESS_ID)?
            .parse::<u64>()
            .map(ProcessId)
            .map_err(|err| AppError::Config(format!("{ENV_PROCESS_ID}: {err}")))?;
        let token = var(ENV_LAUNCH_TOKEN)?;
        let role: ProcessRole = serde_json::from_str(&var(ENV_ROLE)?)
            .map_err(|err| AppError::Config(format!("{ENV_ROLE}: {err}")))?;
        Ok(Self::connect(&name, id, role, &token, limits).await?)
    }

    /// This worker's identifier.
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.shared.id
    }

    /// This worker's role.
    #[must_use]
    pub fn role(&self) -> &ProcessRole {
        &self.role
    }

    /// Underlying channel.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.shared.channel
    }

    /// Send a message with the next sequence for `destination`.
    ///
    /// Returns the sequence used.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the channel rejects the frame.
    pub fn send(
        &self,
        destination: RouteTarget,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> std::result::Result<u64, ChannelError> {
        let sequence = self.shared.next_sequence(destination);
        let message = Message::new(self.shared.id, destination, kind, sequence, payload);
        self.shared.send(&message)?;
        Ok(sequence)
    }

    /// Send a prebuilt message as is.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the channel rejects the frame.
    pub fn send_message(&self, message: &Message) -> std::result::Result<(), ChannelError> {
        self.shared.send(message)
    }

    /// Answer `request` with a response-shaped `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the channel rejects the frame.
    pub fn reply(
        &self,
        request: &Message,
        kind: MessageKind,
        body: &[u8],
    ) -> std::result::Result<u64, ChannelError> {
        let destination = RouteTarget::Process(request.sender());
        let sequence = self.shared.next_sequence(destination);
        let message = Message::reply(
            self.shared.id,
            destination,
            kind,
            sequence,
            request.sequence(),
            body,
        );
        self.shared.send(&message)?;
        Ok(sequence)
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// [`RequestError::Timeout`] when nothing arrives in time,
    /// [`RequestError::ProcessLost`] when the coordinator reports the target
    /// gone, [`RequestError::Cancelled`] when the channel closes, and
    /// [`RequestError::Channel`] when the request cannot be sent.
    pub async fn request(
        &self,
        destination: RouteTarget,
        kind: MessageKind,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> std::result::Result<Message, RequestError> {
        let sequence = self.shared.next_sequence(destination);
        let id = RequestId {
            requester: self.shared.id,
            sequence,
        };
        let reply = self.shared.pending.register(id, destination, timeout);
        let message = Message::new(self.shared.id, destination, kind, sequence, payload);
        if let Err(err) = self.shared.send(&message) {
            reply.cancel();
            return Err(RequestError::Channel(err));
        }
        reply.recv().await
    }

    /// Ask the broker to perform `op`.
    ///
    /// # Errors
    ///
    /// [`AppError::Broker`] when the broker refuses or the operation fails,
    /// [`AppError::Request`] when no answer arrives, and
    /// [`AppError::Schema`] when the answer cannot be decoded.
    pub async fn broker(&self, op: PrivilegedOp, timeout: Duration) -> Result<OpResult> {
        let body = serde_json::to_vec(&BrokerRequestBody::new(op))
            .map_err(|err| SchemaError::Malformed(format!("broker request: {err}")))?;
        let response = self
            .request(RouteTarget::Broker, MessageKind::BrokerRequest, body, timeout)
            .await?;
        let decoded: BrokerResponseBody = serde_json::from_slice(&response.body())
            .map_err(|err| SchemaError::Malformed(format!("broker response: {err}")))?;
        Ok(decoded.outcome?)
    }

    /// Next message for the worker body; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbox.recv().await
    }

    /// Close the channel. The coordinator sees the process as gone.
    pub fn close(&self) {
        self.cancel.cancel();
        self.shared.channel.close();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump(
    shared: Arc<Shared>,
    registry: SchemaRegistry,
    inbox: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let id = shared.id;
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = shared.channel.recv() => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                warn!(%id, %err, "worker channel failed");
                break;
            }
        };
        let message = match registry.decode(&frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(%id, %err, "dropping undecodable frame");
                continue;
            }
        };

        match message.kind() {
            MessageKind::Ping => {
                let destination = RouteTarget::Process(message.sender());
                let pong = Message::reply(
                    id,
                    destination,
                    MessageKind::Pong,
                    shared.next_sequence(destination),
                    message.sequence(),
                    message.payload(),
                );
                if let Err(err) = shared.send(&pong) {
                    debug!(%id, %err, "pong not sent");
                }
            }
            MessageKind::ProcessLost | MessageKind::RequestTimeout
                if message.sender().is_coordinator() =>
            {
                settle_undelivered(&shared, &message);
            }
            kind if kind.is_response() && message.in_reply_to().is_some() => {
                let request = RequestId {
                    requester: id,
                    sequence: message.in_reply_to().unwrap_or_default(),
                };
                let responder = message.sender();
                if !shared.pending.complete_from(request, responder, message) {
                    debug!(%id, %request, %kind, "unmatched response dropped");
                }
            }
            _ => {
                if inbox.send(message).await.is_err() {
                    break;
                }
            }
        }
    }
    shared.pending.clear();
    debug!(%id, "worker pump stopped");
}

fn settle_undelivered(shared: &Shared, message: &Message) {
    let Some(sequence) = message.in_reply_to() else {
        return;
    };
    let request = RequestId {
        requester: shared.id,
        sequence,
    };
    if message.kind() == MessageKind::RequestTimeout {
        shared.pending.expire(request);
        return;
    }
    let lost = schema::parse_undelivered(message)
        .map(|payload| payload.process)
        .unwrap_or(ProcessId::COORDINATOR);
    shared.pending.fail(request, RequestError::ProcessLost(lost));
}
