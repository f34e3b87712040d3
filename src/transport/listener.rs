//! Local-socket listener and worker-side connector.
//!
//! The coordinator binds one namespaced local socket (Unix domain socket or
//! named pipe via `interprocess`). Every launched worker connects back and
//! opens with a `Hello` frame carrying the one-time launch token it was
//! given. The listener hands the resulting [`Channel`] to whoever registered
//! that token; connections with unknown tokens are dropped and logged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use interprocess::local_socket::tokio::Stream as LocalStream;
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions, ToNsName};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::errors::ChannelError;
use crate::models::ProcessId;
use crate::schema::{self, SchemaRegistry};
use crate::transport::channel::{Channel, ChannelLimits};

/// A token registration waiting for its worker to connect.
struct Expected {
    id: ProcessId,
    deliver: oneshot::Sender<Channel>,
}

type ExpectedTable = Arc<Mutex<HashMap<String, Expected>>>;

/// Coordinator-side accept loop for worker connections.
pub struct ChannelListener {
    name: String,
    expected: ExpectedTable,
}

impl ChannelListener {
    /// Bind `name` and start accepting until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Io`] if the name is invalid or the listener
    /// cannot be created.
    pub fn bind(
        name: &str,
        limits: ChannelLimits,
        handshake_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, ChannelError> {
        let listener_name = name
            .to_owned()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| ChannelError::Io(format!("invalid socket name '{name}': {err}")))?;
        let listener = ListenerOptions::new()
            .name(listener_name)
            .create_tokio()
            .map_err(|err| ChannelError::Io(format!("failed to create listener: {err}")))?;

        info!(ipc_name = %name, "channel listener bound");

        let expected: ExpectedTable = Arc::new(Mutex::new(HashMap::new()));
        let table = Arc::clone(&expected);
        let span = info_span!("channel_listener", name = %name);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("channel listener shutting down");
                            break;
                        }
                        accepted = listener.accept() => match accepted {
                            Ok(stream) => {
                                tokio::spawn(handshake(
                                    stream,
                                    limits,
                                    handshake_timeout,
                                    Arc::clone(&table),
                                ));
                            }
                            Err(err) => warn!(%err, "accept failed"),
                        }
                    }
                }
            }
            .instrument(span),
        );

        Ok(Self {
            name: name.to_owned(),
            expected,
        })
    }

    /// Socket name workers connect to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a launch token; the receiver resolves once the worker with
    /// identifier `id` completes its handshake.
    pub async fn expect(&self, token: String, id: ProcessId) -> oneshot::Receiver<Channel> {
        let (deliver, rx) = oneshot::channel();
        self.expected
            .lock()
            .await
            .insert(token, Expected { id, deliver });
        rx
    }

    /// Withdraw a token, e.g. after the launch timed out.
    pub async fn forget(&self, token: &str) {
        self.expected.lock().await.remove(token);
    }
}

/// Read the `Hello` frame from a fresh connection and deliver the channel.
async fn handshake(
    stream: LocalStream,
    limits: ChannelLimits,
    timeout: Duration,
    expected: ExpectedTable,
) {
    let channel = Channel::from_stream("local-socket", stream, limits);

    let first = match tokio::time::timeout(timeout, channel.recv()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            debug!("connection closed before hello");
            return;
        }
        Ok(Err(err)) => {
            warn!(%err, "connection failed before hello");
            return;
        }
        Err(_elapsed) => {
            warn!(?timeout, "no hello within handshake timeout");
            channel.close();
            return;
        }
    };

    let hello = match SchemaRegistry::standard()
        .decode(&first)
        .and_then(|message| schema::parse_hello(&message).map(|hello| (message.sender(), hello)))
    {
        Ok(hello) => hello,
        Err(err) => {
            warn!(%err, "rejecting connection with invalid hello");
            channel.close();
            return;
        }
    };
    let (sender, payload) = hello;

    let Some(entry) = expected.lock().await.remove(&payload.token) else {
        warn!(%sender, "rejecting connection with unknown launch token");
        channel.close();
        return;
    };
    if entry.id != sender {
        warn!(claimed = %sender, expected = %entry.id, "hello sender does not match launch token");
        channel.close();
        return;
    }

    debug!(id = %sender, build = ?payload.build, "worker completed handshake");
    if entry.deliver.send(channel.clone()).is_err() {
        debug!(id = %sender, "launch abandoned before handshake completed");
        channel.close();
    }
}

/// Worker side: connect to the coordinator's socket and send `Hello`.
///
/// # Errors
///
/// Returns [`ChannelError::Io`] if the connection fails and
/// [`ChannelError::Handshake`] if the hello cannot be built or sent.
pub async fn connect_local(
    name: &str,
    id: ProcessId,
    token: &str,
    limits: ChannelLimits,
) -> Result<Channel, ChannelError> {
    let socket_name = name
        .to_owned()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| ChannelError::Io(format!("invalid socket name '{name}': {err}")))?;
    let stream = LocalStream::connect(socket_name)
        .await
        .map_err(|err| ChannelError::Io(format!("failed to connect to '{name}': {err}")))?;
    let channel = Channel::from_stream(format!("worker-{id}"), stream, limits);
    send_hello(&channel, id, token)?;
    Ok(channel)
}

/// Send the opening `Hello` frame on an already-connected channel.
///
/// # Errors
///
/// Returns [`ChannelError::Handshake`] if the hello cannot be built or
/// queued.
pub fn send_hello(channel: &Channel, id: ProcessId, token: &str) -> Result<(), ChannelError> {
    let hello =
        schema::hello(id, token).map_err(|err| ChannelError::Handshake(err.to_string()))?;
    channel
        .send(schema::encode(&hello))
        .map_err(|err| ChannelError::Handshake(err.to_string()))
}
