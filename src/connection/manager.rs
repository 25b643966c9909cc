//! Connection manager
//!
//! Turns a `Connector` (one attempt) into a resilient connect: transient
//! failures are retried with exponential backoff up to the policy's ceiling,
//! anything else fails immediately. Every retry is logged with its number,
//! delay and cause.
//!
//! The current state is published on a `watch` channel so callers can show
//! or react to it without polling.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{Channel, Connector, Endpoint, QueueInfo, QueueSpec};
use crate::connection::backoff::{Backoff, RetryPolicy};
use crate::utils::error::{ConnectError, DeclareError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

/// A live channel to the broker, owned by one loop.
pub struct Session {
    endpoint: Endpoint,
    channel: Arc<dyn Channel>,
    attempts: u32,
    closed: bool,
}

impl Session {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Connection attempts it took to open this session.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Disconnected
        } else if self.channel.is_open() {
            SessionState::Ready
        } else {
            SessionState::Failed
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.channel.close().await
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    policy: RetryPolicy,
    state: watch::Sender<SessionState>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, endpoint: Endpoint, policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            connector,
            endpoint,
            policy,
            state,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Connects, retrying transient failures per the retry policy.
    pub async fn connect(&self) -> Result<Session, ConnectError> {
        let mut backoff = Backoff::new(self.policy.clone());
        self.state.send_replace(SessionState::Connecting);

        loop {
            let attempt = backoff.attempts();
            debug!(attempt, endpoint = %self.endpoint, "Connecting to broker");

            let err = match self.connector.connect(&self.endpoint).await {
                Ok(channel) => {
                    backoff.succeed();
                    self.state.send_replace(SessionState::Ready);
                    info!(attempt, endpoint = %self.endpoint, "Connected to broker");
                    return Ok(Session {
                        endpoint: self.endpoint.clone(),
                        channel,
                        attempts: attempt,
                        closed: false,
                    });
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                backoff.abort();
                self.state.send_replace(SessionState::Failed);
                error!(endpoint = %self.endpoint, error = %err, "Connection failed, not retrying");
                return Err(ConnectError::Fatal {
                    endpoint: self.endpoint.to_string(),
                    source: err,
                });
            }

            let Some(delay) = backoff.fail() else {
                self.state.send_replace(SessionState::Failed);
                error!(attempts = attempt, endpoint = %self.endpoint, error = %err, "Giving up connecting to broker");
                return Err(ConnectError::Exhausted {
                    endpoint: self.endpoint.to_string(),
                    attempts: attempt,
                    source: err,
                });
            };

            warn!(
                retry = attempt,
                delay_secs = delay.as_secs_f64(),
                error = %err,
                "Retry attempt {} after {}s",
                attempt,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Ensures the queue exists with the given parameters.
///
/// Safe to call repeatedly; a parameter conflict comes back as
/// `DeclareError::Conflict` and must not be retried.
pub async fn declare(session: &Session, spec: &QueueSpec) -> Result<QueueInfo, DeclareError> {
    let info = session.channel().declare_queue(spec).await?;
    debug!(
        queue = %info.name,
        messages = info.message_count,
        consumers = info.consumer_count,
        "Queue declared"
    );
    Ok(info)
}
