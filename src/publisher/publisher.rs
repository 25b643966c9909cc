use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{PublishFlags, QueueSpec};
use crate::codec::{Message, encode};
use crate::config::Settings;
use crate::connection::{ConnectionManager, Session, declare};
use crate::publisher::input::{Input, InputSource};
use crate::utils::error::{DeclareError, PublishError, RelayError};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub queue: QueueSpec,
    /// Pause after each publish.
    pub interval: Duration,
}

impl From<&Settings> for PublisherConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            queue: settings.queue.spec(),
            interval: Duration::from_millis(settings.publisher.interval_ms),
        }
    }
}

/// What happened during a publisher run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Confirmed by the broker.
    pub published: u64,
    /// Refused by the broker (unroutable or nacked) or not encodable.
    pub rejected: u64,
    /// Not confirmed because the connection dropped.
    pub lost: u64,
    pub reconnects: u64,
}

pub struct Publisher {
    manager: ConnectionManager,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(manager: ConnectionManager, config: PublisherConfig) -> Self {
        Self { manager, config }
    }

    /// Publishes one message per input until `Input::Stop` or `shutdown`.
    ///
    /// Publishes are never retried. A rejected message is logged and counted;
    /// a lost connection is re-established before the next input is used.
    /// Only an exhausted connect or a queue declaration the broker refuses
    /// ends the run early.
    pub async fn run<I: InputSource>(
        &self,
        input: &mut I,
        shutdown: CancellationToken,
    ) -> Result<PublishReport, RelayError> {
        let mut report = PublishReport::default();
        let Some(mut session) = self.open_session(&shutdown).await? else {
            return Ok(report);
        };

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = input.next_input() => next,
            };
            let Input::Name(name) = next else {
                info!("Stop requested, publisher exiting");
                break;
            };

            if !session.is_ready() {
                warn!("Session is no longer ready, reconnecting");
                match self.open_session(&shutdown).await? {
                    Some(reopened) => session = reopened,
                    None => break,
                }
                report.reconnects += 1;
            }

            let message = Message::new(name);
            info!(first_name = %message.first_name, "Serializing and publishing name");

            match self.publish(&session, &message).await {
                Ok(()) => {
                    report.published += 1;
                    info!(first_name = %message.first_name, queue = %self.config.queue.name, "Published");
                }
                Err(PublishError::ConnectionLost(e)) => {
                    report.lost += 1;
                    error!(first_name = %message.first_name, error = %e, "Connection lost, message was not published");
                    match self.open_session(&shutdown).await? {
                        Some(reopened) => session = reopened,
                        None => break,
                    }
                    report.reconnects += 1;
                }
                Err(e) => {
                    report.rejected += 1;
                    error!(first_name = %message.first_name, error = %e, "Publish failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        close_quietly(&mut session).await;
        Ok(report)
    }

    /// Encodes and publishes a single message, waiting for the broker's
    /// confirmation.
    pub async fn publish(&self, session: &Session, message: &Message) -> Result<(), PublishError> {
        let body = encode(message)?;
        session
            .channel()
            .publish(&self.config.queue.name, &body, PublishFlags::RELIABLE)
            .await?;
        Ok(())
    }

    /// Connects and declares the queue, starting over when the connection
    /// drops mid-declare. `None` means `shutdown` fired first.
    async fn open_session(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<Session>, RelayError> {
        loop {
            let mut session = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(None),
                session = self.manager.connect() => session?,
            };

            let declared = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                declared = declare(&session, &self.config.queue) => Some(declared),
            };
            match declared {
                None => {
                    close_quietly(&mut session).await;
                    return Ok(None);
                }
                Some(Ok(_)) => return Ok(Some(session)),
                Some(Err(DeclareError::ConnectionLost(e))) => {
                    warn!(error = %e, "Connection lost while declaring queue, reconnecting");
                    close_quietly(&mut session).await;
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

async fn close_quietly(session: &mut Session) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close session");
    }
}
