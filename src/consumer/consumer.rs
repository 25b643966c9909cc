use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{DeliveryStream, QueueSpec};
use crate::config::Settings;
use crate::connection::{ConnectionManager, Session, declare};
use crate::consumer::handler::{MessageHandler, Outcome, process_delivery};
use crate::utils::error::{DeclareError, RelayError};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: QueueSpec,
    /// Interval of the re-declare liveness tick.
    pub tick: Duration,
    /// Handler tasks allowed to run at once.
    pub max_in_flight: usize,
    /// Unacknowledged deliveries the broker may push ahead; `0` is unlimited.
    pub prefetch: u16,
}

impl From<&Settings> for ConsumerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            queue: settings.queue.spec(),
            tick: Duration::from_millis(settings.consumer.tick_ms),
            max_in_flight: settings.consumer.max_in_flight,
            prefetch: settings.consumer.prefetch,
        }
    }
}

/// Tally of settled deliveries across a consumer run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumeReport {
    pub acknowledged: u64,
    pub dropped: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub unsettled: u64,
    pub reconnects: u64,
}

impl ConsumeReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Acknowledged => self.acknowledged += 1,
            Outcome::Dropped => self.dropped += 1,
            Outcome::Requeued => self.requeued += 1,
            Outcome::Rejected => self.rejected += 1,
            Outcome::Unsettled => self.unsettled += 1,
        }
    }

    fn merge(&mut self, other: &ConsumeReport) {
        self.acknowledged += other.acknowledged;
        self.dropped += other.dropped;
        self.requeued += other.requeued;
        self.rejected += other.rejected;
        self.unsettled += other.unsettled;
        self.reconnects += other.reconnects;
    }
}

enum SessionEnd {
    Shutdown,
    ConnectionLost(String),
}

struct Dispatched {
    report: ConsumeReport,
    cause: String,
}

pub struct ConsumerLoop {
    manager: ConnectionManager,
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
}

impl ConsumerLoop {
    pub fn new(
        manager: ConnectionManager,
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            manager,
            config,
            handler,
        }
    }

    /// Consumes until `shutdown` is cancelled, reconnecting whenever the
    /// session is lost.
    ///
    /// On shutdown no new deliveries are taken, in-flight handlers finish
    /// and settle, then the session is closed.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<ConsumeReport, RelayError> {
        let mut report = ConsumeReport::default();

        loop {
            let mut session = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                session = self.manager.connect() => session?,
            };

            let end = self.serve(&session, &shutdown, &mut report).await;
            if let Err(e) = session.close().await {
                debug!(error = %e, "Session close failed");
            }

            match end? {
                SessionEnd::Shutdown => break,
                SessionEnd::ConnectionLost(cause) => {
                    warn!(%cause, "Lost connection to broker, reconnecting");
                    report.reconnects += 1;
                }
            }
        }

        info!(?report, "Consumer stopped");
        Ok(report)
    }

    async fn serve(
        &self,
        session: &Session,
        shutdown: &CancellationToken,
        report: &mut ConsumeReport,
    ) -> Result<SessionEnd, RelayError> {
        let queue = &self.config.queue;
        let channel = session.channel();

        match declare(session, queue).await {
            Ok(info) => info!(queue = %info.name, ready = info.message_count, "Awaiting messages..."),
            Err(DeclareError::ConnectionLost(e)) => return Ok(SessionEnd::ConnectionLost(e.to_string())),
            Err(e) => return Err(e.into()),
        }

        let consumer_tag = format!("qrelay-{}", Uuid::new_v4());
        let subscribed = match channel.set_prefetch(self.config.prefetch).await {
            Ok(()) => channel.consume(&queue.name, &consumer_tag).await,
            Err(e) => Err(e),
        };
        let deliveries = match subscribed {
            Ok(deliveries) => deliveries,
            Err(e) if e.is_connection_loss() => return Ok(SessionEnd::ConnectionLost(e.to_string())),
            Err(e) => return Err(RelayError::Subscribe(e)),
        };
        info!(queue = %queue.name, %consumer_tag, "Subscribed");

        let stop = shutdown.child_token();
        let mut dispatcher = tokio::spawn(dispatch(
            deliveries,
            self.handler.clone(),
            self.config.max_in_flight,
            stop.clone(),
        ));

        let mut ticker = tokio::time::interval_at(Instant::now() + self.config.tick, self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            // Shutdown also stops the dispatcher; it must win that race.
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(SessionEnd::Shutdown),
                finished = &mut dispatcher => {
                    let cause = match finished {
                        Ok(dispatched) => {
                            report.merge(&dispatched.report);
                            dispatched.cause
                        }
                        Err(e) => {
                            error!(error = %e, "Delivery dispatcher failed");
                            e.to_string()
                        }
                    };
                    if shutdown.is_cancelled() {
                        return Ok(SessionEnd::Shutdown);
                    }
                    return Ok(SessionEnd::ConnectionLost(cause));
                }
                _ = ticker.tick() => match declare(session, queue).await {
                    Ok(info) => info!(queue = %info.name, ready = info.message_count, "Awaiting messages..."),
                    Err(DeclareError::ConnectionLost(e)) => break Ok(SessionEnd::ConnectionLost(e.to_string())),
                    Err(e) => break Err(RelayError::from(e)),
                },
            }
        };

        stop.cancel();
        match dispatcher.await {
            Ok(dispatched) => report.merge(&dispatched.report),
            Err(e) => error!(error = %e, "Delivery dispatcher failed"),
        }
        end
    }
}

/// Feeds deliveries to at most `max_in_flight` concurrent handler tasks.
///
/// Returns once `stop` is cancelled or the stream ends, after every started
/// handler has finished.
async fn dispatch(
    mut deliveries: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    max_in_flight: usize,
    stop: CancellationToken,
) -> Dispatched {
    let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut tasks = JoinSet::new();
    let mut report = ConsumeReport::default();

    let cause = loop {
        while let Some(done) = tasks.try_join_next() {
            record(&mut report, done);
        }

        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => break "shutdown".to_string(),
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break "worker pool closed".to_string(),
            },
        };

        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break "shutdown".to_string(),
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                debug!(tag = %delivery.tag, redelivered = delivery.redelivered, "Received delivery");
                let handler = handler.clone();
                tasks.spawn(async move {
                    let outcome = process_delivery(delivery, handler.as_ref()).await;
                    drop(permit);
                    outcome
                });
            }
            Some(Err(e)) => break e.to_string(),
            None => break "delivery stream closed".to_string(),
        }
    };

    while let Some(done) = tasks.join_next().await {
        record(&mut report, done);
    }

    Dispatched { report, cause }
}

fn record(report: &mut ConsumeReport, done: Result<Outcome, tokio::task::JoinError>) {
    match done {
        Ok(outcome) => report.record(outcome),
        Err(e) => {
            // A panicking handler never settled its delivery.
            error!(error = %e, "Handler task failed");
            report.record(Outcome::Unsettled);
        }
    }
}
