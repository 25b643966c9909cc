//! RabbitMQ transport
//!
//! Maps the broker seam onto `lapin`. Every channel runs in confirm mode, so
//! a publish only returns once the broker has taken responsibility for the
//! message (or returned it as unroutable).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tracing::{debug, warn};

use crate::broker::{
    Acknowledger, Channel, Connector, Delivery, DeliveryStream, DeliveryTag, Endpoint,
    PublishFlags, QueueInfo, QueueSpec,
};
use crate::utils::error::TransportError;

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// Opens AMQP connections, one channel per connection.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connect_timeout: Duration,
}

impl AmqpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

fn uri_for(endpoint: &Endpoint) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: endpoint.username.clone(),
                password: endpoint.password.clone(),
            },
            host: endpoint.host.clone(),
            port: endpoint.port,
        },
        vhost: endpoint.vhost.clone(),
        ..Default::default()
    }
}

/// Classifies a failure while establishing the connection.
fn connect_error(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::IOError(io) => TransportError::Unreachable(io.to_string()),
        lapin::Error::ProtocolError(amqp) => TransportError::AccessRefused(amqp.to_string()),
        // The broker accepted the socket but hung up mid-handshake, usually
        // because it is still booting.
        lapin::Error::InvalidConnectionState(state) => {
            TransportError::Unreachable(format!("handshake aborted in state {state:?}"))
        }
        other => TransportError::Protocol(other.to_string()),
    }
}

/// Classifies a failure on an established channel.
fn channel_error(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::IOError(io) => TransportError::ConnectionLost(io.to_string()),
        lapin::Error::InvalidChannelState(state) => {
            TransportError::ConnectionLost(format!("channel is {state:?}"))
        }
        lapin::Error::InvalidConnectionState(state) => {
            TransportError::ConnectionLost(format!("connection is {state:?}"))
        }
        lapin::Error::MissingHeartbeatError => {
            TransportError::ConnectionLost("missed heartbeats".to_string())
        }
        other => TransportError::Protocol(other.to_string()),
    }
}

/// Runs lapin's I/O and callbacks on the current tokio runtime.
///
/// Must be called from within a runtime.
pub(crate) fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Channel>, TransportError> {
        let connecting = Connection::connect_uri(uri_for(endpoint), connection_properties());
        let connection = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(connect_error)?;

        let channel = connection.create_channel().await.map_err(channel_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(channel_error)?;
        debug!(channel = channel.id(), "AMQP channel open in confirm mode");

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
        }))
    }
}

pub struct AmqpChannel {
    connection: Connection,
    channel: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, TransportError> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..Default::default()
        };
        let queue = self
            .channel
            .queue_declare(&spec.name, options, FieldTable::default())
            .await
            .map_err(|err| match err {
                // queue.declare only fails at protocol level on PRECONDITION_FAILED
                // (parameter mismatch), RESOURCE_LOCKED or ACCESS_REFUSED.
                lapin::Error::ProtocolError(amqp) => TransportError::QueueConflict {
                    queue: spec.name.clone(),
                    reason: amqp.to_string(),
                },
                other => channel_error(other),
            })?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        flags: PublishFlags,
    ) -> Result<(), TransportError> {
        let options = BasicPublishOptions {
            mandatory: flags.mandatory,
            ..Default::default()
        };
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(if flags.persistent { PERSISTENT } else { TRANSIENT });

        let confirmation = self
            .channel
            .basic_publish("", queue, options, body, properties)
            .await
            .map_err(channel_error)?
            .await
            .map_err(channel_error)?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_returned)) => Err(TransportError::Unroutable(queue.to_string())),
            Confirmation::Nack(_) => Err(TransportError::Nacked),
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let options = BasicConsumeOptions {
            no_ack: false,
            ..Default::default()
        };
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(channel_error)?;

        let deliveries = consumer.map(|item| {
            item.map(|delivery| {
                Delivery::new(
                    DeliveryTag(delivery.delivery_tag),
                    delivery.data,
                    delivery.redelivered,
                    Box::new(AmqpAcker(delivery.acker)),
                )
            })
            .map_err(channel_error)
        });
        Ok(deliveries.boxed())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(200, "closing").await {
                warn!(error = %err, "Failed to close AMQP channel cleanly");
            }
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "closing")
                .await
                .map_err(channel_error)?;
        }
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(drop)
            .map_err(channel_error)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map(drop)
            .map_err(channel_error)
    }
}
