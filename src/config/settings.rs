use std::time::Duration;

use serde::Deserialize;

use crate::broker::{Endpoint, QueueSpec};
use crate::connection::RetryPolicy;
use crate::utils::error::SettingsError;

/// Top-level configuration settings for the relay.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub retry: RetrySettings,
    pub queue: QueueSettings,
    pub publisher: PublisherSettings,
    pub consumer: ConsumerSettings,
    pub log: LogSettings,
}

/// Where the broker lives and how to log in.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub connect_timeout_secs: u64,
}

impl BrokerSettings {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            vhost: self.vhost.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Connection retry policy. `max_retries` counts retries after the first
/// attempt.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QueueSettings {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSettings {
    pub fn spec(&self) -> QueueSpec {
        QueueSpec {
            name: self.name.clone(),
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PublisherSettings {
    /// Pause between two publishes.
    pub interval_ms: u64,
    /// Input that stops the publisher.
    pub stop_word: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConsumerSettings {
    /// Period of the queue re-declare tick.
    pub tick_ms: u64,
    pub max_in_flight: usize,
    pub prefetch: u16,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    /// Used when `RUST_LOG` is not set.
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every value is optional; missing ones are filled in from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub retry: Option<PartialRetrySettings>,
    pub queue: Option<PartialQueueSettings>,
    pub publisher: Option<PartialPublisherSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub vhost: Option<String>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRetrySettings {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialQueueSettings {
    pub name: Option<String>,
    pub durable: Option<bool>,
    pub exclusive: Option<bool>,
    pub auto_delete: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPublisherSettings {
    pub interval_ms: Option<u64>,
    pub stop_word: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConsumerSettings {
    pub tick_ms: Option<u64>,
    pub max_in_flight: Option<usize>,
    pub prefetch: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fills every missing value from `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let broker = self.broker.unwrap_or_default();
        let retry = self.retry.unwrap_or_default();
        let queue = self.queue.unwrap_or_default();
        let publisher = self.publisher.unwrap_or_default();
        let consumer = self.consumer.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            broker: BrokerSettings {
                host: broker.host.unwrap_or(defaults.broker.host),
                port: broker.port.unwrap_or(defaults.broker.port),
                username: broker.username.unwrap_or(defaults.broker.username),
                password: broker.password.unwrap_or(defaults.broker.password),
                vhost: broker.vhost.unwrap_or(defaults.broker.vhost),
                connect_timeout_secs: broker
                    .connect_timeout_secs
                    .unwrap_or(defaults.broker.connect_timeout_secs),
            },
            retry: RetrySettings {
                max_retries: retry.max_retries.unwrap_or(defaults.retry.max_retries),
                base_delay_ms: retry.base_delay_ms.unwrap_or(defaults.retry.base_delay_ms),
                multiplier: retry.multiplier.unwrap_or(defaults.retry.multiplier),
            },
            queue: QueueSettings {
                name: queue.name.unwrap_or(defaults.queue.name),
                durable: queue.durable.unwrap_or(defaults.queue.durable),
                exclusive: queue.exclusive.unwrap_or(defaults.queue.exclusive),
                auto_delete: queue.auto_delete.unwrap_or(defaults.queue.auto_delete),
            },
            publisher: PublisherSettings {
                interval_ms: publisher
                    .interval_ms
                    .unwrap_or(defaults.publisher.interval_ms),
                stop_word: publisher.stop_word.unwrap_or(defaults.publisher.stop_word),
            },
            consumer: ConsumerSettings {
                tick_ms: consumer.tick_ms.unwrap_or(defaults.consumer.tick_ms),
                max_in_flight: consumer
                    .max_in_flight
                    .unwrap_or(defaults.consumer.max_in_flight),
                prefetch: consumer.prefetch.unwrap_or(defaults.consumer.prefetch),
            },
            log: LogSettings {
                level: log.level.unwrap_or(defaults.log.level),
            },
        }
    }
}

impl Settings {
    /// Rejects values the relay cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.broker.host.trim().is_empty() {
            return invalid("broker.host", "must not be empty");
        }
        if self.broker.port == 0 {
            return invalid("broker.port", "must be greater than 0");
        }
        if self.queue.name.trim().is_empty() {
            return invalid("queue.name", "must not be empty");
        }
        if self.publisher.stop_word.trim().is_empty() {
            return invalid("publisher.stop_word", "must not be empty");
        }
        if self.consumer.max_in_flight == 0 {
            return invalid("consumer.max_in_flight", "must be at least 1");
        }
        if self.consumer.tick_ms == 0 {
            return invalid("consumer.tick_ms", "must be greater than 0");
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier", "must be at least 1.0");
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> Result<(), SettingsError> {
    Err(SettingsError::Invalid {
        key,
        reason: reason.to_string(),
    })
}

/// Provides default values for `Settings`.
///
/// These match a stock RabbitMQ reachable as `rabbitmq` on the default port.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                host: "rabbitmq".to_string(),
                port: 5672,
                username: "guest".to_string(),
                password: "guest".to_string(),
                vhost: "/".to_string(),
                connect_timeout_secs: 10,
            },
            retry: RetrySettings {
                max_retries: 5,
                base_delay_ms: 1000,
                multiplier: 2.0,
            },
            queue: QueueSettings {
                name: "first_names".to_string(),
                durable: true,
                exclusive: false,
                auto_delete: false,
            },
            publisher: PublisherSettings {
                interval_ms: 5000,
                stop_word: "q".to_string(),
            },
            consumer: ConsumerSettings {
                tick_ms: 7500,
                max_in_flight: 8,
                prefetch: 16,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
