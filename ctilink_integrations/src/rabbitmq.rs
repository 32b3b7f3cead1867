//! RabbitMQ broker over AMQP 0-9-1.
//!
//! One session is one connection with one channel in publisher-confirm mode.
//! Sessions are never shared between components.

use async_trait::async_trait;
use ctilink_core::models::BrokerSettings;
use ctilink_core::traits::{Broker, BrokerSession, Delivery, DeliveryStream};
use ctilink_core::{Error, Result};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::instrument;

const CONSUMER_TAG: &str = "ctilink";
const PERSISTENT: u8 = 2;

/// Connection target on the default virtual host. Credentials stay structured
/// so reserved characters in them never go through URI parsing.
fn amqp_uri(settings: &BrokerSettings) -> AMQPUri {
    AMQPUri {
        scheme: if settings.use_ssl {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: settings.user.clone(),
                password: settings.pass.clone(),
            },
            host: settings.host.clone(),
            port: settings.port,
        },
        vhost: "/".to_string(),
        ..Default::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LapinBroker;

impl LapinBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for LapinBroker {
    #[instrument(level = "debug", skip_all, fields(host = %settings.host, port = settings.port))]
    async fn open(&self, settings: &BrokerSettings) -> Result<Box<dyn BrokerSession>> {
        let connection = Connection::connect_uri(amqp_uri(settings), ConnectionProperties::default())
            .await
            .map_err(|e| Error::transport("amqp connect", e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::transport("amqp channel", e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::transport("amqp confirm select", e))?;
        Ok(Box::new(LapinSession {
            connection,
            channel,
        }))
    }
}

pub struct LapinSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerSession for LapinSession {
    #[instrument(level = "debug", skip(self))]
    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        // One unacknowledged message at a time; the consumer blocks per message anyway.
        self.channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| Error::transport("amqp qos", e))?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::transport("amqp consume", e))?;
        let deliveries = consumer.map(|delivery| {
            delivery
                .map(|d| Delivery {
                    delivery_tag: d.delivery_tag,
                    body: d.data,
                })
                .map_err(|e| Error::transport("amqp delivery", e))
        });
        Ok(deliveries.boxed())
    }

    #[instrument(level = "debug", skip(self))]
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| Error::transport("amqp ack", e))
    }

    #[instrument(level = "debug", skip(self, body), fields(bytes = body.len()))]
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                body,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| Error::transport("amqp publish", e))?
            .await
            .map_err(|e| Error::transport("amqp publish confirm", e))?;

        match confirm {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(returned)) => Err(Error::PublishRejected(format!(
                "unroutable: {} {}",
                returned.reply_code, returned.reply_text
            ))),
            Confirmation::Nack(_) => Err(Error::PublishRejected("negative acknowledgement".into())),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| Error::transport("amqp channel close", e))?;
        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| Error::transport("amqp connection close", e))
    }
}
