//! RabbitMQ backend built on `lapin`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use proto::{BrokerError, ExchangeEvent, Frame, GatewayId, TransportError};
use tracing::{debug, warn};

use crate::transport::{
    BrokerLink, Connector, EventStream, FrameReader, FrameWriter, TransportPair,
};

/// Broker exchange carrying RabbitMQ internal lifecycle notifications.
pub const EVENT_EXCHANGE: &str = "amq.rabbitmq.event";
/// Binding that selects queue lifecycle notifications.
pub const QUEUE_EVENTS: &str = "queue.*";

const REPLY_SUCCESS: u16 = 200;
const JSON_CONTENT_TYPE: &str = "application/json";

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerLink>, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        Ok(Arc::new(AmqpLink {
            connection,
            channel,
        }))
    }
}

/// An open AMQP connection and its management channel.
pub struct AmqpLink {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerLink for AmqpLink {
    async fn subscribe_events(&self, queue: &str) -> Result<Box<dyn EventStream>, BrokerError> {
        let setup = |e: lapin::Error| BrokerError::Setup(e.to_string());
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(setup)?;
        self.channel
            .queue_bind(
                queue,
                EVENT_EXCHANGE,
                QUEUE_EVENTS,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(setup)?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                queue,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(setup)?;
        debug!(queue, "Bound monitor queue to {EVENT_EXCHANGE} ({QUEUE_EVENTS})");
        Ok(Box::new(AmqpEventStream { consumer }))
    }

    async fn open_transport(
        &self,
        server_id: &str,
        gateway: &GatewayId,
    ) -> Result<TransportPair, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        let consumer_tag = format!("{server_id}.{gateway}");
        let consumer = channel
            .basic_consume(
                &gateway.inbound_queue(),
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Setup(e.to_string()))?;

        Ok(TransportPair {
            reader: Box::new(AmqpReader {
                channel: channel.clone(),
                consumer,
                consumer_tag,
                closed: false,
            }),
            writer: Arc::new(AmqpWriter {
                channel,
                queue: gateway.outbound_queue(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Teardown(e.to_string()))
    }

    async fn close_channel(&self) -> Result<(), BrokerError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BrokerError::Teardown(e.to_string()))
    }

    async fn close_connection(&self) -> Result<(), BrokerError> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BrokerError::Teardown(e.to_string()))
    }
}

struct AmqpEventStream {
    consumer: Consumer,
}

#[async_trait]
impl EventStream for AmqpEventStream {
    async fn next_event(&mut self) -> Option<Result<ExchangeEvent, BrokerError>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(BrokerError::Channel(e.to_string()))),
        };
        Some(exchange_event(&delivery))
    }
}

/// Builds an event from a management delivery: the routing key is the event
/// type, the `name` header is the affected queue.
fn exchange_event(delivery: &Delivery) -> Result<ExchangeEvent, BrokerError> {
    let routing_key = delivery.routing_key.as_str();
    let queue = delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| header_string(headers, "name"))
        .ok_or_else(|| {
            BrokerError::Channel(format!("{routing_key} notification without queue name"))
        })?;
    Ok(ExchangeEvent::new(routing_key, queue))
}

fn header_string(headers: &FieldTable, key: &str) -> Option<String> {
    headers
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == key)
        .and_then(|(_, value)| match value {
            AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
            AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
            _ => None,
        })
}

fn transport_error(e: lapin::Error) -> TransportError {
    match e {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::Closed
        }
        other => TransportError::Io(other.to_string()),
    }
}

struct AmqpReader {
    channel: Channel,
    consumer: Consumer,
    consumer_tag: String,
    closed: bool,
}

#[async_trait]
impl FrameReader for AmqpReader {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.consumer.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(transport_error(e)),
            Some(Ok(delivery)) => Ok(Some(Frame {
                correlation_id: delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string()),
                reply_to: delivery
                    .properties
                    .reply_to()
                    .as_ref()
                    .map(|queue| queue.as_str().to_string()),
                payload: delivery.data,
            })),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        if self.channel.status().connected() {
            self.channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await
                .map_err(transport_error)?;
            self.channel
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(transport_error)?;
        }
        Ok(())
    }
}

struct AmqpWriter {
    channel: Channel,
    queue: String,
    closed: AtomicBool,
}

#[async_trait]
impl FrameWriter for AmqpWriter {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut properties =
            BasicProperties::default().with_content_type(JSON_CONTENT_TYPE.into());
        if let Some(correlation_id) = frame.correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }
        if let Some(reply_to) = frame.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }

        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &frame.payload,
                properties,
            )
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(queue = %self.queue, "Gateway output closed");
        if !self.channel.status().connected() {
            warn!(queue = %self.queue, "Gateway channel already closed by broker");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lapin::types::{LongString, ShortString};

    use super::*;

    #[test]
    fn reads_queue_name_header() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("name"),
            AMQPValue::LongString(LongString::from("gw42.in")),
        );
        headers.insert(ShortString::from("vhost"), AMQPValue::LongString(LongString::from("/")));
        assert_eq!(header_string(&headers, "name").as_deref(), Some("gw42.in"));

        let mut short = FieldTable::default();
        short.insert(
            ShortString::from("name"),
            AMQPValue::ShortString(ShortString::from("gw7.out")),
        );
        assert_eq!(header_string(&short, "name").as_deref(), Some("gw7.out"));
    }

    #[test]
    fn missing_or_non_string_header_is_none() {
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from("name"), AMQPValue::LongInt(7));
        assert_eq!(header_string(&headers, "name"), None);
        assert_eq!(header_string(&FieldTable::default(), "name"), None);
    }

    #[test]
    fn closed_channel_maps_to_closed_transport() {
        let err = transport_error(lapin::Error::InvalidChannelState(
            lapin::ChannelState::Closed,
        ));
        assert_eq!(err, TransportError::Closed);
    }
}
