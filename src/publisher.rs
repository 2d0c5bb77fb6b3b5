// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Message Publisher
//!
//! This module provides the outbound side of the AMQP transport. An
//! [`AmqpPublisherChannel`] publishes messages to an exchange, mapping the
//! message headers onto AMQP properties and propagating the OpenTelemetry trace
//! context. The [`AmqpPublisherChannelBuilder`] registers it behind an
//! [`OutboundChannelAdapter`] so gateways waiting on a command get their reply.

use crate::{
    adapter::OutboundChannelAdapter,
    connection::amqp_channel,
    context::Context,
    errors::MessagingError,
    message::{Message, PublisherChannel},
    otel,
    registry::{ConnectionRegistry, PublisherChannelBuilder},
    translator::{to_wire_body, to_wire_headers},
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes messages to an AMQP exchange.
///
/// The routing key is the message's `channel_name`, or the channel's own
/// routing key when the message does not name one.
pub struct AmqpPublisherChannel {
    name: String,
    exchange: String,
    routing_key: String,
    channel: Arc<Channel>,
}

impl AmqpPublisherChannel {
    /// Creates a new AMQP publisher.
    ///
    /// # Parameters
    /// * `name` - Channel name
    /// * `exchange` - Exchange messages are published to; empty for the default exchange
    /// * `routing_key` - Routing key used when the message has no channel name
    /// * `channel` - A channel to the AMQP server
    pub fn new(name: &str, exchange: &str, routing_key: &str, channel: Arc<Channel>) -> Self {
        AmqpPublisherChannel {
            name: name.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            channel,
        }
    }

    fn routing_key<'m>(&'m self, msg: &'m Message) -> &'m str {
        let channel_name = &msg.headers().channel_name;
        if channel_name.is_empty() {
            &self.routing_key
        } else {
            channel_name
        }
    }
}

/// AMQP properties carrying the headers of `msg` and the current trace context.
pub(crate) fn publish_properties(msg: &Message) -> Result<BasicProperties, MessagingError> {
    let mut wire_headers = to_wire_headers(msg)?;
    otel::inject_context(&opentelemetry::Context::current(), &mut wire_headers);

    let headers = msg.headers();
    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_type(ShortString::from(headers.message_type.to_string()))
        .with_message_id(ShortString::from(headers.message_id.clone()))
        .with_headers(field_table(wire_headers));

    if !headers.correlation_id.is_empty() {
        properties = properties.with_correlation_id(ShortString::from(headers.correlation_id.clone()));
    }
    if !headers.reply_channel_name.is_empty() {
        properties = properties.with_reply_to(ShortString::from(headers.reply_channel_name.clone()));
    }

    Ok(properties)
}

/// Converts wire headers to an AMQP field table of long strings.
pub(crate) fn field_table(headers: HashMap<String, String>) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .into_iter()
        .map(|(key, value)| {
            (
                ShortString::from(key),
                AMQPValue::LongString(LongString::from(value)),
            )
        })
        .collect();

    FieldTable::from(btree)
}

#[async_trait]
impl PublisherChannel for AmqpPublisherChannel {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn send(&self, ctx: &Context, msg: Arc<Message>) -> Result<(), MessagingError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let properties = publish_properties(&msg)?;
        let body = to_wire_body(&msg)?;
        let routing_key = self.routing_key(&msg);

        let confirm = match self
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &body,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(MessagingError::PublishingError(err.to_string()));
            }
        };

        if let Err(err) = confirm.await {
            error!(error = err.to_string(), "publish not confirmed");
            return Err(MessagingError::PublishingError(err.to_string()));
        }

        debug!(
            channel = self.name,
            routing_key,
            message_id = msg.headers().message_id,
            "message published"
        );
        Ok(())
    }
}

/// Builds an AMQP outbound channel on a registered connection.
pub struct AmqpPublisherChannelBuilder {
    reference_name: String,
    connection_name: String,
    exchange: String,
    routing_key: String,
}

impl AmqpPublisherChannelBuilder {
    /// Creates a builder publishing to the default exchange with `reference_name`
    /// as routing key.
    ///
    /// # Parameters
    /// * `reference_name` - Name the channel is registered under
    /// * `connection_name` - Reference name of the [`crate::connection::AmqpConnection`]
    pub fn new(reference_name: &str, connection_name: &str) -> Self {
        AmqpPublisherChannelBuilder {
            reference_name: reference_name.to_owned(),
            connection_name: connection_name.to_owned(),
            exchange: String::new(),
            routing_key: reference_name.to_owned(),
        }
    }

    pub fn with_exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn with_routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = routing_key.to_owned();
        self
    }
}

#[async_trait]
impl PublisherChannelBuilder for AmqpPublisherChannelBuilder {
    fn reference_name(&self) -> String {
        self.reference_name.clone()
    }

    async fn build(
        &self,
        connections: &ConnectionRegistry,
    ) -> Result<Arc<dyn PublisherChannel>, MessagingError> {
        let channel = amqp_channel(connections, &self.connection_name)?;
        let publisher = AmqpPublisherChannel::new(
            &self.reference_name,
            &self.exchange,
            &self.routing_key,
            channel,
        );

        let adapter = OutboundChannelAdapter::new(Arc::new(publisher));
        Ok(Arc::new(adapter.into_channel(&self.reference_name)))
    }
}
