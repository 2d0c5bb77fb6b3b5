// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Inbound Channel
//!
//! This module provides the consuming side of the AMQP transport. An
//! [`AmqpInboundChannel`] consumes a queue on a background task, translates each
//! delivery into a message and hands it to whoever calls `receive`. The
//! hand-off is a rendezvous, so a slow consumer holds back the background task
//! instead of buffering deliveries. Messages are acknowledged through
//! [`ChannelMessageAcknowledgment`] once the consumer's chain has run.

use crate::{
    adapter::InboundChannelAdapterBuilder,
    channel::PointToPointChannel,
    connection::amqp_channel,
    context::Context,
    errors::MessagingError,
    handler::ChannelMessageAcknowledgment,
    message::{ConsumerChannel, InboundChannelAdapter, Message, PublisherChannel},
    otel,
    registry::{ConnectionRegistry, InboundChannelBuilder},
    translator::{from_wire, HEADER_CORRELATION_ID, HEADER_ROUTE, HEADER_TYPE},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, QueueDeclareOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable},
    Channel,
};
use opentelemetry::{
    global,
    trace::{Status, TraceContextExt},
};
use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Consumes an AMQP queue and serves its deliveries as messages.
pub struct AmqpInboundChannel {
    name: String,
    consumer_tag: String,
    channel: Arc<Channel>,
    deliveries: PointToPointChannel,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpInboundChannel {
    /// Starts consuming `queue`.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume
    /// * `channel` - A channel to the AMQP server
    ///
    /// # Returns
    /// The running inbound channel, or `ConsumerError` when the broker refuses
    /// the consumer
    pub async fn start(queue: &str, channel: Arc<Channel>) -> Result<Arc<Self>, MessagingError> {
        let consumer_tag = format!("{}-{}", queue, uuid::Uuid::new_v4());

        let mut consumer = match channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to consume");
                return Err(MessagingError::ConsumerError(err.to_string()));
            }
        };

        let deliveries = PointToPointChannel::new(queue);
        let handoff = deliveries.clone();
        let queue_name = queue.to_owned();

        let task = tokio::spawn(async move {
            let tracer = global::tracer("amqp consumer");

            while let Some(result) = consumer.next().await {
                let delivery = match result {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        error!(queue = queue_name, error = err.to_string(), "failure to receive delivery");
                        continue;
                    }
                };

                let headers = wire_headers(&delivery.properties);
                let route = headers.get(HEADER_ROUTE).cloned().unwrap_or_default();
                let (parent, span) = otel::new_span(&headers, &tracer, &route);
                let trace = parent.with_span(span);

                let msg = Arc::new(translate(&headers, delivery, trace.clone()));
                debug!(
                    queue = queue_name,
                    message_id = msg.headers().message_id,
                    "delivery received"
                );

                if let Err(err) = handoff.send(&Context::background(), msg).await {
                    trace.span().set_status(Status::Error {
                        description: Cow::from("inbound channel closed"),
                    });
                    debug!(queue = queue_name, error = err.to_string(), "delivery loop ended");
                    break;
                }
            }
        });

        Ok(Arc::new(AmqpInboundChannel {
            name: queue.to_owned(),
            consumer_tag,
            channel,
            deliveries,
            task: Mutex::new(Some(task)),
        }))
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Raw message of an AMQP delivery: its acker and the trace context of the
/// consumer span. The span ends once every copy of the message is dropped.
pub struct AmqpDelivery {
    acker: Acker,
    trace: opentelemetry::Context,
}

impl AmqpDelivery {
    pub fn trace_context(&self) -> &opentelemetry::Context {
        &self.trace
    }

    async fn ack(&self) -> Result<(), MessagingError> {
        match self.acker.ack(BasicAckOptions { multiple: false }).await {
            Ok(()) => {
                self.trace.span().set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                self.trace.span().set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                Err(MessagingError::AckMessageError)
            }
        }
    }
}

fn translate(headers: &HashMap<String, String>, delivery: Delivery, trace: opentelemetry::Context) -> Message {
    from_wire(headers, &delivery.data)
        .with_raw_message(Arc::new(AmqpDelivery {
            acker: delivery.acker,
            trace,
        }))
        .build()
}

/// String headers of a delivery. The AMQP `type` and `correlation-id`
/// properties fill in for missing headers.
pub(crate) fn wire_headers(props: &AMQPProperties) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    let value = match value {
                        AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                        AMQPValue::ShortString(v) => v.as_str().to_owned(),
                        _ => return None,
                    };
                    Some((key.as_str().to_owned(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    if let Some(kind) = props.kind() {
        headers
            .entry(HEADER_TYPE.to_owned())
            .or_insert_with(|| kind.as_str().to_owned());
    }
    if let Some(correlation_id) = props.correlation_id() {
        headers
            .entry(HEADER_CORRELATION_ID.to_owned())
            .or_insert_with(|| correlation_id.as_str().to_owned());
    }

    headers
}

#[async_trait]
impl ConsumerChannel for AmqpInboundChannel {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn receive(&self, ctx: &Context) -> Result<Arc<Message>, MessagingError> {
        ConsumerChannel::receive(&self.deliveries, ctx).await
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.deliveries.close_channel();

        let Some(task) = self.take_task() else {
            return Ok(());
        };
        task.abort();

        if let Err(err) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            error!(error = err.to_string(), queue = self.name, "failure to cancel consumer");
            return Err(MessagingError::ConsumerError(err.to_string()));
        }

        debug!(queue = self.name, "inbound channel closed");
        Ok(())
    }
}

#[async_trait]
impl ChannelMessageAcknowledgment for AmqpInboundChannel {
    async fn commit_message(&self, msg: &Message) -> Result<(), MessagingError> {
        let Some(delivery) = msg
            .raw_message()
            .and_then(|raw| raw.downcast_ref::<AmqpDelivery>())
        else {
            debug!(message_id = msg.headers().message_id, "nothing to acknowledge");
            return Ok(());
        };

        delivery.ack().await
    }
}

/// Builds an AMQP inbound adapter on a registered connection.
///
/// The queue is the adapter's channel name. Every message is acknowledged after
/// the consumer's chain ran, whatever its outcome.
pub struct AmqpInboundChannelBuilder {
    adapter: InboundChannelAdapterBuilder,
    connection_name: String,
    declare_queue: bool,
}

impl AmqpInboundChannelBuilder {
    pub fn new(adapter: InboundChannelAdapterBuilder, connection_name: &str) -> Self {
        AmqpInboundChannelBuilder {
            adapter,
            connection_name: connection_name.to_owned(),
            declare_queue: false,
        }
    }

    /// Declares the queue as durable before consuming it.
    pub fn with_queue_declare(mut self, declare: bool) -> Self {
        self.declare_queue = declare;
        self
    }

    async fn declare(&self, channel: &Channel) -> Result<(), MessagingError> {
        let queue = self.adapter.channel_name();
        match channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(_) => {
                debug!(queue, "queue declared");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), queue, "error to declare the queue");
                Err(MessagingError::ConsumerError(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl InboundChannelBuilder for AmqpInboundChannelBuilder {
    fn reference_name(&self) -> String {
        self.adapter.reference_name().to_owned()
    }

    async fn build(
        &self,
        connections: &ConnectionRegistry,
    ) -> Result<Arc<dyn InboundChannelAdapter>, MessagingError> {
        let channel = amqp_channel(connections, &self.connection_name)?;

        if self.declare_queue {
            self.declare(&channel).await?;
        }

        let inbound = AmqpInboundChannel::start(self.adapter.channel_name(), channel).await?;

        Ok(Arc::new(
            self.adapter
                .build_inbound_adapter(inbound.clone())
                .with_acknowledgment(inbound),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::field_table;
    use lapin::{types::ShortString, BasicProperties};

    #[derive(Debug, PartialEq)]
    struct QueueName(&'static str);

    #[test]
    fn headers_fall_back_to_amqp_properties() {
        let props = BasicProperties::default()
            .with_type(ShortString::from("Event"))
            .with_correlation_id(ShortString::from("c-1"))
            .with_headers(field_table(HashMap::from([(
                "route".to_owned(),
                "orders.created".to_owned(),
            )])));

        let headers = wire_headers(&props);

        assert_eq!(headers.get(HEADER_TYPE).map(String::as_str), Some("Event"));
        assert_eq!(headers.get(HEADER_CORRELATION_ID).map(String::as_str), Some("c-1"));
        assert_eq!(headers.get(HEADER_ROUTE).map(String::as_str), Some("orders.created"));
    }

    #[test]
    fn explicit_headers_win_over_properties() {
        let props = BasicProperties::default()
            .with_type(ShortString::from("Event"))
            .with_headers(field_table(HashMap::from([(
                HEADER_TYPE.to_owned(),
                "Command".to_owned(),
            )])));

        let headers = wire_headers(&props);

        assert_eq!(headers.get(HEADER_TYPE).map(String::as_str), Some("Command"));
    }

    #[test]
    fn non_string_headers_are_skipped() {
        let mut table = FieldTable::default();
        table.insert(ShortString::from("x-retries"), AMQPValue::LongInt(3));
        let props = BasicProperties::default().with_headers(table);

        assert!(wire_headers(&props).is_empty());
    }

    #[tokio::test]
    async fn delivery_keeps_trace_context_and_acks_once() {
        let headers = HashMap::from([(HEADER_ROUTE.to_owned(), "orders.created".to_owned())]);
        let trace = opentelemetry::Context::new().with_value(QueueName("orders"));
        let msg = from_wire(&headers, b"{}")
            .with_raw_message(Arc::new(AmqpDelivery {
                acker: Acker::default(),
                trace,
            }))
            .build();

        let delivery = msg
            .raw_message()
            .and_then(|raw| raw.downcast_ref::<AmqpDelivery>())
            .unwrap();

        assert_eq!(
            delivery.trace_context().get::<QueueName>(),
            Some(&QueueName("orders"))
        );
        assert_eq!(delivery.ack().await, Ok(()));
        assert_eq!(delivery.ack().await, Err(MessagingError::AckMessageError));
    }

    #[tokio::test]
    async fn builder_requires_amqp_connection() {
        let builder = AmqpInboundChannelBuilder::new(
            InboundChannelAdapterBuilder::new("orders.consumer", "orders"),
            "broker",
        );

        assert_eq!(InboundChannelBuilder::reference_name(&builder), "orders.consumer");
        assert!(matches!(
            InboundChannelBuilder::build(&builder, &ConnectionRegistry::new()).await,
            Err(MessagingError::ConnectionNotFound(_))
        ));
    }
}
