// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Adapters
//!
//! Transport-neutral halves of the adapters that connect the engine to the
//! outside world.
//!
//! - `InboundChannelAdapterBuilder` collects the consumer-side configuration of an
//!   inbound channel and wraps any [`ConsumerChannel`] as an
//!   [`InboundChannelAdapter`].
//! - `OutboundChannelAdapter` forwards messages to a transport
//!   [`PublisherChannel`] and answers the waiting gateway with a document reply.

use crate::{
    builder::MessageBuilder,
    channel::PointToPointChannel,
    context::Context,
    errors::MessagingError,
    handler::ChannelMessageAcknowledgment,
    message::{
        ConsumerChannel, InboundChannelAdapter, Message, MessageHandler, MessageType, Payload,
        PublisherChannel,
    },
    registry::{ConnectionRegistry, InboundChannelBuilder},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// Consumer-side configuration of an inbound channel.
#[derive(Clone, Default)]
pub struct InboundChannelAdapterBuilder {
    reference_name: String,
    channel_name: String,
    dead_letter_channel_name: Option<String>,
    before_processors: Vec<Arc<dyn MessageHandler>>,
    after_processors: Vec<Arc<dyn MessageHandler>>,
    retry_attempts: Vec<Duration>,
    consumer_channel: Option<Arc<dyn ConsumerChannel>>,
}

impl InboundChannelAdapterBuilder {
    /// Creates a builder.
    ///
    /// # Parameters
    /// * `reference_name` - Name consumers look the adapter up by
    /// * `channel_name` - Transport channel (queue, topic, ..) the adapter reads
    pub fn new(reference_name: &str, channel_name: &str) -> Self {
        InboundChannelAdapterBuilder {
            reference_name: reference_name.to_owned(),
            channel_name: channel_name.to_owned(),
            ..Default::default()
        }
    }

    pub fn reference_name(&self) -> &str {
        &self.reference_name
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn with_dead_letter_channel_name(mut self, name: &str) -> Self {
        if !name.is_empty() {
            self.dead_letter_channel_name = Some(name.to_owned());
        }
        self
    }

    pub fn with_before_interceptors(mut self, processors: Vec<Arc<dyn MessageHandler>>) -> Self {
        self.before_processors = processors;
        self
    }

    pub fn with_after_interceptors(mut self, processors: Vec<Arc<dyn MessageHandler>>) -> Self {
        self.after_processors = processors;
        self
    }

    /// Delays between processing attempts of a failed message.
    pub fn with_retry_attempts(mut self, attempts: Vec<Duration>) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// In-process channel read by the adapter built through the registry.
    pub fn with_consumer_channel(mut self, channel: Arc<dyn ConsumerChannel>) -> Self {
        self.consumer_channel = Some(channel);
        self
    }

    /// Wraps `channel` with this configuration.
    pub fn build_inbound_adapter(&self, channel: Arc<dyn ConsumerChannel>) -> DefaultInboundChannelAdapter {
        DefaultInboundChannelAdapter {
            reference_name: self.reference_name.clone(),
            dead_letter_channel_name: self.dead_letter_channel_name.clone(),
            before_processors: self.before_processors.clone(),
            after_processors: self.after_processors.clone(),
            retry_attempts: self.retry_attempts.clone(),
            channel,
            acknowledgment: None,
        }
    }
}

#[async_trait]
impl InboundChannelBuilder for InboundChannelAdapterBuilder {
    fn reference_name(&self) -> String {
        self.reference_name.clone()
    }

    async fn build(
        &self,
        _connections: &ConnectionRegistry,
    ) -> Result<Arc<dyn InboundChannelAdapter>, MessagingError> {
        let Some(channel) = &self.consumer_channel else {
            return Err(MessagingError::Configuration(format!(
                "inbound adapter `{}` has no consumer channel",
                self.reference_name
            )));
        };

        Ok(Arc::new(self.build_inbound_adapter(channel.clone())))
    }
}

/// [`InboundChannelAdapter`] reading from any [`ConsumerChannel`].
pub struct DefaultInboundChannelAdapter {
    reference_name: String,
    dead_letter_channel_name: Option<String>,
    before_processors: Vec<Arc<dyn MessageHandler>>,
    after_processors: Vec<Arc<dyn MessageHandler>>,
    retry_attempts: Vec<Duration>,
    channel: Arc<dyn ConsumerChannel>,
    acknowledgment: Option<Arc<dyn ChannelMessageAcknowledgment>>,
}

impl DefaultInboundChannelAdapter {
    /// Commits every processed message through `acknowledgment`.
    pub fn with_acknowledgment(mut self, acknowledgment: Arc<dyn ChannelMessageAcknowledgment>) -> Self {
        self.acknowledgment = Some(acknowledgment);
        self
    }
}

#[async_trait]
impl InboundChannelAdapter for DefaultInboundChannelAdapter {
    fn reference_name(&self) -> String {
        self.reference_name.clone()
    }

    fn dead_letter_channel_name(&self) -> Option<String> {
        self.dead_letter_channel_name.clone()
    }

    fn before_processors(&self) -> Vec<Arc<dyn MessageHandler>> {
        self.before_processors.clone()
    }

    fn after_processors(&self) -> Vec<Arc<dyn MessageHandler>> {
        self.after_processors.clone()
    }

    fn retry_attempts(&self) -> Vec<Duration> {
        self.retry_attempts.clone()
    }

    fn acknowledgment(&self) -> Option<Arc<dyn ChannelMessageAcknowledgment>> {
        self.acknowledgment.clone()
    }

    async fn receive_message(&self, ctx: &Context) -> Result<Arc<Message>, MessagingError> {
        self.channel.receive(ctx).await
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.channel.close().await
    }
}

/// Forwards messages to a transport and answers the gateway waiting on them.
///
/// When the message carries a reply channel, a `Document` reply is sent on it:
/// the original payload on success, an `Error` payload on failure.
pub struct OutboundChannelAdapter {
    publisher: Arc<dyn PublisherChannel>,
}

impl OutboundChannelAdapter {
    pub fn new(publisher: Arc<dyn PublisherChannel>) -> Self {
        OutboundChannelAdapter { publisher }
    }

    /// Exposes the adapter as a point-to-point channel named `reference_name`,
    /// processing each message on its own task.
    pub fn into_channel(self, reference_name: &str) -> PointToPointChannel {
        PointToPointChannel::with_handler(reference_name, Arc::new(self))
    }

    async fn reply(&self, ctx: &Context, msg: &Message, outcome: &Result<(), MessagingError>) {
        let Some(reply_channel) = msg.headers().reply_channel() else {
            return;
        };

        let payload = match outcome {
            Ok(()) => msg.payload().clone(),
            Err(err) => Payload::Error(err.to_string()),
        };

        let reply = MessageBuilder::from_message(msg)
            .with_message_type(MessageType::Document)
            .with_payload(payload)
            .without_reply_channel()
            .build();

        if let Err(err) = reply_channel.send(ctx, Arc::new(reply)).await {
            warn!(
                channel = self.publisher.name(),
                message_id = msg.headers().message_id,
                error = err.to_string(),
                "failure to send reply"
            );
        }
    }
}

#[async_trait]
impl MessageHandler for OutboundChannelAdapter {
    async fn handle(
        &self,
        ctx: &Context,
        msg: Arc<Message>,
    ) -> Result<Option<Arc<Message>>, MessagingError> {
        let outcome = self.publisher.send(ctx, msg.clone()).await;
        self.reply(ctx, &msg, &outcome).await;

        outcome.map(|_| Some(msg))
    }
}
