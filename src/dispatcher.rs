// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! This module provides the facade the buses talk to. A dispatcher either sends a
//! message and hands back the reply payload, or publishes it and only reports
//! whether processing failed.

use crate::{
    context::Context,
    errors::MessagingError,
    gateway::{Gateway, GatewayBuilder},
    message::{Message, Payload},
    registry::ChannelRegistry,
};
use async_trait::async_trait;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Send and publish operations over a processing chain.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Sends a message and waits for its result.
    async fn send_message(&self, ctx: &Context, msg: Arc<Message>) -> Result<Payload, MessagingError>;

    /// Sends a message, discarding the result payload.
    async fn publish_message(&self, ctx: &Context, msg: Arc<Message>) -> Result<(), MessagingError>;
}

/// Builder of a [`MessageDispatcher`] backed by its own gateway.
pub struct MessageDispatcherBuilder {
    reference_name: String,
    request_channel_name: String,
}

impl MessageDispatcherBuilder {
    /// Creates a builder.
    ///
    /// # Parameters
    /// * `reference_name` - Name of the dispatcher and of its gateway
    /// * `request_channel_name` - Channel requests are addressed to; empty to route
    ///   by the message route
    pub fn new(reference_name: &str, request_channel_name: &str) -> Self {
        MessageDispatcherBuilder {
            reference_name: reference_name.to_owned(),
            request_channel_name: request_channel_name.to_owned(),
        }
    }

    pub fn reference_name(&self) -> &str {
        &self.reference_name
    }

    pub fn build(&self, channels: Arc<ChannelRegistry>) -> Result<MessageDispatcher, MessagingError> {
        let gateway =
            GatewayBuilder::new(&self.reference_name, &self.request_channel_name).build(channels)?;

        Ok(MessageDispatcher::new(Arc::new(gateway)))
    }
}

/// [`Dispatcher`] executing every message on a [`Gateway`].
#[derive(Clone)]
pub struct MessageDispatcher {
    gateway: Arc<Gateway>,
}

impl MessageDispatcher {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        MessageDispatcher { gateway }
    }
}

#[async_trait]
impl Dispatcher for MessageDispatcher {
    async fn send_message(&self, ctx: &Context, msg: Arc<Message>) -> Result<Payload, MessagingError> {
        self.gateway.execute(ctx, msg).await
    }

    async fn publish_message(&self, ctx: &Context, msg: Arc<Message>) -> Result<(), MessagingError> {
        self.gateway.execute(ctx, msg).await.map(|_| ())
    }
}
