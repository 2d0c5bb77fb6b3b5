// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routers
//!
//! Routing stages of a processing chain:
//!
//! - `CompositeRouter`: runs its handlers in registration order
//! - `MessageFilter`: drops messages that do not satisfy a predicate
//! - `RecipientListRouter`: forwards a message to a channel resolved from its headers

use crate::{
    context::Context,
    errors::MessagingError,
    message::{Message, MessageHandler},
    registry::ChannelRegistry,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Ordered list of handlers executed one after another.
///
/// Stops at the first error, or as soon as a handler absorbs the message.
#[derive(Clone, Default)]
pub struct CompositeRouter {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl CompositeRouter {
    pub fn new() -> Self {
        CompositeRouter::default()
    }

    pub fn add_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl MessageHandler for CompositeRouter {
    async fn handle(
        &self,
        ctx: &Context,
        msg: Arc<Message>,
    ) -> Result<Option<Arc<Message>>, MessagingError> {
        let mut current = msg;

        for handler in &self.handlers {
            match handler.handle(ctx, current).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }

        Ok(Some(current))
    }
}

type Predicate = dyn Fn(&Message) -> bool + Send + Sync;

/// Passes a message through unchanged when the predicate holds, drops it
/// silently otherwise.
pub struct MessageFilter {
    predicate: Arc<Predicate>,
}

impl MessageFilter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        MessageFilter {
            predicate: Arc::new(predicate),
        }
    }
}

#[async_trait]
impl MessageHandler for MessageFilter {
    async fn handle(
        &self,
        _ctx: &Context,
        msg: Arc<Message>,
    ) -> Result<Option<Arc<Message>>, MessagingError> {
        if (self.predicate)(&msg) {
            return Ok(Some(msg));
        }

        debug!(message_id = msg.headers().message_id, "message filtered out");
        Ok(None)
    }
}

/// Sends a message to the channel named by its `channel_name` header, falling
/// back to its `route`, then passes the same message on.
pub struct RecipientListRouter {
    channels: Arc<ChannelRegistry>,
}

impl RecipientListRouter {
    pub fn new(channels: Arc<ChannelRegistry>) -> Self {
        RecipientListRouter { channels }
    }

    fn recipient_key(msg: &Message) -> &str {
        let headers = msg.headers();
        if headers.channel_name.is_empty() {
            &headers.route
        } else {
            &headers.channel_name
        }
    }
}

#[async_trait]
impl MessageHandler for RecipientListRouter {
    async fn handle(
        &self,
        ctx: &Context,
        msg: Arc<Message>,
    ) -> Result<Option<Arc<Message>>, MessagingError> {
        let key = Self::recipient_key(&msg);

        let Some(channel) = self.channels.get(key) else {
            return Err(MessagingError::ChannelNotFound(key.to_owned()));
        };

        debug!(
            message_id = msg.headers().message_id,
            channel = key,
            "routing message"
        );
        channel.send(ctx, msg.clone()).await?;

        Ok(Some(msg))
    }
}
