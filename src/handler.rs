// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Decorators
//!
//! This module provides the decorators a gateway wraps around its processing
//! chain. Each one implements [`MessageHandler`] and owns the handler it decorates:
//!
//! - `ContextHandler`: refuses to run the inner handler once the context is done
//! - `RetryHandler`: re-invokes a failing handler after each configured delay
//! - `DeadLetterHandler`: forwards failed messages to a dead letter channel
//! - `AcknowledgeHandler`: commits the message on the transport after processing

use crate::{
    builder::MessageBuilder,
    context::Context,
    errors::MessagingError,
    message::{Message, MessageHandler, MessageType, Payload, PublisherChannel},
};
use async_trait::async_trait;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

/// Upper bound for handing a failed message to the dead letter channel.
pub const DEAD_LETTER_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Collaborator that confirms to a transport that a message was processed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelMessageAcknowledgment: Send + Sync {
    async fn commit_message(&self, msg: &Message) -> Result<(), MessagingError>;
}

/// Guards a handler against running on a cancelled or expired context.
pub struct ContextHandler {
    handler: Arc<dyn MessageHandler>,
}

impl ContextHandler {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        ContextHandler { handler }
    }
}

#[async_trait]
impl MessageHandler for ContextHandler {
    async fn handle(
        &self,
        ctx: &Context,
        msg: Arc<Message>,
    ) -> Result<Option<Arc<Message>>, MessagingError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        self.handler.handle(ctx, msg).await
    }
}

/// Re-invokes a failing handler once per configured delay.
///
/// With delays `[d1, .., dn]` the handler runs at most `n + 1` times, sleeping
/// `di` before retry `i`. Context errors end the loop immediately.
pub struct RetryHandler {
    delays: Vec<Duration>,
    handler: Arc<dyn MessageHandler>,
}

impl RetryHandler {
    pub fn new(delays: Vec<Duration>, handler: Arc<dyn MessageHandler>) -> Self {
        RetryHandler { delays, handler }
    }
}

#[async_trait]
impl MessageHandler for RetryHandler {
    async fn handle(
        &self,
        ctx: &Context,
        msg: Arc<Message>,
    ) -> Result<Option<Arc<Message>>, MessagingError> {
        let mut last_error = match self.handler.handle(ctx, msg.clone()).await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        for (attempt, delay) in self.delays.iter().enumerate() {
            if last_error.is_context_error() {
                break;
            }

            info!(
                message_id = msg.headers().message_id,
                attempt = attempt + 1,
                error = last_error.to_string(),
                "retrying message after error"
            );

            tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                _ = tokio::time::sleep(*delay) => {}
            }

            match self.handler.handle(ctx, msg.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) => last_error = err,
            }
        }

        Err(last_error)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetterPayload {
    reason_error: String,
    payload: serde_json::Value,
    headers: HashMap<String, String>,
}

/// Dead Letter Channel: on failure, publishes the original message together with
/// the failure reason, then returns the original error.
///
/// The dead letter send is best effort: it runs on its own context bounded by
/// [`DEAD_LETTER_SEND_TIMEOUT`] and its failures are only logged.
pub struct DeadLetterHandler {
    channel: Arc<dyn PublisherChannel>,
    handler: Arc<dyn MessageHandler>,
}

impl DeadLetterHandler {
    pub fn new(channel: Arc<dyn PublisherChannel>, handler: Arc<dyn MessageHandler>) -> Self {
        DeadLetterHandler { channel, handler }
    }

    fn dead_letter_message(
        &self,
        ctx: &Context,
        msg: &Message,
        reason: &MessagingError,
    ) -> Result<Message, MessagingError> {
        let payload = DeadLetterPayload {
            reason_error: reason.to_string(),
            payload: msg.payload().to_json_value()?,
            headers: msg.headers().to_map()?,
        };

        Ok(MessageBuilder::new()
            .with_context(ctx.clone())
            .with_channel_name(self.channel.name())
            .with_message_type(MessageType::Document)
            .with_correlation_id(msg.headers().correlation_id.clone())
            .with_payload(Payload::typed(payload))
            .build())
    }
}

#[async_trait]
impl MessageHandler for DeadLetterHandler {
    async fn handle(
        &self,
        ctx: &Context,
        msg: Arc<Message>,
    ) -> Result<Option<Arc<Message>>, MessagingError> {
        let err = match self.handler.handle(ctx, msg.clone()).await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        let dlq_ctx = Context::background().with_timeout(DEAD_LETTER_SEND_TIMEOUT);
        let dlq_message = match self.dead_letter_message(&dlq_ctx, &msg, &err) {
            Ok(dlq_message) => dlq_message,
            Err(convert_err) => {
                warn!(
                    message_id = msg.headers().message_id,
                    dlq_channel = self.channel.name(),
                    error = convert_err.to_string(),
                    "cannot convert original payload"
                );
                return Err(err);
            }
        };

        match self.channel.send(&dlq_ctx, Arc::new(dlq_message)).await {
            Ok(()) => info!(
                message_id = msg.headers().message_id,
                dlq_channel = self.channel.name(),
                reason = err.to_string(),
                "message sent to dead letter"
            ),
            Err(send_err) => error!(
                message_id = msg.headers().message_id,
                dlq_channel = self.channel.name(),
                error = send_err.to_string(),
                "failure to send message to dead letter"
            ),
        }

        Err(err)
    }
}

/// Commits every processed message, whatever the outcome of the inner handler.
pub struct AcknowledgeHandler {
    acknowledgment: Arc<dyn ChannelMessageAcknowledgment>,
    handler: Arc<dyn MessageHandler>,
}

impl AcknowledgeHandler {
    pub fn new(
        acknowledgment: Arc<dyn ChannelMessageAcknowledgment>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        AcknowledgeHandler {
            acknowledgment,
            handler,
        }
    }
}

#[async_trait]
impl MessageHandler for AcknowledgeHandler {
    async fn handle(
        &self,
        ctx: &Context,
        msg: Arc<Message>,
    ) -> Result<Option<Arc<Message>>, MessagingError> {
        let result = self.handler.handle(ctx, msg.clone()).await;

        if let Err(err) = self.acknowledgment.commit_message(&msg).await {
            warn!(
                message_id = msg.headers().message_id,
                error = err.to_string(),
                "failed to acknowledge message"
            );
        }

        result
    }
}
