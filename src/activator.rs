// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Action Handlers
//!
//! Typed entry points for in-process command and query handling. An [`Action`]
//! is a serializable request identified by a static name; an [`ActionHandler`]
//! executes it. The [`ActionHandlerActivator`] adapts a handler to the
//! [`MessageHandler`] contract: it decodes the payload, runs the handler and
//! sends the outcome back on the message's reply channel.

use crate::{
    builder::MessageBuilder,
    context::Context,
    errors::MessagingError,
    message::{Message, MessageHandler, MessageType, Payload},
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, marker::PhantomData, sync::Arc};
use tracing::{debug, warn};

/// A request routed by name to its handler.
pub trait Action: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Route and channel name the action is registered under.
    const NAME: &'static str;
}

/// Executes one kind of [`Action`].
#[async_trait]
pub trait ActionHandler<A: Action>: Send + Sync {
    type Output: Serialize + Debug + Send + Sync + 'static;

    async fn handle(&self, ctx: &Context, action: A) -> Result<Self::Output, MessagingError>;
}

/// Service activator for a typed [`ActionHandler`].
pub struct ActionHandlerActivator<A, H> {
    handler: Arc<H>,
    _action: PhantomData<fn() -> A>,
}

impl<A, H> ActionHandlerActivator<A, H>
where
    A: Action,
    H: ActionHandler<A>,
{
    pub fn new(handler: Arc<H>) -> Self {
        ActionHandlerActivator {
            handler,
            _action: PhantomData,
        }
    }

    async fn execute(&self, ctx: &Context, msg: &Message) -> Result<Payload, MessagingError> {
        let action = msg
            .payload()
            .decode::<A>()
            .map_err(|err| MessagingError::InvalidPayload(format!("{}: {}", A::NAME, err)))?;

        let output = self.handler.handle(ctx, action).await?;
        Ok(Payload::typed(output))
    }
}

#[async_trait]
impl<A, H> MessageHandler for ActionHandlerActivator<A, H>
where
    A: Action,
    H: ActionHandler<A> + 'static,
{
    async fn handle(
        &self,
        ctx: &Context,
        msg: Arc<Message>,
    ) -> Result<Option<Arc<Message>>, MessagingError> {
        let result = self.execute(ctx, &msg).await;

        let payload = match &result {
            Ok(payload) => payload.clone(),
            Err(err) => Payload::Error(err.to_string()),
        };

        let reply = Arc::new(
            MessageBuilder::from_message(&msg)
                .with_message_type(MessageType::Document)
                .with_payload(payload)
                .without_reply_channel()
                .build(),
        );

        match msg.headers().reply_channel() {
            Some(channel) => {
                debug!(action = A::NAME, channel = channel.name(), "sending reply");
                channel.send(ctx, reply.clone()).await?;
            }
            None if msg.headers().has_reply_channel() => {
                warn!(action = A::NAME, "reply channel dropped before reply");
            }
            None => {}
        }

        result.map(|_| Some(reply))
    }
}
