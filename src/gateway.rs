// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Gateway
//!
//! The gateway bridges a synchronous caller to the asynchronous processing chain.
//! For commands and queries it creates an ephemeral point-to-point reply channel,
//! attaches it to the outgoing message, hands the message to the chain and waits
//! for the correlated reply.
//!
//! Chain layout, outermost first:
//!
//! ```text
//! Acknowledge -> DeadLetter -> Retry -> [ RequestReply(before.., recipient list), after.. ]
//! ```
//!
//! Every stage of the inner router is guarded by a `ContextHandler`.

use crate::{
    builder::MessageBuilder,
    channel::PointToPointChannel,
    context::Context,
    errors::MessagingError,
    handler::{
        AcknowledgeHandler, ChannelMessageAcknowledgment, ContextHandler, DeadLetterHandler,
        RetryHandler,
    },
    message::{ConsumerChannel, Message, MessageHandler, Payload, PublisherChannel},
    registry::ChannelRegistry,
    router::{CompositeRouter, RecipientListRouter},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};
use uuid::Uuid;

/// Registry reference of the gateway built for `reference_name`.
pub fn gateway_reference_name(reference_name: &str) -> String {
    format!("gateway:{}", reference_name)
}

/// Builds a [`Gateway`] and the chain behind it.
#[derive(Clone, Default)]
pub struct GatewayBuilder {
    reference_name: String,
    request_channel_name: String,
    before_interceptors: Vec<Arc<dyn MessageHandler>>,
    after_interceptors: Vec<Arc<dyn MessageHandler>>,
    dead_letter_channel: Option<String>,
    reply_channel_name: Option<String>,
    retry_attempts: Vec<Duration>,
    acknowledgment: Option<Arc<dyn ChannelMessageAcknowledgment>>,
}

impl GatewayBuilder {
    /// Creates a builder.
    ///
    /// # Parameters
    /// * `reference_name` - Name the gateway is known by
    /// * `request_channel_name` - Channel every request is addressed to; empty to
    ///   route by the message route
    pub fn new(reference_name: &str, request_channel_name: &str) -> Self {
        GatewayBuilder {
            reference_name: reference_name.to_owned(),
            request_channel_name: request_channel_name.to_owned(),
            ..Default::default()
        }
    }

    pub fn reference_name(&self) -> String {
        gateway_reference_name(&self.reference_name)
    }

    pub fn with_before_interceptors(mut self, interceptors: Vec<Arc<dyn MessageHandler>>) -> Self {
        self.before_interceptors.extend(interceptors);
        self
    }

    pub fn with_after_interceptors(mut self, interceptors: Vec<Arc<dyn MessageHandler>>) -> Self {
        self.after_interceptors.extend(interceptors);
        self
    }

    /// Failed messages are forwarded to this channel. It must be registered by
    /// the time the gateway is built.
    pub fn with_dead_letter_channel(mut self, channel_name: &str) -> Self {
        if !channel_name.is_empty() {
            self.dead_letter_channel = Some(channel_name.to_owned());
        }
        self
    }

    /// Name stamped on outgoing messages as `reply_channel_name`, for transports
    /// that reply by channel name.
    pub fn with_reply_channel(mut self, channel_name: &str) -> Self {
        if !channel_name.is_empty() {
            self.reply_channel_name = Some(channel_name.to_owned());
        }
        self
    }

    pub fn with_retry(mut self, attempts: Vec<Duration>) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_acknowledgment(mut self, acknowledgment: Arc<dyn ChannelMessageAcknowledgment>) -> Self {
        self.acknowledgment = Some(acknowledgment);
        self
    }

    /// Assembles the processing chain.
    ///
    /// # Parameters
    /// * `channels` - Registered channels the recipient list resolves against
    ///
    /// # Returns
    /// The gateway, or `ChannelNotFound` when the dead letter channel is unknown
    pub fn build(&self, channels: Arc<ChannelRegistry>) -> Result<Gateway, MessagingError> {
        let mut request = CompositeRouter::new();
        for interceptor in &self.before_interceptors {
            request = request.add_handler(Arc::new(ContextHandler::new(interceptor.clone())));
        }
        request = request.add_handler(Arc::new(ContextHandler::new(Arc::new(
            RecipientListRouter::new(channels.clone()),
        ))));

        let mut chain = CompositeRouter::new().add_handler(Arc::new(ContextHandler::new(
            Arc::new(RequestReplyHandler::new(Arc::new(request))),
        )));
        for interceptor in &self.after_interceptors {
            chain = chain.add_handler(Arc::new(ContextHandler::new(interceptor.clone())));
        }

        let mut processor: Arc<dyn MessageHandler> = Arc::new(chain);

        if !self.retry_attempts.is_empty() {
            processor = Arc::new(RetryHandler::new(self.retry_attempts.clone(), processor));
        }

        if let Some(name) = &self.dead_letter_channel {
            let Some(channel) = channels.get(name) else {
                return Err(MessagingError::ChannelNotFound(name.clone()));
            };
            processor = Arc::new(DeadLetterHandler::new(channel, processor));
        }

        if let Some(acknowledgment) = &self.acknowledgment {
            processor = Arc::new(AcknowledgeHandler::new(acknowledgment.clone(), processor));
        }

        Ok(Gateway {
            reference_name: self.reference_name(),
            processor,
            reply_channel_name: self.reply_channel_name.clone(),
            request_channel_name: self.request_channel_name.clone(),
        })
    }
}

/// Entry point turning a call into a message flowing through the chain.
pub struct Gateway {
    reference_name: String,
    processor: Arc<dyn MessageHandler>,
    reply_channel_name: Option<String>,
    request_channel_name: String,
}

impl Gateway {
    pub fn reference_name(&self) -> &str {
        &self.reference_name
    }

    /// Runs `msg` through the chain and returns the reply payload.
    ///
    /// Messages without a reply return the payload of the chain's result, or
    /// `Payload::Empty` when the chain absorbed them. A reply carrying
    /// `Payload::Error` fails with `MessagingError::Handler`.
    pub async fn execute(&self, ctx: &Context, msg: Arc<Message>) -> Result<Payload, MessagingError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let mut builder = MessageBuilder::from_message(&msg)
            .with_channel_name(self.request_channel_name.clone())
            .with_context(ctx.clone());
        if let Some(name) = &self.reply_channel_name {
            builder = builder.with_reply_channel_name(name.clone());
        }
        let request = Arc::new(builder.build());

        let result = tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            result = self.processor.handle(ctx, request.clone()) => result,
        };

        match result {
            Ok(Some(reply)) => match reply.payload() {
                Payload::Error(reason) => Err(MessagingError::Handler(reason.clone())),
                payload => Ok(payload.clone()),
            },
            Ok(None) => Ok(Payload::Empty),
            Err(err) => {
                error!(
                    gateway = self.reference_name,
                    message_id = request.headers().message_id,
                    error = err.to_string(),
                    "failed to process message"
                );
                Err(err)
            }
        }
    }
}

/// Sends a request through `router` and, when the message expects a reply,
/// waits for it on a fresh ephemeral channel.
///
/// Each invocation owns its reply channel, so retries never see a reply meant
/// for an earlier attempt. A reply channel already present on the incoming
/// message belongs to an upstream hop: the reply is forwarded to it as well.
struct RequestReplyHandler {
    router: Arc<dyn MessageHandler>,
}

impl RequestReplyHandler {
    fn new(router: Arc<dyn MessageHandler>) -> Self {
        RequestReplyHandler { router }
    }

    async fn await_reply(
        &self,
        ctx: &Context,
        msg: &Message,
        reply: &PointToPointChannel,
    ) -> Result<Option<Arc<Message>>, MessagingError> {
        let reply_channel: Arc<dyn PublisherChannel> = Arc::new(reply.clone());
        let request = Arc::new(
            MessageBuilder::from_message(msg)
                .with_reply_channel(&reply_channel)
                .build(),
        );

        // absorbed before reaching a recipient: nobody will reply
        if self.router.handle(ctx, request).await?.is_none() {
            return Ok(None);
        }

        // reply_channel stays alive until the reply arrives
        let received = ConsumerChannel::receive(reply, ctx).await;
        drop(reply_channel);
        received.map(Some)
    }
}

#[async_trait]
impl MessageHandler for RequestReplyHandler {
    async fn handle(
        &self,
        ctx: &Context,
        msg: Arc<Message>,
    ) -> Result<Option<Arc<Message>>, MessagingError> {
        if !msg.reply_required() {
            return self.router.handle(ctx, msg).await;
        }

        let upstream = msg.headers().reply_channel();
        let reply = PointToPointChannel::new(&Uuid::new_v4().to_string());

        let received = self.await_reply(ctx, &msg, &reply).await;
        reply.close_channel();
        let Some(received) = received? else {
            debug!(message_id = msg.headers().message_id, "request absorbed, no reply expected");
            return Ok(None);
        };

        debug!(
            message_id = msg.headers().message_id,
            correlation_id = msg.headers().correlation_id,
            "reply received"
        );

        if let Some(upstream) = upstream {
            upstream.send(ctx, received.clone()).await?;
        }

        if let Some(reason) = received.payload().as_error() {
            return Err(MessagingError::Handler(reason.to_owned()));
        }

        Ok(Some(received))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        activator::{Action, ActionHandler, ActionHandlerActivator},
        message::{MessageType, MockMessageHandler, MockPublisherChannel},
        router::MessageFilter,
    };
    use serde::{Deserialize, Serialize};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Double(i64);

    impl Action for Double {
        const NAME: &'static str = "math.double";
    }

    struct DoubleHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ActionHandler<Double> for DoubleHandler {
        type Output = i64;

        async fn handle(&self, _ctx: &Context, action: Double) -> Result<i64, MessagingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if action.0 < 0 {
                return Err(MessagingError::Handler("negative".to_owned()));
            }
            Ok(action.0 * 2)
        }
    }

    fn registry() -> (Arc<ChannelRegistry>, Arc<DoubleHandler>) {
        let handler = Arc::new(DoubleHandler {
            calls: AtomicUsize::new(0),
        });
        let activator = ActionHandlerActivator::new(handler.clone());
        let channel = PointToPointChannel::with_handler(Double::NAME, Arc::new(activator));

        let mut registry = ChannelRegistry::new();
        registry.register(Double::NAME, Arc::new(channel)).unwrap();
        (Arc::new(registry), handler)
    }

    fn command(value: i64) -> Arc<Message> {
        Arc::new(
            MessageBuilder::new()
                .with_message_type(MessageType::Command)
                .with_route(Double::NAME)
                .with_payload(Payload::typed(Double(value)))
                .build(),
        )
    }

    #[tokio::test]
    async fn command_returns_downstream_reply() {
        let (channels, _) = registry();
        let gateway = GatewayBuilder::new("default", "").build(channels).unwrap();

        let result = gateway.execute(&Context::background(), command(21)).await.unwrap();

        assert_eq!(result.decode::<i64>(), Ok(42));
    }

    #[tokio::test]
    async fn concurrent_calls_get_their_own_replies() {
        let (channels, _) = registry();
        let gateway = Arc::new(GatewayBuilder::new("default", "").build(channels).unwrap());

        let mut handles = vec![];
        for value in 0..20 {
            let gateway = gateway.clone();
            handles.push(tokio::spawn(async move {
                (value, gateway.execute(&Context::background(), command(value)).await)
            }));
        }

        for handle in handles {
            let (value, result) = handle.await.unwrap();
            assert_eq!(result.unwrap().decode::<i64>(), Ok(value * 2));
        }
    }

    #[tokio::test]
    async fn error_reply_surfaces_as_handler_error() {
        let (channels, _) = registry();
        let gateway = GatewayBuilder::new("default", "").build(channels).unwrap();

        let result = gateway.execute(&Context::background(), command(-1)).await;

        assert_eq!(result.unwrap_err(), MessagingError::Handler("negative".to_owned()));
    }

    #[tokio::test]
    async fn cancelled_context_fails_before_processing() {
        let (channels, handler) = registry();
        let gateway = GatewayBuilder::new("default", "").build(channels).unwrap();
        let ctx = Context::background().with_cancel();
        ctx.cancel();

        let result = gateway.execute(&ctx, command(1)).await;

        assert_eq!(result.unwrap_err(), MessagingError::ContextCanceled);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_reply_times_out() {
        let mut silent = MockPublisherChannel::new();
        silent.expect_name().return_const("silent".to_owned());
        silent.expect_send().returning(|_, _| Ok(()));
        let mut registry = ChannelRegistry::new();
        registry.register("silent", Arc::new(silent)).unwrap();

        let gateway = GatewayBuilder::new("silent", "silent")
            .build(Arc::new(registry))
            .unwrap();
        let ctx = Context::background().with_timeout(Duration::from_millis(30));

        let result = gateway.execute(&ctx, command(1)).await;

        assert_eq!(result.unwrap_err(), MessagingError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn event_is_routed_without_waiting_for_reply() {
        let sent = Arc::new(Mutex::new(vec![]));
        let recorded = sent.clone();
        let mut events = MockPublisherChannel::new();
        events.expect_name().return_const("users.created".to_owned());
        events.expect_send().times(1).returning(move |_, msg| {
            recorded.lock().unwrap().push(msg);
            Ok(())
        });
        let mut registry = ChannelRegistry::new();
        registry.register("users.created", Arc::new(events)).unwrap();
        let gateway = GatewayBuilder::new("users.created", "users.created")
            .with_reply_channel("users.reply")
            .build(Arc::new(registry))
            .unwrap();

        let event = Arc::new(
            MessageBuilder::new()
                .with_message_type(MessageType::Event)
                .with_payload(Payload::typed("ana".to_owned()))
                .build(),
        );
        let result = gateway.execute(&Context::background(), event).await.unwrap();

        assert_eq!(result.downcast_ref::<String>().unwrap(), "ana");
        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].headers().channel_name, "users.created");
        assert_eq!(sent[0].headers().reply_channel_name, "users.reply");
        assert!(!sent[0].headers().has_reply_channel());
    }

    #[tokio::test]
    async fn unknown_dead_letter_channel_fails_build() {
        let (channels, _) = registry();

        let result = GatewayBuilder::new("default", "")
            .with_dead_letter_channel("missing.dlq")
            .build(channels);

        assert_eq!(
            result.err(),
            Some(MessagingError::ChannelNotFound("missing.dlq".to_owned()))
        );
    }

    #[tokio::test]
    async fn interceptors_run_around_the_request() {
        let order = Arc::new(Mutex::new(vec![]));

        let before_order = order.clone();
        let mut before = MockMessageHandler::new();
        before.expect_handle().times(1).returning(move |_, msg| {
            before_order.lock().unwrap().push("before");
            Ok(Some(msg))
        });
        let after_order = order.clone();
        let mut after = MockMessageHandler::new();
        after.expect_handle().times(1).returning(move |_, msg| {
            after_order.lock().unwrap().push("after");
            Ok(Some(msg))
        });

        let (channels, _) = registry();
        let gateway = GatewayBuilder::new("default", "")
            .with_before_interceptors(vec![Arc::new(before)])
            .with_after_interceptors(vec![Arc::new(after)])
            .build(channels)
            .unwrap();

        let result = gateway.execute(&Context::background(), command(2)).await.unwrap();

        assert_eq!(result.decode::<i64>(), Ok(4));
        assert_eq!(*order.lock().unwrap(), vec!["before", "after"]);
    }

    #[tokio::test]
    async fn upstream_reply_channel_receives_forwarded_reply() {
        let (channels, _) = registry();
        let gateway = GatewayBuilder::new("default", "").build(channels).unwrap();

        let upstream = PointToPointChannel::new("upstream");
        let upstream_channel: Arc<dyn PublisherChannel> = Arc::new(upstream.clone());
        let receiver = tokio::spawn(async move {
            ConsumerChannel::receive(&upstream, &Context::background()).await
        });

        let msg = Arc::new(
            MessageBuilder::from_message(&command(5))
                .with_reply_channel(&upstream_channel)
                .build(),
        );
        let result = gateway.execute(&Context::background(), msg).await.unwrap();

        assert_eq!(result.decode::<i64>(), Ok(10));
        let forwarded = receiver.await.unwrap().unwrap();
        assert_eq!(forwarded.payload().decode::<i64>(), Ok(10));
    }

    #[tokio::test]
    async fn filtered_command_returns_without_waiting_for_reply() {
        let (channels, handler) = registry();
        let gateway = GatewayBuilder::new("default", "")
            .with_before_interceptors(vec![Arc::new(MessageFilter::new(|_| false))])
            .build(channels)
            .unwrap();
        let ctx = Context::background().with_timeout(Duration::from_secs(5));

        let started = std::time::Instant::now();
        let result = gateway.execute(&ctx, command(7)).await.unwrap();

        assert!(result.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_reruns_whole_request() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut flaky = MockMessageHandler::new();
        flaky.expect_handle().returning(move |_, msg| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(MessagingError::Handler("flaky".to_owned()))
            } else {
                Ok(Some(msg))
            }
        });

        let (channels, _) = registry();
        let gateway = GatewayBuilder::new("default", "")
            .with_before_interceptors(vec![Arc::new(flaky)])
            .with_retry(vec![Duration::from_millis(5)])
            .build(channels)
            .unwrap();

        let result = gateway.execute(&Context::background(), command(3)).await.unwrap();

        assert_eq!(result.decode::<i64>(), Ok(6));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
