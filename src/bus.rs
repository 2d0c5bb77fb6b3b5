// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Command, Query and Event Buses
//!
//! Typed facades over a [`Dispatcher`]. Each bus stamps its message type and a
//! fresh correlation id on the messages it builds. Typed variants route by the
//! action name; raw variants take an explicit route, payload and custom headers.

use crate::{
    activator::Action,
    builder::MessageBuilder,
    context::Context,
    dispatcher::Dispatcher,
    errors::MessagingError,
    message::{CustomHeaders, Message, MessageType, Payload},
};
use std::sync::Arc;
use uuid::Uuid;

fn message_builder(message_type: MessageType) -> MessageBuilder {
    MessageBuilder::new()
        .with_message_type(message_type)
        .with_correlation_id(Uuid::new_v4().to_string())
}

fn action_message<A: Action>(message_type: MessageType, action: A) -> Arc<Message> {
    Arc::new(
        message_builder(message_type)
            .with_payload(Payload::typed(action))
            .with_route(A::NAME)
            .build(),
    )
}

fn raw_message(
    message_type: MessageType,
    route: &str,
    payload: Payload,
    headers: CustomHeaders,
) -> Arc<Message> {
    Arc::new(
        message_builder(message_type)
            .with_payload(payload)
            .with_route(route)
            .with_custom_header(headers)
            .build(),
    )
}

/// Sends commands and waits for their outcome.
#[derive(Clone)]
pub struct CommandBus {
    dispatcher: Arc<dyn Dispatcher>,
}

impl CommandBus {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        CommandBus { dispatcher }
    }

    pub async fn send<A: Action>(&self, ctx: &Context, action: A) -> Result<Payload, MessagingError> {
        self.dispatcher
            .send_message(ctx, action_message(MessageType::Command, action))
            .await
    }

    pub async fn send_raw(
        &self,
        ctx: &Context,
        route: &str,
        payload: Payload,
        headers: CustomHeaders,
    ) -> Result<Payload, MessagingError> {
        self.dispatcher
            .send_message(ctx, raw_message(MessageType::Command, route, payload, headers))
            .await
    }

    pub async fn send_async<A: Action>(&self, ctx: &Context, action: A) -> Result<(), MessagingError> {
        self.dispatcher
            .publish_message(ctx, action_message(MessageType::Command, action))
            .await
    }

    pub async fn send_raw_async(
        &self,
        ctx: &Context,
        route: &str,
        payload: Payload,
        headers: CustomHeaders,
    ) -> Result<(), MessagingError> {
        self.dispatcher
            .publish_message(ctx, raw_message(MessageType::Command, route, payload, headers))
            .await
    }
}

/// Sends queries and returns their result.
#[derive(Clone)]
pub struct QueryBus {
    dispatcher: Arc<dyn Dispatcher>,
}

impl QueryBus {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        QueryBus { dispatcher }
    }

    pub async fn send<A: Action>(&self, ctx: &Context, query: A) -> Result<Payload, MessagingError> {
        self.dispatcher
            .send_message(ctx, action_message(MessageType::Query, query))
            .await
    }

    pub async fn send_raw(
        &self,
        ctx: &Context,
        route: &str,
        payload: Payload,
        headers: CustomHeaders,
    ) -> Result<Payload, MessagingError> {
        self.dispatcher
            .send_message(ctx, raw_message(MessageType::Query, route, payload, headers))
            .await
    }

    pub async fn send_async<A: Action>(&self, ctx: &Context, query: A) -> Result<(), MessagingError> {
        self.dispatcher
            .publish_message(ctx, action_message(MessageType::Query, query))
            .await
    }

    pub async fn send_raw_async(
        &self,
        ctx: &Context,
        route: &str,
        payload: Payload,
        headers: CustomHeaders,
    ) -> Result<(), MessagingError> {
        self.dispatcher
            .publish_message(ctx, raw_message(MessageType::Query, route, payload, headers))
            .await
    }
}

/// Publishes events. Events never wait for a reply.
#[derive(Clone)]
pub struct EventBus {
    dispatcher: Arc<dyn Dispatcher>,
}

impl EventBus {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        EventBus { dispatcher }
    }

    pub async fn publish<A: Action>(&self, ctx: &Context, event: A) -> Result<(), MessagingError> {
        self.dispatcher
            .publish_message(ctx, action_message(MessageType::Event, event))
            .await
    }

    pub async fn publish_raw(
        &self,
        ctx: &Context,
        route: &str,
        payload: Payload,
        headers: CustomHeaders,
    ) -> Result<(), MessagingError> {
        self.dispatcher
            .publish_message(ctx, raw_message(MessageType::Event, route, payload, headers))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MockDispatcher;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CreateUser {
        name: String,
    }

    impl Action for CreateUser {
        const NAME: &'static str = "users.create";
    }

    fn create_user() -> CreateUser {
        CreateUser {
            name: "ana".to_owned(),
        }
    }

    fn recording_dispatcher(sent: Arc<Mutex<Vec<Arc<Message>>>>) -> Arc<dyn Dispatcher> {
        let mut dispatcher = MockDispatcher::new();
        let on_send = sent.clone();
        dispatcher.expect_send_message().returning(move |_, msg| {
            on_send.lock().unwrap().push(msg);
            Ok(Payload::typed("done".to_owned()))
        });
        dispatcher.expect_publish_message().returning(move |_, msg| {
            sent.lock().unwrap().push(msg);
            Ok(())
        });
        Arc::new(dispatcher)
    }

    #[tokio::test]
    async fn command_bus_builds_typed_command() {
        let sent = Arc::new(Mutex::new(vec![]));
        let bus = CommandBus::new(recording_dispatcher(sent.clone()));

        let result = bus.send(&Context::background(), create_user()).await.unwrap();

        assert_eq!(result.downcast_ref::<String>().unwrap(), "done");
        let sent = sent.lock().unwrap();
        let headers = sent[0].headers();
        assert_eq!(headers.message_type, MessageType::Command);
        assert_eq!(headers.route, CreateUser::NAME);
        assert!(Uuid::parse_str(&headers.correlation_id).is_ok());
        assert_eq!(sent[0].payload().downcast_ref::<CreateUser>(), Some(&create_user()));
    }

    #[tokio::test]
    async fn every_message_gets_a_fresh_correlation_id() {
        let sent = Arc::new(Mutex::new(vec![]));
        let bus = CommandBus::new(recording_dispatcher(sent.clone()));

        bus.send_async(&Context::background(), create_user()).await.unwrap();
        bus.send_async(&Context::background(), create_user()).await.unwrap();

        let sent = sent.lock().unwrap();
        assert_ne!(sent[0].headers().correlation_id, sent[1].headers().correlation_id);
    }

    #[tokio::test]
    async fn query_bus_raw_variant_keeps_route_and_headers() {
        let sent = Arc::new(Mutex::new(vec![]));
        let bus = QueryBus::new(recording_dispatcher(sent.clone()));
        let headers = CustomHeaders::from([("tenant".to_owned(), "acme".to_owned())]);

        bus.send_raw(
            &Context::background(),
            "users.find",
            Payload::Bytes(br#"{"id":1}"#.to_vec()),
            headers.clone(),
        )
        .await
        .unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].headers().message_type, MessageType::Query);
        assert_eq!(sent[0].headers().route, "users.find");
        assert_eq!(sent[0].headers().custom_headers, headers);
    }

    #[tokio::test]
    async fn event_bus_publishes_events() {
        let sent = Arc::new(Mutex::new(vec![]));
        let bus = EventBus::new(recording_dispatcher(sent.clone()));

        bus.publish(&Context::background(), create_user()).await.unwrap();
        bus.publish_raw(
            &Context::background(),
            "users.created",
            Payload::Empty,
            CustomHeaders::new(),
        )
        .await
        .unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.headers().message_type == MessageType::Event));
        assert!(sent.iter().all(|m| !m.reply_required()));
    }

    #[tokio::test]
    async fn dispatcher_errors_are_returned() {
        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_send_message()
            .returning(|_, _| Err(MessagingError::DeadlineExceeded));
        let bus = QueryBus::new(Arc::new(dispatcher));

        let result = bus.send(&Context::background(), create_user()).await;

        assert_eq!(result.unwrap_err(), MessagingError::DeadlineExceeded);
    }
}
