// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Builder
//!
//! Fluent construction of a [`Message`]. `build` never fails: missing fields take
//! their defaults (fresh UUID message id, current timestamp, default origin and
//! version). [`MessageBuilder::from_message`] seeds a builder with every field of
//! an existing message so a stage can override a few of them and forward the
//! result while keeping correlation and reply information.

use crate::{
    context::Context,
    message::{
        CustomHeaders, Message, MessageHeaders, MessageType, Payload, PublisherChannel,
        DEFAULT_ORIGIN, DEFAULT_VERSION,
    },
};
use chrono::{DateTime, Utc};
use std::{
    any::Any,
    sync::{Arc, Weak},
};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct MessageBuilder {
    payload: Payload,
    origin: String,
    message_id: String,
    route: String,
    message_type: MessageType,
    reply_channel: Option<Weak<dyn PublisherChannel>>,
    reply_channel_name: String,
    custom_headers: CustomHeaders,
    correlation_id: String,
    channel_name: String,
    timestamp: Option<DateTime<Utc>>,
    context: Option<Context>,
    version: String,
    raw: Option<Arc<dyn Any + Send + Sync>>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        MessageBuilder::default()
    }

    /// Creates a builder carrying every field of `msg`.
    pub fn from_message(msg: &Message) -> Self {
        let headers = msg.headers();

        MessageBuilder {
            payload: msg.payload().clone(),
            origin: headers.origin.clone(),
            message_id: headers.message_id.clone(),
            route: headers.route.clone(),
            message_type: headers.message_type,
            reply_channel: headers.reply_channel.clone(),
            reply_channel_name: headers.reply_channel_name.clone(),
            custom_headers: headers.custom_headers.clone(),
            correlation_id: headers.correlation_id.clone(),
            channel_name: headers.channel_name.clone(),
            timestamp: Some(headers.timestamp),
            context: Some(msg.context().clone()),
            version: headers.version.clone(),
            raw: msg.raw_message().cloned(),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    /// Sets the reply destination. Only a weak reference is kept: the creator of
    /// the channel owns its lifecycle.
    pub fn with_reply_channel(mut self, channel: &Arc<dyn PublisherChannel>) -> Self {
        self.reply_channel = Some(Arc::downgrade(channel));
        self
    }

    pub fn without_reply_channel(mut self) -> Self {
        self.reply_channel = None;
        self
    }

    pub fn with_reply_channel_name(mut self, name: impl Into<String>) -> Self {
        self.reply_channel_name = name.into();
        self
    }

    pub fn with_custom_header(mut self, headers: CustomHeaders) -> Self {
        self.custom_headers = headers;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_channel_name(mut self, channel_name: impl Into<String>) -> Self {
        self.channel_name = channel_name.into();
        self
    }

    pub fn with_context(mut self, ctx: Context) -> Self {
        self.context = Some(ctx);
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Attaches the transport delivery the message was translated from.
    pub fn with_raw_message(mut self, raw: Arc<dyn Any + Send + Sync>) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn build(self) -> Message {
        let headers = MessageHeaders {
            origin: or_default(self.origin, DEFAULT_ORIGIN),
            message_id: if self.message_id.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                self.message_id
            },
            route: self.route,
            message_type: self.message_type,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            reply_channel: self.reply_channel,
            reply_channel_name: self.reply_channel_name,
            custom_headers: self.custom_headers,
            correlation_id: self.correlation_id,
            channel_name: self.channel_name,
            version: or_default(self.version, DEFAULT_VERSION),
        };

        Message {
            payload: self.payload,
            headers,
            context: self.context.unwrap_or_default(),
            raw: self.raw,
        }
    }
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_owned()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MockPublisherChannel;
    use chrono::TimeZone;

    #[test]
    fn build_fills_defaults() {
        let msg = MessageBuilder::new().build();
        let headers = msg.headers();

        assert_eq!(headers.origin, DEFAULT_ORIGIN);
        assert_eq!(headers.version, DEFAULT_VERSION);
        assert!(Uuid::parse_str(&headers.message_id).is_ok());
        assert!(headers.reply_channel.is_none());
        assert!(msg.payload().is_empty());
        assert!(!msg.context().is_done());
    }

    #[test]
    fn every_build_gets_a_fresh_message_id() {
        let first = MessageBuilder::new().build();
        let second = MessageBuilder::new().build();
        assert_ne!(first.headers().message_id, second.headers().message_id);
    }

    #[test]
    fn explicit_fields_are_kept() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        let msg = MessageBuilder::new()
            .with_payload(Payload::Json(serde_json::json!({"id": 1})))
            .with_origin("orders-service")
            .with_message_id("msg-1")
            .with_route("orders.create")
            .with_message_type(MessageType::Query)
            .with_correlation_id("corr-1")
            .with_channel_name("orders")
            .with_reply_channel_name("orders.reply")
            .with_timestamp(at)
            .with_version("2.0")
            .build();
        let headers = msg.headers();

        assert_eq!(headers.origin, "orders-service");
        assert_eq!(headers.message_id, "msg-1");
        assert_eq!(headers.route, "orders.create");
        assert_eq!(headers.message_type, MessageType::Query);
        assert_eq!(headers.correlation_id, "corr-1");
        assert_eq!(headers.channel_name, "orders");
        assert_eq!(headers.reply_channel_name, "orders.reply");
        assert_eq!(headers.timestamp, at);
        assert_eq!(headers.version, "2.0");
    }

    #[test]
    fn from_message_preserves_correlation_and_reply() {
        let mut reply = MockPublisherChannel::new();
        reply.expect_name().return_const("reply".to_owned());
        let reply: Arc<dyn PublisherChannel> = Arc::new(reply);

        let original = MessageBuilder::new()
            .with_route("orders.create")
            .with_correlation_id("corr-9")
            .with_reply_channel(&reply)
            .with_reply_channel_name("orders.reply")
            .with_raw_message(Arc::new(42_u64))
            .build();

        let forwarded = MessageBuilder::from_message(&original)
            .with_channel_name("orders")
            .build();

        assert_eq!(forwarded.headers().message_id, original.headers().message_id);
        assert_eq!(forwarded.headers().correlation_id, "corr-9");
        assert_eq!(forwarded.headers().reply_channel_name, "orders.reply");
        assert_eq!(forwarded.headers().channel_name, "orders");
        assert_eq!(forwarded.headers().timestamp, original.headers().timestamp);
        assert_eq!(forwarded.headers().reply_channel().unwrap().name(), "reply");
        assert!(forwarded.raw_message().is_some());
    }

    #[test]
    fn reply_channel_is_not_owned_by_the_message() {
        let reply: Arc<dyn PublisherChannel> = Arc::new(MockPublisherChannel::new());
        let msg = MessageBuilder::new().with_reply_channel(&reply).build();

        drop(reply);

        assert!(msg.headers().has_reply_channel());
        assert!(msg.headers().reply_channel().is_none());
    }
}
