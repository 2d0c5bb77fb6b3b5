// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Wire Translation
//!
//! Transport-neutral mapping between messages and the `(headers, body)` pair a
//! broker carries. Outgoing headers are the flattened [`MessageHeaders`] and the
//! body is the JSON encoding of the payload. Incoming translation is tolerant:
//! missing or malformed optional headers keep their defaults.
//!
//! [`MessageHeaders`]: crate::message::MessageHeaders

use crate::{
    builder::MessageBuilder,
    errors::MessagingError,
    message::{CustomHeaders, Message, MessageType, Payload, TIMESTAMP_FORMAT},
};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use tracing::warn;

pub const HEADER_ORIGIN: &str = "origin";
pub const HEADER_ROUTE: &str = "route";
pub const HEADER_TYPE: &str = "type";
pub const HEADER_TIMESTAMP: &str = "timestamp";
pub const HEADER_REPLY_CHANNEL: &str = "replyChannel";
pub const HEADER_CUSTOM_HEADERS: &str = "customHeaders";
pub const HEADER_CORRELATION_ID: &str = "correlationId";
pub const HEADER_CHANNEL_NAME: &str = "channelName";
pub const HEADER_MESSAGE_ID: &str = "messageId";
pub const HEADER_VERSION: &str = "version";

/// Headers written for `msg` on the wire.
pub fn to_wire_headers(msg: &Message) -> Result<HashMap<String, String>, MessagingError> {
    msg.headers().to_map()
}

/// JSON body written for `msg` on the wire.
pub fn to_wire_body(msg: &Message) -> Result<Vec<u8>, MessagingError> {
    msg.payload().to_json_bytes()
}

/// Builder for the message carried by `headers` and `body`.
///
/// An empty body becomes `Payload::Empty`; any other body is kept as bytes and
/// decoded on demand.
pub fn from_wire(headers: &HashMap<String, String>, body: &[u8]) -> MessageBuilder {
    let header = |key: &str| headers.get(key).filter(|v| !v.is_empty()).cloned();

    let payload = if body.is_empty() {
        Payload::Empty
    } else {
        Payload::Bytes(body.to_vec())
    };

    let message_type = header(HEADER_TYPE)
        .and_then(|v| v.parse::<MessageType>().ok())
        .unwrap_or(MessageType::Document);

    let mut builder = MessageBuilder::new()
        .with_payload(payload)
        .with_message_type(message_type)
        .with_custom_header(custom_headers(header(HEADER_CUSTOM_HEADERS)));

    if let Some(origin) = header(HEADER_ORIGIN) {
        builder = builder.with_origin(origin);
    }
    if let Some(route) = header(HEADER_ROUTE) {
        builder = builder.with_route(route);
    }
    if let Some(reply_channel) = header(HEADER_REPLY_CHANNEL) {
        builder = builder.with_reply_channel_name(reply_channel);
    }
    if let Some(correlation_id) = header(HEADER_CORRELATION_ID) {
        builder = builder.with_correlation_id(correlation_id);
    }
    if let Some(channel_name) = header(HEADER_CHANNEL_NAME) {
        builder = builder.with_channel_name(channel_name);
    }
    if let Some(message_id) = header(HEADER_MESSAGE_ID) {
        builder = builder.with_message_id(message_id);
    }
    if let Some(version) = header(HEADER_VERSION) {
        builder = builder.with_version(version);
    }
    if let Some(timestamp) = header(HEADER_TIMESTAMP) {
        match NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT) {
            Ok(value) => builder = builder.with_timestamp(value.and_utc()),
            Err(err) => warn!(timestamp = timestamp.as_str(), error = err.to_string(), "invalid timestamp header"),
        }
    }

    builder
}

fn custom_headers(value: Option<String>) -> CustomHeaders {
    let Some(value) = value else {
        return CustomHeaders::new();
    };

    serde_json::from_str(&value).unwrap_or_else(|err| {
        warn!(error = err.to_string(), "invalid custom headers");
        CustomHeaders::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn outgoing() -> Message {
        MessageBuilder::new()
            .with_message_type(MessageType::Event)
            .with_route("orders.created")
            .with_channel_name("orders")
            .with_correlation_id("c-1")
            .with_reply_channel_name("orders.reply")
            .with_custom_header(CustomHeaders::from([("tenant".to_owned(), "acme".to_owned())]))
            .with_timestamp(Utc.with_ymd_and_hms(2025, 3, 1, 10, 30, 0).unwrap())
            .with_payload(Payload::Json(serde_json::json!({"id": 1})))
            .build()
    }

    #[test]
    fn headers_survive_the_wire() {
        let msg = outgoing();
        let headers = to_wire_headers(&msg).unwrap();
        let body = to_wire_body(&msg).unwrap();

        let received = from_wire(&headers, &body).build();

        let (sent, got) = (msg.headers(), received.headers());
        assert_eq!(got.message_type, MessageType::Event);
        assert_eq!(got.route, sent.route);
        assert_eq!(got.channel_name, sent.channel_name);
        assert_eq!(got.correlation_id, sent.correlation_id);
        assert_eq!(got.message_id, sent.message_id);
        assert_eq!(got.reply_channel_name, "orders.reply");
        assert_eq!(got.custom_headers, sent.custom_headers);
        assert_eq!(got.timestamp, sent.timestamp);
        assert_eq!(
            received.payload().to_json_value().unwrap(),
            serde_json::json!({"id": 1})
        );
    }

    #[test]
    fn missing_headers_keep_defaults() {
        let received = from_wire(&HashMap::new(), b"").build();

        let headers = received.headers();
        assert_eq!(headers.message_type, MessageType::Document);
        assert_eq!(headers.origin, crate::message::DEFAULT_ORIGIN);
        assert_eq!(headers.version, crate::message::DEFAULT_VERSION);
        assert!(!headers.message_id.is_empty());
        assert!(headers.custom_headers.is_empty());
        assert!(received.payload().is_empty());
    }

    #[test]
    fn malformed_optional_headers_are_ignored() {
        let headers = HashMap::from([
            (HEADER_TIMESTAMP.to_owned(), "yesterday".to_owned()),
            (HEADER_CUSTOM_HEADERS.to_owned(), "{not json".to_owned()),
            (HEADER_TYPE.to_owned(), "Query".to_owned()),
        ]);

        let received = from_wire(&headers, b"1").build();

        assert_eq!(received.headers().message_type, MessageType::Query);
        assert!(received.headers().custom_headers.is_empty());
        assert_eq!(received.payload().decode::<i32>(), Ok(1));
    }
}
