// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Model and Channel Contracts
//!
//! This module defines the envelope that travels through the engine and the
//! narrow contracts every component is written against:
//!
//! - `Message`: payload, headers, execution context and the optional raw delivery
//! - `MessageHeaders`: routing, correlation and reply metadata
//! - `MessageHandler`: one stage of a processing chain
//! - `PublisherChannel`, `ConsumerChannel`, `SubscriberChannel`: channel shapes
//! - `InboundChannelAdapter`: the boundary an external transport implements

use crate::{context::Context, errors::MessagingError, handler::ChannelMessageAcknowledgment};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Weak},
    time::Duration,
};

#[cfg(test)]
use mockall::automock;

/// Origin stamped on messages that do not declare one
pub const DEFAULT_ORIGIN: &str = "messageSystem";
/// Version stamped on messages that do not declare one
pub const DEFAULT_VERSION: &str = "1.0";
/// Timestamp layout used when headers cross a transport boundary
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Custom header key-value pairs. Ordering is irrelevant.
pub type CustomHeaders = HashMap<String, String>;

/// Callback invoked by a subscribed channel for every delivered message.
pub type Subscriber = Arc<dyn Fn(Arc<Message>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a channel [`Subscriber`].
pub fn subscriber<F, Fut>(callback: F) -> Subscriber
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(callback(msg)))
}

/// The kind of a message. Commands and queries expect exactly one reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[default]
    Command,
    Query,
    Event,
    Document,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Command => write!(f, "Command"),
            MessageType::Query => write!(f, "Query"),
            MessageType::Event => write!(f, "Event"),
            MessageType::Document => write!(f, "Document"),
        }
    }
}

impl FromStr for MessageType {
    type Err = MessagingError;

    /// Unknown names fall back to `Document`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "Command" => MessageType::Command,
            "Query" => MessageType::Query,
            "Event" => MessageType::Event,
            _ => MessageType::Document,
        })
    }
}

/// A value that can travel as a typed payload.
///
/// Implemented for every serializable `'static` type, so typed payloads stay
/// downcastable in-process and still encode to JSON for a transport.
pub trait PayloadValue: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<T> PayloadValue for T
where
    T: Any + Serialize + Send + Sync + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Data carried by a message.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    /// Raw body as received from a transport
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Typed(Arc<dyn PayloadValue>),
    /// Failure carried back on a reply channel
    Error(String),
}

impl Payload {
    pub fn typed<T: PayloadValue>(value: T) -> Self {
        Payload::Typed(Arc::new(value))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }

    pub fn as_error(&self) -> Option<&str> {
        match self {
            Payload::Error(reason) => Some(reason),
            _ => None,
        }
    }

    /// Borrows a typed payload as `T` without any conversion.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Payload::Typed(value) => (**value).as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Produces a `T` from any payload representation.
    ///
    /// Typed payloads are downcast first; everything else goes through JSON.
    pub fn decode<T>(&self) -> Result<T, MessagingError>
    where
        T: DeserializeOwned + Clone + Any,
    {
        match self {
            Payload::Typed(value) => match (**value).as_any().downcast_ref::<T>() {
                Some(typed) => Ok(typed.clone()),
                None => Ok(serde_json::from_value((**value).to_json()?)?),
            },
            Payload::Json(value) => Ok(serde_json::from_value(value.clone())?),
            Payload::Bytes(data) => Ok(serde_json::from_slice(data)?),
            Payload::Empty => Ok(serde_json::from_value(serde_json::Value::Null)?),
            Payload::Error(reason) => Err(MessagingError::Handler(reason.clone())),
        }
    }

    /// JSON view of the payload. Raw bytes are parsed when they hold JSON and
    /// kept as a string otherwise.
    pub fn to_json_value(&self) -> Result<serde_json::Value, MessagingError> {
        match self {
            Payload::Empty => Ok(serde_json::Value::Null),
            Payload::Bytes(data) => Ok(serde_json::from_slice(data).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(data).into_owned())
            })),
            Payload::Json(value) => Ok(value.clone()),
            Payload::Typed(value) => Ok((**value).to_json()?),
            Payload::Error(reason) => Ok(serde_json::Value::String(reason.clone())),
        }
    }

    /// Transport encoding of the payload. Raw bytes are passed through untouched.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        match self {
            Payload::Bytes(data) => Ok(data.clone()),
            other => Ok(serde_json::to_vec(&other.to_json_value()?)?),
        }
    }
}

/// Metadata associated with a message.
#[derive(Clone)]
pub struct MessageHeaders {
    pub origin: String,
    pub message_id: String,
    pub route: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub reply_channel: Option<Weak<dyn PublisherChannel>>,
    pub reply_channel_name: String,
    pub custom_headers: CustomHeaders,
    pub correlation_id: String,
    pub channel_name: String,
    pub version: String,
}

impl MessageHeaders {
    /// Resolves the reply destination, if it is still alive.
    pub fn reply_channel(&self) -> Option<Arc<dyn PublisherChannel>> {
        self.reply_channel.as_ref().and_then(Weak::upgrade)
    }

    pub fn has_reply_channel(&self) -> bool {
        self.reply_channel.is_some()
    }

    /// Flattens the headers into the string map used across transports.
    ///
    /// Custom headers are JSON-encoded; an empty set is written as an empty string.
    pub fn to_map(&self) -> Result<HashMap<String, String>, MessagingError> {
        let custom_headers = if self.custom_headers.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&self.custom_headers)?
        };

        Ok(HashMap::from([
            ("origin".to_owned(), self.origin.clone()),
            ("route".to_owned(), self.route.clone()),
            ("type".to_owned(), self.message_type.to_string()),
            (
                "timestamp".to_owned(),
                self.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            ),
            ("replyChannel".to_owned(), self.reply_channel_name.clone()),
            ("customHeaders".to_owned(), custom_headers),
            ("correlationId".to_owned(), self.correlation_id.clone()),
            ("channelName".to_owned(), self.channel_name.clone()),
            ("messageId".to_owned(), self.message_id.clone()),
            ("version".to_owned(), self.version.clone()),
        ]))
    }
}

impl fmt::Debug for MessageHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHeaders")
            .field("origin", &self.origin)
            .field("message_id", &self.message_id)
            .field("route", &self.route)
            .field("message_type", &self.message_type)
            .field("timestamp", &self.timestamp)
            .field("reply_channel", &self.reply_channel().map(|c| c.name()))
            .field("reply_channel_name", &self.reply_channel_name)
            .field("custom_headers", &self.custom_headers)
            .field("correlation_id", &self.correlation_id)
            .field("channel_name", &self.channel_name)
            .field("version", &self.version)
            .finish()
    }
}

/// A message in the system. Shared as `Arc<Message>` and never mutated in place;
/// use [`crate::builder::MessageBuilder::from_message`] to derive a new one.
#[derive(Clone)]
pub struct Message {
    pub(crate) payload: Payload,
    pub(crate) headers: MessageHeaders,
    pub(crate) context: Context,
    pub(crate) raw: Option<Arc<dyn Any + Send + Sync>>,
}

impl Message {
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The transport delivery this message was translated from, if any.
    pub fn raw_message(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.raw.as_ref()
    }

    /// Commands and queries require a reply; events and documents do not.
    pub fn reply_required(&self) -> bool {
        matches!(
            self.headers.message_type,
            MessageType::Command | MessageType::Query
        )
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("payload", &self.payload)
            .field("headers", &self.headers)
            .field("raw", &self.raw.is_some())
            .finish()
    }
}

/// One stage of a processing chain.
///
/// Returning `Ok(None)` means the message was absorbed (e.g. dropped by a filter)
/// and later stages must not run.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &Context,
        msg: Arc<Message>,
    ) -> Result<Option<Arc<Message>>, MessagingError>;
}

/// A channel messages can be sent to.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PublisherChannel: Send + Sync {
    fn name(&self) -> String;

    async fn send(&self, ctx: &Context, msg: Arc<Message>) -> Result<(), MessagingError>;

    /// Tears the channel down. Must be idempotent.
    async fn close(&self) -> Result<(), MessagingError> {
        Ok(())
    }
}

/// A channel messages can be pulled from.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerChannel: Send + Sync {
    fn name(&self) -> String;

    async fn receive(&self, ctx: &Context) -> Result<Arc<Message>, MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;
}

/// A channel that pushes every message to registered callbacks.
pub trait SubscriberChannel: Send + Sync {
    fn name(&self) -> String;

    fn subscribe(&self, callbacks: Vec<Subscriber>);

    /// Closes the channel. Must be idempotent.
    fn unsubscribe(&self) -> Result<(), MessagingError>;
}

/// Boundary implemented by adapters that bring messages in from a transport.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InboundChannelAdapter: Send + Sync {
    fn reference_name(&self) -> String;

    fn dead_letter_channel_name(&self) -> Option<String>;

    fn before_processors(&self) -> Vec<Arc<dyn MessageHandler>>;

    fn after_processors(&self) -> Vec<Arc<dyn MessageHandler>>;

    /// Delays between processing attempts of a failed message.
    fn retry_attempts(&self) -> Vec<Duration> {
        vec![]
    }

    /// Collaborator that commits a message once it has been processed.
    fn acknowledgment(&self) -> Option<Arc<dyn ChannelMessageAcknowledgment>> {
        None
    }

    async fn receive_message(&self, ctx: &Context) -> Result<Arc<Message>, MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;
}
