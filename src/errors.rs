// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Engine
//!
//! This module provides the single error type used across the engine. The
//! `MessagingError` enum covers configuration mistakes detected while composing
//! the system, runtime processing failures raised by handlers, channel lifecycle
//! violations, context cancellation and transport failures reported by adapters.

use thiserror::Error;

/// Represents errors that can occur while composing or running the messaging engine.
///
/// Errors are cloneable so they can be carried back to a caller through a reply
/// channel and kept as the reason a consumer stopped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid composition detected while building a component
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A component was registered twice under the same reference name
    #[error("`{0}` already registered")]
    DuplicateRegistration(String),

    /// No channel is registered for the given key
    #[error("no channel for key `{0}`")]
    ChannelNotFound(String),

    /// No connection is registered for the given reference name
    #[error("connection `{0}` does not exist")]
    ConnectionNotFound(String),

    /// The channel was closed before or during the operation
    #[error("channel `{0}` not open")]
    ChannelClosed(String),

    /// The execution context was cancelled
    #[error("context canceled")]
    ContextCanceled,

    /// The execution context deadline expired
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// A handler failed while processing a message
    #[error("{0}")]
    Handler(String),

    /// The payload does not have the shape the receiver expects
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The reply destination was dropped before a reply could be sent
    #[error("reply channel dropped")]
    ReplyChannelDropped,

    /// Error encoding or decoding a message for a transport
    #[error("serialization failure `{0}`")]
    Serialization(String),

    /// Error establishing or closing a transport connection
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error publishing a message to a transport
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error consuming a message from a transport
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message on a transport
    #[error("failure to ack message")]
    AckMessageError,
}

impl MessagingError {
    /// Returns true for cancellation and deadline errors.
    ///
    /// Context errors are terminal for the current operation and are never retried.
    pub fn is_context_error(&self) -> bool {
        matches!(
            self,
            MessagingError::ContextCanceled | MessagingError::DeadlineExceeded
        )
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::Serialization(err.to_string())
    }
}
