// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Execution Context
//!
//! A `Context` is the cancellable scope a message is processed in. Scopes nest:
//! a child created with [`Context::with_cancel`] or [`Context::with_timeout`] is
//! cancelled together with its parent, and a child deadline never outlives the
//! parent deadline. Every blocking operation in the engine races against
//! [`Context::done`].

use crate::errors::MessagingError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellable execution scope with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Creates a root context that is never cancelled unless asked to.
    pub fn background() -> Self {
        Context::default()
    }

    /// Creates a child scope that can be cancelled independently of its parent.
    pub fn with_cancel(&self) -> Self {
        Context {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Creates a child scope that expires after `timeout`.
    ///
    /// The resulting deadline is the earlier of the parent's and the new one.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };

        Context {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancels this scope and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason this scope is done, if it is.
    ///
    /// Cancellation takes precedence over an expired deadline.
    pub fn err(&self) -> Option<MessagingError> {
        if self.token.is_cancelled() {
            return Some(MessagingError::ContextCanceled);
        }

        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(MessagingError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the scope is cancelled or its deadline expires.
    pub async fn done(&self) -> MessagingError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => MessagingError::ContextCanceled,
                _ = tokio::time::sleep_until(deadline) => MessagingError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                MessagingError::ContextCanceled
            }
        }
    }
}
