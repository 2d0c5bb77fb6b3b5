// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Point-to-Point Channel
//!
//! This module provides the unbuffered hand-off primitive shared by the in-process
//! channels and the point-to-point channel built on it. A send completes only
//! once a receiver has taken the message; a sender that gives up (cancelled
//! context, closed channel) is skipped by the receiver, so each message is
//! delivered to at most one receiver and never after its sender returned.
//!
//! The open/closed state is an atomic flag paired with a cancellation token that
//! wakes every blocked sender and receiver when the channel is closed.

use crate::{
    context::Context,
    errors::MessagingError,
    message::{subscriber, ConsumerChannel, Message, MessageHandler, PublisherChannel, Subscriber},
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Handoff {
    msg: Arc<Message>,
    taken: oneshot::Sender<()>,
}

/// Synchronous hand-off between one sender and one receiver.
pub(crate) struct Rendezvous {
    name: String,
    sender: mpsc::Sender<Handoff>,
    receiver: Mutex<mpsc::Receiver<Handoff>>,
    open: AtomicBool,
    closed: CancellationToken,
}

impl Rendezvous {
    pub(crate) fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::channel(1);

        Rendezvous {
            name: name.to_owned(),
            sender,
            receiver: Mutex::new(receiver),
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn closed_error(&self) -> MessagingError {
        MessagingError::ChannelClosed(self.name.clone())
    }

    pub(crate) async fn send(&self, ctx: &Context, msg: Arc<Message>) -> Result<(), MessagingError> {
        if !self.is_open() {
            return Err(self.closed_error());
        }

        let (taken, mut taken_rx) = oneshot::channel();

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            err = ctx.done() => return Err(err),
            sent = self.sender.send(Handoff { msg, taken }) => {
                sent.map_err(|_| self.closed_error())?
            }
        }

        let outcome = tokio::select! {
            biased;
            ack = &mut taken_rx => return ack.map_err(|_| self.closed_error()),
            _ = self.closed.cancelled() => self.closed_error(),
            err = ctx.done() => err,
        };

        // a receiver that took the message before we gave up owns it
        taken_rx.close();
        match taken_rx.try_recv() {
            Ok(()) => Ok(()),
            Err(_) => Err(outcome),
        }
    }

    pub(crate) async fn receive(&self, ctx: &Context) -> Result<Arc<Message>, MessagingError> {
        if !self.is_open() {
            return Err(self.closed_error());
        }

        let mut receiver = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            err = ctx.done() => return Err(err),
            guard = self.receiver.lock() => guard,
        };

        loop {
            let handoff = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(self.closed_error()),
                err = ctx.done() => return Err(err),
                next = receiver.recv() => next,
            };

            match handoff {
                Some(handoff) => {
                    // the sender is still waiting: the message is ours
                    if handoff.taken.send(()).is_ok() {
                        return Ok(handoff.msg);
                    }
                }
                None => return Err(self.closed_error()),
            }
        }
    }

    /// Returns false when the channel was already closed.
    pub(crate) fn close(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }

        self.closed.cancel();
        true
    }
}

/// Channel delivering every message to exactly one receiver.
#[derive(Clone)]
pub struct PointToPointChannel {
    inner: Arc<Rendezvous>,
}

impl PointToPointChannel {
    pub fn new(name: &str) -> Self {
        PointToPointChannel {
            inner: Arc::new(Rendezvous::new(name)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Starts a background receive loop handing each message to `callback` on its
    /// own task. The loop ends when the channel is closed.
    pub fn subscribe(&self, callback: Subscriber) {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let ctx = Context::background();
            loop {
                match inner.receive(&ctx).await {
                    Ok(msg) => {
                        tokio::spawn(callback(msg));
                    }
                    Err(err) => {
                        debug!(channel = inner.name(), error = err.to_string(), "subscription ended");
                        break;
                    }
                }
            }
        });
    }

    /// Creates a channel whose messages are processed by `handler`, each one on
    /// its own task with the message's own context. Failures are logged.
    pub fn with_handler(name: &str, handler: Arc<dyn MessageHandler>) -> Self {
        let channel = PointToPointChannel::new(name);
        let channel_name = name.to_owned();

        channel.subscribe(subscriber(move |msg: Arc<Message>| {
            let handler = handler.clone();
            let channel_name = channel_name.clone();
            async move {
                let ctx = msg.context().clone();
                if let Err(err) = handler.handle(&ctx, msg.clone()).await {
                    warn!(
                        channel = channel_name,
                        message_id = msg.headers().message_id,
                        error = err.to_string(),
                        "failure to handle message"
                    );
                }
            }
        }));

        channel
    }

    /// Closes the channel, waking blocked senders and receivers. Idempotent.
    pub fn close_channel(&self) {
        if self.inner.close() {
            debug!(channel = self.inner.name(), "channel closed");
        }
    }
}

#[async_trait]
impl PublisherChannel for PointToPointChannel {
    fn name(&self) -> String {
        self.inner.name().to_owned()
    }

    async fn send(&self, ctx: &Context, msg: Arc<Message>) -> Result<(), MessagingError> {
        self.inner.send(ctx, msg).await
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.close_channel();
        Ok(())
    }
}

#[async_trait]
impl ConsumerChannel for PointToPointChannel {
    fn name(&self) -> String {
        self.inner.name().to_owned()
    }

    async fn receive(&self, ctx: &Context) -> Result<Arc<Message>, MessagingError> {
        self.inner.receive(ctx).await
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.close_channel();
        Ok(())
    }
}
