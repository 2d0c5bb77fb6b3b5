// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish-Subscribe Channel
//!
//! Broadcasts each message to every callback subscribed at delivery time. There
//! is no buffering: a send waits until the dispatch loop takes the message, and a
//! late subscriber never sees earlier messages. Callbacks run concurrently on
//! their own tasks, without ordering between them.

use crate::{
    channel::Rendezvous,
    context::Context,
    errors::MessagingError,
    message::{Message, PublisherChannel, Subscriber, SubscriberChannel},
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};
use tracing::{debug, warn};

struct Shared {
    rendezvous: Rendezvous,
    subscribers: RwLock<Vec<Subscriber>>,
    dispatching: AtomicBool,
}

#[derive(Clone)]
pub struct PubSubChannel {
    shared: Arc<Shared>,
}

impl PubSubChannel {
    pub fn new(name: &str) -> Self {
        PubSubChannel {
            shared: Arc::new(Shared {
                rendezvous: Rendezvous::new(name),
                subscribers: RwLock::new(vec![]),
                dispatching: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.rendezvous.is_open()
    }

    fn subscribers(&self) -> Vec<Subscriber> {
        snapshot(&self.shared)
    }

    fn start_dispatch(&self) {
        if self.shared.dispatching.swap(true, Ordering::AcqRel) {
            return;
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let ctx = Context::background();
            loop {
                let msg = match shared.rendezvous.receive(&ctx).await {
                    Ok(msg) => msg,
                    Err(err) => {
                        debug!(
                            channel = shared.rendezvous.name(),
                            error = err.to_string(),
                            "dispatch ended"
                        );
                        break;
                    }
                };

                for callback in snapshot(&shared) {
                    tokio::spawn(callback(msg.clone()));
                }
            }
        });
    }
}

fn snapshot(shared: &Shared) -> Vec<Subscriber> {
    match shared.subscribers.read() {
        Ok(subscribers) => subscribers.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

impl SubscriberChannel for PubSubChannel {
    fn name(&self) -> String {
        self.shared.rendezvous.name().to_owned()
    }

    fn subscribe(&self, callbacks: Vec<Subscriber>) {
        if !self.is_open() {
            warn!(channel = self.shared.rendezvous.name(), "subscribe on closed channel");
            return;
        }

        match self.shared.subscribers.write() {
            Ok(mut subscribers) => subscribers.extend(callbacks),
            Err(poisoned) => poisoned.into_inner().extend(callbacks),
        }

        self.start_dispatch();
    }

    fn unsubscribe(&self) -> Result<(), MessagingError> {
        if self.shared.rendezvous.close() {
            debug!(channel = self.shared.rendezvous.name(), "unsubscribed");
        }
        Ok(())
    }
}

#[async_trait]
impl PublisherChannel for PubSubChannel {
    fn name(&self) -> String {
        self.shared.rendezvous.name().to_owned()
    }

    async fn send(&self, ctx: &Context, msg: Arc<Message>) -> Result<(), MessagingError> {
        self.shared.rendezvous.send(ctx, msg).await
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.unsubscribe()
    }
}

impl std::fmt::Debug for PubSubChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubChannel")
            .field("name", &self.shared.rendezvous.name())
            .field("open", &self.is_open())
            .field("subscribers", &self.subscribers().len())
            .finish()
    }
}
