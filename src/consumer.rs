// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event-Driven Consumer
//!
//! This module provides the worker pool that drains an inbound channel adapter.
//! A producer loop receives messages from the adapter and enqueues them on a
//! bounded processing queue whose capacity equals the number of workers; each
//! worker dequeues and drives the message through the consumer's gateway under a
//! per-message timeout.
//!
//! With a single worker, messages are processed in receive order. With more
//! workers, no ordering is guaranteed across concurrently processed messages.
//!
//! The consumer stops when its context is cancelled, when [`EventDrivenConsumer::stop`]
//! is called, or on the first processing failure when `stop_on_error` is set.

use crate::{
    context::Context,
    errors::MessagingError,
    gateway::{Gateway, GatewayBuilder},
    message::{InboundChannelAdapter, Message},
    registry::ChannelRegistry,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info};

/// Default per-message processing timeout
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_millis(100_000);
/// Default number of concurrent workers
pub const DEFAULT_AMOUNT_OF_PROCESSORS: usize = 1;

/// Lifecycle of an [`EventDrivenConsumer`]. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// Configuration of an [`EventDrivenConsumer`] for one inbound channel adapter.
#[derive(Debug, Clone)]
pub struct EventDrivenConsumerBuilder {
    reference_name: String,
    amount_of_processors: usize,
    processing_timeout: Duration,
    stop_on_error: bool,
}

impl EventDrivenConsumerBuilder {
    /// Creates a builder for the adapter registered as `reference_name`.
    pub fn new(reference_name: &str) -> Self {
        EventDrivenConsumerBuilder {
            reference_name: reference_name.to_owned(),
            amount_of_processors: DEFAULT_AMOUNT_OF_PROCESSORS,
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            stop_on_error: true,
        }
    }

    pub fn reference_name(&self) -> &str {
        &self.reference_name
    }

    /// Sets the worker count. Values below 2 keep the single worker.
    pub fn with_amount_of_processors(mut self, value: usize) -> Self {
        if value > 1 {
            self.amount_of_processors = value;
        }
        self
    }

    /// Sets the per-message timeout in milliseconds. Zero keeps the default.
    pub fn with_message_processing_timeout(mut self, milliseconds: u64) -> Self {
        if milliseconds > 0 {
            self.processing_timeout = Duration::from_millis(milliseconds);
        }
        self
    }

    pub fn with_stop_on_error(mut self, value: bool) -> Self {
        self.stop_on_error = value;
        self
    }

    /// Builds the consumer and its gateway from the adapter's configuration.
    ///
    /// # Parameters
    /// * `adapter` - Inbound adapter the consumer drains
    /// * `channels` - Registered channels the gateway routes to
    ///
    /// # Returns
    /// The consumer, or an error when the gateway cannot be built
    pub fn build(
        &self,
        adapter: Arc<dyn InboundChannelAdapter>,
        channels: Arc<ChannelRegistry>,
    ) -> Result<EventDrivenConsumer, MessagingError> {
        let mut gateway = GatewayBuilder::new(&adapter.reference_name(), "")
            .with_before_interceptors(adapter.before_processors())
            .with_after_interceptors(adapter.after_processors())
            .with_retry(adapter.retry_attempts());

        if let Some(dead_letter) = adapter.dead_letter_channel_name() {
            gateway = gateway.with_dead_letter_channel(&dead_letter);
        }

        if let Some(acknowledgment) = adapter.acknowledgment() {
            gateway = gateway.with_acknowledgment(acknowledgment);
        }

        Ok(EventDrivenConsumer {
            reference_name: self.reference_name.clone(),
            gateway: Arc::new(gateway.build(channels)?),
            adapter,
            amount_of_processors: self.amount_of_processors,
            processing_timeout: self.processing_timeout,
            stop_on_error: self.stop_on_error,
            state: Mutex::new(ConsumerState::Created),
            run_ctx: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            workers: Mutex::new(None),
            failure: Arc::new(Mutex::new(None)),
        })
    }
}

struct Workers {
    queue: mpsc::Sender<Arc<Message>>,
    handles: Vec<JoinHandle<()>>,
}

/// Worker-pool consumer driving inbound messages through a gateway.
pub struct EventDrivenConsumer {
    reference_name: String,
    gateway: Arc<Gateway>,
    adapter: Arc<dyn InboundChannelAdapter>,
    amount_of_processors: usize,
    processing_timeout: Duration,
    stop_on_error: bool,
    state: Mutex<ConsumerState>,
    run_ctx: Mutex<Option<Context>>,
    stop_requested: AtomicBool,
    running: AtomicBool,
    workers: Mutex<Option<Workers>>,
    failure: Arc<Mutex<Option<MessagingError>>>,
}

impl EventDrivenConsumer {
    pub fn reference_name(&self) -> &str {
        &self.reference_name
    }

    pub fn amount_of_processors(&self) -> usize {
        self.amount_of_processors
    }

    pub fn processing_timeout(&self) -> Duration {
        self.processing_timeout
    }

    pub fn stop_on_error(&self) -> bool {
        self.stop_on_error
    }

    pub fn state(&self) -> ConsumerState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConsumerState) {
        *lock(&self.state) = state;
    }

    /// Receives and processes messages until the consumer is stopped.
    ///
    /// Returns `Ok` after [`stop`](Self::stop) or cancellation of `ctx`, and the
    /// first processing error when `stop_on_error` stopped the consumer. Running a
    /// stopped consumer returns `Ok` immediately.
    pub async fn run(&self, ctx: &Context) -> Result<(), MessagingError> {
        {
            let mut state = lock(&self.state);
            match *state {
                ConsumerState::Created => *state = ConsumerState::Running,
                ConsumerState::Stopped => return Ok(()),
                _ => {
                    return Err(MessagingError::Configuration(format!(
                        "consumer `{}` already running",
                        self.reference_name
                    )))
                }
            }
        }

        info!(consumer = self.reference_name, "event-driven consumer started");

        let run_ctx = ctx.with_cancel();
        *lock(&self.run_ctx) = Some(run_ctx.clone());
        if self.stop_requested.load(Ordering::Acquire) {
            run_ctx.cancel();
        }

        let queue = self.start_workers(&run_ctx);
        self.running.store(true, Ordering::Release);

        self.receive_loop(&run_ctx, queue).await;

        run_ctx.cancel();
        self.shutdown().await;

        match lock(&self.failure).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Requests the consumer to stop. The running `run` call returns once the
    /// workers have drained.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);

        {
            let mut state = lock(&self.state);
            if *state == ConsumerState::Created {
                *state = ConsumerState::Stopped;
            }
        }

        if let Some(run_ctx) = lock(&self.run_ctx).as_ref() {
            run_ctx.cancel();
        }
    }

    fn start_workers(&self, run_ctx: &Context) -> mpsc::Sender<Arc<Message>> {
        let (sender, receiver) = mpsc::channel(self.amount_of_processors);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..self.amount_of_processors)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    consumer: self.reference_name.clone(),
                    gateway: self.gateway.clone(),
                    run_ctx: run_ctx.clone(),
                    processing_timeout: self.processing_timeout,
                    stop_on_error: self.stop_on_error,
                    failure: self.failure.clone(),
                };
                let receiver = receiver.clone();

                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        match next {
                            Some(msg) => worker.process(msg).await,
                            None => break,
                        }
                    }
                    debug!(consumer = worker.consumer, worker = worker.id, "worker finished");
                })
            })
            .collect();

        *lock(&self.workers) = Some(Workers {
            queue: sender.clone(),
            handles,
        });

        sender
    }

    async fn receive_loop(&self, run_ctx: &Context, queue: mpsc::Sender<Arc<Message>>) {
        loop {
            if run_ctx.is_done() {
                return;
            }

            let msg = match self.adapter.receive_message(run_ctx).await {
                Ok(msg) => msg,
                // stopped while waiting; a close racing the stop is not a failure
                Err(_) if run_ctx.is_done() => return,
                Err(err) => {
                    error!(
                        consumer = self.reference_name,
                        error = err.to_string(),
                        "message receive error"
                    );
                    if self.stop_on_error || matches!(err, MessagingError::ChannelClosed(_)) {
                        record_failure(&self.failure, err);
                        return;
                    }
                    continue;
                }
            };

            if run_ctx.is_done() {
                return;
            }

            tokio::select! {
                biased;
                _ = run_ctx.done() => return,
                sent = queue.send(msg) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Closes the adapter and the processing queue, then waits for the workers.
    /// Only the first call does anything.
    async fn shutdown(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.set_state(ConsumerState::ShuttingDown);
        info!(consumer = self.reference_name, "shutting down");

        if let Err(err) = self.adapter.close().await {
            error!(
                consumer = self.reference_name,
                error = err.to_string(),
                "failure to close inbound adapter"
            );
        }

        let workers = lock(&self.workers).take();
        if let Some(Workers { queue, handles }) = workers {
            drop(queue);
            for handle in handles {
                if let Err(err) = handle.await {
                    error!(consumer = self.reference_name, error = err.to_string(), "worker failed");
                }
            }
        }

        self.set_state(ConsumerState::Stopped);
        info!(consumer = self.reference_name, "event-driven consumer stopped");
    }
}

struct Worker {
    id: usize,
    consumer: String,
    gateway: Arc<Gateway>,
    run_ctx: Context,
    processing_timeout: Duration,
    stop_on_error: bool,
    failure: Arc<Mutex<Option<MessagingError>>>,
}

impl Worker {
    async fn process(&self, msg: Arc<Message>) {
        if self.run_ctx.is_done() {
            return;
        }

        let ctx = self.run_ctx.with_timeout(self.processing_timeout);
        let message_id = msg.headers().message_id.clone();

        info!(
            consumer = self.consumer,
            worker = self.id,
            message_id,
            "message processing started"
        );

        if let Err(err) = self.gateway.execute(&ctx, msg).await {
            error!(
                consumer = self.consumer,
                worker = self.id,
                message_id,
                error = err.to_string(),
                "processing message error"
            );

            if self.stop_on_error {
                record_failure(&self.failure, err);
                self.run_ctx.cancel();
            }
            return;
        }

        info!(
            consumer = self.consumer,
            worker = self.id,
            message_id,
            "message processing completed"
        );
    }
}

fn record_failure(failure: &Mutex<Option<MessagingError>>, err: MessagingError) {
    let mut failure = lock(failure);
    if failure.is_none() {
        *failure = Some(err);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::MessageBuilder,
        message::{MessageHandler, MessageType, Payload, PublisherChannel},
    };
    use async_trait::async_trait;
    use std::{
        collections::{HashSet, VecDeque},
        sync::atomic::AtomicUsize,
    };

    /// Adapter replaying a fixed list of messages, then blocking until cancelled
    /// or failing with `exhausted` when set.
    struct FakeAdapter {
        messages: Mutex<VecDeque<Arc<Message>>>,
        closes: AtomicUsize,
        exhausted: Option<MessagingError>,
    }

    impl FakeAdapter {
        fn new(count: usize) -> Arc<Self> {
            let messages = (0..count)
                .map(|i| {
                    Arc::new(
                        MessageBuilder::new()
                            .with_message_type(MessageType::Event)
                            .with_route("orders.created")
                            .with_message_id(format!("msg-{i}"))
                            .with_payload(Payload::typed(i))
                            .build(),
                    )
                })
                .collect();

            Arc::new(FakeAdapter {
                messages: Mutex::new(messages),
                closes: AtomicUsize::new(0),
                exhausted: None,
            })
        }
    }

    #[async_trait]
    impl InboundChannelAdapter for FakeAdapter {
        fn reference_name(&self) -> String {
            "orders.consumer".to_owned()
        }

        fn dead_letter_channel_name(&self) -> Option<String> {
            None
        }

        fn before_processors(&self) -> Vec<Arc<dyn MessageHandler>> {
            vec![]
        }

        fn after_processors(&self) -> Vec<Arc<dyn MessageHandler>> {
            vec![]
        }

        async fn receive_message(&self, ctx: &Context) -> Result<Arc<Message>, MessagingError> {
            let next = lock(&self.messages).pop_front();
            match (next, &self.exhausted) {
                (Some(msg), _) => Ok(msg),
                (None, Some(err)) => Err(err.clone()),
                (None, None) => Err(ctx.done().await),
            }
        }

        async fn close(&self) -> Result<(), MessagingError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Channel recording every message id it receives.
    struct RecordingChannel {
        received: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl PublisherChannel for RecordingChannel {
        fn name(&self) -> String {
            "orders.created".to_owned()
        }

        async fn send(&self, _ctx: &Context, msg: Arc<Message>) -> Result<(), MessagingError> {
            lock(&self.received).push(msg.headers().message_id.clone());
            if self.fail {
                return Err(MessagingError::Handler("cannot store order".to_owned()));
            }
            Ok(())
        }
    }

    fn setup(
        builder: EventDrivenConsumerBuilder,
        messages: usize,
        fail: bool,
    ) -> (Arc<EventDrivenConsumer>, Arc<FakeAdapter>, Arc<RecordingChannel>) {
        let adapter = FakeAdapter::new(messages);
        let channel = Arc::new(RecordingChannel {
            received: Mutex::new(vec![]),
            fail,
        });
        let mut registry = ChannelRegistry::new();
        registry.register("orders.created", channel.clone()).unwrap();

        let consumer = builder.build(adapter.clone(), Arc::new(registry)).unwrap();
        (Arc::new(consumer), adapter, channel)
    }

    async fn wait_for(count: usize, channel: &RecordingChannel) {
        for _ in 0..200 {
            if lock(&channel.received).len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn builder_ignores_out_of_range_values() {
        let builder = EventDrivenConsumerBuilder::new("orders")
            .with_amount_of_processors(0)
            .with_message_processing_timeout(0);

        assert_eq!(builder.amount_of_processors, DEFAULT_AMOUNT_OF_PROCESSORS);
        assert_eq!(builder.processing_timeout, DEFAULT_PROCESSING_TIMEOUT);
        assert!(builder.stop_on_error);

        let builder = builder
            .with_amount_of_processors(4)
            .with_message_processing_timeout(250)
            .with_stop_on_error(false);

        assert_eq!(builder.amount_of_processors, 4);
        assert_eq!(builder.processing_timeout, Duration::from_millis(250));
        assert!(!builder.stop_on_error);
    }

    #[tokio::test]
    async fn every_message_reaches_the_gateway_once() {
        let (consumer, adapter, channel) = setup(
            EventDrivenConsumerBuilder::new("orders.consumer")
                .with_amount_of_processors(3)
                .with_stop_on_error(false),
            10,
            false,
        );

        let running = consumer.clone();
        let handle = tokio::spawn(async move { running.run(&Context::background()).await });

        wait_for(10, &channel).await;
        assert_eq!(consumer.state(), ConsumerState::Running);

        consumer.stop();
        handle.await.unwrap().unwrap();

        let received = lock(&channel.received).clone();
        assert_eq!(received.len(), 10);
        assert_eq!(received.iter().collect::<HashSet<_>>().len(), 10);
        assert_eq!(adapter.closes.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn single_worker_keeps_receive_order() {
        let (consumer, _, channel) = setup(
            EventDrivenConsumerBuilder::new("orders.consumer").with_stop_on_error(false),
            5,
            false,
        );

        let running = consumer.clone();
        let handle = tokio::spawn(async move { running.run(&Context::background()).await });

        wait_for(5, &channel).await;
        consumer.stop();
        handle.await.unwrap().unwrap();

        let expected: Vec<String> = (0..5).map(|i| format!("msg-{i}")).collect();
        assert_eq!(*lock(&channel.received), expected);
    }

    #[tokio::test]
    async fn first_failure_stops_the_consumer() {
        let (consumer, adapter, _) = setup(
            EventDrivenConsumerBuilder::new("orders.consumer").with_amount_of_processors(2),
            10,
            true,
        );

        let result = consumer.run(&Context::background()).await;

        assert_eq!(
            result.unwrap_err(),
            MessagingError::Handler("cannot store order".to_owned())
        );

        tokio::join!(consumer.shutdown(), consumer.shutdown());
        assert_eq!(adapter.closes.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn failures_are_skipped_without_stop_on_error() {
        let (consumer, _, channel) = setup(
            EventDrivenConsumerBuilder::new("orders.consumer").with_stop_on_error(false),
            4,
            true,
        );

        let running = consumer.clone();
        let handle = tokio::spawn(async move { running.run(&Context::background()).await });

        wait_for(4, &channel).await;
        assert_eq!(consumer.state(), ConsumerState::Running);

        consumer.stop();
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(lock(&channel.received).len(), 4);
    }

    #[tokio::test]
    async fn cancelling_the_context_stops_the_consumer() {
        let (consumer, adapter, _) = setup(EventDrivenConsumerBuilder::new("orders.consumer"), 0, false);
        let ctx = Context::background().with_timeout(Duration::from_millis(30));

        consumer.run(&ctx).await.unwrap();

        assert_eq!(adapter.closes.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn adapter_timeout_is_a_receive_failure() {
        let adapter = Arc::new(FakeAdapter {
            messages: Mutex::new(VecDeque::new()),
            closes: AtomicUsize::new(0),
            exhausted: Some(MessagingError::DeadlineExceeded),
        });
        let consumer = EventDrivenConsumerBuilder::new("orders.consumer")
            .build(adapter.clone(), Arc::new(ChannelRegistry::new()))
            .unwrap();
        let ctx = Context::background().with_timeout(Duration::from_secs(5));

        let result = consumer.run(&ctx).await;

        assert_eq!(result.unwrap_err(), MessagingError::DeadlineExceeded);
        assert!(!ctx.is_done());
        assert_eq!(adapter.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stopped_consumer_does_not_run_again() {
        let (consumer, adapter, _) = setup(EventDrivenConsumerBuilder::new("orders.consumer"), 3, false);

        consumer.stop();
        consumer.run(&Context::background()).await.unwrap();

        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(adapter.closes.load(Ordering::SeqCst), 0);
    }
}
