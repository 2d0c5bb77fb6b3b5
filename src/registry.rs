// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message System Registry
//!
//! This module provides the composition root of the engine. A [`MessageSystem`]
//! collects connections, outbound channel builders, inbound adapter builders and
//! action handlers, builds them in `start`, and hands out buses and consumers
//! afterwards.
//!
//! Startup order:
//!
//! 1. connect every registered [`ChannelConnection`]
//! 2. build outbound channels
//! 3. build inbound adapters
//! 4. register the default command and query buses
//!
//! Registrations are only accepted before `start`; lookups are only answered
//! after it.

use crate::{
    activator::{Action, ActionHandler, ActionHandlerActivator},
    bus::{CommandBus, EventBus, QueryBus},
    channel::PointToPointChannel,
    consumer::{EventDrivenConsumer, EventDrivenConsumerBuilder},
    dispatcher::{Dispatcher, MessageDispatcherBuilder},
    errors::MessagingError,
    message::{InboundChannelAdapter, PublisherChannel},
    pubsub::PubSubChannel,
};
use async_trait::async_trait;
use std::{
    any::Any,
    collections::HashMap,
    fmt::{self, Write},
    sync::{Arc, RwLock},
};
use tracing::{debug, error, info};

/// Name of the command bus that routes by the message route.
pub const DEFAULT_COMMAND_CHANNEL: &str = "default.channel.command";

/// Name of the query bus that routes by the message route.
pub const DEFAULT_QUERY_CHANNEL: &str = "default.channel.query";

/// A transport connection owned by the registry.
#[async_trait]
pub trait ChannelConnection: Send + Sync {
    fn reference_name(&self) -> String;

    async fn connect(&self) -> Result<(), MessagingError>;

    async fn disconnect(&self) -> Result<(), MessagingError>;

    /// Access to the concrete connection for the builders of its transport.
    fn as_any(&self) -> &dyn Any;
}

/// Builds an outbound channel, registered under its reference name.
#[async_trait]
pub trait PublisherChannelBuilder: Send + Sync {
    fn reference_name(&self) -> String;

    async fn build(
        &self,
        connections: &ConnectionRegistry,
    ) -> Result<Arc<dyn PublisherChannel>, MessagingError>;
}

/// Builds an inbound adapter, registered under its reference name.
#[async_trait]
pub trait InboundChannelBuilder: Send + Sync {
    fn reference_name(&self) -> String;

    async fn build(
        &self,
        connections: &ConnectionRegistry,
    ) -> Result<Arc<dyn InboundChannelAdapter>, MessagingError>;
}

#[async_trait]
impl PublisherChannelBuilder for PointToPointChannel {
    fn reference_name(&self) -> String {
        PublisherChannel::name(self)
    }

    async fn build(
        &self,
        _connections: &ConnectionRegistry,
    ) -> Result<Arc<dyn PublisherChannel>, MessagingError> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl PublisherChannelBuilder for PubSubChannel {
    fn reference_name(&self) -> String {
        PublisherChannel::name(self)
    }

    async fn build(
        &self,
        _connections: &ConnectionRegistry,
    ) -> Result<Arc<dyn PublisherChannel>, MessagingError> {
        Ok(Arc::new(self.clone()))
    }
}

/// Connections keyed by reference name.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, Arc<dyn ChannelConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    pub fn register(&mut self, connection: Arc<dyn ChannelConnection>) -> Result<(), MessagingError> {
        let name = connection.reference_name();
        if self.connections.contains_key(&name) {
            return Err(MessagingError::DuplicateRegistration(name));
        }
        self.connections.insert(name, connection);
        Ok(())
    }

    pub fn get(&self, reference_name: &str) -> Result<Arc<dyn ChannelConnection>, MessagingError> {
        self.connections
            .get(reference_name)
            .cloned()
            .ok_or_else(|| MessagingError::ConnectionNotFound(reference_name.to_owned()))
    }

    fn all(&self) -> impl Iterator<Item = &Arc<dyn ChannelConnection>> {
        self.connections.values()
    }
}

/// Outbound channels keyed by reference name.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn PublisherChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry::default()
    }

    /// Registers `channel` under `name`.
    ///
    /// # Returns
    /// `DuplicateRegistration` when the name is already taken
    pub fn register(
        &mut self,
        name: &str,
        channel: Arc<dyn PublisherChannel>,
    ) -> Result<(), MessagingError> {
        if self.channels.contains_key(name) {
            return Err(MessagingError::DuplicateRegistration(name.to_owned()));
        }
        self.channels.insert(name.to_owned(), channel);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PublisherChannel>> {
        self.channels.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn all(&self) -> impl Iterator<Item = (&String, &Arc<dyn PublisherChannel>)> {
        self.channels.iter()
    }
}

#[derive(Clone)]
enum Endpoint {
    CommandBus(CommandBus),
    QueryBus(QueryBus),
    EventBus(EventBus),
    Consumer(Arc<EventDrivenConsumer>),
}

impl Endpoint {
    fn label(&self) -> &'static str {
        match self {
            Endpoint::CommandBus(_) => "[outbound] Command-Bus",
            Endpoint::QueryBus(_) => "[outbound] Query-Bus",
            Endpoint::EventBus(_) => "[outbound] Event-Bus",
            Endpoint::Consumer(_) => "[inbound] Event-Driven",
        }
    }
}

/// Composition root holding every channel, connection and endpoint.
#[derive(Default)]
pub struct MessageSystem {
    connections: ConnectionRegistry,
    publisher_builders: Vec<Box<dyn PublisherChannelBuilder>>,
    inbound_builders: Vec<Box<dyn InboundChannelBuilder>>,
    channels: ChannelRegistry,
    shared_channels: Option<Arc<ChannelRegistry>>,
    inbound_adapters: HashMap<String, Arc<dyn InboundChannelAdapter>>,
    endpoints: RwLock<HashMap<String, Endpoint>>,
    shut_down: bool,
}

impl MessageSystem {
    pub fn new() -> Self {
        MessageSystem::default()
    }

    fn ensure_not_started(&self) -> Result<(), MessagingError> {
        if self.shared_channels.is_some() {
            return Err(MessagingError::Configuration(
                "message system already started".to_owned(),
            ));
        }
        Ok(())
    }

    fn started_channels(&self) -> Result<Arc<ChannelRegistry>, MessagingError> {
        self.shared_channels.clone().ok_or_else(|| {
            MessagingError::Configuration("message system not started".to_owned())
        })
    }

    pub fn add_channel_connection(
        &mut self,
        connection: Arc<dyn ChannelConnection>,
    ) -> Result<(), MessagingError> {
        self.ensure_not_started()?;
        self.connections.register(connection)
    }

    pub fn add_publisher_channel<B>(&mut self, builder: B) -> Result<(), MessagingError>
    where
        B: PublisherChannelBuilder + 'static,
    {
        self.ensure_not_started()?;
        let name = builder.reference_name();
        if self
            .publisher_builders
            .iter()
            .any(|b| b.reference_name() == name)
        {
            return Err(MessagingError::DuplicateRegistration(name));
        }
        self.publisher_builders.push(Box::new(builder));
        Ok(())
    }

    pub fn add_consumer_channel<B>(&mut self, builder: B) -> Result<(), MessagingError>
    where
        B: InboundChannelBuilder + 'static,
    {
        self.ensure_not_started()?;
        let name = builder.reference_name();
        if self
            .inbound_builders
            .iter()
            .any(|b| b.reference_name() == name)
        {
            return Err(MessagingError::DuplicateRegistration(name));
        }
        self.inbound_builders.push(Box::new(builder));
        Ok(())
    }

    /// Registers `handler` on a point-to-point channel named after the action.
    ///
    /// # Returns
    /// `DuplicateRegistration` when a channel with that name already exists
    pub fn add_action_handler<A, H>(&mut self, handler: Arc<H>) -> Result<(), MessagingError>
    where
        A: Action,
        H: ActionHandler<A> + 'static,
    {
        self.ensure_not_started()?;
        let activator = ActionHandlerActivator::<A, H>::new(handler);
        let channel = PointToPointChannel::with_handler(A::NAME, Arc::new(activator));

        if let Err(err) = self.channels.register(A::NAME, Arc::new(channel.clone())) {
            channel.close_channel();
            return Err(err);
        }

        debug!(action = A::NAME, "action handler registered");
        Ok(())
    }

    /// Connects, builds every registered component and the default buses.
    pub async fn start(&mut self) -> Result<(), MessagingError> {
        self.ensure_not_started()?;

        for connection in self.connections.all() {
            connection.connect().await?;
            info!(connection = connection.reference_name(), "connection established");
        }

        for builder in &self.publisher_builders {
            let channel = builder.build(&self.connections).await?;
            self.channels.register(&builder.reference_name(), channel)?;
        }

        for builder in &self.inbound_builders {
            let name = builder.reference_name();
            if self.inbound_adapters.contains_key(&name) {
                return Err(MessagingError::DuplicateRegistration(name));
            }
            let adapter = builder.build(&self.connections).await?;
            self.inbound_adapters.insert(name, adapter);
        }

        let channels = Arc::new(self.channels.clone());
        self.shared_channels = Some(channels.clone());

        let command = MessageDispatcherBuilder::new(DEFAULT_COMMAND_CHANNEL, "").build(channels.clone())?;
        let query = MessageDispatcherBuilder::new(DEFAULT_QUERY_CHANNEL, "").build(channels)?;

        let mut endpoints = self.endpoints_mut();
        endpoints.insert(
            DEFAULT_COMMAND_CHANNEL.to_owned(),
            Endpoint::CommandBus(CommandBus::new(Arc::new(command))),
        );
        endpoints.insert(
            DEFAULT_QUERY_CHANNEL.to_owned(),
            Endpoint::QueryBus(QueryBus::new(Arc::new(query))),
        );
        drop(endpoints);

        info!("message system started");
        Ok(())
    }

    fn endpoints(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Endpoint>> {
        match self.endpoints.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn endpoints_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Endpoint>> {
        match self.endpoints.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the endpoint registered as `name`, creating it with `create`
    /// when absent. `extract` rejects endpoints of another kind.
    fn bus_endpoint<T>(
        &self,
        name: &str,
        create: impl FnOnce(Arc<dyn Dispatcher>) -> Endpoint,
        extract: impl Fn(&Endpoint) -> Option<T>,
    ) -> Result<T, MessagingError> {
        let channels = self.started_channels()?;

        let mut endpoints = self.endpoints_mut();
        if let Some(endpoint) = endpoints.get(name) {
            return extract(endpoint).ok_or_else(|| {
                MessagingError::Configuration(format!(
                    "endpoint `{}` is registered as {}",
                    name,
                    endpoint.label()
                ))
            });
        }

        let dispatcher = MessageDispatcherBuilder::new(name, name).build(channels)?;
        let endpoint = create(Arc::new(dispatcher));
        let bus = extract(&endpoint).ok_or(MessagingError::InternalError)?;
        endpoints.insert(name.to_owned(), endpoint);

        Ok(bus)
    }

    /// Command bus routing by the message route.
    pub fn command_bus(&self) -> Result<CommandBus, MessagingError> {
        self.command_bus_by_channel(DEFAULT_COMMAND_CHANNEL)
    }

    /// Query bus routing by the message route.
    pub fn query_bus(&self) -> Result<QueryBus, MessagingError> {
        self.query_bus_by_channel(DEFAULT_QUERY_CHANNEL)
    }

    /// Command bus addressing every message to `channel_name`.
    pub fn command_bus_by_channel(&self, channel_name: &str) -> Result<CommandBus, MessagingError> {
        self.bus_endpoint(
            channel_name,
            |dispatcher| Endpoint::CommandBus(CommandBus::new(dispatcher)),
            |endpoint| match endpoint {
                Endpoint::CommandBus(bus) => Some(bus.clone()),
                _ => None,
            },
        )
    }

    /// Query bus addressing every message to `channel_name`.
    pub fn query_bus_by_channel(&self, channel_name: &str) -> Result<QueryBus, MessagingError> {
        self.bus_endpoint(
            channel_name,
            |dispatcher| Endpoint::QueryBus(QueryBus::new(dispatcher)),
            |endpoint| match endpoint {
                Endpoint::QueryBus(bus) => Some(bus.clone()),
                _ => None,
            },
        )
    }

    /// Event bus publishing every message to `channel_name`.
    pub fn event_bus_by_channel(&self, channel_name: &str) -> Result<EventBus, MessagingError> {
        self.bus_endpoint(
            channel_name,
            |dispatcher| Endpoint::EventBus(EventBus::new(dispatcher)),
            |endpoint| match endpoint {
                Endpoint::EventBus(bus) => Some(bus.clone()),
                _ => None,
            },
        )
    }

    /// Consumer with default settings for the inbound adapter `name`.
    pub fn event_driven_consumer(&self, name: &str) -> Result<Arc<EventDrivenConsumer>, MessagingError> {
        self.event_driven_consumer_with(&EventDrivenConsumerBuilder::new(name))
    }

    /// Builds the consumer described by `builder` for the inbound adapter of the
    /// same reference name.
    ///
    /// # Returns
    /// `DuplicateRegistration` when a consumer already exists for that name,
    /// `ChannelNotFound` when no inbound adapter is registered under it
    pub fn event_driven_consumer_with(
        &self,
        builder: &EventDrivenConsumerBuilder,
    ) -> Result<Arc<EventDrivenConsumer>, MessagingError> {
        let channels = self.started_channels()?;
        let name = builder.reference_name();

        let mut endpoints = self.endpoints_mut();
        if endpoints.contains_key(name) {
            return Err(MessagingError::DuplicateRegistration(name.to_owned()));
        }

        let Some(adapter) = self.inbound_adapters.get(name) else {
            return Err(MessagingError::ChannelNotFound(name.to_owned()));
        };

        let consumer = Arc::new(builder.build(adapter.clone(), channels)?);
        endpoints.insert(name.to_owned(), Endpoint::Consumer(consumer.clone()));

        Ok(consumer)
    }

    /// Stops every consumer, closes every channel and adapter, then disconnects.
    /// Failures are logged; calling it again does nothing.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("message system shutting down");

        let consumers: Vec<_> = self
            .endpoints()
            .iter()
            .filter_map(|(name, endpoint)| match endpoint {
                Endpoint::Consumer(consumer) => Some((name.clone(), consumer.clone())),
                _ => None,
            })
            .collect();
        for (name, consumer) in consumers {
            info!(consumer = name, "stopping consumer");
            consumer.stop();
        }

        for (name, adapter) in &self.inbound_adapters {
            if let Err(err) = adapter.close().await {
                error!(adapter = name, error = err.to_string(), "failure to close inbound adapter");
            }
        }

        for (name, channel) in self.channels.all() {
            if let Err(err) = channel.close().await {
                error!(channel = name, error = err.to_string(), "failure to close channel");
            }
        }

        for connection in self.connections.all() {
            if let Err(err) = connection.disconnect().await {
                error!(
                    connection = connection.reference_name(),
                    error = err.to_string(),
                    "failure to disconnect"
                );
            }
        }

        info!("message system shutdown completed");
    }

    /// Renders the table of active endpoints and logs it.
    pub fn show_active_endpoints(&self) -> String {
        let table = self.to_string();
        info!("{}", table);
        table
    }
}

impl fmt::Display for MessageSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoints = self.endpoints();
        let mut names: Vec<_> = endpoints.keys().collect();
        names.sort();

        let mut table = String::new();
        writeln!(table, "---[Message System] Active Endpoints ---")?;
        writeln!(table, "{:<30} | {:<10}", "Endpoint Name", "Type")?;
        writeln!(table, "-------------------------------------------")?;
        for name in names {
            writeln!(table, "{:<30} | {:<10}", name, endpoints[name].label())?;
        }
        write!(table, "-------------------------------------------")?;

        f.write_str(&table)
    }
}
