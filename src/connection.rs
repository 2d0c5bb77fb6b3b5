// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection
//!
//! This module handles the creation and management of the AMQP connection owned
//! by the registry. The connection and its channel are opened in `connect` and
//! shared by the publisher and inbound channels built on top of it.

use crate::{config::AmqpConfigs, errors::MessagingError, registry::ChannelConnection};
use async_trait::async_trait;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{
    any::Any,
    sync::{Arc, Mutex},
};
use tracing::{debug, error};

struct Opened {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
}

/// Registry-owned AMQP connection.
pub struct AmqpConnection {
    reference_name: String,
    configs: AmqpConfigs,
    opened: Mutex<Option<Opened>>,
}

impl AmqpConnection {
    /// Creates a connection that is opened by the registry on start.
    ///
    /// # Parameters
    /// * `reference_name` - Name channel builders look the connection up by
    /// * `configs` - Broker address, credentials and connection name
    pub fn new(reference_name: &str, configs: AmqpConfigs) -> Self {
        AmqpConnection {
            reference_name: reference_name.to_owned(),
            configs,
            opened: Mutex::new(None),
        }
    }

    /// The channel opened on `connect`.
    pub fn channel(&self) -> Result<Arc<Channel>, MessagingError> {
        self.with_opened(|opened| opened.map(|o| o.channel.clone()))
            .ok_or_else(|| MessagingError::ConnectionError(format!("`{}` not connected", self.reference_name)))
    }

    pub fn is_connected(&self) -> bool {
        self.with_opened(|opened| opened.map(|o| o.connection.status().connected()))
            .unwrap_or(false)
    }

    fn with_opened<T>(&self, f: impl FnOnce(Option<&Opened>) -> Option<T>) -> Option<T> {
        match self.opened.lock() {
            Ok(guard) => f(guard.as_ref()),
            Err(poisoned) => f(poisoned.into_inner().as_ref()),
        }
    }

    fn take_opened(&self) -> Option<Opened> {
        match self.opened.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn set_opened(&self, opened: Opened) {
        match self.opened.lock() {
            Ok(mut guard) => *guard = Some(opened),
            Err(poisoned) => *poisoned.into_inner() = Some(opened),
        }
    }
}

#[async_trait]
impl ChannelConnection for AmqpConnection {
    fn reference_name(&self) -> String {
        self.reference_name.clone()
    }

    async fn connect(&self) -> Result<(), MessagingError> {
        if self.is_connected() {
            return Ok(());
        }

        debug!(connection = self.reference_name, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.configs.app_name.clone()));

        let connection = match Connection::connect(&self.configs.uri(), options).await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(MessagingError::ConnectionError(err.to_string()));
            }
        };
        debug!("amqp connected");

        let channel = match connection.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                return Err(MessagingError::ConnectionError(err.to_string()));
            }
        };
        debug!("channel created");

        self.set_opened(Opened {
            connection: Arc::new(connection),
            channel: Arc::new(channel),
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MessagingError> {
        let Some(opened) = self.take_opened() else {
            return Ok(());
        };

        if let Err(err) = opened.channel.close(200, "shutdown").await {
            debug!(error = err.to_string(), "channel already closed");
        }

        match opened.connection.close(200, "shutdown").await {
            Ok(()) => {
                debug!(connection = self.reference_name, "amqp disconnected");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to disconnect");
                Err(MessagingError::ConnectionError(err.to_string()))
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Resolves the AMQP channel of the connection registered as `reference_name`.
pub(crate) fn amqp_channel(
    connections: &crate::registry::ConnectionRegistry,
    reference_name: &str,
) -> Result<Arc<Channel>, MessagingError> {
    let connection = connections.get(reference_name)?;
    let Some(amqp) = connection.as_any().downcast_ref::<AmqpConnection>() else {
        return Err(MessagingError::Configuration(format!(
            "connection `{}` is not an amqp connection",
            reference_name
        )));
    };

    amqp.channel()
}
