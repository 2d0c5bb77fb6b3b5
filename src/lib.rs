// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod activator;
pub mod adapter;
pub mod builder;
pub mod bus;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod gateway;
pub mod handler;
pub mod inbound;
pub mod message;
pub mod publisher;
pub mod pubsub;
pub mod registry;
pub mod router;
pub mod translator;
