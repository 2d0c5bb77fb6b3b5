// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! This module provides integration with OpenTelemetry for distributed tracing.
//! Trace context travels in the wire headers of a message: the publisher injects
//! the current context, the inbound channel extracts it and opens a consumer span
//! for every delivery.

use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::HashMap};

/// Injects trace context into outgoing wire headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut HashMap<String, String>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut HashMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

/// Reads trace context from incoming wire headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a HashMap<String, String>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a HashMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the trace context of `ctx` into `headers` with the global propagator.
pub fn inject_context(ctx: &Context, headers: &mut HashMap<String, String>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(headers))
    });
}

/// Creates a consumer span for an incoming message.
///
/// # Parameters
/// * `headers` - Wire headers of the delivery
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Name for the new span (typically the message route)
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub fn new_span(
    headers: &HashMap<String, String>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
