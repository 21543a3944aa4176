// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in the AMQP message headers. Publishing injects the
//! current context through the globally registered text map propagator, and a
//! received [`Delivery`] can hand back the remote parent context.

use crate::transport::Delivery;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Writes trace context entries into AMQP headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads trace context entries out of AMQP headers.
pub(crate) struct RabbitMQTraceExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTraceExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Extractor for RabbitMQTraceExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Returns `properties` with `ctx` injected into its headers, keeping any
/// headers already present.
pub(crate) fn inject_context(ctx: &Context, properties: BasicProperties) -> BasicProperties {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut headers))
    });

    properties.with_headers(FieldTable::from(headers))
}

pub(crate) fn extract_context(properties: &BasicProperties) -> Context {
    let empty = BTreeMap::new();
    let headers = properties
        .headers()
        .as_ref()
        .map(|table| table.inner())
        .unwrap_or(&empty);

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTraceExtractor::new(headers))
    })
}

/// Starts a consumer span for `delivery`, parented to the context it carries.
pub fn new_span(delivery: &Delivery, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = delivery.trace_context();

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
