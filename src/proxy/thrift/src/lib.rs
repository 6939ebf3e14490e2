// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The per-connection core of a Thrift-aware proxy: accepts bytes from a
//! downstream client, drives the streaming Thrift decoder, routes each
//! message's events through a filter, forwards requests upstream through the
//! filter's connection pool, and streams re-encoded replies back with the
//! client's original sequence ids.
//!
//! Everything here runs on one event-loop worker per connection. The outer
//! runtime owns the sockets and delivers `on_data`, `on_event`,
//! `continue_decoding`, and `upstream_data` in program order; this crate owns
//! the decode state, the set of in-flight RPCs, and their lifecycles.

#[macro_use]
extern crate log;

mod config;
mod conn_manager;
mod filter;
mod router;
mod runtime;
mod stats;

pub use config::ProxyConfig;
pub use conn_manager::{ConnectionManager, ConnectionManagerBuilder};
pub use filter::{DecoderFilter, DecoderFilterCallbacks, FilterChainFactory, UpstreamResponse};
pub use router::{Route, Router};
pub use runtime::{CloseType, Connection, ConnectionEvent, DefaultRandomGenerator, RandomGenerator};
pub use stats::ConnectionManagerStats;

pub use protocol_thrift::{
    new_protocol, new_transport, AppException, AppExceptionKind, DecoderEvent,
    DecoderEventHandler, DirectResponse, Error, FieldType, FilterStatus, MessageMetadata,
    MessageType, Protocol, ProtocolType, Transport, TransportType, DEFAULT_MAX_FRAME_SIZE,
};
