// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use std::cell::RefCell;
use std::rc::Rc;

use protocol_thrift::{
    DecoderEvent, DirectResponse, Error, FilterStatus, Protocol, Transport,
};

use crate::router::Route;
use crate::runtime::Connection;

/// Outcome of feeding upstream bytes into an RPC's response decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamResponse {
    /// The reply is incomplete, keep feeding.
    MoreData,
    /// The reply was fully re-encoded and written downstream.
    Complete,
    /// The reply could not be decoded. A local reply was already issued where
    /// possible; the caller must reset its upstream connection.
    Reset,
}

/// The surface a decoder filter may call back into. A fresh view is handed to
/// the filter with every event; nothing here may be retained across events.
pub trait DecoderFilterCallbacks {
    /// Handle to the downstream connection.
    fn connection(&self) -> Rc<RefCell<Box<dyn Connection>>>;

    /// Asks the connection manager to resume decoding after this filter
    /// previously returned `StopIteration`. Takes effect once the current
    /// event unwinds.
    fn continue_decoding(&mut self);

    /// Resolves (and caches) the route for this RPC. A cached resolution to
    /// no route is not recomputed.
    fn route(&mut self) -> Option<Rc<dyn Route>>;

    /// Identifier for this RPC, unique within the process.
    fn stream_id(&self) -> u64;

    /// Encodes `response` with the downstream codecs, writes it to the
    /// downstream connection with the RPC's original sequence id, and
    /// schedules this RPC for destruction.
    fn send_local_reply(&mut self, response: &dyn DirectResponse);

    /// Installs the response decoder for this RPC, parameterized with the
    /// transport and protocol observed on the upstream connection. Must be
    /// called at most once per RPC.
    fn start_upstream_response(
        &mut self,
        transport: Box<dyn Transport>,
        protocol: Box<dyn Protocol>,
    );

    /// Feeds upstream bytes into the response decoder. On `Reset` the filter
    /// owns resetting its upstream connection.
    fn upstream_data(&mut self, data: &[u8]) -> UpstreamResponse;

    /// Closes the downstream connection without flushing.
    fn reset_downstream_connection(&mut self);
}

/// A decoder filter: the per-RPC sink at the head of the filter chain. The
/// terminal filter owns the upstream side of the RPC's lifecycle.
pub trait DecoderFilter {
    fn on_event(
        &mut self,
        event: DecoderEvent,
        callbacks: &mut dyn DecoderFilterCallbacks,
    ) -> Result<FilterStatus, Error>;

    /// Tears down any upstream connection state held for this RPC.
    fn reset_upstream_connection(&mut self) {}

    /// Called when the RPC is being destroyed without completing.
    fn on_destroy(&mut self) {}
}

/// Builds the filter chain head for each new RPC.
pub trait FilterChainFactory {
    fn create_filter_chain(&self) -> Box<dyn DecoderFilter>;
}
