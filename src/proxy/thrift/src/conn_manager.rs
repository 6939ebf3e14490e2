// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Per-connection controller for the proxy: owns the downstream decoder and
//! the list of in-flight RPCs, creates an `ActiveRpc` for every message that
//! begins, correlates upstream replies back to downstream sequence ids, and
//! translates decode failures into in-band exception replies or connection
//! teardown.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use bytes::BytesMut;
use protocol_thrift::{
    new_protocol, new_transport, AppException, AppExceptionKind, Decoder, DecoderCallbacks,
    DecoderEvent, DecoderEventHandler, DirectResponse, Error, FilterStatus, MessageMetadata,
    MessageType, Protocol, ProtocolConverter, ProtocolType, Transport, TransportType,
};

use crate::config::ProxyConfig;
use crate::filter::{DecoderFilter, DecoderFilterCallbacks, FilterChainFactory, UpstreamResponse};
use crate::router::{Route, Router};
use crate::runtime::{CloseType, Connection, ConnectionEvent, DefaultRandomGenerator, RandomGenerator};
use crate::stats::ConnectionManagerStats;

/// Handles shared by the connection manager and every RPC it owns. All of it
/// is per-connection and single-threaded; the `Rc<RefCell<_>>` sharing mirrors
/// the fact that the codec objects are used for decoding the wire and for
/// encoding local replies at the same time.
#[derive(Clone)]
struct ConnectionContext {
    stats: Arc<ConnectionManagerStats>,
    transport: Rc<RefCell<Box<dyn Transport>>>,
    protocol: Rc<RefCell<Box<dyn Protocol>>>,
    connection: Rc<RefCell<Box<dyn Connection>>>,
    router: Rc<dyn Router>,
    filter_factory: Rc<dyn FilterChainFactory>,
    random: Rc<RefCell<Box<dyn RandomGenerator>>>,
    // set by a filter's continue_decoding, honored when the current entry
    // point unwinds
    resume: Rc<Cell<bool>>,
    max_frame_size: usize,
}

// Encodes a local reply through the connection's current protocol, frames it
// with the current transport, and writes it downstream without closing.
fn encode_local_reply(
    ctx: &ConnectionContext,
    metadata: &mut MessageMetadata,
    response: &dyn DirectResponse,
) -> Result<(), Error> {
    let mut payload = BytesMut::new();
    {
        let mut protocol = ctx.protocol.borrow_mut();
        response.encode(metadata, &mut **protocol, &mut payload)?;
        metadata.set_protocol(protocol.protocol_type());
    }

    let mut frame = BytesMut::new();
    ctx.transport
        .borrow_mut()
        .encode_frame(&mut frame, metadata, &payload)?;
    ctx.connection.borrow_mut().write(&frame, false);
    Ok(())
}

/// Builder for a `ConnectionManager`. The transport and protocol default to
/// the configured types; custom codec instances (an upgrade-capable protocol,
/// for example) may be supplied explicitly.
pub struct ConnectionManagerBuilder {
    config: ProxyConfig,
    filter_factory: Rc<dyn FilterChainFactory>,
    router: Rc<dyn Router>,
    stats: Arc<ConnectionManagerStats>,
    random: Option<Box<dyn RandomGenerator>>,
    transport: Option<Box<dyn Transport>>,
    protocol: Option<Box<dyn Protocol>>,
}

impl ConnectionManagerBuilder {
    pub fn new(
        config: ProxyConfig,
        filter_factory: Rc<dyn FilterChainFactory>,
        router: Rc<dyn Router>,
    ) -> Self {
        Self {
            config,
            filter_factory,
            router,
            stats: Arc::new(ConnectionManagerStats::new()),
            random: None,
            transport: None,
            protocol: None,
        }
    }

    pub fn stats(mut self, stats: Arc<ConnectionManagerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn random(mut self, random: Box<dyn RandomGenerator>) -> Self {
        self.random = Some(random);
        self
    }

    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn protocol(mut self, protocol: Box<dyn Protocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn build(self, mut connection: Box<dyn Connection>) -> ConnectionManager {
        connection.enable_half_close(true);

        let max_frame_size = self.config.max_frame_size();
        let transport = Rc::new(RefCell::new(self.transport.unwrap_or_else(|| {
            new_transport(self.config.transport(), max_frame_size)
        })));
        let protocol = Rc::new(RefCell::new(
            self.protocol
                .unwrap_or_else(|| new_protocol(self.config.protocol())),
        ));
        let random = self
            .random
            .unwrap_or_else(|| Box::new(DefaultRandomGenerator::new()));

        let ctx = ConnectionContext {
            stats: self.stats,
            transport: transport.clone(),
            protocol: protocol.clone(),
            connection: Rc::new(RefCell::new(connection)),
            router: self.router,
            filter_factory: self.filter_factory,
            random: Rc::new(RefCell::new(random)),
            resume: Rc::new(Cell::new(false)),
            max_frame_size,
        };

        ConnectionManager {
            decoder: Decoder::new(transport, protocol),
            ctx,
            request_buffer: BytesMut::new(),
            rpcs: VecDeque::new(),
            drain: Vec::new(),
            stopped: false,
            half_closed: false,
        }
    }
}

/// Per-connection controller. One per downstream connection, driven entirely
/// by the runtime's callbacks on a single worker.
pub struct ConnectionManager {
    ctx: ConnectionContext,
    decoder: Decoder,
    request_buffer: BytesMut,
    // in-flight RPCs, oldest first
    rpcs: VecDeque<ActiveRpc>,
    // RPCs scheduled for destruction; dropped when the current entry point
    // unwinds, never earlier
    drain: Vec<ActiveRpc>,
    stopped: bool,
    half_closed: bool,
}

impl ConnectionManager {
    /// Consumes downstream bytes. Always returns `StopIteration`: the buffer
    /// is fully absorbed here and nothing flows further down the outer filter
    /// chain.
    pub fn on_data(&mut self, data: &[u8], end_stream: bool) -> FilterStatus {
        self.request_buffer.extend_from_slice(data);
        self.dispatch();
        self.maybe_resume();

        if end_stream {
            trace!("downstream half-closed");

            // Downstream has closed. Unless we're waiting to finish decoding
            // a one-way request, close. The special case lets a one-way
            // complete even though no reply will ever be written.
            if self.stopped {
                debug_assert!(!self.rpcs.is_empty());
                let oneway_in_flight = self.rpcs.front().map_or(false, |rpc| {
                    rpc.metadata().map_or(false, |metadata| {
                        metadata.borrow().message_type() == Some(MessageType::Oneway)
                    })
                });
                if oneway_in_flight {
                    trace!("waiting for one-way completion");
                    self.half_closed = true;
                    self.drain.clear();
                    return FilterStatus::StopIteration;
                }
            }

            self.reset_all_rpcs(false);
            self.ctx.connection.borrow_mut().close(CloseType::FlushWrite);
        }

        self.drain.clear();
        FilterStatus::StopIteration
    }

    /// Resumes decoding after a filter returned `StopIteration`.
    pub fn continue_decoding(&mut self) {
        debug!("thrift filter continued");
        self.resume_decoding();
        self.drain.clear();
    }

    /// Connection-level event from the runtime.
    pub fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {}
            ConnectionEvent::LocalClose => self.reset_all_rpcs(true),
            ConnectionEvent::RemoteClose => self.reset_all_rpcs(false),
        }
        self.drain.clear();
    }

    /// Encodes `response` through the connection's protocol, frames it with
    /// the connection's transport, and writes it downstream.
    pub fn send_local_reply(&mut self, metadata: &mut MessageMetadata, response: &dyn DirectResponse) {
        if let Err(error) = encode_local_reply(&self.ctx, metadata, response) {
            error!("failed to encode local response: {}", error);
        }
    }

    /// Installs the response decoder for the RPC with the given stream id.
    /// Returns false when no such RPC is in flight.
    pub fn start_upstream_response(
        &mut self,
        stream_id: u64,
        transport: Box<dyn Transport>,
        protocol: Box<dyn Protocol>,
    ) -> bool {
        match self.rpcs.iter_mut().find(|rpc| rpc.stream_id() == stream_id) {
            Some(rpc) => {
                rpc.start_upstream_response(transport, protocol);
                true
            }
            None => false,
        }
    }

    /// Feeds upstream bytes to the RPC with the given stream id. Returns
    /// `None` when no such RPC is in flight (it may have been reset).
    pub fn upstream_data(&mut self, stream_id: u64, data: &[u8]) -> Option<UpstreamResponse> {
        let status = match self.rpcs.iter_mut().find(|rpc| rpc.stream_id() == stream_id) {
            Some(rpc) => rpc.upstream_data(data),
            None => {
                warn!("upstream data for unknown stream {}", stream_id);
                return None;
            }
        };

        self.sweep_destroyed();
        self.maybe_resume();
        self.drain.clear();
        Some(status)
    }

    /// Number of RPCs currently in flight.
    pub fn active_rpc_count(&self) -> usize {
        self.rpcs.len()
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn half_closed(&self) -> bool {
        self.half_closed
    }

    /// Concrete downstream transport type, after any auto-detection.
    pub fn transport_type(&self) -> TransportType {
        self.ctx.transport.borrow().transport_type()
    }

    /// Concrete downstream protocol type, after any auto-detection.
    pub fn protocol_type(&self) -> ProtocolType {
        self.ctx.protocol.borrow().protocol_type()
    }

    fn dispatch(&mut self) {
        if self.stopped {
            debug!("thrift filter stopped");
            return;
        }

        loop {
            let result = {
                let Self {
                    ctx,
                    decoder,
                    request_buffer,
                    rpcs,
                    ..
                } = self;
                let mut callbacks = DispatchCallbacks { ctx: &*ctx, rpcs };
                decoder.on_data(request_buffer, &mut callbacks)
            };
            self.sweep_destroyed();

            match result {
                Ok((FilterStatus::StopIteration, _)) => {
                    self.stopped = true;
                    return;
                }
                Ok((FilterStatus::Continue, true)) => return,
                Ok((FilterStatus::Continue, false)) => continue,
                Err(Error::App(exception)) => {
                    error!("thrift application exception: {}", exception);
                    self.on_app_exception(exception);
                    if !self.decoder.recover_to_frame_end() {
                        // without framing there is no way to realign on the
                        // next message
                        self.ctx.stats.request_decoding_error.increment();
                        self.reset_all_rpcs(true);
                        self.ctx.connection.borrow_mut().close(CloseType::FlushWrite);
                        return;
                    }
                }
                Err(Error::Decode(message)) => {
                    error!("thrift error: {}", message);
                    // use the oldest rpc to report the error downstream, if
                    // it got far enough to have an identity
                    if let Some(rpc) = self.rpcs.front_mut() {
                        rpc.on_error(&message);
                    }
                    self.ctx.stats.request_decoding_error.increment();
                    self.reset_all_rpcs(true);
                    self.ctx.connection.borrow_mut().close(CloseType::FlushWrite);
                    return;
                }
            }
        }
    }

    // An application exception is reportable in-band: reply with the oldest
    // request's identity (or a blank envelope when nothing has been decoded),
    // drop the RPC of the message that raised it, and keep the connection.
    fn on_app_exception(&mut self, exception: AppException) {
        let result = match self.rpcs.front().and_then(|rpc| rpc.metadata()) {
            Some(metadata) => {
                let mut metadata = metadata.borrow_mut();
                encode_local_reply(&self.ctx, &mut metadata, &exception)
            }
            None => {
                let mut metadata = MessageMetadata::new();
                encode_local_reply(&self.ctx, &mut metadata, &exception)
            }
        };
        if let Err(error) = result {
            error!("failed to encode local response: {}", error);
        }

        if self.decoder.handler_active() {
            if let Some(rpc) = self.rpcs.back_mut() {
                rpc.on_reset();
            }
        }
        self.sweep_destroyed();
    }

    fn resume_decoding(&mut self) {
        self.stopped = false;
        self.dispatch();

        if !self.stopped && self.half_closed {
            // the client already went away; nothing further can complete
            self.reset_all_rpcs(false);
            self.ctx.connection.borrow_mut().close(CloseType::FlushWrite);
        }
    }

    fn maybe_resume(&mut self) {
        // a filter may stop and resume repeatedly within one turn; settle
        // before handing control back to the runtime
        while self.ctx.resume.take() {
            if self.stopped {
                self.resume_decoding();
            }
        }
    }

    fn reset_all_rpcs(&mut self, local_reset: bool) {
        while let Some(mut rpc) = self.rpcs.pop_front() {
            if local_reset {
                debug!("local close with active request");
                self.ctx.stats.cx_destroy_local_with_active_rq.increment();
            } else {
                debug!("remote close with active request");
                self.ctx.stats.cx_destroy_remote_with_active_rq.increment();
            }

            rpc.on_reset();
            self.drain.push(rpc);
        }
    }

    // Moves RPCs whose destruction was scheduled out of the in-flight list.
    // They stay alive on the drain list until the current entry point
    // unwinds, so an RPC may schedule its own destruction from inside one of
    // its event handlers.
    fn sweep_destroyed(&mut self) {
        let mut index = 0;
        while index < self.rpcs.len() {
            if self.rpcs[index].destroy_pending() {
                if let Some(rpc) = self.rpcs.remove(index) {
                    self.drain.push(rpc);
                }
            } else {
                index += 1;
            }
        }
    }
}

// The decoder's view of the manager during one dispatch step: installs a new
// RPC per message and routes every event to the RPC currently being decoded,
// which is always the newest.
struct DispatchCallbacks<'a> {
    ctx: &'a ConnectionContext,
    rpcs: &'a mut VecDeque<ActiveRpc>,
}

impl DecoderEventHandler for DispatchCallbacks<'_> {
    fn on_event(&mut self, event: DecoderEvent) -> Result<FilterStatus, Error> {
        match self.rpcs.back_mut() {
            Some(rpc) => rpc.on_event(event),
            None => Err(Error::Decode(
                "decoder event without an active rpc".to_string(),
            )),
        }
    }
}

impl DecoderCallbacks for DispatchCallbacks<'_> {
    fn new_decoder_event_handler(&mut self) {
        trace!("new decoder filter");
        self.rpcs.push_back(ActiveRpc::new(self.ctx.clone()));
    }
}

/// One in-flight downstream request. Routes decoder events into the filter
/// chain (or, for protocol upgrade messages, into the protocol's upgrade
/// handler), counts the request, and owns the response side once an upstream
/// is selected.
struct ActiveRpc {
    filter: Box<dyn DecoderFilter>,
    upgrade_handler: Option<Box<dyn DecoderEventHandler>>,
    inner: RpcInner,
}

// The RPC state the filter may reach through `DecoderFilterCallbacks`. Split
// from the filter itself so the filter can borrow it mutably while being
// called.
struct RpcInner {
    ctx: ConnectionContext,
    metadata: Option<Rc<RefCell<MessageMetadata>>>,
    original_sequence_id: i32,
    stream_id: u64,
    response_decoder: Option<ResponseDecoder>,
    // distinguishes "not yet resolved" from "resolved to no route"
    cached_route: Option<Option<Rc<dyn Route>>>,
    destroy_pending: bool,
}

impl ActiveRpc {
    fn new(ctx: ConnectionContext) -> Self {
        let stream_id = ctx.random.borrow_mut().random();
        let filter = ctx.filter_factory.create_filter_chain();

        Self {
            filter,
            upgrade_handler: None,
            inner: RpcInner {
                ctx,
                metadata: None,
                original_sequence_id: 0,
                stream_id,
                response_decoder: None,
                cached_route: None,
                destroy_pending: false,
            },
        }
    }

    fn stream_id(&self) -> u64 {
        self.inner.stream_id
    }

    fn destroy_pending(&self) -> bool {
        self.inner.destroy_pending
    }

    fn metadata(&self) -> Option<Rc<RefCell<MessageMetadata>>> {
        self.inner.metadata.clone()
    }

    fn on_event(&mut self, event: DecoderEvent) -> Result<FilterStatus, Error> {
        match event {
            DecoderEvent::MessageBegin(metadata) => self.message_begin(metadata),
            DecoderEvent::TransportEnd => self.transport_end(),
            event => self.forward(event),
        }
    }

    fn forward(&mut self, event: DecoderEvent) -> Result<FilterStatus, Error> {
        match self.upgrade_handler.as_mut() {
            Some(handler) => handler.on_event(event),
            None => self.filter.on_event(event, &mut self.inner),
        }
    }

    fn message_begin(&mut self, metadata: Rc<RefCell<MessageMetadata>>) -> Result<FilterStatus, Error> {
        let upgrade = {
            let metadata = metadata.borrow();
            debug_assert!(metadata.sequence_id().is_some());
            self.inner.original_sequence_id = metadata.sequence_id().unwrap_or(0);
            metadata.is_protocol_upgrade_message()
                && self.inner.ctx.protocol.borrow().supports_upgrade()
        };

        if upgrade {
            debug!("decoding protocol upgrade request");
            self.upgrade_handler = self.inner.ctx.protocol.borrow_mut().upgrade_request_decoder();
        }

        self.inner.metadata = Some(metadata.clone());
        self.forward(DecoderEvent::MessageBegin(metadata))
    }

    fn transport_end(&mut self) -> Result<FilterStatus, Error> {
        let stats = self.inner.ctx.stats.clone();
        stats.request.increment();

        let message_type = self
            .inner
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.borrow().message_type());
        match message_type {
            Some(MessageType::Call) => {
                stats.request_call.increment();
            }
            Some(MessageType::Oneway) => {
                stats.request_oneway.increment();
                // no response is forthcoming, we're done
                self.inner.destroy_pending = true;
            }
            _ => {
                stats.request_invalid_type.increment();
            }
        }

        let status = self.forward(DecoderEvent::TransportEnd)?;

        let upgrade = self
            .inner
            .metadata
            .as_ref()
            .map_or(false, |metadata| metadata.borrow().is_protocol_upgrade_message());
        if upgrade {
            debug!("sending protocol upgrade response");
            let response = {
                let protocol = self.inner.ctx.protocol.borrow();
                self.upgrade_handler
                    .as_deref()
                    .and_then(|handler| protocol.upgrade_response(handler))
            };
            if let Some(response) = response {
                self.inner.send_local_reply(response.as_ref());
            }
        }

        Ok(status)
    }

    fn on_reset(&mut self) {
        self.filter.on_destroy();
        self.inner.destroy_pending = true;
    }

    fn on_error(&mut self, message: &str) {
        self.inner.on_error(message);
    }

    fn start_upstream_response(&mut self, transport: Box<dyn Transport>, protocol: Box<dyn Protocol>) {
        self.inner.start_upstream_response(transport, protocol);
    }

    fn upstream_data(&mut self, data: &[u8]) -> UpstreamResponse {
        let status = self.inner.upstream_data(data);
        if status == UpstreamResponse::Reset {
            self.filter.reset_upstream_connection();
        }
        status
    }
}

impl RpcInner {
    fn on_error(&mut self, message: &str) {
        if self.metadata.is_some() {
            self.send_local_reply(&AppException::new(AppExceptionKind::ProtocolError, message));
        }
        // an error before message begin has no sequence id or protocol
        // identity to frame a reply with, stay silent
    }
}

impl DecoderFilterCallbacks for RpcInner {
    fn connection(&self) -> Rc<RefCell<Box<dyn Connection>>> {
        self.ctx.connection.clone()
    }

    fn continue_decoding(&mut self) {
        self.ctx.resume.set(true);
    }

    fn route(&mut self) -> Option<Rc<dyn Route>> {
        if let Some(cached) = &self.cached_route {
            return cached.clone();
        }

        let route = match &self.metadata {
            Some(metadata) => self.ctx.router.route(&metadata.borrow(), self.stream_id),
            None => None,
        };
        self.cached_route = Some(route.clone());
        route
    }

    fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn send_local_reply(&mut self, response: &dyn DirectResponse) {
        match self.metadata.clone() {
            Some(metadata) => {
                let mut metadata = metadata.borrow_mut();
                // the upstream may have rewritten it
                metadata.set_sequence_id(self.original_sequence_id);
                if let Err(error) = encode_local_reply(&self.ctx, &mut metadata, response) {
                    error!("failed to encode local response: {}", error);
                }
            }
            None => error!("local reply without message metadata"),
        }
        self.destroy_pending = true;
    }

    fn start_upstream_response(&mut self, transport: Box<dyn Transport>, protocol: Box<dyn Protocol>) {
        debug_assert!(self.response_decoder.is_none());
        self.response_decoder = Some(ResponseDecoder::new(
            self.ctx.clone(),
            self.original_sequence_id,
            transport,
            protocol,
        ));
    }

    fn upstream_data(&mut self, data: &[u8]) -> UpstreamResponse {
        let Some(decoder) = self.response_decoder.as_mut() else {
            error!("upstream data without a response decoder");
            return UpstreamResponse::Reset;
        };

        match decoder.on_data(data) {
            Ok(true) => {
                self.destroy_pending = true;
                UpstreamResponse::Complete
            }
            Ok(false) => UpstreamResponse::MoreData,
            Err(Error::App(exception)) => {
                error!("thrift response application error: {}", exception);
                self.ctx.stats.response_decoding_error.increment();
                self.send_local_reply(&exception);
                UpstreamResponse::Reset
            }
            Err(Error::Decode(message)) => {
                error!("thrift response error: {}", message);
                self.ctx.stats.response_decoding_error.increment();
                self.on_error(&message);
                self.destroy_pending = true;
                UpstreamResponse::Reset
            }
        }
    }

    fn reset_downstream_connection(&mut self) {
        self.ctx.connection.borrow_mut().close(CloseType::NoFlush);
    }
}

/// Decodes one upstream reply with the codecs observed on the upstream
/// connection and re-encodes it for the downstream: the converter emits the
/// body in the downstream protocol and transport end frames it with a fresh
/// instance of the downstream's concrete transport, with the sequence id
/// rewritten back to the client's original.
struct ResponseDecoder {
    decoder: Decoder,
    upstream_buffer: BytesMut,
    sink: ResponseSink,
}

struct ResponseSink {
    ctx: ConnectionContext,
    converter: ProtocolConverter,
    metadata: Option<Rc<RefCell<MessageMetadata>>>,
    original_sequence_id: i32,
    first_reply_field: bool,
    complete: bool,
    success: Option<bool>,
}

impl ResponseDecoder {
    fn new(
        ctx: ConnectionContext,
        original_sequence_id: i32,
        transport: Box<dyn Transport>,
        protocol: Box<dyn Protocol>,
    ) -> Self {
        let downstream_protocol = ctx.protocol.borrow().protocol_type();

        Self {
            decoder: Decoder::new(
                Rc::new(RefCell::new(transport)),
                Rc::new(RefCell::new(protocol)),
            ),
            upstream_buffer: BytesMut::new(),
            sink: ResponseSink {
                ctx,
                converter: ProtocolConverter::new(new_protocol(downstream_protocol)),
                metadata: None,
                original_sequence_id,
                first_reply_field: false,
                complete: false,
                success: None,
            },
        }
    }

    fn on_data(&mut self, data: &[u8]) -> Result<bool, Error> {
        self.upstream_buffer.extend_from_slice(data);
        let (_, underflow) = self.decoder.on_data(&mut self.upstream_buffer, &mut self.sink)?;
        debug_assert!(self.sink.complete || underflow);
        let _ = underflow;
        Ok(self.sink.complete)
    }
}

impl DecoderEventHandler for ResponseSink {
    fn on_event(&mut self, event: DecoderEvent) -> Result<FilterStatus, Error> {
        match event {
            DecoderEvent::MessageBegin(metadata) => {
                {
                    let mut metadata = metadata.borrow_mut();
                    metadata.set_sequence_id(self.original_sequence_id);
                    self.first_reply_field =
                        metadata.message_type() == Some(MessageType::Reply);
                }
                self.metadata = Some(metadata.clone());
                self.converter.on_event(DecoderEvent::MessageBegin(metadata))
            }
            DecoderEvent::FieldBegin(name, field_type, field_id) => {
                if self.first_reply_field {
                    // a reply struct sets at most one field: field 0 is the
                    // declared return value, any other id is a declared
                    // exception
                    self.success =
                        Some(field_id == 0 && field_type != protocol_thrift::FieldType::Stop);
                    self.first_reply_field = false;
                }
                self.converter
                    .on_event(DecoderEvent::FieldBegin(name, field_type, field_id))
            }
            DecoderEvent::TransportEnd => self.transport_end(),
            event => self.converter.on_event(event),
        }
    }
}

impl DecoderCallbacks for ResponseSink {
    fn new_decoder_event_handler(&mut self) {}
}

impl ResponseSink {
    fn transport_end(&mut self) -> Result<FilterStatus, Error> {
        let metadata = self.metadata.clone().ok_or_else(|| {
            Error::Decode("response transport end without a message".to_string())
        })?;

        // frame with the concrete transport the downstream negotiated, which
        // may differ from the pre-detection configuration and from whatever
        // the upstream spoke
        let downstream_transport = self.ctx.transport.borrow().transport_type();
        let mut transport = new_transport(downstream_transport, self.ctx.max_frame_size);

        let mut frame = BytesMut::new();
        {
            let mut metadata = metadata.borrow_mut();
            metadata.set_protocol(self.ctx.protocol.borrow().protocol_type());
            transport.encode_frame(&mut frame, &metadata, self.converter.payload())?;
        }
        self.complete = true;
        self.ctx.connection.borrow_mut().write(&frame, false);

        let stats = &self.ctx.stats;
        stats.response.increment();
        match metadata.borrow().message_type() {
            Some(MessageType::Reply) => {
                stats.response_reply.increment();
                if self.success.unwrap_or(false) {
                    stats.response_success.increment();
                } else {
                    stats.response_error.increment();
                }
            }
            Some(MessageType::Exception) => {
                stats.response_exception.increment();
            }
            _ => {
                stats.response_invalid_type.increment();
            }
        }

        Ok(FilterStatus::Continue)
    }
}
