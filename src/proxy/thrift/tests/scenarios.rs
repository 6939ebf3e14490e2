// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end scenarios for the connection manager, driven the way the outer
//! runtime drives it: downstream bytes in, upstream bytes in, writes and
//! closes observed on a fake connection handle.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use proxy_thrift::{
    new_protocol, new_transport, AppException, AppExceptionKind, CloseType, Connection,
    ConnectionEvent, ConnectionManager, ConnectionManagerBuilder, ConnectionManagerStats,
    DecoderEvent, DecoderEventHandler, DecoderFilter, DecoderFilterCallbacks, DirectResponse,
    Error, FieldType, FilterChainFactory, FilterStatus, MessageMetadata, MessageType, Protocol,
    ProtocolType, ProxyConfig, RandomGenerator, Route, Router, UpstreamResponse,
    DEFAULT_MAX_FRAME_SIZE,
};

// ---------------------------------------------------------------- fixtures

#[derive(Default)]
struct ConnectionState {
    writes: Vec<Vec<u8>>,
    closed: Option<CloseType>,
    half_close_enabled: bool,
}

struct FakeConnection {
    state: Rc<RefCell<ConnectionState>>,
}

impl Connection for FakeConnection {
    fn write(&mut self, data: &[u8], _end_stream: bool) {
        self.state.borrow_mut().writes.push(data.to_vec());
    }

    fn close(&mut self, close_type: CloseType) {
        let mut state = self.state.borrow_mut();
        if state.closed.is_none() {
            state.closed = Some(close_type);
        }
    }

    fn enable_half_close(&mut self, enabled: bool) {
        self.state.borrow_mut().half_close_enabled = enabled;
    }
}

struct SequentialRandom {
    next: u64,
}

impl RandomGenerator for SequentialRandom {
    fn random(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

#[derive(Default)]
struct FilterState {
    stream_ids: Vec<u64>,
    message_begins: usize,
    transport_ends: usize,
    clusters: Vec<Option<String>>,
    upstream_resets: usize,
}

struct RecordingFilter {
    state: Rc<RefCell<FilterState>>,
    stop_at_message_begin: Rc<Cell<bool>>,
    fail_on_string: Rc<Cell<bool>>,
    resume_at_transport_end: Rc<Cell<bool>>,
    reset_downstream_at_transport_end: Rc<Cell<bool>>,
}

impl DecoderFilter for RecordingFilter {
    fn on_event(
        &mut self,
        event: DecoderEvent,
        callbacks: &mut dyn DecoderFilterCallbacks,
    ) -> Result<FilterStatus, Error> {
        match &event {
            DecoderEvent::MessageBegin(_) => {
                let route = callbacks.route();
                // a second resolution must come from the cache
                let _ = callbacks.route();

                let mut state = self.state.borrow_mut();
                state.message_begins += 1;
                state.stream_ids.push(callbacks.stream_id());
                state
                    .clusters
                    .push(route.map(|route| route.cluster_name().to_string()));
                drop(state);

                if self.stop_at_message_begin.take() {
                    return Ok(FilterStatus::StopIteration);
                }
            }
            DecoderEvent::StringValue(_) => {
                if self.fail_on_string.get() {
                    return Err(AppException::new(
                        AppExceptionKind::ProtocolError,
                        "failed to deserialize arguments",
                    )
                    .into());
                }
            }
            DecoderEvent::TransportEnd => {
                self.state.borrow_mut().transport_ends += 1;
                if self.reset_downstream_at_transport_end.get() {
                    callbacks.reset_downstream_connection();
                }
                if self.resume_at_transport_end.get() {
                    callbacks.continue_decoding();
                    return Ok(FilterStatus::StopIteration);
                }
            }
            _ => {}
        }

        Ok(FilterStatus::Continue)
    }

    fn reset_upstream_connection(&mut self) {
        self.state.borrow_mut().upstream_resets += 1;
    }
}

struct RecordingFilterFactory {
    state: Rc<RefCell<FilterState>>,
    stop_at_message_begin: Rc<Cell<bool>>,
    fail_on_string: Rc<Cell<bool>>,
    resume_at_transport_end: Rc<Cell<bool>>,
    reset_downstream_at_transport_end: Rc<Cell<bool>>,
}

impl FilterChainFactory for RecordingFilterFactory {
    fn create_filter_chain(&self) -> Box<dyn DecoderFilter> {
        Box::new(RecordingFilter {
            state: self.state.clone(),
            stop_at_message_begin: self.stop_at_message_begin.clone(),
            fail_on_string: self.fail_on_string.clone(),
            resume_at_transport_end: self.resume_at_transport_end.clone(),
            reset_downstream_at_transport_end: self.reset_downstream_at_transport_end.clone(),
        })
    }
}

struct StaticRoute {
    cluster: String,
}

impl Route for StaticRoute {
    fn cluster_name(&self) -> &str {
        &self.cluster
    }
}

struct TestRouter {
    calls: Rc<Cell<usize>>,
}

impl Router for TestRouter {
    fn route(&self, _metadata: &MessageMetadata, _stream_id: u64) -> Option<Rc<dyn Route>> {
        self.calls.set(self.calls.get() + 1);
        Some(Rc::new(StaticRoute {
            cluster: "backend".to_string(),
        }))
    }
}

struct Harness {
    manager: ConnectionManager,
    connection: Rc<RefCell<ConnectionState>>,
    filters: Rc<RefCell<FilterState>>,
    stats: Arc<ConnectionManagerStats>,
    stop_at_message_begin: Rc<Cell<bool>>,
    fail_on_string: Rc<Cell<bool>>,
    resume_at_transport_end: Rc<Cell<bool>>,
    reset_downstream_at_transport_end: Rc<Cell<bool>>,
    router_calls: Rc<Cell<usize>>,
}

fn harness_with_protocol(custom_protocol: Option<Box<dyn Protocol>>) -> Harness {
    build_harness(ProxyConfig::default(), custom_protocol)
}

fn build_harness(config: ProxyConfig, custom_protocol: Option<Box<dyn Protocol>>) -> Harness {
    let connection = Rc::new(RefCell::new(ConnectionState::default()));
    let filters = Rc::new(RefCell::new(FilterState::default()));
    let stop_at_message_begin = Rc::new(Cell::new(false));
    let fail_on_string = Rc::new(Cell::new(false));
    let resume_at_transport_end = Rc::new(Cell::new(false));
    let reset_downstream_at_transport_end = Rc::new(Cell::new(false));
    let stats = Arc::new(ConnectionManagerStats::new());
    let router_calls = Rc::new(Cell::new(0));

    let factory = Rc::new(RecordingFilterFactory {
        state: filters.clone(),
        stop_at_message_begin: stop_at_message_begin.clone(),
        fail_on_string: fail_on_string.clone(),
        resume_at_transport_end: resume_at_transport_end.clone(),
        reset_downstream_at_transport_end: reset_downstream_at_transport_end.clone(),
    });
    let router = Rc::new(TestRouter {
        calls: router_calls.clone(),
    });

    let mut builder = ConnectionManagerBuilder::new(config, factory, router)
        .stats(stats.clone())
        .random(Box::new(SequentialRandom { next: 0 }));
    if let Some(protocol) = custom_protocol {
        builder = builder.protocol(protocol);
    }
    let manager = builder.build(Box::new(FakeConnection {
        state: connection.clone(),
    }));

    Harness {
        manager,
        connection,
        filters,
        stats,
        stop_at_message_begin,
        fail_on_string,
        resume_at_transport_end,
        reset_downstream_at_transport_end,
        router_calls,
    }
}

fn harness() -> Harness {
    harness_with_protocol(None)
}

// ---------------------------------------------------------- wire builders

fn framed(payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::new();
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out.to_vec()
}

fn build_payload(
    protocol: &mut dyn Protocol,
    message_type: MessageType,
    name: &str,
    sequence_id: i32,
    body: &dyn Fn(&mut dyn Protocol, &mut BytesMut),
) -> Vec<u8> {
    let mut metadata = MessageMetadata::new();
    metadata.set_method_name(name.to_string());
    metadata.set_message_type(message_type);
    metadata.set_sequence_id(sequence_id);

    let mut payload = BytesMut::new();
    protocol.write_message_begin(&mut payload, &metadata).unwrap();
    protocol.write_struct_begin(&mut payload, "").unwrap();
    body(protocol, &mut payload);
    protocol.write_field_stop(&mut payload).unwrap();
    protocol.write_struct_end(&mut payload).unwrap();
    protocol.write_message_end(&mut payload).unwrap();
    payload.to_vec()
}

fn binary_message(
    message_type: MessageType,
    name: &str,
    sequence_id: i32,
    body: &dyn Fn(&mut dyn Protocol, &mut BytesMut),
) -> Vec<u8> {
    let mut protocol = new_protocol(ProtocolType::Binary);
    framed(&build_payload(
        &mut *protocol,
        message_type,
        name,
        sequence_id,
        body,
    ))
}

fn empty_call(name: &str, sequence_id: i32) -> Vec<u8> {
    binary_message(MessageType::Call, name, sequence_id, &|_, _| {})
}

fn empty_oneway(name: &str, sequence_id: i32) -> Vec<u8> {
    binary_message(MessageType::Oneway, name, sequence_id, &|_, _| {})
}

fn call_with_string_arg(name: &str, sequence_id: i32, arg: &str) -> Vec<u8> {
    let arg = arg.to_string();
    binary_message(MessageType::Call, name, sequence_id, &move |protocol, out| {
        protocol
            .write_field_begin(out, "", FieldType::String, 1)
            .unwrap();
        protocol.write_string(out, arg.as_bytes()).unwrap();
        protocol.write_field_end(out).unwrap();
    })
}

// a successful reply: field 0 carries the declared return value
fn success_reply(sequence_id: i32, value: i32) -> Vec<u8> {
    binary_message(MessageType::Reply, "ping", sequence_id, &move |protocol, out| {
        protocol
            .write_field_begin(out, "", FieldType::I32, 0)
            .unwrap();
        protocol.write_i32(out, value).unwrap();
        protocol.write_field_end(out).unwrap();
    })
}

// an IDL exception reply: some field other than 0 is set
fn idl_exception_reply(sequence_id: i32) -> Vec<u8> {
    binary_message(MessageType::Reply, "ping", sequence_id, &|protocol, out| {
        protocol
            .write_field_begin(out, "", FieldType::Struct, 1)
            .unwrap();
        protocol.write_struct_begin(out, "").unwrap();
        protocol.write_field_stop(out).unwrap();
        protocol.write_struct_end(out).unwrap();
        protocol.write_field_end(out).unwrap();
    })
}

// ------------------------------------------------------------- wire readers

fn read_framed_header(frame: &[u8]) -> MessageMetadata {
    assert!(frame.len() > 4);
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    assert_eq!(declared, frame.len() - 4);

    let mut buffer = BytesMut::new();
    buffer.put_slice(&frame[4..]);
    let mut protocol = new_protocol(ProtocolType::Binary);
    let mut metadata = MessageMetadata::new();
    assert!(protocol
        .read_message_begin(&mut buffer, &mut metadata)
        .unwrap());
    metadata
}

// parses a complete exception reply, returning (metadata, message, type code)
fn read_exception_reply(frame: &[u8]) -> (MessageMetadata, String, i32) {
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    assert_eq!(declared, frame.len() - 4);

    let mut buffer = BytesMut::new();
    buffer.put_slice(&frame[4..]);
    let mut protocol = new_protocol(ProtocolType::Binary);
    let mut metadata = MessageMetadata::new();
    assert!(protocol
        .read_message_begin(&mut buffer, &mut metadata)
        .unwrap());

    protocol.read_struct_begin(&mut buffer).unwrap().unwrap();
    let (_, field_type, field_id) = protocol.read_field_begin(&mut buffer).unwrap().unwrap();
    assert_eq!((field_type, field_id), (FieldType::String, 1));
    let message = protocol.read_string(&mut buffer).unwrap().unwrap();
    protocol.read_field_end(&mut buffer).unwrap().unwrap();
    let (_, field_type, field_id) = protocol.read_field_begin(&mut buffer).unwrap().unwrap();
    assert_eq!((field_type, field_id), (FieldType::I32, 2));
    let code = protocol.read_i32(&mut buffer).unwrap().unwrap();

    (metadata, String::from_utf8(message).unwrap(), code)
}

fn counter(stats: &ConnectionManagerStats, name: &str) -> u64 {
    stats
        .counters()
        .iter()
        .find(|(counter_name, _)| *counter_name == name)
        .map(|(_, value)| *value)
        .unwrap()
}

// ---------------------------------------------------------------- scenarios

#[test]
fn happy_call_preserves_downstream_sequence_id() {
    let mut harness = harness();

    let status = harness.manager.on_data(&empty_call("ping", 7), false);
    assert_eq!(status, FilterStatus::StopIteration);

    assert_eq!(counter(&harness.stats, "request"), 1);
    assert_eq!(counter(&harness.stats, "request_call"), 1);
    assert_eq!(harness.manager.active_rpc_count(), 1);
    assert!(harness.connection.borrow().half_close_enabled);

    let stream_id = harness.filters.borrow().stream_ids[0];
    assert!(harness.manager.start_upstream_response(
        stream_id,
        new_transport(proxy_thrift::TransportType::Framed, DEFAULT_MAX_FRAME_SIZE),
        new_protocol(ProtocolType::Binary),
    ));

    // the upstream assigned its own sequence id
    let status = harness
        .manager
        .upstream_data(stream_id, &success_reply(99, 0));
    assert_eq!(status, Some(UpstreamResponse::Complete));

    let connection = harness.connection.borrow();
    assert_eq!(connection.writes.len(), 1);
    let metadata = read_framed_header(&connection.writes[0]);
    assert_eq!(metadata.message_type(), Some(MessageType::Reply));
    assert_eq!(metadata.sequence_id(), Some(7));
    drop(connection);

    assert_eq!(counter(&harness.stats, "response"), 1);
    assert_eq!(counter(&harness.stats, "response_reply"), 1);
    assert_eq!(counter(&harness.stats, "response_success"), 1);
    assert_eq!(counter(&harness.stats, "response_error"), 0);
    assert_eq!(harness.manager.active_rpc_count(), 0);
    assert!(harness.connection.borrow().closed.is_none());
}

#[test]
fn idl_exception_reply_counts_as_error() {
    let mut harness = harness();

    harness.manager.on_data(&empty_call("ping", 7), false);
    let stream_id = harness.filters.borrow().stream_ids[0];
    harness.manager.start_upstream_response(
        stream_id,
        new_transport(proxy_thrift::TransportType::Framed, DEFAULT_MAX_FRAME_SIZE),
        new_protocol(ProtocolType::Binary),
    );

    let status = harness
        .manager
        .upstream_data(stream_id, &idl_exception_reply(42));
    assert_eq!(status, Some(UpstreamResponse::Complete));

    let connection = harness.connection.borrow();
    let metadata = read_framed_header(&connection.writes[0]);
    assert_eq!(metadata.sequence_id(), Some(7));
    drop(connection);

    assert_eq!(counter(&harness.stats, "response_reply"), 1);
    assert_eq!(counter(&harness.stats, "response_error"), 1);
    assert_eq!(counter(&harness.stats, "response_success"), 0);
}

#[test]
fn oneway_completes_across_half_close() {
    let mut harness = harness();
    harness.stop_at_message_begin.set(true);

    let status = harness.manager.on_data(&empty_oneway("log", 4), true);
    assert_eq!(status, FilterStatus::StopIteration);

    // the filter held the oneway mid-decode; the half-close must not tear
    // the connection down yet
    assert!(harness.manager.stopped());
    assert!(harness.manager.half_closed());
    assert!(harness.connection.borrow().closed.is_none());
    assert_eq!(harness.manager.active_rpc_count(), 1);

    harness.manager.continue_decoding();

    assert_eq!(counter(&harness.stats, "request_oneway"), 1);
    assert_eq!(harness.manager.active_rpc_count(), 0);
    assert_eq!(
        harness.connection.borrow().closed,
        Some(CloseType::FlushWrite)
    );

    // a oneway never produces a response
    for name in [
        "response",
        "response_reply",
        "response_exception",
        "response_invalid_type",
        "response_success",
        "response_error",
    ] {
        assert_eq!(counter(&harness.stats, name), 0, "{} must stay 0", name);
    }
}

#[test]
fn malformed_frame_closes_the_connection() {
    let mut harness = harness();

    harness.manager.on_data(&[0xff, 0xff, 0xff, 0xff], false);

    assert_eq!(counter(&harness.stats, "request_decoding_error"), 1);
    assert_eq!(harness.manager.active_rpc_count(), 0);
    assert_eq!(
        harness.connection.borrow().closed,
        Some(CloseType::FlushWrite)
    );
}

#[test]
fn app_exception_replies_in_band_and_keeps_decoding() {
    let mut harness = harness();
    harness.fail_on_string.set(true);

    harness
        .manager
        .on_data(&call_with_string_arg("echo", 9, "boom"), false);

    // a well-formed exception reply with the original sequence id
    {
        let connection = harness.connection.borrow();
        assert_eq!(connection.writes.len(), 1);
        let (metadata, message, code) = read_exception_reply(&connection.writes[0]);
        assert_eq!(metadata.message_type(), Some(MessageType::Exception));
        assert_eq!(metadata.sequence_id(), Some(9));
        assert_eq!(message, "failed to deserialize arguments");
        assert_eq!(code, AppExceptionKind::ProtocolError as i32);
        assert!(connection.closed.is_none());
    }
    assert_eq!(harness.manager.active_rpc_count(), 0);

    // the connection keeps decoding subsequent requests
    harness.fail_on_string.set(false);
    harness.manager.on_data(&empty_call("ping", 10), false);

    assert!(harness.connection.borrow().closed.is_none());
    assert_eq!(harness.filters.borrow().message_begins, 2);
    assert_eq!(counter(&harness.stats, "request"), 1);
    assert_eq!(counter(&harness.stats, "request_call"), 1);
    assert_eq!(harness.manager.active_rpc_count(), 1);
}

#[test]
fn pipelined_chunked_requests_parse_in_arrival_order() {
    let mut harness = harness();

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&empty_call("a", 101));
    bytes.extend_from_slice(&empty_call("b", 102));
    bytes.extend_from_slice(&empty_call("c", 103));

    // one byte at a time: underflow at every boundary
    for byte in bytes {
        harness.manager.on_data(&[byte], false);
    }

    let filters = harness.filters.borrow();
    assert_eq!(filters.message_begins, 3);
    assert_eq!(filters.transport_ends, 3);
    assert_eq!(filters.stream_ids, vec![1, 2, 3]);
    drop(filters);

    assert_eq!(counter(&harness.stats, "request"), 3);
    assert_eq!(harness.manager.active_rpc_count(), 3);
}

#[test]
fn replies_complete_out_of_order_with_correct_correlation() {
    let mut harness = harness();

    for (name, sequence_id) in [("a", 101), ("b", 102), ("c", 103)] {
        harness.manager.on_data(&empty_call(name, sequence_id), false);
    }
    let stream_ids = harness.filters.borrow().stream_ids.clone();
    assert_eq!(stream_ids.len(), 3);

    for stream_id in &stream_ids {
        assert!(harness.manager.start_upstream_response(
            *stream_id,
            new_transport(proxy_thrift::TransportType::Framed, DEFAULT_MAX_FRAME_SIZE),
            new_protocol(ProtocolType::Binary),
        ));
    }

    // upstream completes newest first, each under its own upstream id
    for stream_id in stream_ids.iter().rev() {
        let status = harness
            .manager
            .upstream_data(*stream_id, &success_reply(999, 0));
        assert_eq!(status, Some(UpstreamResponse::Complete));
    }

    // the downstream wire carries replies in completion order, each with the
    // sequence id of its own request
    let connection = harness.connection.borrow();
    let sequence_ids: Vec<i32> = connection
        .writes
        .iter()
        .map(|write| read_framed_header(write).sequence_id().unwrap())
        .collect();
    assert_eq!(sequence_ids, vec![103, 102, 101]);
    drop(connection);

    assert_eq!(harness.manager.active_rpc_count(), 0);
    assert_eq!(counter(&harness.stats, "response_success"), 3);
}

#[test]
fn remote_close_resets_all_in_flight_rpcs() {
    let mut harness = harness();

    harness.manager.on_data(&empty_call("a", 1), false);
    harness.manager.on_data(&empty_call("b", 2), false);
    assert_eq!(harness.manager.active_rpc_count(), 2);

    harness.manager.on_event(ConnectionEvent::RemoteClose);

    assert_eq!(harness.manager.active_rpc_count(), 0);
    assert_eq!(
        counter(&harness.stats, "cx_destroy_remote_with_active_rq"),
        2
    );
    assert_eq!(counter(&harness.stats, "cx_destroy_local_with_active_rq"), 0);
}

#[test]
fn end_stream_without_oneway_resets_and_closes() {
    let mut harness = harness();

    harness.manager.on_data(&empty_call("a", 1), false);
    harness.manager.on_data(&[], true);

    assert_eq!(harness.manager.active_rpc_count(), 0);
    assert_eq!(
        counter(&harness.stats, "cx_destroy_remote_with_active_rq"),
        1
    );
    assert_eq!(
        harness.connection.borrow().closed,
        Some(CloseType::FlushWrite)
    );
}

#[test]
fn stopped_implies_an_rpc_in_flight() {
    let mut harness = harness();
    harness.stop_at_message_begin.set(true);

    harness.manager.on_data(&empty_call("a", 1), false);

    assert!(harness.manager.stopped());
    assert!(harness.manager.active_rpc_count() >= 1);

    harness.manager.continue_decoding();
    assert!(!harness.manager.stopped());
    assert_eq!(counter(&harness.stats, "request"), 1);
}

#[test]
fn filter_can_stop_and_resume_within_one_turn() {
    let mut harness = harness();
    harness.resume_at_transport_end.set(true);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&empty_call("a", 1));
    bytes.extend_from_slice(&empty_call("b", 2));
    harness.manager.on_data(&bytes, false);

    // both messages decoded despite the filter stopping at each transport end
    assert_eq!(harness.filters.borrow().message_begins, 2);
    assert_eq!(counter(&harness.stats, "request"), 2);
    assert!(!harness.manager.stopped());
}

#[test]
fn upstream_decode_error_resets_upstream_and_replies_downstream() {
    let mut harness = harness();

    harness.manager.on_data(&empty_call("ping", 5), false);
    let stream_id = harness.filters.borrow().stream_ids[0];
    harness.manager.start_upstream_response(
        stream_id,
        new_transport(proxy_thrift::TransportType::Framed, DEFAULT_MAX_FRAME_SIZE),
        new_protocol(ProtocolType::Binary),
    );

    // a framed chunk whose payload is not a thrift message
    let garbage = framed(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0x00, 0x00]);
    let status = harness.manager.upstream_data(stream_id, &garbage);
    assert_eq!(status, Some(UpstreamResponse::Reset));

    assert_eq!(counter(&harness.stats, "response_decoding_error"), 1);
    assert_eq!(harness.filters.borrow().upstream_resets, 1);
    assert_eq!(harness.manager.active_rpc_count(), 0);

    // the client hears about it in-band and the connection survives
    let connection = harness.connection.borrow();
    assert_eq!(connection.writes.len(), 1);
    let (metadata, _, code) = read_exception_reply(&connection.writes[0]);
    assert_eq!(metadata.sequence_id(), Some(5));
    assert_eq!(code, AppExceptionKind::ProtocolError as i32);
    assert!(connection.closed.is_none());
}

#[test]
fn cross_codec_upstream_is_reencoded_for_downstream() {
    let mut harness = harness();

    harness.manager.on_data(&empty_call("ping", 7), false);
    let stream_id = harness.filters.borrow().stream_ids[0];

    // the upstream negotiated unframed compact
    harness.manager.start_upstream_response(
        stream_id,
        new_transport(proxy_thrift::TransportType::Unframed, DEFAULT_MAX_FRAME_SIZE),
        new_protocol(ProtocolType::Compact),
    );

    let mut compact = new_protocol(ProtocolType::Compact);
    let payload = build_payload(&mut *compact, MessageType::Reply, "ping", 88, &|protocol,
                                                                                 out| {
        protocol
            .write_field_begin(out, "", FieldType::I32, 0)
            .unwrap();
        protocol.write_i32(out, 1).unwrap();
        protocol.write_field_end(out).unwrap();
    });

    let status = harness.manager.upstream_data(stream_id, &payload);
    assert_eq!(status, Some(UpstreamResponse::Complete));

    // downstream sees framed binary with its own sequence id
    let connection = harness.connection.borrow();
    assert_eq!(connection.writes.len(), 1);
    let metadata = read_framed_header(&connection.writes[0]);
    assert_eq!(metadata.message_type(), Some(MessageType::Reply));
    assert_eq!(metadata.sequence_id(), Some(7));
    drop(connection);

    assert_eq!(counter(&harness.stats, "response_success"), 1);
}

#[test]
fn auto_detected_codecs_frame_the_replies() {
    let config: ProxyConfig = toml::from_str("transport = \"auto\"\nprotocol = \"auto\"\n")
        .unwrap();
    let mut harness = build_harness(config, None);
    assert_eq!(
        harness.manager.transport_type(),
        proxy_thrift::TransportType::Auto
    );

    harness.manager.on_data(&empty_call("ping", 7), false);

    // the decoder has settled on concrete codec types
    assert_eq!(
        harness.manager.transport_type(),
        proxy_thrift::TransportType::Framed
    );
    assert_eq!(harness.manager.protocol_type(), ProtocolType::Binary);

    let stream_id = harness.filters.borrow().stream_ids[0];
    harness.manager.start_upstream_response(
        stream_id,
        new_transport(proxy_thrift::TransportType::Framed, DEFAULT_MAX_FRAME_SIZE),
        new_protocol(ProtocolType::Binary),
    );
    let status = harness
        .manager
        .upstream_data(stream_id, &success_reply(50, 0));
    assert_eq!(status, Some(UpstreamResponse::Complete));

    // the reply is framed with the detected transport and carries the
    // client's sequence id
    let connection = harness.connection.borrow();
    let metadata = read_framed_header(&connection.writes[0]);
    assert_eq!(metadata.sequence_id(), Some(7));
}

#[test]
fn filter_can_reset_the_downstream_connection() {
    let mut harness = harness();
    harness.reset_downstream_at_transport_end.set(true);

    harness.manager.on_data(&empty_call("ping", 1), false);

    assert_eq!(harness.connection.borrow().closed, Some(CloseType::NoFlush));
}

#[test]
fn route_resolution_is_cached_per_rpc() {
    let mut harness = harness();

    harness.manager.on_data(&empty_call("a", 1), false);
    harness.manager.on_data(&empty_call("b", 2), false);

    // the filter resolves twice per message begin, the router runs once per rpc
    assert_eq!(harness.router_calls.get(), 2);
    assert_eq!(
        harness.filters.borrow().clusters,
        vec![Some("backend".to_string()), Some("backend".to_string())]
    );
}

// -------------------------------------------------------- protocol upgrade

#[derive(Default)]
struct UpgradeState {
    consumed_events: usize,
    request_seen: bool,
    upgraded: bool,
}

struct UpgradeSink {
    state: Rc<RefCell<UpgradeState>>,
}

impl DecoderEventHandler for UpgradeSink {
    fn on_event(&mut self, _event: DecoderEvent) -> Result<FilterStatus, Error> {
        self.state.borrow_mut().consumed_events += 1;
        Ok(FilterStatus::Continue)
    }
}

struct UpgradeReply;

impl DirectResponse for UpgradeReply {
    fn encode(
        &self,
        metadata: &MessageMetadata,
        protocol: &mut dyn Protocol,
        out: &mut BytesMut,
    ) -> Result<(), Error> {
        let mut reply = metadata.clone();
        reply.set_message_type(MessageType::Reply);
        protocol.write_message_begin(out, &reply)?;
        protocol.write_struct_begin(out, "")?;
        protocol.write_field_stop(out)?;
        protocol.write_struct_end(out)?;
        protocol.write_message_end(out)
    }
}

// A binary protocol variant which treats the "__upgrade" method as a protocol
// upgrade handshake.
struct UpgradableProtocol {
    inner: Box<dyn Protocol>,
    state: Rc<RefCell<UpgradeState>>,
}

impl UpgradableProtocol {
    fn new(state: Rc<RefCell<UpgradeState>>) -> Self {
        Self {
            inner: new_protocol(ProtocolType::Binary),
            state,
        }
    }
}

impl Protocol for UpgradableProtocol {
    fn protocol_type(&self) -> ProtocolType {
        self.inner.protocol_type()
    }

    fn read_message_begin(
        &mut self,
        buffer: &mut BytesMut,
        metadata: &mut MessageMetadata,
    ) -> Result<bool, Error> {
        let complete = self.inner.read_message_begin(buffer, metadata)?;
        if complete && metadata.method_name() == Some("__upgrade") {
            metadata.set_protocol_upgrade_message(true);
        }
        Ok(complete)
    }

    fn read_message_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.inner.read_message_end(buffer)
    }

    fn read_struct_begin(&mut self, buffer: &mut BytesMut) -> Result<Option<String>, Error> {
        self.inner.read_struct_begin(buffer)
    }

    fn read_struct_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.inner.read_struct_end(buffer)
    }

    fn read_field_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(String, FieldType, i16)>, Error> {
        self.inner.read_field_begin(buffer)
    }

    fn read_field_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.inner.read_field_end(buffer)
    }

    fn read_map_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(FieldType, FieldType, u32)>, Error> {
        self.inner.read_map_begin(buffer)
    }

    fn read_map_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.inner.read_map_end(buffer)
    }

    fn read_list_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(FieldType, u32)>, Error> {
        self.inner.read_list_begin(buffer)
    }

    fn read_list_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.inner.read_list_end(buffer)
    }

    fn read_set_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(FieldType, u32)>, Error> {
        self.inner.read_set_begin(buffer)
    }

    fn read_set_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.inner.read_set_end(buffer)
    }

    fn read_bool(&mut self, buffer: &mut BytesMut) -> Result<Option<bool>, Error> {
        self.inner.read_bool(buffer)
    }

    fn read_byte(&mut self, buffer: &mut BytesMut) -> Result<Option<i8>, Error> {
        self.inner.read_byte(buffer)
    }

    fn read_i16(&mut self, buffer: &mut BytesMut) -> Result<Option<i16>, Error> {
        self.inner.read_i16(buffer)
    }

    fn read_i32(&mut self, buffer: &mut BytesMut) -> Result<Option<i32>, Error> {
        self.inner.read_i32(buffer)
    }

    fn read_i64(&mut self, buffer: &mut BytesMut) -> Result<Option<i64>, Error> {
        self.inner.read_i64(buffer)
    }

    fn read_double(&mut self, buffer: &mut BytesMut) -> Result<Option<f64>, Error> {
        self.inner.read_double(buffer)
    }

    fn read_string(&mut self, buffer: &mut BytesMut) -> Result<Option<Vec<u8>>, Error> {
        self.inner.read_string(buffer)
    }

    fn write_message_begin(
        &mut self,
        out: &mut BytesMut,
        metadata: &MessageMetadata,
    ) -> Result<(), Error> {
        self.inner.write_message_begin(out, metadata)
    }

    fn write_message_end(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner.write_message_end(out)
    }

    fn write_struct_begin(&mut self, out: &mut BytesMut, name: &str) -> Result<(), Error> {
        self.inner.write_struct_begin(out, name)
    }

    fn write_struct_end(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner.write_struct_end(out)
    }

    fn write_field_begin(
        &mut self,
        out: &mut BytesMut,
        name: &str,
        field_type: FieldType,
        field_id: i16,
    ) -> Result<(), Error> {
        self.inner.write_field_begin(out, name, field_type, field_id)
    }

    fn write_field_end(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner.write_field_end(out)
    }

    fn write_field_stop(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner.write_field_stop(out)
    }

    fn write_map_begin(
        &mut self,
        out: &mut BytesMut,
        key_type: FieldType,
        value_type: FieldType,
        size: u32,
    ) -> Result<(), Error> {
        self.inner.write_map_begin(out, key_type, value_type, size)
    }

    fn write_map_end(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner.write_map_end(out)
    }

    fn write_list_begin(
        &mut self,
        out: &mut BytesMut,
        elem_type: FieldType,
        size: u32,
    ) -> Result<(), Error> {
        self.inner.write_list_begin(out, elem_type, size)
    }

    fn write_list_end(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner.write_list_end(out)
    }

    fn write_set_begin(
        &mut self,
        out: &mut BytesMut,
        elem_type: FieldType,
        size: u32,
    ) -> Result<(), Error> {
        self.inner.write_set_begin(out, elem_type, size)
    }

    fn write_set_end(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner.write_set_end(out)
    }

    fn write_bool(&mut self, out: &mut BytesMut, value: bool) -> Result<(), Error> {
        self.inner.write_bool(out, value)
    }

    fn write_byte(&mut self, out: &mut BytesMut, value: i8) -> Result<(), Error> {
        self.inner.write_byte(out, value)
    }

    fn write_i16(&mut self, out: &mut BytesMut, value: i16) -> Result<(), Error> {
        self.inner.write_i16(out, value)
    }

    fn write_i32(&mut self, out: &mut BytesMut, value: i32) -> Result<(), Error> {
        self.inner.write_i32(out, value)
    }

    fn write_i64(&mut self, out: &mut BytesMut, value: i64) -> Result<(), Error> {
        self.inner.write_i64(out, value)
    }

    fn write_double(&mut self, out: &mut BytesMut, value: f64) -> Result<(), Error> {
        self.inner.write_double(out, value)
    }

    fn write_string(&mut self, out: &mut BytesMut, value: &[u8]) -> Result<(), Error> {
        self.inner.write_string(out, value)
    }

    fn supports_upgrade(&self) -> bool {
        true
    }

    fn upgrade_request_decoder(&mut self) -> Option<Box<dyn DecoderEventHandler>> {
        self.state.borrow_mut().request_seen = true;
        Some(Box::new(UpgradeSink {
            state: self.state.clone(),
        }))
    }

    fn upgrade_response(
        &self,
        _decoder: &dyn DecoderEventHandler,
    ) -> Option<Box<dyn DirectResponse>> {
        self.state.borrow_mut().upgraded = true;
        Some(Box::new(UpgradeReply))
    }
}

#[test]
fn protocol_upgrade_handshake() {
    let upgrade_state = Rc::new(RefCell::new(UpgradeState::default()));
    let mut harness = harness_with_protocol(Some(Box::new(UpgradableProtocol::new(
        upgrade_state.clone(),
    ))));

    harness
        .manager
        .on_data(&empty_call("__upgrade", 1), false);

    // the upgrade handler consumed the message body, not the filter chain
    {
        let state = upgrade_state.borrow();
        assert!(state.request_seen);
        assert!(state.upgraded);
        assert!(state.consumed_events > 0);
    }
    assert_eq!(harness.filters.borrow().message_begins, 0);

    // an upgrade response was written and the rpc terminated
    {
        let connection = harness.connection.borrow();
        assert_eq!(connection.writes.len(), 1);
        let metadata = read_framed_header(&connection.writes[0]);
        assert_eq!(metadata.message_type(), Some(MessageType::Reply));
        assert_eq!(metadata.sequence_id(), Some(1));
        assert!(connection.closed.is_none());
    }
    assert_eq!(harness.manager.active_rpc_count(), 0);
    assert_eq!(counter(&harness.stats, "request"), 1);

    // post-upgrade, ordinary messages flow through the filter chain
    harness.manager.on_data(&empty_call("ping", 2), false);
    assert_eq!(harness.filters.borrow().message_begins, 1);
    assert_eq!(counter(&harness.stats, "request"), 2);
}
