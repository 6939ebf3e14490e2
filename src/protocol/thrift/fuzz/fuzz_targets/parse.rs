// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A fuzz target which makes sure the streaming decoder handles arbitrary
//! data without panicking, for every combination of transport and protocol.

#![no_main]
use libfuzzer_sys::fuzz_target;

use bytes::BytesMut;
use protocol_thrift::*;
use std::cell::RefCell;
use std::rc::Rc;

const MAX_LEN: usize = 1024;

struct NullSink {}

impl DecoderEventHandler for NullSink {
    fn on_event(&mut self, _event: DecoderEvent) -> Result<FilterStatus, Error> {
        Ok(FilterStatus::Continue)
    }
}

impl DecoderCallbacks for NullSink {
    fn new_decoder_event_handler(&mut self) {}
}

fuzz_target!(|data: &[u8]| {
    for transport_type in [TransportType::Framed, TransportType::Unframed, TransportType::Auto] {
        for protocol_type in [ProtocolType::Binary, ProtocolType::Compact, ProtocolType::Auto] {
            let mut decoder = Decoder::new(
                Rc::new(RefCell::new(new_transport(transport_type, MAX_LEN))),
                Rc::new(RefCell::new(new_protocol(protocol_type))),
            );
            let mut sink = NullSink {};

            let mut buffer = BytesMut::new();
            buffer.extend_from_slice(data);
            loop {
                match decoder.on_data(&mut buffer, &mut sink) {
                    Ok((_, true)) => break,
                    Ok((_, false)) => {
                        if buffer.is_empty() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
});
