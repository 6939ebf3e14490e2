// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use bytes::BytesMut;

use crate::decoder::{DecoderEvent, FilterStatus};
use crate::protocol::Protocol;
use crate::Error;

/// Re-encodes a stream of decoder events with a target protocol, accumulating
/// the wire bytes of the message body. When source and target protocols are
/// the same this copies the message; when they differ it transcodes. The
/// output carries no framing, a transport wraps it independently.
pub struct ProtocolConverter {
    protocol: Box<dyn Protocol>,
    buffer: BytesMut,
}

impl ProtocolConverter {
    pub fn new(protocol: Box<dyn Protocol>) -> Self {
        Self {
            protocol,
            buffer: BytesMut::new(),
        }
    }

    /// The re-encoded message body accumulated so far.
    pub fn payload(&self) -> &[u8] {
        &self.buffer
    }

    pub fn on_event(&mut self, event: DecoderEvent) -> Result<FilterStatus, Error> {
        let Self { protocol, buffer } = self;

        match event {
            DecoderEvent::MessageBegin(metadata) => {
                protocol.write_message_begin(buffer, &metadata.borrow())?
            }
            DecoderEvent::MessageEnd => protocol.write_message_end(buffer)?,
            DecoderEvent::StructBegin(name) => protocol.write_struct_begin(buffer, &name)?,
            DecoderEvent::StructEnd => {
                protocol.write_field_stop(buffer)?;
                protocol.write_struct_end(buffer)?;
            }
            DecoderEvent::FieldBegin(name, field_type, field_id) => {
                protocol.write_field_begin(buffer, &name, field_type, field_id)?
            }
            DecoderEvent::FieldEnd => protocol.write_field_end(buffer)?,
            DecoderEvent::BoolValue(value) => protocol.write_bool(buffer, value)?,
            DecoderEvent::ByteValue(value) => protocol.write_byte(buffer, value)?,
            DecoderEvent::Int16Value(value) => protocol.write_i16(buffer, value)?,
            DecoderEvent::Int32Value(value) => protocol.write_i32(buffer, value)?,
            DecoderEvent::Int64Value(value) => protocol.write_i64(buffer, value)?,
            DecoderEvent::DoubleValue(value) => protocol.write_double(buffer, value)?,
            DecoderEvent::StringValue(value) => protocol.write_string(buffer, &value)?,
            DecoderEvent::MapBegin(key_type, value_type, size) => {
                protocol.write_map_begin(buffer, key_type, value_type, size)?
            }
            DecoderEvent::MapEnd => protocol.write_map_end(buffer)?,
            DecoderEvent::ListBegin(elem_type, size) => {
                protocol.write_list_begin(buffer, elem_type, size)?
            }
            DecoderEvent::ListEnd => protocol.write_list_end(buffer)?,
            DecoderEvent::SetBegin(elem_type, size) => {
                protocol.write_set_begin(buffer, elem_type, size)?
            }
            DecoderEvent::SetEnd => protocol.write_set_end(buffer)?,
            // framing is the owner's concern
            DecoderEvent::TransportEnd => {}
        }

        Ok(FilterStatus::Continue)
    }
}
