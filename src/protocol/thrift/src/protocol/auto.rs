// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use bytes::BytesMut;

use super::{BinaryProtocol, CompactProtocol, Protocol};
use crate::{Error, FieldType, MessageMetadata, ProtocolType};

/// Protocol which sniffs the first bytes of the first message to decide
/// between binary and compact, then behaves as the detected protocol. After
/// detection `protocol_type` reports the concrete type.
#[derive(Default)]
pub struct AutoProtocol {
    inner: Option<Box<dyn Protocol>>,
}

impl AutoProtocol {
    pub fn new() -> Self {
        Default::default()
    }

    fn inner(&mut self) -> Result<&mut Box<dyn Protocol>, Error> {
        self.inner
            .as_mut()
            .ok_or_else(|| Error::Decode("auto protocol is not resolved".to_string()))
    }
}

impl Protocol for AutoProtocol {
    fn protocol_type(&self) -> ProtocolType {
        match &self.inner {
            Some(protocol) => protocol.protocol_type(),
            None => ProtocolType::Auto,
        }
    }

    fn read_message_begin(
        &mut self,
        buffer: &mut BytesMut,
        metadata: &mut MessageMetadata,
    ) -> Result<bool, Error> {
        if self.inner.is_none() {
            if buffer.len() < 2 {
                return Ok(false);
            }

            if buffer[0] == 0x80 && buffer[1] == 0x01 {
                debug!("detected binary protocol");
                self.inner = Some(Box::new(BinaryProtocol::new()));
            } else if buffer[0] == 0x82 && (buffer[1] & 0x1f) == 1 {
                debug!("detected compact protocol");
                self.inner = Some(Box::new(CompactProtocol::new()));
            } else {
                return Err(Error::Decode(format!(
                    "unknown thrift auto protocol message start 0x{:02x}{:02x}",
                    buffer[0], buffer[1]
                )));
            }
        }

        self.inner()?.read_message_begin(buffer, metadata)
    }

    fn read_message_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.inner()?.read_message_end(buffer)
    }

    fn read_struct_begin(&mut self, buffer: &mut BytesMut) -> Result<Option<String>, Error> {
        self.inner()?.read_struct_begin(buffer)
    }

    fn read_struct_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.inner()?.read_struct_end(buffer)
    }

    fn read_field_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(String, FieldType, i16)>, Error> {
        self.inner()?.read_field_begin(buffer)
    }

    fn read_field_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.inner()?.read_field_end(buffer)
    }

    fn read_map_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(FieldType, FieldType, u32)>, Error> {
        self.inner()?.read_map_begin(buffer)
    }

    fn read_map_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.inner()?.read_map_end(buffer)
    }

    fn read_list_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(FieldType, u32)>, Error> {
        self.inner()?.read_list_begin(buffer)
    }

    fn read_list_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.inner()?.read_list_end(buffer)
    }

    fn read_set_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(FieldType, u32)>, Error> {
        self.inner()?.read_set_begin(buffer)
    }

    fn read_set_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.inner()?.read_set_end(buffer)
    }

    fn read_bool(&mut self, buffer: &mut BytesMut) -> Result<Option<bool>, Error> {
        self.inner()?.read_bool(buffer)
    }

    fn read_byte(&mut self, buffer: &mut BytesMut) -> Result<Option<i8>, Error> {
        self.inner()?.read_byte(buffer)
    }

    fn read_i16(&mut self, buffer: &mut BytesMut) -> Result<Option<i16>, Error> {
        self.inner()?.read_i16(buffer)
    }

    fn read_i32(&mut self, buffer: &mut BytesMut) -> Result<Option<i32>, Error> {
        self.inner()?.read_i32(buffer)
    }

    fn read_i64(&mut self, buffer: &mut BytesMut) -> Result<Option<i64>, Error> {
        self.inner()?.read_i64(buffer)
    }

    fn read_double(&mut self, buffer: &mut BytesMut) -> Result<Option<f64>, Error> {
        self.inner()?.read_double(buffer)
    }

    fn read_string(&mut self, buffer: &mut BytesMut) -> Result<Option<Vec<u8>>, Error> {
        self.inner()?.read_string(buffer)
    }

    fn write_message_begin(
        &mut self,
        out: &mut BytesMut,
        metadata: &MessageMetadata,
    ) -> Result<(), Error> {
        self.inner()?.write_message_begin(out, metadata)
    }

    fn write_message_end(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner()?.write_message_end(out)
    }

    fn write_struct_begin(&mut self, out: &mut BytesMut, name: &str) -> Result<(), Error> {
        self.inner()?.write_struct_begin(out, name)
    }

    fn write_struct_end(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner()?.write_struct_end(out)
    }

    fn write_field_begin(
        &mut self,
        out: &mut BytesMut,
        name: &str,
        field_type: FieldType,
        field_id: i16,
    ) -> Result<(), Error> {
        self.inner()?.write_field_begin(out, name, field_type, field_id)
    }

    fn write_field_end(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner()?.write_field_end(out)
    }

    fn write_field_stop(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner()?.write_field_stop(out)
    }

    fn write_map_begin(
        &mut self,
        out: &mut BytesMut,
        key_type: FieldType,
        value_type: FieldType,
        size: u32,
    ) -> Result<(), Error> {
        self.inner()?.write_map_begin(out, key_type, value_type, size)
    }

    fn write_map_end(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner()?.write_map_end(out)
    }

    fn write_list_begin(
        &mut self,
        out: &mut BytesMut,
        elem_type: FieldType,
        size: u32,
    ) -> Result<(), Error> {
        self.inner()?.write_list_begin(out, elem_type, size)
    }

    fn write_list_end(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner()?.write_list_end(out)
    }

    fn write_set_begin(
        &mut self,
        out: &mut BytesMut,
        elem_type: FieldType,
        size: u32,
    ) -> Result<(), Error> {
        self.inner()?.write_set_begin(out, elem_type, size)
    }

    fn write_set_end(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.inner()?.write_set_end(out)
    }

    fn write_bool(&mut self, out: &mut BytesMut, value: bool) -> Result<(), Error> {
        self.inner()?.write_bool(out, value)
    }

    fn write_byte(&mut self, out: &mut BytesMut, value: i8) -> Result<(), Error> {
        self.inner()?.write_byte(out, value)
    }

    fn write_i16(&mut self, out: &mut BytesMut, value: i16) -> Result<(), Error> {
        self.inner()?.write_i16(out, value)
    }

    fn write_i32(&mut self, out: &mut BytesMut, value: i32) -> Result<(), Error> {
        self.inner()?.write_i32(out, value)
    }

    fn write_i64(&mut self, out: &mut BytesMut, value: i64) -> Result<(), Error> {
        self.inner()?.write_i64(out, value)
    }

    fn write_double(&mut self, out: &mut BytesMut, value: f64) -> Result<(), Error> {
        self.inner()?.write_double(out, value)
    }

    fn write_string(&mut self, out: &mut BytesMut, value: &[u8]) -> Result<(), Error> {
        self.inner()?.write_string(out, value)
    }
}
