// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use bytes::{Buf, BufMut, BytesMut};

use super::{ByteReader, Protocol};
use crate::{Error, FieldType, MessageMetadata, MessageType, ProtocolType};

// Strict binary protocol messages open with this magic in the two high bytes
// of the version word.
const MAGIC: u16 = 0x8001;

/// The Thrift strict binary protocol. All integers are big-endian and the
/// encoding carries no state, every item is self-delimiting.
#[derive(Default)]
pub struct BinaryProtocol {}

impl BinaryProtocol {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Protocol for BinaryProtocol {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Binary
    }

    fn read_message_begin(
        &mut self,
        buffer: &mut BytesMut,
        metadata: &mut MessageMetadata,
    ) -> Result<bool, Error> {
        let (name, message_type, sequence_id, consumed) = {
            let mut reader = ByteReader::new(buffer);

            let Some(version) = reader.be_i32() else {
                return Ok(false);
            };
            let magic = ((version >> 16) & 0xffff) as u16;
            if magic != MAGIC {
                return Err(Error::Decode(format!(
                    "invalid binary protocol version 0x{:04x}",
                    magic
                )));
            }

            let raw_type = (version & 0xff) as u8;
            let Some(message_type) = MessageType::from_wire(raw_type) else {
                return Err(Error::Decode(format!(
                    "invalid binary protocol message type {}",
                    raw_type
                )));
            };

            let Some(name_len) = reader.be_i32() else {
                return Ok(false);
            };
            if name_len < 0 {
                return Err(Error::Decode(format!(
                    "negative binary protocol message name length {}",
                    name_len
                )));
            }
            let Some(name) = reader.bytes(name_len as usize) else {
                return Ok(false);
            };
            let name = String::from_utf8_lossy(name).into_owned();

            let Some(sequence_id) = reader.be_i32() else {
                return Ok(false);
            };

            (name, message_type, sequence_id, reader.consumed())
        };

        buffer.advance(consumed);
        metadata.set_method_name(name);
        metadata.set_message_type(message_type);
        metadata.set_sequence_id(sequence_id);
        Ok(true)
    }

    fn read_message_end(&mut self, _buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        Ok(Some(()))
    }

    fn read_struct_begin(&mut self, _buffer: &mut BytesMut) -> Result<Option<String>, Error> {
        Ok(Some(String::new()))
    }

    fn read_struct_end(&mut self, _buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        Ok(Some(()))
    }

    fn read_field_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(String, FieldType, i16)>, Error> {
        let (field_type, field_id, consumed) = {
            let mut reader = ByteReader::new(buffer);

            let Some(raw_type) = reader.u8() else {
                return Ok(None);
            };
            let field_type = FieldType::from_binary(raw_type)?;
            if field_type == FieldType::Stop {
                (field_type, 0, reader.consumed())
            } else {
                let Some(field_id) = reader.be_i16() else {
                    return Ok(None);
                };
                (field_type, field_id, reader.consumed())
            }
        };

        buffer.advance(consumed);
        Ok(Some((String::new(), field_type, field_id)))
    }

    fn read_field_end(&mut self, _buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        Ok(Some(()))
    }

    fn read_map_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(FieldType, FieldType, u32)>, Error> {
        let (key_type, value_type, size, consumed) = {
            let mut reader = ByteReader::new(buffer);

            let Some(raw_key) = reader.u8() else {
                return Ok(None);
            };
            let Some(raw_value) = reader.u8() else {
                return Ok(None);
            };
            let Some(size) = reader.be_i32() else {
                return Ok(None);
            };
            if size < 0 {
                return Err(Error::Decode(format!(
                    "negative binary protocol map size {}",
                    size
                )));
            }

            (
                FieldType::from_binary(raw_key)?,
                FieldType::from_binary(raw_value)?,
                size as u32,
                reader.consumed(),
            )
        };

        buffer.advance(consumed);
        Ok(Some((key_type, value_type, size)))
    }

    fn read_map_end(&mut self, _buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        Ok(Some(()))
    }

    fn read_list_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(FieldType, u32)>, Error> {
        let (elem_type, size, consumed) = {
            let mut reader = ByteReader::new(buffer);

            let Some(raw_elem) = reader.u8() else {
                return Ok(None);
            };
            let Some(size) = reader.be_i32() else {
                return Ok(None);
            };
            if size < 0 {
                return Err(Error::Decode(format!(
                    "negative binary protocol list size {}",
                    size
                )));
            }

            (FieldType::from_binary(raw_elem)?, size as u32, reader.consumed())
        };

        buffer.advance(consumed);
        Ok(Some((elem_type, size)))
    }

    fn read_list_end(&mut self, _buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        Ok(Some(()))
    }

    fn read_set_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(FieldType, u32)>, Error> {
        self.read_list_begin(buffer)
    }

    fn read_set_end(&mut self, _buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        Ok(Some(()))
    }

    fn read_bool(&mut self, buffer: &mut BytesMut) -> Result<Option<bool>, Error> {
        if buffer.is_empty() {
            return Ok(None);
        }
        let value = buffer[0] != 0;
        buffer.advance(1);
        Ok(Some(value))
    }

    fn read_byte(&mut self, buffer: &mut BytesMut) -> Result<Option<i8>, Error> {
        if buffer.is_empty() {
            return Ok(None);
        }
        let value = buffer[0] as i8;
        buffer.advance(1);
        Ok(Some(value))
    }

    fn read_i16(&mut self, buffer: &mut BytesMut) -> Result<Option<i16>, Error> {
        let mut reader = ByteReader::new(buffer);
        let Some(value) = reader.be_i16() else {
            return Ok(None);
        };
        let consumed = reader.consumed();
        buffer.advance(consumed);
        Ok(Some(value))
    }

    fn read_i32(&mut self, buffer: &mut BytesMut) -> Result<Option<i32>, Error> {
        let mut reader = ByteReader::new(buffer);
        let Some(value) = reader.be_i32() else {
            return Ok(None);
        };
        let consumed = reader.consumed();
        buffer.advance(consumed);
        Ok(Some(value))
    }

    fn read_i64(&mut self, buffer: &mut BytesMut) -> Result<Option<i64>, Error> {
        let mut reader = ByteReader::new(buffer);
        let Some(value) = reader.be_i64() else {
            return Ok(None);
        };
        let consumed = reader.consumed();
        buffer.advance(consumed);
        Ok(Some(value))
    }

    fn read_double(&mut self, buffer: &mut BytesMut) -> Result<Option<f64>, Error> {
        let mut reader = ByteReader::new(buffer);
        let Some(value) = reader.be_f64() else {
            return Ok(None);
        };
        let consumed = reader.consumed();
        buffer.advance(consumed);
        Ok(Some(value))
    }

    fn read_string(&mut self, buffer: &mut BytesMut) -> Result<Option<Vec<u8>>, Error> {
        let (value, consumed) = {
            let mut reader = ByteReader::new(buffer);

            let Some(len) = reader.be_i32() else {
                return Ok(None);
            };
            if len < 0 {
                return Err(Error::Decode(format!(
                    "negative binary protocol string length {}",
                    len
                )));
            }
            let Some(value) = reader.bytes(len as usize) else {
                return Ok(None);
            };

            (value.to_vec(), reader.consumed())
        };

        buffer.advance(consumed);
        Ok(Some(value))
    }

    fn write_message_begin(
        &mut self,
        out: &mut BytesMut,
        metadata: &MessageMetadata,
    ) -> Result<(), Error> {
        let message_type = metadata
            .message_type()
            .ok_or_else(|| Error::Decode("message metadata is missing a type".to_string()))?;
        let name = metadata.method_name().unwrap_or("");
        let sequence_id = metadata.sequence_id().unwrap_or(0);

        let version = ((MAGIC as u32) << 16) | u32::from(message_type.as_wire());
        out.put_u32(version);
        out.put_i32(name.len() as i32);
        out.put_slice(name.as_bytes());
        out.put_i32(sequence_id);
        Ok(())
    }

    fn write_message_end(&mut self, _out: &mut BytesMut) -> Result<(), Error> {
        Ok(())
    }

    fn write_struct_begin(&mut self, _out: &mut BytesMut, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    fn write_struct_end(&mut self, _out: &mut BytesMut) -> Result<(), Error> {
        Ok(())
    }

    fn write_field_begin(
        &mut self,
        out: &mut BytesMut,
        _name: &str,
        field_type: FieldType,
        field_id: i16,
    ) -> Result<(), Error> {
        out.put_u8(field_type.as_binary());
        out.put_i16(field_id);
        Ok(())
    }

    fn write_field_end(&mut self, _out: &mut BytesMut) -> Result<(), Error> {
        Ok(())
    }

    fn write_field_stop(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        out.put_u8(FieldType::Stop.as_binary());
        Ok(())
    }

    fn write_map_begin(
        &mut self,
        out: &mut BytesMut,
        key_type: FieldType,
        value_type: FieldType,
        size: u32,
    ) -> Result<(), Error> {
        out.put_u8(key_type.as_binary());
        out.put_u8(value_type.as_binary());
        out.put_i32(size as i32);
        Ok(())
    }

    fn write_map_end(&mut self, _out: &mut BytesMut) -> Result<(), Error> {
        Ok(())
    }

    fn write_list_begin(
        &mut self,
        out: &mut BytesMut,
        elem_type: FieldType,
        size: u32,
    ) -> Result<(), Error> {
        out.put_u8(elem_type.as_binary());
        out.put_i32(size as i32);
        Ok(())
    }

    fn write_list_end(&mut self, _out: &mut BytesMut) -> Result<(), Error> {
        Ok(())
    }

    fn write_set_begin(
        &mut self,
        out: &mut BytesMut,
        elem_type: FieldType,
        size: u32,
    ) -> Result<(), Error> {
        self.write_list_begin(out, elem_type, size)
    }

    fn write_set_end(&mut self, _out: &mut BytesMut) -> Result<(), Error> {
        Ok(())
    }

    fn write_bool(&mut self, out: &mut BytesMut, value: bool) -> Result<(), Error> {
        out.put_u8(value as u8);
        Ok(())
    }

    fn write_byte(&mut self, out: &mut BytesMut, value: i8) -> Result<(), Error> {
        out.put_i8(value);
        Ok(())
    }

    fn write_i16(&mut self, out: &mut BytesMut, value: i16) -> Result<(), Error> {
        out.put_i16(value);
        Ok(())
    }

    fn write_i32(&mut self, out: &mut BytesMut, value: i32) -> Result<(), Error> {
        out.put_i32(value);
        Ok(())
    }

    fn write_i64(&mut self, out: &mut BytesMut, value: i64) -> Result<(), Error> {
        out.put_i64(value);
        Ok(())
    }

    fn write_double(&mut self, out: &mut BytesMut, value: f64) -> Result<(), Error> {
        out.put_f64(value);
        Ok(())
    }

    fn write_string(&mut self, out: &mut BytesMut, value: &[u8]) -> Result<(), Error> {
        out.put_i32(value.len() as i32);
        out.put_slice(value);
        Ok(())
    }
}
