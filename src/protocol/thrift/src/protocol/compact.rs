// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use bytes::{Buf, BufMut, BytesMut};

use super::{
    put_varint_u32, put_varint_u64, zigzag_decode_i32, zigzag_decode_i64, zigzag_encode_i32,
    zigzag_encode_i64, ByteReader, Protocol,
};
use crate::{Error, FieldType, MessageMetadata, MessageType, ProtocolType};

const PROTOCOL_ID: u8 = 0x82;
const VERSION: u8 = 1;
const VERSION_MASK: u8 = 0x1f;
const TYPE_SHIFT: u8 = 5;

// compact wire type codes
const CT_BOOLEAN_TRUE: u8 = 1;
const CT_BOOLEAN_FALSE: u8 = 2;
const CT_BYTE: u8 = 3;
const CT_I16: u8 = 4;
const CT_I32: u8 = 5;
const CT_I64: u8 = 6;
const CT_DOUBLE: u8 = 7;
const CT_BINARY: u8 = 8;
const CT_LIST: u8 = 9;
const CT_SET: u8 = 10;
const CT_MAP: u8 = 11;
const CT_STRUCT: u8 = 12;

fn field_type_from_compact(value: u8) -> Result<FieldType, Error> {
    match value {
        0 => Ok(FieldType::Stop),
        CT_BOOLEAN_TRUE | CT_BOOLEAN_FALSE => Ok(FieldType::Bool),
        CT_BYTE => Ok(FieldType::Byte),
        CT_I16 => Ok(FieldType::I16),
        CT_I32 => Ok(FieldType::I32),
        CT_I64 => Ok(FieldType::I64),
        CT_DOUBLE => Ok(FieldType::Double),
        CT_BINARY => Ok(FieldType::String),
        CT_LIST => Ok(FieldType::List),
        CT_SET => Ok(FieldType::Set),
        CT_MAP => Ok(FieldType::Map),
        CT_STRUCT => Ok(FieldType::Struct),
        _ => Err(Error::Decode(format!(
            "unknown compact protocol field type {}",
            value
        ))),
    }
}

fn field_type_to_compact(field_type: FieldType) -> Result<u8, Error> {
    match field_type {
        FieldType::Stop => Ok(0),
        FieldType::Bool => Ok(CT_BOOLEAN_TRUE),
        FieldType::Byte => Ok(CT_BYTE),
        FieldType::I16 => Ok(CT_I16),
        FieldType::I32 => Ok(CT_I32),
        FieldType::I64 => Ok(CT_I64),
        FieldType::Double => Ok(CT_DOUBLE),
        FieldType::String => Ok(CT_BINARY),
        FieldType::List => Ok(CT_LIST),
        FieldType::Set => Ok(CT_SET),
        FieldType::Map => Ok(CT_MAP),
        FieldType::Struct => Ok(CT_STRUCT),
        FieldType::Void => Err(Error::Decode(
            "void is not representable in the compact protocol".to_string(),
        )),
    }
}

/// The Thrift compact protocol. Integers are zigzag varints, field headers
/// carry an id delta from the previous field of the enclosing struct, and
/// bool field values are folded into the field header itself. Unlike binary,
/// the codec is stateful: it tracks the enclosing struct's last field id and
/// any bool value pending between field begin and the value read.
#[derive(Default)]
pub struct CompactProtocol {
    read_last_field: i16,
    read_field_stack: Vec<i16>,
    pending_read_bool: Option<bool>,
    write_last_field: i16,
    write_field_stack: Vec<i16>,
    pending_write_bool_field: Option<i16>,
}

impl CompactProtocol {
    pub fn new() -> Self {
        Default::default()
    }

    fn put_field_header(&mut self, out: &mut BytesMut, type_code: u8, field_id: i16) {
        let delta = i32::from(field_id) - i32::from(self.write_last_field);
        if delta > 0 && delta <= 15 {
            out.put_u8(((delta as u8) << 4) | type_code);
        } else {
            out.put_u8(type_code);
            put_varint_u32(out, zigzag_encode_i32(i32::from(field_id)));
        }
        self.write_last_field = field_id;
    }
}

impl Protocol for CompactProtocol {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Compact
    }

    fn read_message_begin(
        &mut self,
        buffer: &mut BytesMut,
        metadata: &mut MessageMetadata,
    ) -> Result<bool, Error> {
        let (name, message_type, sequence_id, consumed) = {
            let mut reader = ByteReader::new(buffer);

            let Some(protocol_id) = reader.u8() else {
                return Ok(false);
            };
            if protocol_id != PROTOCOL_ID {
                return Err(Error::Decode(format!(
                    "invalid compact protocol id 0x{:02x}",
                    protocol_id
                )));
            }

            let Some(version_and_type) = reader.u8() else {
                return Ok(false);
            };
            let version = version_and_type & VERSION_MASK;
            if version != VERSION {
                return Err(Error::Decode(format!(
                    "invalid compact protocol version {}",
                    version
                )));
            }
            let raw_type = (version_and_type >> TYPE_SHIFT) & 0x07;
            let Some(message_type) = MessageType::from_wire(raw_type) else {
                return Err(Error::Decode(format!(
                    "invalid compact protocol message type {}",
                    raw_type
                )));
            };

            let Some(sequence_id) = reader.varint_u32()? else {
                return Ok(false);
            };
            let Some(name_len) = reader.varint_u32()? else {
                return Ok(false);
            };
            let Some(name) = reader.bytes(name_len as usize) else {
                return Ok(false);
            };
            let name = String::from_utf8_lossy(name).into_owned();

            (name, message_type, sequence_id as i32, reader.consumed())
        };

        buffer.advance(consumed);
        self.read_last_field = 0;
        self.read_field_stack.clear();
        self.pending_read_bool = None;
        metadata.set_method_name(name);
        metadata.set_message_type(message_type);
        metadata.set_sequence_id(sequence_id);
        Ok(true)
    }

    fn read_message_end(&mut self, _buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        Ok(Some(()))
    }

    fn read_struct_begin(&mut self, _buffer: &mut BytesMut) -> Result<Option<String>, Error> {
        self.read_field_stack.push(self.read_last_field);
        self.read_last_field = 0;
        Ok(Some(String::new()))
    }

    fn read_struct_end(&mut self, _buffer: &mut BytesMut) -> Result<Option<()>, Error> {
        self.read_last_field = self.read_field_stack.pop().unwrap_or(0);
        Ok(Some(()))
    }

    fn read_field_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(String, FieldType, i16)>, Error> {
        let (field_type, field_id, pending_bool, consumed) = {
            let mut reader = ByteReader::new(buffer);

            let Some(header) = reader.u8() else {
                return Ok(None);
            };
            if header == 0 {
                (FieldType::Stop, 0i16, None, reader.consumed())
            } else {
                let type_code = header & 0x0f;
                let delta = (header >> 4) & 0x0f;

                let field_id = if delta == 0 {
                    let Some(raw) = reader.varint_u32()? else {
                        return Ok(None);
                    };
                    zigzag_decode_i32(raw) as i16
                } else {
                    self.read_last_field.wrapping_add(i16::from(delta))
                };

                let field_type = field_type_from_compact(type_code)?;
                let pending_bool = match type_code {
                    CT_BOOLEAN_TRUE => Some(true),
                    CT_BOOLEAN_FALSE => Some(false),
                    _ => None,
                };

                (field_type, field_id, pending_bool, reader.consumed())
            }
        };

        buffer.advance(consumed);
        if field_type != FieldType::Stop {
            self.read_last_field = field_id;
            self.pending_read_bool = pending_bool;
        }
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

            let Some(size) = reader.varint_u32()? else {
                return Ok(None);
            };

            if size == 0 {
                (FieldType::Stop, FieldType::Stop, 0, reader.consumed())
            } else {
                let Some(types) = reader.u8() else {
                    return Ok(None);
                };
                (
                    field_type_from_compact((types >> 4) & 0x0f)?,
                    field_type_from_compact(types & 0x0f)?,
                    size,
                    reader.consumed(),
                )
            }
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

            let Some(header) = reader.u8() else {
                return Ok(None);
            };
            let elem_type = field_type_from_compact(header & 0x0f)?;
            let short_size = (header >> 4) & 0x0f;

            let size = if short_size == 0x0f {
                let Some(size) = reader.varint_u32()? else {
                    return Ok(None);
                };
                size
            } else {
                u32::from(short_size)
            };

            (elem_type, size, reader.consumed())
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
        // bool struct fields carry their value in the field header
        if let Some(value) = self.pending_read_bool.take() {
            return Ok(Some(value));
        }
        if buffer.is_empty() {
            return Ok(None);
        }
        let value = buffer[0] == CT_BOOLEAN_TRUE;
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
        Ok(self.read_i32(buffer)?.map(|v| v as i16))
    }

    fn read_i32(&mut self, buffer: &mut BytesMut) -> Result<Option<i32>, Error> {
        let mut reader = ByteReader::new(buffer);
        let Some(raw) = reader.varint_u32()? else {
            return Ok(None);
        };
        let consumed = reader.consumed();
        buffer.advance(consumed);
        Ok(Some(zigzag_decode_i32(raw)))
    }

    fn read_i64(&mut self, buffer: &mut BytesMut) -> Result<Option<i64>, Error> {
        let mut reader = ByteReader::new(buffer);
        let Some(raw) = reader.varint_u64()? else {
            return Ok(None);
        };
        let consumed = reader.consumed();
        buffer.advance(consumed);
        Ok(Some(zigzag_decode_i64(raw)))
    }

    fn read_double(&mut self, buffer: &mut BytesMut) -> Result<Option<f64>, Error> {
        // compact protocol doubles are little-endian on the wire
        let mut reader = ByteReader::new(buffer);
        let Some(value) = reader.le_f64() else {
            return Ok(None);
        };
        let consumed = reader.consumed();
        buffer.advance(consumed);
        Ok(Some(value))
    }

    fn read_string(&mut self, buffer: &mut BytesMut) -> Result<Option<Vec<u8>>, Error> {
        let (value, consumed) = {
            let mut reader = ByteReader::new(buffer);

            let Some(len) = reader.varint_u32()? else {
                return Ok(None);
            };
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

        self.write_last_field = 0;
        self.write_field_stack.clear();
        self.pending_write_bool_field = None;

        out.put_u8(PROTOCOL_ID);
        out.put_u8((message_type.as_wire() << TYPE_SHIFT) | (VERSION & VERSION_MASK));
        put_varint_u32(out, sequence_id as u32);
        put_varint_u32(out, name.len() as u32);
        out.put_slice(name.as_bytes());
        Ok(())
    }

    fn write_message_end(&mut self, _out: &mut BytesMut) -> Result<(), Error> {
        Ok(())
    }

    fn write_struct_begin(&mut self, _out: &mut BytesMut, _name: &str) -> Result<(), Error> {
        self.write_field_stack.push(self.write_last_field);
        self.write_last_field = 0;
        Ok(())
    }

    fn write_struct_end(&mut self, _out: &mut BytesMut) -> Result<(), Error> {
        self.write_last_field = self.write_field_stack.pop().unwrap_or(0);
        Ok(())
    }

    fn write_field_begin(
        &mut self,
        out: &mut BytesMut,
        _name: &str,
        field_type: FieldType,
        field_id: i16,
    ) -> Result<(), Error> {
        if field_type == FieldType::Bool {
            // deferred until the value is known, the header carries it
            self.pending_write_bool_field = Some(field_id);
            return Ok(());
        }

        let type_code = field_type_to_compact(field_type)?;
        self.put_field_header(out, type_code, field_id);
        Ok(())
    }

    fn write_field_end(&mut self, _out: &mut BytesMut) -> Result<(), Error> {
        Ok(())
    }

    fn write_field_stop(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        out.put_u8(0);
        Ok(())
    }

    fn write_map_begin(
        &mut self,
        out: &mut BytesMut,
        key_type: FieldType,
        value_type: FieldType,
        size: u32,
    ) -> Result<(), Error> {
        put_varint_u32(out, size);
        if size > 0 {
            let key = field_type_to_compact(key_type)?;
            let value = field_type_to_compact(value_type)?;
            out.put_u8((key << 4) | value);
        }
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
        let type_code = field_type_to_compact(elem_type)?;
        if size < 15 {
            out.put_u8(((size as u8) << 4) | type_code);
        } else {
            out.put_u8(0xf0 | type_code);
            put_varint_u32(out, size);
        }
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
        let type_code = if value { CT_BOOLEAN_TRUE } else { CT_BOOLEAN_FALSE };
        match self.pending_write_bool_field.take() {
            Some(field_id) => self.put_field_header(out, type_code, field_id),
            None => out.put_u8(type_code),
        }
        Ok(())
    }

    fn write_byte(&mut self, out: &mut BytesMut, value: i8) -> Result<(), Error> {
        out.put_i8(value);
        Ok(())
    }

    fn write_i16(&mut self, out: &mut BytesMut, value: i16) -> Result<(), Error> {
        self.write_i32(out, i32::from(value))
    }

    fn write_i32(&mut self, out: &mut BytesMut, value: i32) -> Result<(), Error> {
        put_varint_u32(out, zigzag_encode_i32(value));
        Ok(())
    }

    fn write_i64(&mut self, out: &mut BytesMut, value: i64) -> Result<(), Error> {
        put_varint_u64(out, zigzag_encode_i64(value));
        Ok(())
    }

    fn write_double(&mut self, out: &mut BytesMut, value: f64) -> Result<(), Error> {
        out.put_slice(&value.to_le_bytes());
        Ok(())
    }

    fn write_string(&mut self, out: &mut BytesMut, value: &[u8]) -> Result<(), Error> {
        put_varint_u32(out, value.len() as u32);
        out.put_slice(value);
        Ok(())
    }
}
