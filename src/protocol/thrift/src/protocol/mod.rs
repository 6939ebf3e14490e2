// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use bytes::BytesMut;

use crate::app_exception::DirectResponse;
use crate::decoder::DecoderEventHandler;
use crate::{Error, FieldType, MessageMetadata, ProtocolType};

mod auto;
mod binary;
mod compact;

pub use auto::AutoProtocol;
pub use binary::BinaryProtocol;
pub use compact::CompactProtocol;

/// A Thrift encoding layer.
///
/// Every `read_*` returns `Ok(None)` when the buffer does not yet hold the
/// complete item and consumes nothing in that case, which makes each read
/// safe to retry once more bytes arrive. Successful reads consume exactly the
/// item's bytes. The `write_*` side appends the wire form of each item to the
/// output buffer.
pub trait Protocol {
    fn protocol_type(&self) -> ProtocolType;

    fn read_message_begin(
        &mut self,
        buffer: &mut BytesMut,
        metadata: &mut MessageMetadata,
    ) -> Result<bool, Error>;
    fn read_message_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error>;
    fn read_struct_begin(&mut self, buffer: &mut BytesMut) -> Result<Option<String>, Error>;
    fn read_struct_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error>;
    fn read_field_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(String, FieldType, i16)>, Error>;
    fn read_field_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error>;
    fn read_map_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(FieldType, FieldType, u32)>, Error>;
    fn read_map_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error>;
    fn read_list_begin(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<(FieldType, u32)>, Error>;
    fn read_list_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error>;
    fn read_set_begin(&mut self, buffer: &mut BytesMut)
        -> Result<Option<(FieldType, u32)>, Error>;
    fn read_set_end(&mut self, buffer: &mut BytesMut) -> Result<Option<()>, Error>;
    fn read_bool(&mut self, buffer: &mut BytesMut) -> Result<Option<bool>, Error>;
    fn read_byte(&mut self, buffer: &mut BytesMut) -> Result<Option<i8>, Error>;
    fn read_i16(&mut self, buffer: &mut BytesMut) -> Result<Option<i16>, Error>;
    fn read_i32(&mut self, buffer: &mut BytesMut) -> Result<Option<i32>, Error>;
    fn read_i64(&mut self, buffer: &mut BytesMut) -> Result<Option<i64>, Error>;
    fn read_double(&mut self, buffer: &mut BytesMut) -> Result<Option<f64>, Error>;
    fn read_string(&mut self, buffer: &mut BytesMut) -> Result<Option<Vec<u8>>, Error>;

    fn write_message_begin(
        &mut self,
        out: &mut BytesMut,
        metadata: &MessageMetadata,
    ) -> Result<(), Error>;
    fn write_message_end(&mut self, out: &mut BytesMut) -> Result<(), Error>;
    fn write_struct_begin(&mut self, out: &mut BytesMut, name: &str) -> Result<(), Error>;
    fn write_struct_end(&mut self, out: &mut BytesMut) -> Result<(), Error>;
    fn write_field_begin(
        &mut self,
        out: &mut BytesMut,
        name: &str,
        field_type: FieldType,
        field_id: i16,
    ) -> Result<(), Error>;
    fn write_field_end(&mut self, out: &mut BytesMut) -> Result<(), Error>;
    fn write_field_stop(&mut self, out: &mut BytesMut) -> Result<(), Error>;
    fn write_map_begin(
        &mut self,
        out: &mut BytesMut,
        key_type: FieldType,
        value_type: FieldType,
        size: u32,
    ) -> Result<(), Error>;
    fn write_map_end(&mut self, out: &mut BytesMut) -> Result<(), Error>;
    fn write_list_begin(
        &mut self,
        out: &mut BytesMut,
        elem_type: FieldType,
        size: u32,
    ) -> Result<(), Error>;
    fn write_list_end(&mut self, out: &mut BytesMut) -> Result<(), Error>;
    fn write_set_begin(
        &mut self,
        out: &mut BytesMut,
        elem_type: FieldType,
        size: u32,
    ) -> Result<(), Error>;
    fn write_set_end(&mut self, out: &mut BytesMut) -> Result<(), Error>;
    fn write_bool(&mut self, out: &mut BytesMut, value: bool) -> Result<(), Error>;
    fn write_byte(&mut self, out: &mut BytesMut, value: i8) -> Result<(), Error>;
    fn write_i16(&mut self, out: &mut BytesMut, value: i16) -> Result<(), Error>;
    fn write_i32(&mut self, out: &mut BytesMut, value: i32) -> Result<(), Error>;
    fn write_i64(&mut self, out: &mut BytesMut, value: i64) -> Result<(), Error>;
    fn write_double(&mut self, out: &mut BytesMut, value: f64) -> Result<(), Error>;
    fn write_string(&mut self, out: &mut BytesMut, value: &[u8]) -> Result<(), Error>;

    /// Whether this protocol can negotiate an upgraded variant of itself.
    fn supports_upgrade(&self) -> bool {
        false
    }

    /// Returns the event sink which consumes the body of an upgrade request
    /// message, for protocols which support upgrade.
    fn upgrade_request_decoder(&mut self) -> Option<Box<dyn DecoderEventHandler>> {
        None
    }

    /// Builds the reply to a consumed upgrade request. The handler passed in
    /// is the one previously returned by `upgrade_request_decoder`.
    fn upgrade_response(
        &self,
        _decoder: &dyn DecoderEventHandler,
    ) -> Option<Box<dyn DirectResponse>> {
        None
    }
}

/// Constructs a protocol of the given type.
pub fn new_protocol(which: ProtocolType) -> Box<dyn Protocol> {
    match which {
        ProtocolType::Binary => Box::new(BinaryProtocol::new()),
        ProtocolType::Compact => Box::new(CompactProtocol::new()),
        ProtocolType::Auto => Box::new(AutoProtocol::new()),
    }
}

/// Non-consuming cursor over the readable bytes of a buffer. Reads advance a
/// local position; callers commit by advancing the underlying buffer with
/// `consumed()` only after an entire item has parsed.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn u8(&mut self) -> Option<u8> {
        let value = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(value)
    }

    pub fn i8(&mut self) -> Option<i8> {
        self.u8().map(|v| v as i8)
    }

    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(slice)
    }

    pub fn be_i16(&mut self) -> Option<i16> {
        self.bytes(2).map(|b| i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn be_i32(&mut self) -> Option<i32> {
        self.bytes(4)
            .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn be_i64(&mut self) -> Option<i64> {
        self.bytes(8)
            .map(|b| i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn be_f64(&mut self) -> Option<f64> {
        self.be_i64().map(|v| f64::from_bits(v as u64))
    }

    pub fn le_f64(&mut self) -> Option<f64> {
        self.bytes(8).map(|b| {
            f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    pub fn varint_u32(&mut self) -> Result<Option<u32>, Error> {
        self.varint(5).map(|v| v.map(|v| v as u32))
    }

    pub fn varint_u64(&mut self) -> Result<Option<u64>, Error> {
        self.varint(10)
    }

    fn varint(&mut self, max_bytes: usize) -> Result<Option<u64>, Error> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        for _ in 0..max_bytes {
            let Some(byte) = self.u8() else {
                return Ok(None);
            };
            result |= u64::from(byte & 0x7f).wrapping_shl(shift);
            if byte & 0x80 == 0 {
                return Ok(Some(result));
            }
            shift += 7;
        }
        Err(Error::Decode("malformed compact protocol varint".to_string()))
    }
}

pub(crate) fn zigzag_decode_i32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

pub(crate) fn zigzag_decode_i64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub(crate) fn zigzag_encode_i32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

pub(crate) fn zigzag_encode_i64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub(crate) fn put_varint_u32(out: &mut BytesMut, value: u32) {
    put_varint_u64(out, u64::from(value))
}

pub(crate) fn put_varint_u64(out: &mut BytesMut, mut value: u64) {
    use bytes::BufMut;

    loop {
        if value & !0x7f == 0 {
            out.put_u8(value as u8);
            return;
        }
        out.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut out = BytesMut::new();
            put_varint_u64(&mut out, value);
            let mut reader = ByteReader::new(&out);
            assert_eq!(reader.varint_u64().unwrap(), Some(value));
            assert_eq!(reader.consumed(), out.len());
        }
    }

    #[test]
    fn varint_underflow() {
        let mut reader = ByteReader::new(&[0x80, 0x80]);
        assert_eq!(reader.varint_u32().unwrap(), None);
    }

    #[test]
    fn varint_rejects_overlong() {
        let bytes = [0x80u8; 11];
        let mut reader = ByteReader::new(&bytes);
        assert!(reader.varint_u64().is_err());
    }

    #[test]
    fn zigzag_round_trip() {
        for value in [0i32, -1, 1, 63, -64, i32::MIN, i32::MAX] {
            assert_eq!(zigzag_decode_i32(zigzag_encode_i32(value)), value);
        }
        for value in [0i64, -1, 1, i64::MIN, i64::MAX] {
            assert_eq!(zigzag_decode_i64(zigzag_encode_i64(value)), value);
        }
    }

    #[test]
    fn reader_does_not_consume_past_end() {
        let mut reader = ByteReader::new(&[0x01, 0x02]);
        assert_eq!(reader.be_i32(), None);
        assert_eq!(reader.consumed(), 0);
        assert_eq!(reader.u8(), Some(0x01));
        assert_eq!(reader.consumed(), 1);
    }
}
