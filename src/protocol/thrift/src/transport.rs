// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use bytes::{Buf, BufMut, BytesMut};

use crate::{Error, MessageMetadata, TransportType};

const FRAME_HEADER_LEN: usize = std::mem::size_of::<u32>();

/// Upper bound on the size of a single framed message.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// A Thrift framing layer.
///
/// `decode_frame_start` and `decode_frame_end` bracket a single message and
/// return `Ok(false)` when more bytes are needed; they consume nothing until a
/// complete header is available, so both are safe to retry as data arrives.
pub trait Transport {
    fn transport_type(&self) -> TransportType;

    fn decode_frame_start(
        &mut self,
        buffer: &mut BytesMut,
        metadata: &mut MessageMetadata,
    ) -> Result<bool, Error>;

    fn decode_frame_end(&mut self, buffer: &mut BytesMut) -> Result<bool, Error>;

    fn encode_frame(
        &mut self,
        out: &mut BytesMut,
        metadata: &MessageMetadata,
        payload: &[u8],
    ) -> Result<(), Error>;
}

/// Constructs a transport of the given type.
pub fn new_transport(which: TransportType, max_frame_size: usize) -> Box<dyn Transport> {
    match which {
        TransportType::Framed => Box::new(FramedTransport::new(max_frame_size)),
        TransportType::Unframed => Box::new(UnframedTransport::new()),
        TransportType::Auto => Box::new(AutoTransport::new(max_frame_size)),
    }
}

/// Framed transport: each message is prefixed with its length as a big-endian
/// 32-bit integer.
pub struct FramedTransport {
    max_frame_size: usize,
}

impl FramedTransport {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FramedTransport {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Transport for FramedTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Framed
    }

    fn decode_frame_start(
        &mut self,
        buffer: &mut BytesMut,
        metadata: &mut MessageMetadata,
    ) -> Result<bool, Error> {
        if buffer.len() < FRAME_HEADER_LEN {
            return Ok(false);
        }

        let size = i32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        if size <= 0 || size as usize > self.max_frame_size {
            return Err(Error::Decode(format!(
                "invalid thrift framed transport frame size {}",
                size
            )));
        }

        buffer.advance(FRAME_HEADER_LEN);
        metadata.set_frame_size(size as u32);
        Ok(true)
    }

    fn decode_frame_end(&mut self, _buffer: &mut BytesMut) -> Result<bool, Error> {
        // the length prefix carries all of the framing, there is no trailer
        Ok(true)
    }

    fn encode_frame(
        &mut self,
        out: &mut BytesMut,
        _metadata: &MessageMetadata,
        payload: &[u8],
    ) -> Result<(), Error> {
        if payload.is_empty() || payload.len() > self.max_frame_size {
            return Err(Error::Decode(format!(
                "invalid thrift framed transport frame size {}",
                payload.len()
            )));
        }

        out.put_u32(payload.len() as u32);
        out.put_slice(payload);
        Ok(())
    }
}

/// Unframed transport: messages are written back to back with no framing, the
/// protocol layer alone delimits them.
#[derive(Default)]
pub struct UnframedTransport {}

impl UnframedTransport {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Transport for UnframedTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Unframed
    }

    fn decode_frame_start(
        &mut self,
        buffer: &mut BytesMut,
        _metadata: &mut MessageMetadata,
    ) -> Result<bool, Error> {
        Ok(!buffer.is_empty())
    }

    fn decode_frame_end(&mut self, _buffer: &mut BytesMut) -> Result<bool, Error> {
        Ok(true)
    }

    fn encode_frame(
        &mut self,
        out: &mut BytesMut,
        _metadata: &MessageMetadata,
        payload: &[u8],
    ) -> Result<(), Error> {
        out.put_slice(payload);
        Ok(())
    }
}

// Leading byte pairs for the protocols we can detect: strict binary opens with
// 0x80 0x01, compact with 0x82 followed by a version byte whose low five bits
// are 1.
fn is_protocol_start(bytes: &[u8]) -> bool {
    (bytes[0] == 0x80 && bytes[1] == 0x01) || (bytes[0] == 0x82 && (bytes[1] & 0x1f) == 1)
}

/// Transport which sniffs the first bytes of the connection to decide between
/// framed and unframed, then behaves as the detected transport. After
/// detection `transport_type` reports the concrete type.
pub struct AutoTransport {
    inner: Option<Box<dyn Transport>>,
    max_frame_size: usize,
}

impl AutoTransport {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            inner: None,
            max_frame_size,
        }
    }
}

impl Transport for AutoTransport {
    fn transport_type(&self) -> TransportType {
        match &self.inner {
            Some(transport) => transport.transport_type(),
            None => TransportType::Auto,
        }
    }

    fn decode_frame_start(
        &mut self,
        buffer: &mut BytesMut,
        metadata: &mut MessageMetadata,
    ) -> Result<bool, Error> {
        if self.inner.is_none() {
            if buffer.len() < 2 {
                return Ok(false);
            }

            if is_protocol_start(&buffer[0..2]) {
                debug!("detected unframed transport");
                self.inner = Some(Box::new(UnframedTransport::new()));
            } else {
                if buffer.len() < FRAME_HEADER_LEN + 2 {
                    return Ok(false);
                }

                if !is_protocol_start(&buffer[FRAME_HEADER_LEN..FRAME_HEADER_LEN + 2]) {
                    return Err(Error::Decode(format!(
                        "unknown thrift auto transport frame start 0x{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
                        buffer[0], buffer[1], buffer[2], buffer[3], buffer[4], buffer[5]
                    )));
                }

                debug!("detected framed transport");
                self.inner = Some(Box::new(FramedTransport::new(self.max_frame_size)));
            }
        }

        match self.inner.as_mut() {
            Some(transport) => transport.decode_frame_start(buffer, metadata),
            None => Ok(false),
        }
    }

    fn decode_frame_end(&mut self, buffer: &mut BytesMut) -> Result<bool, Error> {
        match self.inner.as_mut() {
            Some(transport) => transport.decode_frame_end(buffer),
            None => Ok(true),
        }
    }

    fn encode_frame(
        &mut self,
        out: &mut BytesMut,
        metadata: &MessageMetadata,
        payload: &[u8],
    ) -> Result<(), Error> {
        match self.inner.as_mut() {
            Some(transport) => transport.encode_frame(out, metadata, payload),
            // replies issued before any downstream bytes arrived have no
            // detected framing to mirror, use framed
            None => FramedTransport::new(self.max_frame_size).encode_frame(out, metadata, payload),
        }
    }
}
