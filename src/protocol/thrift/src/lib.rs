// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A protocol crate for Thrift. Provides the transport codecs (framed,
//! unframed, auto-detect), the protocol codecs (binary, compact, auto-detect),
//! and a streaming decoder which turns a byte stream into a sequence of typed
//! message events. The decoder is resumable: it may underflow at any byte
//! boundary and pick up exactly where it left off once more data arrives.

#[macro_use]
extern crate log;

use serde::{Deserialize, Serialize};

mod app_exception;
mod convert;
mod decoder;
mod metadata;
mod protocol;
mod transport;

pub use app_exception::{AppException, AppExceptionKind, DirectResponse};
pub use convert::ProtocolConverter;
pub use decoder::{Decoder, DecoderCallbacks, DecoderEvent, DecoderEventHandler, FilterStatus};
pub use metadata::MessageMetadata;
pub use protocol::{new_protocol, AutoProtocol, BinaryProtocol, CompactProtocol, Protocol};
pub use transport::{
    new_transport, AutoTransport, FramedTransport, Transport, UnframedTransport,
    DEFAULT_MAX_FRAME_SIZE,
};

/// Errors produced while decoding or encoding Thrift messages.
///
/// The two variants carry very different policies for the connection that
/// produced them: an `App` error is expressible in-band as a Thrift exception
/// reply and the connection survives it, while a `Decode` error means the
/// framing itself is broken and the stream cannot be trusted any further.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    App(#[from] AppException),
    #[error("{0}")]
    Decode(String),
}

/// Thrift message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl MessageType {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Call),
            2 => Some(Self::Reply),
            3 => Some(Self::Exception),
            4 => Some(Self::Oneway),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u8 {
        self as u8
    }
}

/// Thrift struct field types, independent of any protocol's wire encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Stop,
    Void,
    Bool,
    Byte,
    Double,
    I16,
    I32,
    I64,
    String,
    Struct,
    Map,
    Set,
    List,
}

impl FieldType {
    /// Converts from the binary protocol's field type id.
    pub fn from_binary(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::Stop),
            1 => Ok(Self::Void),
            2 => Ok(Self::Bool),
            3 => Ok(Self::Byte),
            4 => Ok(Self::Double),
            6 => Ok(Self::I16),
            8 => Ok(Self::I32),
            10 => Ok(Self::I64),
            11 => Ok(Self::String),
            12 => Ok(Self::Struct),
            13 => Ok(Self::Map),
            14 => Ok(Self::Set),
            15 => Ok(Self::List),
            _ => Err(Error::Decode(format!(
                "unknown binary protocol field type {}",
                value
            ))),
        }
    }

    pub fn as_binary(self) -> u8 {
        match self {
            Self::Stop => 0,
            Self::Void => 1,
            Self::Bool => 2,
            Self::Byte => 3,
            Self::Double => 4,
            Self::I16 => 6,
            Self::I32 => 8,
            Self::I64 => 10,
            Self::String => 11,
            Self::Struct => 12,
            Self::Map => 13,
            Self::Set => 14,
            Self::List => 15,
        }
    }
}

/// The framing layers this crate can speak.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Framed,
    Unframed,
    Auto,
}

impl TransportType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Framed => "framed",
            Self::Unframed => "unframed",
            Self::Auto => "auto",
        }
    }
}

/// The encoding layers this crate can speak.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Binary,
    Compact,
    Auto,
}

impl ProtocolType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Compact => "compact",
            Self::Auto => "auto",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trip() {
        for value in 1..=4 {
            let message_type = MessageType::from_wire(value).unwrap();
            assert_eq!(message_type.as_wire(), value);
        }
        assert_eq!(MessageType::from_wire(0), None);
        assert_eq!(MessageType::from_wire(5), None);
    }

    #[test]
    fn field_type_round_trip() {
        for value in [0, 1, 2, 3, 4, 6, 8, 10, 11, 12, 13, 14, 15] {
            let field_type = FieldType::from_binary(value).unwrap();
            assert_eq!(field_type.as_binary(), value);
        }
        assert!(FieldType::from_binary(5).is_err());
        assert!(FieldType::from_binary(16).is_err());
    }
}
