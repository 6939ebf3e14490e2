// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use bytes::BytesMut;

use crate::protocol::Protocol;
use crate::{Error, FieldType, MessageMetadata, MessageType};

/// Standard Thrift application exception codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppExceptionKind {
    Unknown = 0,
    UnknownMethod = 1,
    InvalidMessageType = 2,
    WrongMethodName = 3,
    BadSequenceId = 4,
    MissingResult = 5,
    InternalError = 6,
    ProtocolError = 7,
    InvalidTransform = 8,
    InvalidProtocol = 9,
    UnsupportedClientType = 10,
}

/// A Thrift-level application error. Unlike framing errors, these are
/// expressible on the wire as an Exception-typed reply and a connection that
/// produces one keeps running.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct AppException {
    pub kind: AppExceptionKind,
    pub message: String,
}

impl AppException {
    pub fn new(kind: AppExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A reply which can be produced locally, without consulting an upstream, and
/// encoded directly onto the downstream connection.
pub trait DirectResponse {
    /// Writes the complete reply message for the request described by
    /// `metadata` into `out` using the given protocol.
    fn encode(
        &self,
        metadata: &MessageMetadata,
        protocol: &mut dyn Protocol,
        out: &mut BytesMut,
    ) -> Result<(), Error>;
}

impl DirectResponse for AppException {
    fn encode(
        &self,
        metadata: &MessageMetadata,
        protocol: &mut dyn Protocol,
        out: &mut BytesMut,
    ) -> Result<(), Error> {
        // an exception reply is a struct with the message at field 1 and the
        // exception type code at field 2
        let mut reply = metadata.clone();
        reply.set_message_type(MessageType::Exception);

        protocol.write_message_begin(out, &reply)?;
        protocol.write_struct_begin(out, "")?;
        protocol.write_field_begin(out, "", FieldType::String, 1)?;
        protocol.write_string(out, self.message.as_bytes())?;
        protocol.write_field_end(out)?;
        protocol.write_field_begin(out, "", FieldType::I32, 2)?;
        protocol.write_i32(out, self.kind as i32)?;
        protocol.write_field_end(out)?;
        protocol.write_field_stop(out)?;
        protocol.write_struct_end(out)?;
        protocol.write_message_end(out)
    }
}
