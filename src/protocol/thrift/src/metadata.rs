// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::{MessageType, ProtocolType};

/// The per-message envelope. Accumulated by the transport and protocol layers
/// as a message is decoded and shared read-mostly with everything downstream
/// of message begin. The sequence id is the one field which is rewritten after
/// decode, to preserve request/response correlation across an upstream that
/// assigns its own ids.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageMetadata {
    method_name: Option<String>,
    message_type: Option<MessageType>,
    sequence_id: Option<i32>,
    protocol: Option<ProtocolType>,
    frame_size: Option<u32>,
    headers: Vec<(String, String)>,
    protocol_upgrade_message: bool,
}

impl MessageMetadata {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn method_name(&self) -> Option<&str> {
        self.method_name.as_deref()
    }

    pub fn set_method_name(&mut self, name: String) {
        self.method_name = Some(name);
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.message_type
    }

    pub fn set_message_type(&mut self, message_type: MessageType) {
        self.message_type = Some(message_type);
    }

    pub fn sequence_id(&self) -> Option<i32> {
        self.sequence_id
    }

    pub fn set_sequence_id(&mut self, sequence_id: i32) {
        self.sequence_id = Some(sequence_id);
    }

    pub fn protocol(&self) -> Option<ProtocolType> {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: ProtocolType) {
        self.protocol = Some(protocol);
    }

    pub fn frame_size(&self) -> Option<u32> {
        self.frame_size
    }

    pub fn set_frame_size(&mut self, frame_size: u32) {
        self.frame_size = Some(frame_size);
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn add_header(&mut self, key: String, value: String) {
        self.headers.push((key, value));
    }

    pub fn is_protocol_upgrade_message(&self) -> bool {
        self.protocol_upgrade_message
    }

    pub fn set_protocol_upgrade_message(&mut self, upgrade: bool) {
        self.protocol_upgrade_message = upgrade;
    }
}
