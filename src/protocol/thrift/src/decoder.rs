// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Streaming decoder which drives a transport and protocol over a byte buffer
//! and emits typed message events. The machine is an explicit state enum plus
//! a frame stack for nested structs and containers, so it can stop on
//! underflow at any byte boundary and resume when more data arrives.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::{Buf, BytesMut};

use crate::protocol::Protocol;
use crate::transport::Transport;
use crate::{Error, FieldType, MessageMetadata};

/// Whether event processing should continue or pause. A handler returning
/// `StopIteration` pauses the decoder after the event it was delivered;
/// resumption picks up with the next wire item and never re-delivers an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    StopIteration,
}

/// One decoded Thrift message event.
#[derive(Clone, Debug)]
pub enum DecoderEvent {
    MessageBegin(Rc<RefCell<MessageMetadata>>),
    MessageEnd,
    StructBegin(String),
    StructEnd,
    FieldBegin(String, FieldType, i16),
    FieldEnd,
    BoolValue(bool),
    ByteValue(i8),
    Int16Value(i16),
    Int32Value(i32),
    Int64Value(i64),
    DoubleValue(f64),
    StringValue(Vec<u8>),
    MapBegin(FieldType, FieldType, u32),
    MapEnd,
    ListBegin(FieldType, u32),
    ListEnd,
    SetBegin(FieldType, u32),
    SetEnd,
    TransportEnd,
}

/// Polymorphic sink for decoder events.
///
/// The error side of the result is the in-band escape hatch for handlers: an
/// `Error::App` is reportable to the peer as an exception reply while an
/// `Error::Decode` poisons the stream.
pub trait DecoderEventHandler {
    fn on_event(&mut self, event: DecoderEvent) -> Result<FilterStatus, Error>;
}

/// The decoder's view of its owner. `new_decoder_event_handler` is invoked
/// once per message, immediately before that message's `MessageBegin` event,
/// so the owner can install a fresh per-message sink; every event is then
/// delivered through `on_event` and belongs to the most recently started
/// message.
pub trait DecoderCallbacks: DecoderEventHandler {
    fn new_decoder_event_handler(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    FrameBegin,
    MessageBegin,
    StructBegin,
    FieldBegin,
    FieldValue,
    FieldEnd,
    StructEnd,
    MapBegin,
    MapKey,
    MapValue,
    MapEnd,
    ListBegin,
    ListValue,
    ListEnd,
    SetBegin,
    SetValue,
    SetEnd,
    MessageEnd,
    FrameEnd,
    SkipFrame,
}

// One level of nesting. `return_state` is where the machine goes when this
// level finishes; the element types and remaining count only apply to
// container levels.
#[derive(Clone, Copy)]
struct Frame {
    return_state: State,
    elem_type: FieldType,
    value_type: FieldType,
    remaining: u32,
}

impl Frame {
    fn new(return_state: State) -> Self {
        Self {
            return_state,
            elem_type: FieldType::Stop,
            value_type: FieldType::Stop,
            remaining: 0,
        }
    }
}

enum Step {
    Underflow,
    Continue(FilterStatus),
    MessageComplete(FilterStatus),
}

enum ValueOutcome {
    Underflow,
    Value(DecoderEvent),
    Descend(State),
}

/// Streaming decoder for one direction of a connection.
///
/// The decoder owns only resumable parse state; the transport and protocol
/// objects are shared with the decoder's owner so the owner can keep encoding
/// replies (and resolving upgrades) with the very same codec instances the
/// wire is being decoded with.
pub struct Decoder {
    transport: Rc<RefCell<Box<dyn Transport>>>,
    protocol: Rc<RefCell<Box<dyn Protocol>>>,
    state: State,
    stack: Vec<Frame>,
    metadata: Option<Rc<RefCell<MessageMetadata>>>,
    frame_remaining: Option<usize>,
    handler_active: bool,
}

impl Decoder {
    pub fn new(
        transport: Rc<RefCell<Box<dyn Transport>>>,
        protocol: Rc<RefCell<Box<dyn Protocol>>>,
    ) -> Self {
        Self {
            transport,
            protocol,
            state: State::FrameBegin,
            stack: Vec::new(),
            metadata: None,
            frame_remaining: None,
            handler_active: false,
        }
    }

    /// Runs the decoder over the buffer until one message completes, a
    /// handler pauses it, more bytes are needed, or an error surfaces.
    /// Returns the last handler status and whether the decoder underflowed.
    pub fn on_data(
        &mut self,
        buffer: &mut BytesMut,
        callbacks: &mut dyn DecoderCallbacks,
    ) -> Result<(FilterStatus, bool), Error> {
        loop {
            let frame_start_step = self.state == State::FrameBegin;
            let before = buffer.len();
            let result = self.step(buffer, callbacks);
            let consumed = before - buffer.len();
            if !frame_start_step {
                if let Some(remaining) = self.frame_remaining.as_mut() {
                    *remaining = remaining.saturating_sub(consumed);
                }
            }

            match result? {
                Step::Underflow => return Ok((FilterStatus::Continue, true)),
                Step::Continue(FilterStatus::StopIteration) => {
                    return Ok((FilterStatus::StopIteration, false))
                }
                Step::Continue(FilterStatus::Continue) => continue,
                Step::MessageComplete(status) => return Ok((status, false)),
            }
        }
    }

    /// True from the moment a message's event handler was installed until its
    /// `TransportEnd` was delivered.
    pub fn handler_active(&self) -> bool {
        self.handler_active
    }

    /// Abandons the message currently being decoded and arranges for the rest
    /// of its frame to be discarded, leaving the decoder aligned on the next
    /// frame boundary. Only possible when the framing carries an explicit
    /// length; returns false when it does not.
    pub fn recover_to_frame_end(&mut self) -> bool {
        if self.frame_remaining.is_none() {
            return false;
        }

        self.state = State::SkipFrame;
        self.stack.clear();
        self.metadata = None;
        self.handler_active = false;
        true
    }

    fn step(
        &mut self,
        buffer: &mut BytesMut,
        callbacks: &mut dyn DecoderCallbacks,
    ) -> Result<Step, Error> {
        match self.state {
            State::FrameBegin => {
                let mut metadata = MessageMetadata::new();
                if !self
                    .transport
                    .borrow_mut()
                    .decode_frame_start(buffer, &mut metadata)?
                {
                    return Ok(Step::Underflow);
                }

                self.frame_remaining = metadata.frame_size().map(|size| size as usize);
                self.metadata = Some(Rc::new(RefCell::new(metadata)));
                self.state = State::MessageBegin;
                Ok(Step::Continue(FilterStatus::Continue))
            }
            State::MessageBegin => {
                let metadata = self
                    .metadata
                    .clone()
                    .ok_or_else(|| Error::Decode("message begin without a frame".to_string()))?;
                let complete = {
                    let mut metadata = metadata.borrow_mut();
                    self.protocol
                        .borrow_mut()
                        .read_message_begin(buffer, &mut metadata)?
                };
                if !complete {
                    return Ok(Step::Underflow);
                }

                trace!(
                    "message begin: method={:?} sequence_id={:?}",
                    metadata.borrow().method_name(),
                    metadata.borrow().sequence_id()
                );

                self.stack.push(Frame::new(State::MessageEnd));
                self.state = State::StructBegin;
                self.handler_active = true;
                callbacks.new_decoder_event_handler();
                let status = callbacks.on_event(DecoderEvent::MessageBegin(metadata))?;
                Ok(Step::Continue(status))
            }
            State::StructBegin => {
                let Some(name) = self.protocol.borrow_mut().read_struct_begin(buffer)? else {
                    return Ok(Step::Underflow);
                };
                self.state = State::FieldBegin;
                let status = callbacks.on_event(DecoderEvent::StructBegin(name))?;
                Ok(Step::Continue(status))
            }
            State::FieldBegin => {
                let Some((name, field_type, field_id)) =
                    self.protocol.borrow_mut().read_field_begin(buffer)?
                else {
                    return Ok(Step::Underflow);
                };

                if field_type == FieldType::Stop {
                    self.state = State::StructEnd;
                    Ok(Step::Continue(FilterStatus::Continue))
                } else {
                    self.stack.push(Frame {
                        return_state: State::FieldEnd,
                        elem_type: field_type,
                        value_type: FieldType::Stop,
                        remaining: 0,
                    });
                    self.state = State::FieldValue;
                    let status =
                        callbacks.on_event(DecoderEvent::FieldBegin(name, field_type, field_id))?;
                    Ok(Step::Continue(status))
                }
            }
            State::FieldValue => {
                let frame = *self.top()?;
                match self.read_value(buffer, frame.elem_type)? {
                    ValueOutcome::Underflow => Ok(Step::Underflow),
                    ValueOutcome::Value(event) => {
                        self.stack.pop();
                        self.state = frame.return_state;
                        let status = callbacks.on_event(event)?;
                        Ok(Step::Continue(status))
                    }
                    ValueOutcome::Descend(next) => {
                        self.stack.pop();
                        self.stack.push(Frame::new(frame.return_state));
                        self.state = next;
                        Ok(Step::Continue(FilterStatus::Continue))
                    }
                }
            }
            State::FieldEnd => {
                let Some(()) = self.protocol.borrow_mut().read_field_end(buffer)? else {
                    return Ok(Step::Underflow);
                };
                self.state = State::FieldBegin;
                let status = callbacks.on_event(DecoderEvent::FieldEnd)?;
                Ok(Step::Continue(status))
            }
            State::StructEnd => {
                let Some(()) = self.protocol.borrow_mut().read_struct_end(buffer)? else {
                    return Ok(Step::Underflow);
                };
                let frame = self.pop()?;
                self.state = frame.return_state;
                let status = callbacks.on_event(DecoderEvent::StructEnd)?;
                Ok(Step::Continue(status))
            }
            State::MapBegin => {
                let Some((key_type, value_type, size)) =
                    self.protocol.borrow_mut().read_map_begin(buffer)?
                else {
                    return Ok(Step::Underflow);
                };
                {
                    let frame = self.top()?;
                    frame.elem_type = key_type;
                    frame.value_type = value_type;
                    frame.remaining = size;
                }
                self.state = State::MapKey;
                let status =
                    callbacks.on_event(DecoderEvent::MapBegin(key_type, value_type, size))?;
                Ok(Step::Continue(status))
            }
            State::MapKey => {
                let frame = *self.top()?;
                if frame.remaining == 0 {
                    self.state = State::MapEnd;
                    return Ok(Step::Continue(FilterStatus::Continue));
                }
                match self.read_value(buffer, frame.elem_type)? {
                    ValueOutcome::Underflow => Ok(Step::Underflow),
                    ValueOutcome::Value(event) => {
                        self.state = State::MapValue;
                        let status = callbacks.on_event(event)?;
                        Ok(Step::Continue(status))
                    }
                    ValueOutcome::Descend(next) => {
                        self.stack.push(Frame::new(State::MapValue));
                        self.state = next;
                        Ok(Step::Continue(FilterStatus::Continue))
                    }
                }
            }
            State::MapValue => {
                let frame = *self.top()?;
                match self.read_value(buffer, frame.value_type)? {
                    ValueOutcome::Underflow => Ok(Step::Underflow),
                    ValueOutcome::Value(event) => {
                        self.top()?.remaining -= 1;
                        self.state = State::MapKey;
                        let status = callbacks.on_event(event)?;
                        Ok(Step::Continue(status))
                    }
                    ValueOutcome::Descend(next) => {
                        self.top()?.remaining -= 1;
                        self.stack.push(Frame::new(State::MapKey));
                        self.state = next;
                        Ok(Step::Continue(FilterStatus::Continue))
                    }
                }
            }
            State::MapEnd => {
                let Some(()) = self.protocol.borrow_mut().read_map_end(buffer)? else {
                    return Ok(Step::Underflow);
                };
                let frame = self.pop()?;
                self.state = frame.return_state;
                let status = callbacks.on_event(DecoderEvent::MapEnd)?;
                Ok(Step::Continue(status))
            }
            State::ListBegin => {
                let Some((elem_type, size)) = self.protocol.borrow_mut().read_list_begin(buffer)?
                else {
                    return Ok(Step::Underflow);
                };
                {
                    let frame = self.top()?;
                    frame.elem_type = elem_type;
                    frame.remaining = size;
                }
                self.state = State::ListValue;
                let status = callbacks.on_event(DecoderEvent::ListBegin(elem_type, size))?;
                Ok(Step::Continue(status))
            }
            State::ListValue => {
                let frame = *self.top()?;
                if frame.remaining == 0 {
                    self.state = State::ListEnd;
                    return Ok(Step::Continue(FilterStatus::Continue));
                }
                match self.read_value(buffer, frame.elem_type)? {
                    ValueOutcome::Underflow => Ok(Step::Underflow),
                    ValueOutcome::Value(event) => {
                        self.top()?.remaining -= 1;
                        let status = callbacks.on_event(event)?;
                        Ok(Step::Continue(status))
                    }
                    ValueOutcome::Descend(next) => {
                        self.top()?.remaining -= 1;
                        self.stack.push(Frame::new(State::ListValue));
                        self.state = next;
                        Ok(Step::Continue(FilterStatus::Continue))
                    }
                }
            }
            State::ListEnd => {
                let Some(()) = self.protocol.borrow_mut().read_list_end(buffer)? else {
                    return Ok(Step::Underflow);
                };
                let frame = self.pop()?;
                self.state = frame.return_state;
                let status = callbacks.on_event(DecoderEvent::ListEnd)?;
                Ok(Step::Continue(status))
            }
            State::SetBegin => {
                let Some((elem_type, size)) = self.protocol.borrow_mut().read_set_begin(buffer)?
                else {
                    return Ok(Step::Underflow);
                };
                {
                    let frame = self.top()?;
                    frame.elem_type = elem_type;
                    frame.remaining = size;
                }
                self.state = State::SetValue;
                let status = callbacks.on_event(DecoderEvent::SetBegin(elem_type, size))?;
                Ok(Step::Continue(status))
            }
            State::SetValue => {
                let frame = *self.top()?;
                if frame.remaining == 0 {
                    self.state = State::SetEnd;
                    return Ok(Step::Continue(FilterStatus::Continue));
                }
                match self.read_value(buffer, frame.elem_type)? {
                    ValueOutcome::Underflow => Ok(Step::Underflow),
                    ValueOutcome::Value(event) => {
                        self.top()?.remaining -= 1;
                        let status = callbacks.on_event(event)?;
                        Ok(Step::Continue(status))
                    }
                    ValueOutcome::Descend(next) => {
                        self.top()?.remaining -= 1;
                        self.stack.push(Frame::new(State::SetValue));
                        self.state = next;
                        Ok(Step::Continue(FilterStatus::Continue))
                    }
                }
            }
            State::SetEnd => {
                let Some(()) = self.protocol.borrow_mut().read_set_end(buffer)? else {
                    return Ok(Step::Underflow);
                };
                let frame = self.pop()?;
                self.state = frame.return_state;
                let status = callbacks.on_event(DecoderEvent::SetEnd)?;
                Ok(Step::Continue(status))
            }
            State::MessageEnd => {
                let Some(()) = self.protocol.borrow_mut().read_message_end(buffer)? else {
                    return Ok(Step::Underflow);
                };
                self.state = State::FrameEnd;
                let status = callbacks.on_event(DecoderEvent::MessageEnd)?;
                Ok(Step::Continue(status))
            }
            State::FrameEnd => {
                if !self.transport.borrow_mut().decode_frame_end(buffer)? {
                    return Ok(Step::Underflow);
                }

                self.state = State::FrameBegin;
                self.metadata = None;
                self.frame_remaining = None;
                self.handler_active = false;
                let status = callbacks.on_event(DecoderEvent::TransportEnd)?;
                Ok(Step::MessageComplete(status))
            }
            State::SkipFrame => {
                let remaining = self.frame_remaining.unwrap_or(0);
                if buffer.len() >= remaining {
                    buffer.advance(remaining);
                    if !self.transport.borrow_mut().decode_frame_end(buffer)? {
                        return Ok(Step::Underflow);
                    }
                    self.state = State::FrameBegin;
                    self.frame_remaining = None;
                    Ok(Step::MessageComplete(FilterStatus::Continue))
                } else {
                    let len = buffer.len();
                    buffer.advance(len);
                    Ok(Step::Underflow)
                }
            }
        }
    }

    fn read_value(
        &mut self,
        buffer: &mut BytesMut,
        elem_type: FieldType,
    ) -> Result<ValueOutcome, Error> {
        let mut protocol = self.protocol.borrow_mut();
        let outcome = match elem_type {
            FieldType::Bool => protocol.read_bool(buffer)?.map(DecoderEvent::BoolValue),
            FieldType::Byte => protocol.read_byte(buffer)?.map(DecoderEvent::ByteValue),
            FieldType::I16 => protocol.read_i16(buffer)?.map(DecoderEvent::Int16Value),
            FieldType::I32 => protocol.read_i32(buffer)?.map(DecoderEvent::Int32Value),
            FieldType::I64 => protocol.read_i64(buffer)?.map(DecoderEvent::Int64Value),
            FieldType::Double => protocol.read_double(buffer)?.map(DecoderEvent::DoubleValue),
            FieldType::String => protocol.read_string(buffer)?.map(DecoderEvent::StringValue),
            FieldType::Struct => return Ok(ValueOutcome::Descend(State::StructBegin)),
            FieldType::Map => return Ok(ValueOutcome::Descend(State::MapBegin)),
            FieldType::List => return Ok(ValueOutcome::Descend(State::ListBegin)),
            FieldType::Set => return Ok(ValueOutcome::Descend(State::SetBegin)),
            FieldType::Stop | FieldType::Void => {
                return Err(Error::Decode(format!(
                    "unsupported value type {:?}",
                    elem_type
                )))
            }
        };

        Ok(match outcome {
            Some(event) => ValueOutcome::Value(event),
            None => ValueOutcome::Underflow,
        })
    }

    fn top(&mut self) -> Result<&mut Frame, Error> {
        self.stack
            .last_mut()
            .ok_or_else(|| Error::Decode("decoder frame stack underflow".to_string()))
    }

    fn pop(&mut self) -> Result<Frame, Error> {
        self.stack
            .pop()
            .ok_or_else(|| Error::Decode("decoder frame stack underflow".to_string()))
    }
}
