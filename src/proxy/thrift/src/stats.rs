// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use metriken::Counter;

/// Counters for one connection manager scope. The stats sink is supplied by
/// the embedding process and typically shared across connections; every
/// counter is monotonic and atomically incremented, so sharing needs no
/// locking.
pub struct ConnectionManagerStats {
    pub request: Counter,
    pub request_call: Counter,
    pub request_oneway: Counter,
    pub request_invalid_type: Counter,
    pub request_decoding_error: Counter,
    pub response: Counter,
    pub response_reply: Counter,
    pub response_exception: Counter,
    pub response_invalid_type: Counter,
    pub response_success: Counter,
    pub response_error: Counter,
    pub response_decoding_error: Counter,
    pub cx_destroy_local_with_active_rq: Counter,
    pub cx_destroy_remote_with_active_rq: Counter,
}

impl ConnectionManagerStats {
    pub fn new() -> Self {
        Self {
            request: Counter::new(),
            request_call: Counter::new(),
            request_oneway: Counter::new(),
            request_invalid_type: Counter::new(),
            request_decoding_error: Counter::new(),
            response: Counter::new(),
            response_reply: Counter::new(),
            response_exception: Counter::new(),
            response_invalid_type: Counter::new(),
            response_success: Counter::new(),
            response_error: Counter::new(),
            response_decoding_error: Counter::new(),
            cx_destroy_local_with_active_rq: Counter::new(),
            cx_destroy_remote_with_active_rq: Counter::new(),
        }
    }

    /// Current readings keyed by the well-known counter names.
    pub fn counters(&self) -> [(&'static str, u64); 14] {
        [
            ("request", self.request.value()),
            ("request_call", self.request_call.value()),
            ("request_oneway", self.request_oneway.value()),
            ("request_invalid_type", self.request_invalid_type.value()),
            ("request_decoding_error", self.request_decoding_error.value()),
            ("response", self.response.value()),
            ("response_reply", self.response_reply.value()),
            ("response_exception", self.response_exception.value()),
            ("response_invalid_type", self.response_invalid_type.value()),
            ("response_success", self.response_success.value()),
            ("response_error", self.response_error.value()),
            ("response_decoding_error", self.response_decoding_error.value()),
            (
                "cx_destroy_local_with_active_rq",
                self.cx_destroy_local_with_active_rq.value(),
            ),
            (
                "cx_destroy_remote_with_active_rq",
                self.cx_destroy_remote_with_active_rq.value(),
            ),
        ]
    }
}

impl Default for ConnectionManagerStats {
    fn default() -> Self {
        Self::new()
    }
}
