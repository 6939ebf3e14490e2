// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use std::rc::Rc;

use protocol_thrift::MessageMetadata;

/// A resolved route for one RPC.
pub trait Route {
    /// Name of the upstream cluster this route selects.
    fn cluster_name(&self) -> &str;
}

/// Route table seam. Consulted once per RPC; the result is cached on the RPC,
/// including a resolution to no route at all.
pub trait Router {
    fn route(&self, metadata: &MessageMetadata, stream_id: u64) -> Option<Rc<dyn Route>>;
}
