// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use std::io::Read;

use protocol_thrift::{ProtocolType, TransportType, DEFAULT_MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};

// constants to define default values
const TRANSPORT: TransportType = TransportType::Framed;
const PROTOCOL: ProtocolType = ProtocolType::Binary;

// helper functions
fn transport() -> TransportType {
    TRANSPORT
}

fn protocol() -> ProtocolType {
    PROTOCOL
}

fn max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

// struct definitions
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ProxyConfig {
    #[serde(default = "transport")]
    transport: TransportType,
    #[serde(default = "protocol")]
    protocol: ProtocolType,
    #[serde(default = "max_frame_size")]
    max_frame_size: usize,
}

// implementation
impl ProxyConfig {
    pub fn load(file: &str) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(file)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        toml::from_str(&content).map_err(|e| {
            error!("{}", e);
            std::io::Error::new(std::io::ErrorKind::Other, "Error parsing config")
        })
    }

    pub fn transport(&self) -> TransportType {
        self.transport
    }

    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

// trait implementations
impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            transport: transport(),
            protocol: protocol(),
            max_frame_size: max_frame_size(),
        }
    }
}
