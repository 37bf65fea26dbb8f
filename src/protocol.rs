//! Reply protocols.
//!
//! A protocol turns one chunk of bytes read from a client into the reply
//! written back before the next read. There is no framing: a chunk is
//! whatever a single read returned.

use bytes::{Bytes, BytesMut};

use crate::config::{Config, ProtocolType};

/// Reply transformation applied by every connection handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    /// Reply with a fixed acknowledgement.
    Ack(Bytes),
    /// Reply with the bytes that were read.
    Echo,
}

impl Protocol {
    /// Build the protocol selected in the configuration.
    pub fn from_config(config: &Config) -> Self {
        match config.protocol {
            ProtocolType::Ack => Protocol::Ack(Bytes::from(config.ack_message.clone())),
            ProtocolType::Echo => Protocol::Echo,
        }
    }

    /// Append the reply for `input` to `output`.
    pub fn respond(&self, input: &[u8], output: &mut BytesMut) {
        match self {
            Protocol::Ack(message) => output.extend_from_slice(message),
            Protocol::Echo => output.extend_from_slice(input),
        }
    }
}
