//! Network message types for P2P communication
//!
//! Blocks travel as bare [`Block`] payloads on the push channel. The query
//! channel carries [`Request`]/[`Response`] pairs and the discovery channel
//! carries one [`Heartbeat`] per datagram. Everything is bincode-encoded.

use crate::core::{Block, BlockHash};
use serde::{Deserialize, Serialize};

/// Largest heartbeat datagram we expect to receive
pub const MAX_DATAGRAM_SIZE: usize = 512;

/// Query channel requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Current best block
    GetTip,
    /// Block by id
    GetBlock(BlockHash),
    /// Number of accepted blocks
    GetHeight,
    /// Queue a blob for the next mined block
    SubmitBlob(Vec<u8>),
}

/// Query channel responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Block(Block),
    Height(u64),
    BlobAccepted { pending: usize },
    NotFound,
    Error(String),
}

impl Request {
    /// Serialize request to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize request from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Get request type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::GetTip => "GetTip",
            Request::GetBlock(_) => "GetBlock",
            Request::GetHeight => "GetHeight",
            Request::SubmitBlob(_) => "SubmitBlob",
        }
    }
}

impl Response {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Liveness announcement sent on the discovery channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: u32,
    /// Sender's clock, seconds since epoch
    pub timestamp: f64,
    /// TCP port of the sender's push channel
    pub push_port: u16,
    /// TCP port of the sender's query channel
    pub query_port: u16,
}

impl Heartbeat {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::tests::mine_test_block;

    #[test]
    fn test_request_serialization() {
        let hash = mine_test_block(vec![], 1, 1.0).hash();
        let req = Request::GetBlock(hash);
        let decoded = Request::from_bytes(&req.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.type_name(), "GetBlock");
    }

    #[test]
    fn test_unknown_request_tag_fails() {
        // Variant index 99 does not exist
        let bytes = 99u32.to_le_bytes();
        assert!(Request::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_response_with_block() {
        let block = mine_test_block(vec![b"blob".to_vec()], 1, 2.0);
        let resp = Response::Block(block);
        assert_eq!(Response::from_bytes(&resp.to_bytes().unwrap()).unwrap(), resp);
    }

    #[test]
    fn test_heartbeat_fits_in_datagram() {
        let hb = Heartbeat {
            node_id: 0xDEAD_BEEF,
            timestamp: 1_700_000_000.25,
            push_port: 9999,
            query_port: 10000,
        };
        let bytes = hb.to_bytes().unwrap();
        assert!(bytes.len() <= MAX_DATAGRAM_SIZE);
        assert_eq!(Heartbeat::from_bytes(&bytes).unwrap(), hb);
    }

    #[test]
    fn test_truncated_heartbeat_fails() {
        assert!(Heartbeat::from_bytes(&[1, 2, 3]).is_err());
    }
}
