//! Query channel: request/response over framed TCP
//!
//! Each frame carries one bincode [`Request`] and is answered with exactly
//! one [`Response`] frame. A connection may carry any number of exchanges.

use crate::core::{Block, ChainState};
use crate::network::framing::{receive_framed_segment, FrameCodec};
use crate::network::message::{Request, Response};
use crate::network::NetworkError;
use bytes::Bytes;
use futures::SinkExt;
use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Answers queries against the local chain
pub struct QueryResponder {
    chain: Arc<ChainState>,
}

impl QueryResponder {
    pub fn new(chain: Arc<ChainState>) -> Self {
        Self { chain }
    }

    /// Answer one request
    pub fn respond(&self, request: Request) -> Response {
        match request {
            Request::GetTip => match self.chain.tip() {
                Some(block) => Response::Block(block),
                None => Response::NotFound,
            },
            Request::GetBlock(hash) => match self.chain.get_block(&hash) {
                Some(block) => Response::Block(block),
                None => Response::NotFound,
            },
            Request::GetHeight => Response::Height(self.chain.height()),
            Request::SubmitBlob(blob) => match self.chain.submit_blob(blob) {
                Ok(pending) => Response::BlobAccepted { pending },
                Err(e) => Response::Error(e.to_string()),
            },
        }
    }

    /// Answer one raw request payload. Undecodable requests get an error
    /// response rather than a dropped connection.
    pub fn respond_raw(&self, payload: &[u8]) -> Response {
        match Request::from_bytes(payload) {
            Ok(request) => {
                debug!("Query {}", request.type_name());
                self.respond(request)
            }
            Err(e) => Response::Error(format!("malformed request: {}", e)),
        }
    }

    /// Service one query connection until the peer closes it, a framing
    /// error occurs, or `shutdown` fires.
    pub async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let mut frames = Framed::new(stream, FrameCodec::new());
        loop {
            let payload = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = receive_framed_segment(&mut frames) => match frame {
                    Ok(Some(payload)) => payload,
                    Ok(None) => {
                        debug!("Query peer {} disconnected", addr);
                        break;
                    }
                    Err(e) => {
                        warn!("Framing error from {}: {}", addr, e);
                        break;
                    }
                },
            };

            let reply = match self.respond_raw(&payload).to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode response for {}: {}", addr, e);
                    break;
                }
            };
            if let Err(e) = frames.send(Bytes::from(reply)).await {
                debug!("Failed to reply to {}: {}", addr, e);
                break;
            }
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Send one request and wait for its response
pub async fn request(addr: SocketAddr, request: &Request) -> Result<Response, NetworkError> {
    let stream = TcpStream::connect(addr).await?;
    let mut frames = Framed::new(stream, FrameCodec::new());
    frames.send(Bytes::from(request.to_bytes()?)).await?;

    match receive_framed_segment(&mut frames).await? {
        Some(payload) => Ok(Response::from_bytes(&payload)?),
        None => Err(NetworkError::ConnectionClosed),
    }
}

/// Fetch a node's current tip. `Ok(None)` if its chain is empty.
pub async fn query_tip(addr: SocketAddr) -> Result<Option<Block>, NetworkError> {
    match request(addr, &Request::GetTip).await? {
        Response::Block(block) => Ok(Some(block)),
        Response::NotFound => Ok(None),
        Response::Error(e) => Err(NetworkError::UnexpectedResponse(e)),
        other => Err(NetworkError::UnexpectedResponse(format!("{:?}", other))),
    }
}
