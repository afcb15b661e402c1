//! Network map directory client
//!
//! [`NetworkMapClient`] is the capability the updater consumes. The bundled
//! [`TcpNetworkMapClient`] speaks one framed request/response per connection.

use crate::framing::{read_frame, write_frame, Frame, FrameError, FrameType};
use async_trait::async_trait;
use netmap_core::crypto::{node_info_hash, verify_node_info};
use netmap_core::types::*;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection closed before response")]
    ConnectionClosed,
    #[error("Unexpected response frame: {0:?}")]
    UnexpectedResponse(FrameType),
    #[error("Network map error: {0}")]
    Remote(String),
    #[error("Invalid content from network map: {0}")]
    Invalid(#[from] netmap_core::Error),
}

/// Network map snapshot together with how long it may be cached
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkMapResponse {
    pub network_map: NetworkMap,
    pub cache_timeout: Duration,
}

/// Wire body of a [`FrameType::NetworkMap`] frame
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkMapEnvelope {
    pub network_map: NetworkMap,
    pub cache_timeout_ms: u64,
}

impl From<NetworkMapEnvelope> for NetworkMapResponse {
    fn from(envelope: NetworkMapEnvelope) -> Self {
        Self {
            network_map: envelope.network_map,
            cache_timeout: Duration::from_millis(envelope.cache_timeout_ms),
        }
    }
}

/// Remote directory operations used to keep the local network map in sync
#[async_trait]
pub trait NetworkMapClient: Send + Sync {
    /// Fetch the current network map and its cache timeout
    async fn get_network_map(&self) -> Result<NetworkMapResponse, ClientError>;

    /// Fetch a membership entry by content hash
    async fn get_node_info(&self, hash: &SecureHash) -> Result<SignedNodeInfo, ClientError>;

    /// Fetch signed network parameters by hash
    async fn get_network_parameters(
        &self,
        hash: &SecureHash,
    ) -> Result<SignedNetworkParameters, ClientError>;

    /// Acknowledge acceptance of a parameters update
    async fn ack_parameters_update(&self, signed_hash: SignedHash) -> Result<(), ClientError>;

    /// Root key that network map certificates must chain to
    fn trusted_root(&self) -> Bytes32;
}

/// Directory client over plain TCP
#[derive(Debug, Clone)]
pub struct TcpNetworkMapClient {
    addr: SocketAddr,
    trusted_root: Bytes32,
    request_timeout: Duration,
}

impl TcpNetworkMapClient {
    pub fn new(addr: SocketAddr, trusted_root: Bytes32, request_timeout: Duration) -> Self {
        Self {
            addr,
            trusted_root,
            request_timeout,
        }
    }

    /// Address of the network map
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn request(&self, frame: Frame, expected: FrameType) -> Result<Frame, ClientError> {
        debug!("Network map request {:?} to {}", frame.frame_type, self.addr);
        let exchange = async {
            let mut stream = TcpStream::connect(self.addr).await?;
            write_frame(&mut stream, frame).await?;
            let response = read_frame(&mut stream).await?;
            Ok::<_, ClientError>(response)
        };
        let response = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.request_timeout))??
            .ok_or(ClientError::ConnectionClosed)?;

        match response.frame_type {
            t if t == expected => Ok(response),
            FrameType::Error => Err(ClientError::Remote(
                String::from_utf8_lossy(&response.payload).into_owned(),
            )),
            other => Err(ClientError::UnexpectedResponse(other)),
        }
    }
}

#[async_trait]
impl NetworkMapClient for TcpNetworkMapClient {
    async fn get_network_map(&self) -> Result<NetworkMapResponse, ClientError> {
        let frame = self
            .request(Frame::new(FrameType::GetNetworkMap, vec![]), FrameType::NetworkMap)
            .await?;
        let envelope: NetworkMapEnvelope = frame.decode()?;
        Ok(envelope.into())
    }

    async fn get_node_info(&self, hash: &SecureHash) -> Result<SignedNodeInfo, ClientError> {
        let frame = self
            .request(Frame::encode(FrameType::GetNodeInfo, hash)?, FrameType::NodeInfo)
            .await?;
        let signed: SignedNodeInfo = frame.decode()?;

        let computed = node_info_hash(&signed);
        if computed != *hash {
            return Err(netmap_core::Error::HashMismatch {
                computed: computed.to_hex(),
                transmitted: hash.to_hex(),
            }
            .into());
        }
        verify_node_info(&signed)?;
        Ok(signed)
    }

    async fn get_network_parameters(
        &self,
        hash: &SecureHash,
    ) -> Result<SignedNetworkParameters, ClientError> {
        let frame = self
            .request(
                Frame::encode(FrameType::GetNetworkParameters, hash)?,
                FrameType::NetworkParameters,
            )
            .await?;
        Ok(frame.decode()?)
    }

    async fn ack_parameters_update(&self, signed_hash: SignedHash) -> Result<(), ClientError> {
        self.request(
            Frame::encode(FrameType::AckParametersUpdate, &signed_hash)?,
            FrameType::Ack,
        )
        .await?;
        Ok(())
    }

    fn trusted_root(&self) -> Bytes32 {
        self.trusted_root
    }
}
