//! # RPC Layer
//!
//! QUIC request/response plumbing for the directory protocol.
//!
//! ## Framing
//!
//! One request per bidirectional stream:
//!
//! ```text
//! client → server: [u32 BE length][bincode RpcRequest]   (finish)
//! server → client: [u32 BE length][bincode RpcResponse]  (finish)
//! ```
//!
//! ## Server side
//!
//! [`handle_connection`] accepts streams on one connection and spawns a task
//! per stream; the task reads the request under a read timeout, hands it to
//! [`dispatch`] and writes the response. Handler failures become
//! `RpcResponse::Error { kind, message }`.
//!
//! Handlers are not time-limited and run in their own task: a Load waits on
//! one reachability probe per node, and a dropped stream must not cut a batch
//! short.
//!
//! ## Client side
//!
//! [`RpcClient`] holds one cached connection to a pinned server identity and
//! implements [`DirectoryRpc`], so callers use the same trait either side of
//! the wire. Transport failures surface as `DirectoryError::Transport`;
//! server-side failures are rebuilt from their wire kind.
//!
//! ## Security
//!
//! - Request and response sizes are bounded before allocation
//! - The server certificate must match the identity given to the client
//! - The caller identity inside each request is not authenticated

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint, Incoming};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crypto::{create_client_config, extract_verified_identity, generate_ed25519_cert, identity_to_sni};
use crate::error::{DirectoryError, ErrorKind, Result as DirectoryResult};
use crate::identity::{Identity, Keypair};
use crate::messages::{self, LoadRequest, NodeResponse, QueryResponse, RpcRequest, RpcResponse};
use crate::protocols::DirectoryRpc;

// ============================================================================
// Limits
// ============================================================================

/// Maximum size of an RPC response payload.
/// SECURITY: Prevents memory exhaustion from oversized responses.
const MAX_RESPONSE_SIZE: usize = messages::MAX_DESERIALIZE_SIZE as usize;

/// Maximum size of an RPC request payload.
const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Timeout for reading each part of a request off the stream.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a whole client-side request/response exchange.
const RPC_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra client-side budget per submitted node, covering its server-side probe.
const LOAD_NODE_BUDGET: Duration = Duration::from_secs(5);

/// Timeout for the QUIC handshake with the server.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Server side
// ============================================================================

pub async fn handle_connection<D: DirectoryRpc + 'static>(service: Arc<D>, incoming: Incoming) -> Result<()> {
    let connection = incoming.await.context("failed to accept connection")?;
    let remote = connection.remote_address();

    let Some(peer) = extract_verified_identity(&connection) else {
        warn!(remote = %remote, "rejecting connection: could not read client certificate");
        connection.close(0u32.into(), b"bad certificate");
        return Err(anyhow::anyhow!("could not verify client certificate"));
    };
    debug!(remote = %remote, peer = %peer, "client connected");

    loop {
        let stream = match connection.accept_bi().await {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_)) | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!(remote = %remote, "connection closed");
                break Ok(());
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(remote = %remote, "connection idle timeout");
                break Ok(());
            }
            Err(e) => break Err(e.into()),
        };

        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(service, stream, remote).await {
                debug!(remote = %remote, error = ?e, "stream error");
            }
        });
    }
}

async fn handle_stream<D: DirectoryRpc + 'static>(
    service: Arc<D>,
    (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    remote: SocketAddr,
) -> Result<()> {
    let mut len_buf = [0u8; 4];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut len_buf))
        .await
        .map_err(|_| anyhow::anyhow!("request header read timed out"))??;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_REQUEST_SIZE {
        warn!(remote = %remote, size = len, max = MAX_REQUEST_SIZE, "rejecting oversized request");
        let response = RpcResponse::Error {
            kind: ErrorKind::Internal,
            message: format!("request too large: {} bytes (max {})", len, MAX_REQUEST_SIZE),
        };
        return write_response(&mut send, &response).await;
    }

    let mut request_bytes = vec![0u8; len];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut request_bytes))
        .await
        .map_err(|_| anyhow::anyhow!("request body read timed out"))??;

    let request = match messages::deserialize_request(&request_bytes) {
        Ok(request) => request,
        Err(e) => {
            warn!(remote = %remote, error = %e, "rejecting malformed request");
            let response = RpcResponse::Error {
                kind: ErrorKind::Internal,
                message: "malformed request".to_string(),
            };
            return write_response(&mut send, &response).await;
        }
    };

    let response = dispatch(service, request).await;
    write_response(&mut send, &response).await
}

/// Run one request in a task of its own. The handler finishes even if the
/// caller of `dispatch` is dropped.
pub async fn dispatch<D: DirectoryRpc + 'static>(service: Arc<D>, request: RpcRequest) -> RpcResponse {
    let operation = request.operation();
    let handler = tokio::spawn(async move { handle_rpc_request(service.as_ref(), request).await });
    match handler.await {
        Ok(response) => response,
        Err(e) => {
            warn!(operation, error = %e, "request handler aborted");
            RpcResponse::Error {
                kind: ErrorKind::Internal,
                message: "request handler aborted".to_string(),
            }
        }
    }
}

async fn write_response(send: &mut quinn::SendStream, response: &RpcResponse) -> Result<()> {
    let response_bytes = messages::serialize_response(response).context("failed to serialize response")?;
    let len = response_bytes.len() as u32;
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(&response_bytes).await?;
    send.finish()?;
    Ok(())
}

/// Run one request against `service` and wrap the outcome for the wire.
pub async fn handle_rpc_request<D: DirectoryRpc + ?Sized>(service: &D, request: RpcRequest) -> RpcResponse {
    let operation = request.operation();
    let user = request.username().to_string();

    let result = match request {
        RpcRequest::Access { username } => service.access(&username).await.map(|()| RpcResponse::Access),
        RpcRequest::User { username } => service.users(&username).await.map(RpcResponse::Users),
        RpcRequest::Query { username, groups } => service.query(&username, &groups).await.map(RpcResponse::Query),
        RpcRequest::Load(load) => service.load(load).await.map(RpcResponse::Load),
        RpcRequest::Delete { username, groups } => service.delete(&username, &groups).await.map(RpcResponse::Delete),
        RpcRequest::Dump { username } => service.dump(&username).await.map(|message| RpcResponse::Dump { message }),
        RpcRequest::Decode { username } => {
            service.decode(&username).await.map(|message| RpcResponse::Decode { message })
        }
        RpcRequest::Cache { username } => service
            .cache(&username)
            .await
            .map(|dirty| RpcResponse::Cache { dirty: u8::from(dirty) }),
    };

    result.unwrap_or_else(|e| {
        if e.is_systemic() {
            warn!(user = %user, operation, error = %e, "request failed");
        } else {
            debug!(user = %user, operation, error = %e, "request refused");
        }
        RpcResponse::Error {
            kind: e.kind(),
            message: e.detail(),
        }
    })
}

// ============================================================================
// Client side
// ============================================================================

/// Parse `IP:PORT/IDENTITY`, where IDENTITY is the server's hex public key.
pub fn parse_server_address(address: &str) -> Result<(SocketAddr, Identity)> {
    let (addr, identity) = address
        .split_once('/')
        .with_context(|| format!("server must be ADDR/IDENTITY, got {:?}", address))?;
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid server address: {}", addr))?;
    let identity = Identity::from_hex(identity).with_context(|| format!("invalid server identity: {}", identity))?;
    Ok((addr, identity))
}

pub struct RpcClient {
    endpoint: Endpoint,
    client_config: ClientConfig,
    server_addr: SocketAddr,
    server_identity: Identity,
    connection: Mutex<Option<Connection>>,
}

impl RpcClient {
    /// Client endpoint with a throwaway keypair for its certificate.
    pub fn new(server_addr: SocketAddr, server_identity: Identity) -> Result<Self> {
        let keypair = Keypair::generate();
        let (certs, key) = generate_ed25519_cert(&keypair)?;
        let client_config = create_client_config(certs, key)?;

        let bind: SocketAddr = if server_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let endpoint = Endpoint::client(bind).context("failed to bind client endpoint")?;

        Ok(Self {
            endpoint,
            client_config,
            server_addr,
            server_identity,
            connection: Mutex::new(None),
        })
    }

    async fn get_or_connect(&self) -> Result<Connection> {
        let mut cached = self.connection.lock().await;
        if let Some(conn) = cached.as_ref()
            && conn.close_reason().is_none()
        {
            return Ok(conn.clone());
        }
        let conn = self.connect().await?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn connect(&self) -> Result<Connection> {
        let sni = identity_to_sni(&self.server_identity);
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), self.server_addr, &sni)
            .with_context(|| format!("failed to initiate connection to {}", self.server_addr))?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .with_context(|| format!("connection to {} timed out", self.server_addr))?
            .with_context(|| format!("failed to establish connection to {}", self.server_addr))?;
        info!(server = %self.server_addr, identity = %self.server_identity, "connected to directory");
        Ok(conn)
    }

    async fn invalidate_connection(&self) {
        self.connection.lock().await.take();
    }

    /// Send one request and wait for its response.
    pub async fn call(&self, request: RpcRequest) -> Result<RpcResponse> {
        let budget = match &request {
            RpcRequest::Load(load) => {
                let nodes = u32::try_from(load.nodes.len()).unwrap_or(u32::MAX);
                RPC_STREAM_TIMEOUT.saturating_add(LOAD_NODE_BUDGET.saturating_mul(nodes))
            }
            _ => RPC_STREAM_TIMEOUT,
        };
        let conn = self.get_or_connect().await?;
        let result = self.rpc_inner(&conn, request, budget).await;
        if result.is_err() {
            self.invalidate_connection().await;
        }
        result
    }

    async fn rpc_inner(&self, conn: &Connection, request: RpcRequest, budget: Duration) -> Result<RpcResponse> {
        tokio::time::timeout(budget, async {
            let (mut send, mut recv) = conn.open_bi().await.context("failed to open bidirectional stream")?;

            let request_bytes = messages::serialize_request(&request).context("failed to serialize request")?;
            let len = request_bytes.len() as u32;
            send.write_all(&len.to_be_bytes()).await?;
            send.write_all(&request_bytes).await?;
            send.finish()?;

            let mut len_buf = [0u8; 4];
            recv.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;

            if len > MAX_RESPONSE_SIZE {
                warn!(
                    server = %self.server_addr,
                    size = len,
                    max = MAX_RESPONSE_SIZE,
                    "server sent oversized response"
                );
                anyhow::bail!("response too large: {} bytes (max {})", len, MAX_RESPONSE_SIZE);
            }

            let mut response_bytes = vec![0u8; len];
            recv.read_exact(&mut response_bytes).await?;

            let response: RpcResponse =
                messages::deserialize_bounded(&response_bytes).context("failed to deserialize response")?;
            Ok(response)
        })
        .await
        .context("RPC timed out")?
    }

    /// `call` with failures mapped into the directory error taxonomy.
    async fn request(&self, request: RpcRequest) -> DirectoryResult<RpcResponse> {
        match self.call(request).await {
            Ok(RpcResponse::Error { kind, message }) => Err(DirectoryError::from_wire(kind, message)),
            Ok(response) => Ok(response),
            Err(e) => Err(DirectoryError::Transport(format!("{:#}", e))),
        }
    }

    /// Close the connection and wait for the endpoint to drain.
    pub async fn close(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.close(0u32.into(), b"done");
        }
        self.endpoint.wait_idle().await;
    }
}

fn unexpected(operation: &str, response: RpcResponse) -> DirectoryError {
    DirectoryError::Transport(format!("unexpected response to {}: {:?}", operation, response))
}

#[async_trait]
impl DirectoryRpc for RpcClient {
    async fn access(&self, username: &str) -> DirectoryResult<()> {
        match self.request(RpcRequest::Access { username: username.into() }).await? {
            RpcResponse::Access => Ok(()),
            other => Err(unexpected("access", other)),
        }
    }

    async fn users(&self, username: &str) -> DirectoryResult<std::collections::BTreeMap<String, bool>> {
        match self.request(RpcRequest::User { username: username.into() }).await? {
            RpcResponse::Users(users) => Ok(users),
            other => Err(unexpected("user", other)),
        }
    }

    async fn query(&self, username: &str, groups: &[String]) -> DirectoryResult<QueryResponse> {
        let request = RpcRequest::Query {
            username: username.into(),
            groups: groups.to_vec(),
        };
        match self.request(request).await? {
            RpcResponse::Query(response) => Ok(response),
            other => Err(unexpected("query", other)),
        }
    }

    async fn load(&self, request: LoadRequest) -> DirectoryResult<Vec<NodeResponse>> {
        match self.request(RpcRequest::Load(request)).await? {
            RpcResponse::Load(results) => Ok(results),
            other => Err(unexpected("load", other)),
        }
    }

    async fn delete(&self, username: &str, groups: &[String]) -> DirectoryResult<Vec<NodeResponse>> {
        let request = RpcRequest::Delete {
            username: username.into(),
            groups: groups.to_vec(),
        };
        match self.request(request).await? {
            RpcResponse::Delete(results) => Ok(results),
            other => Err(unexpected("delete", other)),
        }
    }

    async fn dump(&self, username: &str) -> DirectoryResult<String> {
        match self.request(RpcRequest::Dump { username: username.into() }).await? {
            RpcResponse::Dump { message } => Ok(message),
            other => Err(unexpected("dump", other)),
        }
    }

    async fn decode(&self, username: &str) -> DirectoryResult<String> {
        match self.request(RpcRequest::Decode { username: username.into() }).await? {
            RpcResponse::Decode { message } => Ok(message),
            other => Err(unexpected("decode", other)),
        }
    }

    async fn cache(&self, username: &str) -> DirectoryResult<bool> {
        match self.request(RpcRequest::Cache { username: username.into() }).await? {
            RpcResponse::Cache { dirty } => Ok(dirty != 0),
            other => Err(unexpected("cache", other)),
        }
    }
}
