//! Auxiliary TCP control endpoint: a lightweight lite-server
//! style listener for out-of-band queries (node health, administrative
//! calls) that doesn't need full UDP ADNL semantics. Framing here is a
//! private length-prefixed `bincode` encoding rather than the TL-exact
//! format the primary datagram path uses — this channel isn't addressed
//! by short-id prefix matching, so there's no wire-compatibility
//! requirement to preserve, only authentication and confidentiality.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use adnl_core::ecies;
use adnl_core::Keyring;
use adnl_types::ShortNodeId;
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::NetError;

const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
const PING_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Serialize, Deserialize)]
enum ExtFrame {
    Ping { value: i64 },
    Pong { value: i64 },
    Query { query_id: [u8; 32], data: Vec<u8> },
    Answer { query_id: [u8; 32], data: Vec<u8> },
}

/// Sent once, sealed with ECIES against the server's long-term key,
/// to establish the pair of AES-GCM keys framing the rest of the session.
#[derive(Serialize, Deserialize)]
struct HandshakeHello {
    client_full_id: [u8; 32],
    key_material: [u8; 32],
}

pub type ExtQueryHandler = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// Listens for TCP connections addressed to one local identity.
pub struct ExtServer {
    local_id: ShortNodeId,
    keyring: Keyring,
    handler: Option<ExtQueryHandler>,
}

impl ExtServer {
    pub fn new(local_id: ShortNodeId, keyring: Keyring, handler: Option<ExtQueryHandler>) -> Self {
        ExtServer { local_id, keyring, handler }
    }

    pub async fn serve(self: Arc<Self>, bind_addr: SocketAddr) -> Result<(), NetError> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(%bind_addr, "ext server: listening");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream).await {
                    debug!(%peer_addr, error = %e, "ext server: connection ended");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), NetError> {
        let hello_sealed = read_frame(&mut stream).await?;
        let hello_bytes = self.keyring.decrypt(&self.local_id, &hello_sealed)?;
        let hello: HandshakeHello =
            bincode::deserialize(&hello_bytes).map_err(|e| NetError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        // Server receives on the client->server key and sends on server->client.
        let (recv_key, send_key) = derive_session_keys(&hello);

        // Ack: an empty frame encrypted with the session's send key,
        // proving the server derived the same keys the client did.
        let ack = adnl_core::channel_crypto::encrypt(&send_key, &[])?;
        write_frame(&mut stream, &ack).await?;

        loop {
            let framed = match read_frame(&mut stream).await {
                Ok(f) => f,
                Err(NetError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            let plaintext = adnl_core::channel_crypto::decrypt(&recv_key, &framed)?;
            let frame: ExtFrame =
                bincode::deserialize(&plaintext).map_err(|e| NetError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

            match frame {
                ExtFrame::Ping { value } => {
                    self.send_frame(&mut stream, &send_key, &ExtFrame::Pong { value }).await?;
                }
                ExtFrame::Pong { .. } => {}
                ExtFrame::Query { query_id, data } => {
                    let answer = match &self.handler {
                        Some(handler) => handler(data),
                        None => Vec::new(),
                    };
                    self.send_frame(&mut stream, &send_key, &ExtFrame::Answer { query_id, data: answer }).await?;
                }
                ExtFrame::Answer { .. } => {
                    warn!("ext server: unsolicited answer frame, dropping");
                }
            }
        }
    }

    async fn send_frame(&self, stream: &mut TcpStream, key: &[u8; 32], frame: &ExtFrame) -> Result<(), NetError> {
        let plaintext = bincode::serialize(frame).expect("ExtFrame serialization is infallible");
        let framed = adnl_core::channel_crypto::encrypt(key, &plaintext)?;
        write_frame(stream, &framed).await
    }
}

/// Client-side half of the handshake: seal a fresh symmetric key against
/// the server's known public identity and run the ping keepalive loop
/// until the caller drops the returned handle.
pub struct ExtClient {
    stream: TcpStream,
    recv_key: [u8; 32],
    send_key: [u8; 32],
}

impl ExtClient {
    pub async fn connect(
        addr: SocketAddr,
        server_local_id: ShortNodeId,
        server_full_id: &ed25519_dalek::VerifyingKey,
        client_full_id: [u8; 32],
    ) -> Result<Self, NetError> {
        let mut stream = TcpStream::connect(addr).await?;
        let mut key_material = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key_material);
        let hello = HandshakeHello { client_full_id, key_material };
        let hello_bytes = bincode::serialize(&hello).expect("HandshakeHello serialization is infallible");
        let sealed = ecies::seal(server_full_id, &hello_bytes)?;
        write_frame(&mut stream, &sealed).await?;

        // Client receives on server->client and sends on client->server,
        // the mirror image of the server's assignment above.
        let (send_key, recv_key) = derive_session_keys(&hello);
        let _ = read_frame(&mut stream).await?; // ack
        let _ = server_local_id;

        Ok(ExtClient { stream, recv_key, send_key })
    }

    pub async fn ping(&mut self, value: i64) -> Result<i64, NetError> {
        self.send(&ExtFrame::Ping { value }).await?;
        match self.recv().await? {
            ExtFrame::Pong { value } => Ok(value),
            _ => Err(NetError::NotReady("expected pong".into())),
        }
    }

    pub async fn query(&mut self, query_id: [u8; 32], data: Vec<u8>) -> Result<Vec<u8>, NetError> {
        self.send(&ExtFrame::Query { query_id, data }).await?;
        match self.recv().await? {
            ExtFrame::Answer { data, .. } => Ok(data),
            _ => Err(NetError::NotReady("expected answer".into())),
        }
    }

    async fn send(&mut self, frame: &ExtFrame) -> Result<(), NetError> {
        let plaintext = bincode::serialize(frame).expect("ExtFrame serialization is infallible");
        let framed = adnl_core::channel_crypto::encrypt(&self.send_key, &plaintext)?;
        write_frame(&mut self.stream, &framed).await
    }

    async fn recv(&mut self) -> Result<ExtFrame, NetError> {
        let framed = read_frame(&mut self.stream).await?;
        let plaintext = adnl_core::channel_crypto::decrypt(&self.recv_key, &framed)?;
        bincode::deserialize(&plaintext).map_err(|e| NetError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }
}

/// Run an unattended ping loop on a connected client until it errors.
pub async fn keepalive_loop(mut client: ExtClient) {
    let mut counter: i64 = 0;
    loop {
        tokio::time::sleep(PING_INTERVAL).await;
        counter += 1;
        if let Err(e) = client.ping(counter).await {
            debug!(error = %e, "ext client: keepalive ping failed, stopping");
            return;
        }
    }
}

/// Derive the two directional AES keys from the handshake's key material.
/// Unlike channel establishment (§4.3), the two ends here aren't symmetric
/// peers negotiating who's "less" — the TCP connection direction already
/// fixes which side is client and which is server — so each direction
/// just gets its own domain-separated hash of the shared material.
fn derive_session_keys(hello: &HandshakeHello) -> ([u8; 32], [u8; 32]) {
    let client_to_server = {
        let mut hasher = Sha256::new();
        hasher.update(b"adnl-ext-c2s");
        hasher.update(hello.key_material);
        let digest: [u8; 32] = hasher.finalize().into();
        digest
    };
    let server_to_client = {
        let mut hasher = Sha256::new();
        hasher.update(b"adnl-ext-s2c");
        hasher.update(hello.key_material);
        let digest: [u8; 32] = hasher.finalize().into();
        digest
    };
    (client_to_server, server_to_client)
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, NetError> {
    let len = stream.read_u32_le_adnl().await?;
    if len > MAX_FRAME_SIZE {
        return Err(NetError::NotReady(format!("ext frame of {len} bytes exceeds cap")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), NetError> {
    let len = payload.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(payload).await?;
    Ok(())
}

/// Small helper trait so call sites read `read_u32_le_adnl()` instead of
/// a one-off local buffer dance at every call site.
#[async_trait]
trait ReadU32LeExt {
    async fn read_u32_le_adnl(&mut self) -> std::io::Result<u32>;
}

#[async_trait]
impl ReadU32LeExt for TcpStream {
    async fn read_u32_le_adnl(&mut self) -> std::io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).await?;
        Ok(u32::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_keys_differ_by_direction_and_are_deterministic() {
        let hello = HandshakeHello {
            client_full_id: [2u8; 32],
            key_material: [3u8; 32],
        };
        let (c2s, s2c) = derive_session_keys(&hello);
        assert_ne!(c2s, s2c);
        let (c2s_again, s2c_again) = derive_session_keys(&hello);
        assert_eq!(c2s, c2s_again);
        assert_eq!(s2c, s2c_again);
    }
}
