//! Owns UDP listening sockets and category → socket routing.
//! Tunnelling proxies aren't wired up yet; the socket table shape
//! leaves room for them without changing the public API.

use std::net::SocketAddr;
use std::sync::Arc;

use adnl_types::constants::NETWORK_MTU;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::NetError;

/// One inbound datagram, handed up to whatever installed the callback
/// (in practice, `PeerTable`'s router task).
#[derive(Debug)]
pub struct InboundDatagram {
    pub src: SocketAddr,
    pub category_mask: u16,
    pub payload: Vec<u8>,
}

struct ListenSocket {
    socket: Arc<UdpSocket>,
    category_mask: u16,
    priority: u32,
}

/// UDP transport shared by every LocalId and PeerPair. Cheap to clone
/// (an `Arc` handle) since every listener's socket and the inbound
/// sender are themselves reference-counted.
#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<parking_lot::RwLock<Vec<ListenSocket>>>,
    inbound_tx: mpsc::Sender<InboundDatagram>,
}

impl NetworkManager {
    /// Returns the manager plus the receiving half of its single inbound
    /// sink, fed by every listening socket this manager owns.
    pub fn new() -> (Self, mpsc::Receiver<InboundDatagram>) {
        let (tx, rx) = mpsc::channel(1024);
        (
            NetworkManager {
                inner: Arc::new(parking_lot::RwLock::new(Vec::new())),
                inbound_tx: tx,
            },
            rx,
        )
    }

    pub const fn get_mtu() -> u32 {
        NETWORK_MTU as u32
    }

    /// Bind a listening UDP endpoint tagged with `category_mask` and
    /// `priority`, and start forwarding everything it receives to the
    /// installed callback.
    pub async fn add_self_addr(
        &self,
        bind_addr: SocketAddr,
        category_mask: u16,
        priority: u32,
    ) -> Result<SocketAddr, NetError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        info!(%local_addr, category_mask, priority, "network manager: listening");

        self.inner.write().push(ListenSocket {
            socket: Arc::clone(&socket),
            category_mask,
            priority,
        });

        let tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; NETWORK_MTU + 256];
            loop {
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "network manager: recv_from failed");
                        continue;
                    }
                };
                let datagram = InboundDatagram {
                    src,
                    category_mask,
                    payload: buf[..len].to_vec(),
                };
                if tx.send(datagram).await.is_err() {
                    debug!("network manager: inbound channel closed, stopping listener");
                    break;
                }
            }
        });

        Ok(local_addr)
    }

    pub fn set_local_id_category(&self, _category: u16) {
        // Category bookkeeping for outbound selection lives on the
        // caller (LocalId stores its own category); nothing to persist
        // here beyond what add_self_addr already records per socket.
    }

    /// Send `payload` out whichever listening socket's category mask
    /// intersects `src_category` and whose priority is high enough.
    /// Drops silently if no socket matches.
    pub async fn send_udp(
        &self,
        src_category: u16,
        dst: SocketAddr,
        min_priority: u32,
        payload: &[u8],
    ) -> Result<(), NetError> {
        if payload.len() > NETWORK_MTU {
            return Err(NetError::NotReady(format!(
                "payload {} exceeds network mtu {}",
                payload.len(),
                NETWORK_MTU
            )));
        }
        let socket = {
            let sockets = self.inner.read();
            sockets
                .iter()
                .filter(|s| s.category_mask & src_category != 0 && s.priority >= min_priority)
                .map(|s| Arc::clone(&s.socket))
                .next()
        };
        let Some(socket) = socket else {
            debug!(src_category, %dst, "network manager: no socket matches, dropping");
            return Ok(());
        };
        if let Err(e) = socket.send_to(payload, dst).await {
            error!(error = %e, %dst, "network manager: send_to failed");
        }
        Ok(())
    }
}
