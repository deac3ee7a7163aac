//! Request/response RPC over unreliable datagrams.
//!
//! An outbound call allocates a random 20-byte message id and parks a
//! one-shot completion in the pending table. The entry is registered before
//! the datagram is handed to the socket, so a response can never race its
//! own registration. A response with an unknown id, including one that
//! arrives after its timeout, is logged and dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rmpv::Value;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{KadError, Result};
use crate::message::{self, MessageId};

struct Pending {
    tx: oneshot::Sender<Value>,
    method: &'static str,
    addr: SocketAddr,
}

/// Shared datagram transport: one bound socket plus the correlation table.
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    pending: Arc<Mutex<HashMap<MessageId, Pending>>>,
    rpc_timeout: Duration,
}

impl Transport {
    pub fn new(socket: Arc<UdpSocket>, rpc_timeout: Duration) -> Self {
        Self {
            socket,
            pending: Arc::new(Mutex::new(HashMap::new())),
            rpc_timeout,
        }
    }

    /// Sends a request and waits for the matching response or the timeout.
    pub async fn call(
        &self,
        addr: SocketAddr,
        method: &'static str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let id = MessageId::random();
        let datagram = message::encode_request(&id, method, args)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, Pending { tx, method, addr });

        if let Err(err) = self.socket.send_to(&datagram, addr).await {
            self.pending.lock().remove(&id);
            return Err(err.into());
        }

        match timeout(self.rpc_timeout, rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) | Err(_) => {
                debug!("rpc {} to {} timed out", method, addr);
                self.pending.lock().remove(&id);
                Err(KadError::Timeout)
            }
        }
    }

    /// Routes an inbound response to its waiting caller.
    pub fn fulfill(&self, id: MessageId, body: Value) {
        match self.pending.lock().remove(&id) {
            Some(pending) => {
                debug!("rpc {} to {} answered", pending.method, pending.addr);
                let _ = pending.tx.send(body);
            }
            None => debug!("dropping response with unknown {:?}", id),
        }
    }

    /// Sends the response datagram for a handled request.
    pub async fn respond(&self, addr: SocketAddr, id: &MessageId, body: &Value) {
        match message::encode_response(id, body) {
            Ok(datagram) => {
                if let Err(err) = self.socket.send_to(&datagram, addr).await {
                    warn!("failed to send response to {}: {}", addr, err);
                }
            }
            Err(err) => warn!("failed to encode response for {}: {}", addr, err),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Inbound;

    async fn bound() -> (Arc<UdpSocket>, SocketAddr) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn test_call_correlates_response() {
        let (caller_socket, _) = bound().await;
        let (responder, responder_addr) = bound().await;

        // Echo-style responder: answer any request with `true`.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            if let Inbound::Request { id, .. } = message::decode(&buf[..len]).unwrap() {
                let reply = message::encode_response(&id, &Value::from(true)).unwrap();
                responder.send_to(&reply, from).await.unwrap();
            }
        });

        let transport = Transport::new(Arc::clone(&caller_socket), Duration::from_secs(2));
        let pump = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                let (len, _) = caller_socket.recv_from(&mut buf).await.unwrap();
                if let Inbound::Response { id, body } = message::decode(&buf[..len]).unwrap() {
                    transport.fulfill(id, body);
                }
            })
        };

        let body = transport
            .call(responder_addr, "ping", vec![])
            .await
            .unwrap();
        assert_eq!(body.as_bool(), Some(true));
        assert_eq!(transport.pending_len(), 0);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_times_out_and_vacates_pending() {
        let (caller_socket, _) = bound().await;
        let (_silent, silent_addr) = bound().await;

        let transport = Transport::new(caller_socket, Duration::from_millis(100));
        let result = transport.call(silent_addr, "ping", vec![]).await;
        assert!(matches!(result, Err(KadError::Timeout)));
        assert_eq!(transport.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_response_is_dropped() {
        let (socket, _) = bound().await;
        let transport = Transport::new(socket, Duration::from_millis(100));
        transport.fulfill(MessageId::random(), Value::from(true));
        assert_eq!(transport.pending_len(), 0);
    }
}
