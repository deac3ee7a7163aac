//! Datagram framing and MessagePack bodies.
//!
//! Every datagram is `kind (1 byte) | message id (20 bytes) | body`, where
//! the body is a single MessagePack value. Request bodies are exactly
//! `[method, args]`; response bodies are whatever the method defines.
//! Framed requests are capped at 512 bytes and rejected at the sender.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use rand::Rng as _;
use rmpv::Value;

use crate::constants::{HEADER_LEN, MAX_REQUEST_LEN};
use crate::error::{KadError, Result};
use crate::node::{Node, NodeId};

pub const KIND_REQUEST: u8 = 0x00;
pub const KIND_RESPONSE: u8 = 0x01;

/// Random correlation id carried by every datagram.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 20]);

impl MessageId {
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// A decoded inbound datagram.
#[derive(Debug)]
pub enum Inbound {
    Request {
        id: MessageId,
        method: String,
        args: Vec<Value>,
    },
    Response {
        id: MessageId,
        body: Value,
    },
}

pub fn encode_request(id: &MessageId, method: &str, args: Vec<Value>) -> Result<Vec<u8>> {
    let body = Value::Array(vec![Value::from(method), Value::Array(args)]);
    let mut buf = Vec::with_capacity(64);
    buf.push(KIND_REQUEST);
    buf.extend_from_slice(&id.0);
    rmpv::encode::write_value(&mut buf, &body)
        .map_err(|e| KadError::Malformed(e.to_string()))?;
    if buf.len() > MAX_REQUEST_LEN {
        return Err(KadError::RequestTooLarge(buf.len()));
    }
    Ok(buf)
}

pub fn encode_response(id: &MessageId, body: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.push(KIND_RESPONSE);
    buf.extend_from_slice(&id.0);
    rmpv::encode::write_value(&mut buf, body)
        .map_err(|e| KadError::Malformed(e.to_string()))?;
    Ok(buf)
}

pub fn decode(datagram: &[u8]) -> Result<Inbound> {
    if datagram.len() <= HEADER_LEN {
        return Err(KadError::Malformed(format!(
            "datagram too short: {} bytes",
            datagram.len()
        )));
    }
    let kind = datagram[0];
    let mut raw_id = [0u8; 20];
    raw_id.copy_from_slice(&datagram[1..HEADER_LEN]);
    let id = MessageId(raw_id);

    let mut rest = &datagram[HEADER_LEN..];
    let body = rmpv::decode::read_value(&mut rest)
        .map_err(|e| KadError::Malformed(e.to_string()))?;

    match kind {
        KIND_REQUEST => {
            let (method, args) = split_request(body)?;
            Ok(Inbound::Request { id, method, args })
        }
        KIND_RESPONSE => Ok(Inbound::Response { id, body }),
        other => Err(KadError::Malformed(format!(
            "unknown message kind {:#04x}",
            other
        ))),
    }
}

/// Request bodies are exactly `[name, args]`.
fn split_request(body: Value) -> Result<(String, Vec<Value>)> {
    let malformed = || KadError::Malformed("request body is not [name, args]".into());
    match body {
        Value::Array(mut items) if items.len() == 2 => {
            let args = match items.pop() {
                Some(Value::Array(args)) => args,
                _ => return Err(malformed()),
            };
            let method = match items.pop() {
                Some(Value::String(s)) => s.into_str().ok_or_else(malformed)?,
                _ => return Err(malformed()),
            };
            Ok((method, args))
        }
        _ => Err(malformed()),
    }
}

pub fn id_value(id: &NodeId) -> Value {
    Value::Binary(id.0.to_vec())
}

pub fn id_from(value: &Value) -> Result<NodeId> {
    value
        .as_slice()
        .and_then(|b| NodeId::from_bytes(b).ok())
        .ok_or_else(|| KadError::Malformed("expected a 20-byte id".into()))
}

/// A node on the wire is `[id, host, port]`.
pub fn node_value(node: &Node) -> Value {
    Value::Array(vec![
        Value::Binary(node.id.0.to_vec()),
        Value::from(node.addr.ip().to_string()),
        Value::from(node.addr.port()),
    ])
}

pub fn node_from(value: &Value) -> Result<Node> {
    let malformed = || KadError::Malformed("expected [id, host, port]".into());
    let items = value.as_array().ok_or_else(malformed)?;
    match items.as_slice() {
        [id, host, port] => {
            let id = id_from(id)?;
            let ip: IpAddr = host
                .as_str()
                .and_then(|h| h.parse().ok())
                .ok_or_else(malformed)?;
            let port = port
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(malformed)?;
            Ok(Node::new(id, SocketAddr::new(ip, port)))
        }
        _ => Err(malformed()),
    }
}

pub fn node_list_value(nodes: &[Node]) -> Value {
    Value::Array(nodes.iter().map(node_value).collect())
}

pub fn node_list_from(value: &Value) -> Result<Vec<Node>> {
    let items = value
        .as_array()
        .ok_or_else(|| KadError::Malformed("expected a node list".into()))?;
    items.iter().map(node_from).collect()
}

/// An address on the wire is `[host, port]`.
pub fn addr_value(addr: &SocketAddr) -> Value {
    Value::Array(vec![
        Value::from(addr.ip().to_string()),
        Value::from(addr.port()),
    ])
}

pub fn addr_from(value: &Value) -> Result<SocketAddr> {
    let malformed = || KadError::Malformed("expected [host, port]".into());
    let items = value.as_array().ok_or_else(malformed)?;
    match items.as_slice() {
        [host, port] => {
            let ip: IpAddr = host
                .as_str()
                .and_then(|h| h.parse().ok())
                .ok_or_else(malformed)?;
            let port = port
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(malformed)?;
            Ok(SocketAddr::new(ip, port))
        }
        _ => Err(malformed()),
    }
}
