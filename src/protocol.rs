//! Kademlia RPC semantics: inbound handlers and typed outbound calls.
//!
//! Inbound requests are dispatched from an explicit method-name table; an
//! unknown name is logged and dropped without a wire response. Outbound
//! helpers fold the response outcome back into the routing table: an answer
//! welcomes the peer, silence evicts it. Silence is the only death signal
//! the protocol reacts to.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rmpv::Value;
use tracing::debug;

use crate::error::{KadError, Result};
use crate::message::{self, MessageId};
use crate::node::{Node, NodeId};
use crate::routing::RoutingTable;
use crate::rpc::Transport;
use crate::storage::SharedStorage;

/// What a peer answered to `find_value`.
#[derive(Debug)]
pub enum FindValueReply {
    Value(Bytes),
    Nodes(Vec<Node>),
}

/// Protocol glue between the transport, the routing table, and storage.
///
/// Cloning is cheap; every clone shares the same socket, table, and store.
#[derive(Clone)]
pub struct Protocol {
    local_id: NodeId,
    ksize: usize,
    transport: Transport,
    routing: Arc<RoutingTable>,
    storage: SharedStorage,
}

impl Protocol {
    pub fn new(
        local_id: NodeId,
        ksize: usize,
        transport: Transport,
        routing: Arc<RoutingTable>,
        storage: SharedStorage,
    ) -> Self {
        Self {
            local_id,
            ksize,
            transport,
            routing,
            storage,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Handles one inbound request and sends the response, if any.
    pub async fn handle_request(
        &self,
        sender: SocketAddr,
        id: MessageId,
        method: &str,
        args: Vec<Value>,
    ) {
        let reply = match method {
            "ping" => self.on_ping(sender, &args),
            "store" => self.on_store(sender, &args),
            "find_node" => self.on_find_node(sender, &args),
            "find_value" => self.on_find_value(sender, &args),
            "stun" => self.on_stun(sender, &args),
            "punch" => self.on_punch(&args),
            "hole" => Ok(message::id_value(&self.local_id)),
            other => {
                debug!("dropping request for unknown method {:?} from {}", other, sender);
                return;
            }
        };
        match reply {
            Ok(body) => self.transport.respond(sender, &id, &body).await,
            Err(err) => debug!("malformed {} request from {}: {}", method, sender, err),
        }
    }

    fn on_ping(&self, sender: SocketAddr, args: &[Value]) -> Result<Value> {
        let src = message::id_from(arg(args, 0)?)?;
        self.welcome_if_new(Node::new(src, sender));
        Ok(message::id_value(&self.local_id))
    }

    fn on_store(&self, sender: SocketAddr, args: &[Value]) -> Result<Value> {
        let src = message::id_from(arg(args, 0)?)?;
        let key = message::id_from(arg(args, 1)?)?;
        let value = arg(args, 2)?
            .as_slice()
            .ok_or_else(|| KadError::Malformed("store value is not binary".into()))?;

        self.welcome_if_new(Node::new(src, sender));
        debug!("storing {} bytes under {} for {}", value.len(), key, sender);
        self.storage
            .lock()
            .set(key, Bytes::copy_from_slice(value));
        Ok(Value::from(true))
    }

    fn on_find_node(&self, sender: SocketAddr, args: &[Value]) -> Result<Value> {
        let src = message::id_from(arg(args, 0)?)?;
        let target = message::id_from(arg(args, 1)?)?;

        self.welcome_if_new(Node::new(src, sender));
        let neighbors = self
            .routing
            .find_neighbors(&target, self.ksize, Some(sender));
        Ok(message::node_list_value(&neighbors))
    }

    fn on_find_value(&self, sender: SocketAddr, args: &[Value]) -> Result<Value> {
        let src = message::id_from(arg(args, 0)?)?;
        let key = message::id_from(arg(args, 1)?)?;

        self.welcome_if_new(Node::new(src, sender));
        let value = self.storage.lock().get(&key);
        match value {
            Some(value) => Ok(Value::Map(vec![(
                Value::from("value"),
                Value::Binary(value.to_vec()),
            )])),
            None => self.on_find_node(sender, args),
        }
    }

    /// Asks every listed peer to punch a mapping toward the caller, and
    /// tells the caller the address it was seen from.
    fn on_stun(&self, sender: SocketAddr, args: &[Value]) -> Result<Value> {
        let peers = message::node_list_from(arg(args, 0)?)?;
        for peer in peers {
            let proto = self.clone();
            tokio::spawn(async move {
                let _ = proto.punch(peer.addr, sender).await;
            });
        }
        Ok(message::addr_value(&sender))
    }

    fn on_punch(&self, args: &[Value]) -> Result<Value> {
        let target = message::addr_from(arg(args, 0)?)?;
        let proto = self.clone();
        tokio::spawn(async move {
            let _ = proto.hole(target).await;
        });
        Ok(Value::from("hole"))
    }

    /// First-contact bookkeeping: hand the newcomer every stored value it is
    /// now among the best holders for, then add it to the routing table. A
    /// node we already know only gets its bucket position refreshed.
    pub fn welcome_if_new(&self, node: Node) {
        if node.id == self.local_id {
            return;
        }
        if !self.routing.is_new_node(&node) {
            self.routing.add_contact(node);
            return;
        }

        debug!("never seen {:?} before, adding to routing table", node.id);
        let items = self.storage.lock().items();
        for (key, value) in items {
            let neighbors = self.routing.find_neighbors(&key, self.ksize, None);
            let hand_over = match (neighbors.first(), neighbors.last()) {
                (Some(nearest), Some(furthest)) => {
                    let new_node_closer = node.id.distance(&key) < furthest.id.distance(&key);
                    let we_are_closest = self.local_id.distance(&key) < nearest.id.distance(&key);
                    new_node_closer && we_are_closest
                }
                _ => true,
            };
            if hand_over {
                let proto = self.clone();
                tokio::spawn(async move {
                    let _ = proto.store(&node, key, value).await;
                });
            }
        }
        self.routing.add_contact(node);
    }

    /// An answer proves the peer alive; a timeout evicts it.
    fn note_response<T>(&self, node: &Node, result: &Result<T>) {
        match result {
            Ok(_) => self.welcome_if_new(*node),
            Err(KadError::Timeout) => {
                debug!("no response from {:?}, removing from routing table", node.id);
                self.routing.remove_contact(&node.id);
            }
            Err(_) => {}
        }
    }

    /// Pings a bare address, learning the id of whoever answers. Used during
    /// bootstrap, before the peer is a routing-table citizen.
    pub async fn ping_addr(&self, addr: SocketAddr) -> Result<NodeId> {
        let body = self
            .transport
            .call(addr, "ping", vec![message::id_value(&self.local_id)])
            .await?;
        message::id_from(&body)
    }

    pub async fn ping(&self, node: &Node) -> Result<NodeId> {
        let result = self.ping_addr(node.addr).await;
        self.note_response(node, &result);
        result
    }

    pub async fn store(&self, node: &Node, key: NodeId, value: Bytes) -> Result<bool> {
        let args = vec![
            message::id_value(&self.local_id),
            message::id_value(&key),
            Value::Binary(value.to_vec()),
        ];
        let result = self.transport.call(node.addr, "store", args).await;
        self.note_response(node, &result);
        Ok(result?.as_bool().unwrap_or(false))
    }

    pub async fn find_node(&self, node: &Node, target: &NodeId) -> Result<Vec<Node>> {
        let args = vec![
            message::id_value(&self.local_id),
            message::id_value(target),
        ];
        let result = self.transport.call(node.addr, "find_node", args).await;
        self.note_response(node, &result);
        message::node_list_from(&result?)
    }

    pub async fn find_value(&self, node: &Node, key: &NodeId) -> Result<FindValueReply> {
        let args = vec![message::id_value(&self.local_id), message::id_value(key)];
        let result = self.transport.call(node.addr, "find_value", args).await;
        self.note_response(node, &result);
        let body = result?;

        if let Some(map) = body.as_map() {
            for (k, v) in map {
                if k.as_str() == Some("value") {
                    let bytes = v
                        .as_slice()
                        .ok_or_else(|| KadError::Malformed("value is not binary".into()))?;
                    return Ok(FindValueReply::Value(Bytes::copy_from_slice(bytes)));
                }
            }
            return Err(KadError::Malformed("response map lacks a value".into()));
        }
        Ok(FindValueReply::Nodes(message::node_list_from(&body)?))
    }

    /// NAT priming ahead of a lookup round: the gateway has each listed peer
    /// punch a hole back to us. Best-effort, no bookkeeping.
    pub async fn stun(&self, gateway: &Node, peers: &[Node]) -> Result<()> {
        self.transport
            .call(gateway.addr, "stun", vec![message::node_list_value(peers)])
            .await
            .map(|_| ())
    }

    async fn punch(&self, peer: SocketAddr, target: SocketAddr) -> Result<()> {
        self.transport
            .call(peer, "punch", vec![message::addr_value(&target)])
            .await
            .map(|_| ())
    }

    async fn hole(&self, target: SocketAddr) -> Result<()> {
        self.transport.call(target, "hole", vec![]).await.map(|_| ())
    }

    /// One random id per lonely bucket, for the periodic refresh crawl.
    pub fn refresh_ids(&self) -> Vec<NodeId> {
        self.routing.refresh_ids()
    }
}

fn arg<'a>(args: &'a [Value], index: usize) -> Result<&'a Value> {
    args.get(index)
        .ok_or_else(|| KadError::Malformed(format!("missing argument {}", index)))
}
