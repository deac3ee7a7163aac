//! Iterative α-parallel lookup, the "spider crawl".
//!
//! Each round queries up to α of the nearest uncontacted candidates in
//! parallel and folds their answers back into the candidate set. The crawl
//! ends once every visible candidate has been contacted. When the visible
//! frontier repeats between rounds, the next round widens to the whole
//! uncontacted frontier, which bounds the tail of the crawl once the
//! nearest set has stabilized.

use std::collections::HashMap;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::heap::NodeHeap;
use crate::node::{Node, NodeId};
use crate::protocol::{FindValueReply, Protocol};

/// State for one lookup around `target`.
pub struct Spider {
    proto: Protocol,
    target: NodeId,
    nearest: NodeHeap,
    alpha: usize,
    gateways: Vec<Node>,
    last_crawled: Vec<NodeId>,
}

impl Spider {
    pub fn new(
        proto: Protocol,
        target: NodeId,
        seeds: Vec<Node>,
        ksize: usize,
        alpha: usize,
        gateways: Vec<Node>,
    ) -> Self {
        let mut nearest = NodeHeap::new(target, ksize);
        nearest.push_all(seeds);
        Self {
            proto,
            target,
            nearest,
            alpha,
            gateways,
            last_crawled: Vec::new(),
        }
    }

    /// Picks this round's peers and primes their NAT mappings through the
    /// bootstrap gateways.
    async fn next_batch(&mut self) -> Vec<Node> {
        let visible = self.nearest.visible_ids();
        let mut count = self.alpha;
        if visible == self.last_crawled {
            // The frontier has stabilized: fast-forward through the rest.
            count = self.nearest.uncontacted().len();
        }
        self.last_crawled = visible;

        let batch: Vec<Node> = self.nearest.uncontacted().into_iter().take(count).collect();
        for gateway in &self.gateways {
            let _ = self.proto.stun(gateway, &batch).await;
        }
        for node in &batch {
            self.nearest.mark_contacted(node);
        }
        batch
    }

    /// Node mode: crawls toward the target and returns the nearest nodes
    /// seen once the frontier is exhausted.
    pub async fn find_nodes(mut self) -> Vec<Node> {
        loop {
            let batch = self.next_batch().await;
            let round = join_all(batch.into_iter().map(|node| {
                let proto = self.proto.clone();
                let target = self.target;
                async move {
                    let result = proto.find_node(&node, &target).await;
                    (node, result)
                }
            }))
            .await;

            for (node, result) in round {
                match result {
                    Ok(found) => self.nearest.push_all(found),
                    Err(_) => self.nearest.remove(&node.id),
                }
            }

            if self.nearest.have_contacted_all() {
                return self.nearest.closest().copied().collect();
            }
        }
    }

    /// Value mode: crawls toward the key and returns the stored bytes if
    /// any peer holds them.
    pub async fn find_value(mut self) -> Option<Bytes> {
        // The nearest peer that answered with nodes instead of the value;
        // the found value gets cached onto it.
        let mut without_value = NodeHeap::new(self.target, 1);
        loop {
            let batch = self.next_batch().await;
            let round = join_all(batch.into_iter().map(|node| {
                let proto = self.proto.clone();
                let target = self.target;
                async move {
                    let result = proto.find_value(&node, &target).await;
                    (node, result)
                }
            }))
            .await;

            let mut found_values: Vec<Bytes> = Vec::new();
            for (node, result) in round {
                match result {
                    Ok(FindValueReply::Value(value)) => found_values.push(value),
                    Ok(FindValueReply::Nodes(found)) => {
                        without_value.push(node);
                        self.nearest.push_all(found);
                    }
                    Err(_) => self.nearest.remove(&node.id),
                }
            }

            if !found_values.is_empty() {
                return Some(self.settle(found_values, &without_value).await);
            }
            if self.nearest.have_contacted_all() {
                return None;
            }
        }
    }

    /// Plurality vote across the returned values, then cache the winner at
    /// the nearest peer that did not have it.
    async fn settle(&self, values: Vec<Bytes>, without_value: &NodeHeap) -> Bytes {
        let mut counts: HashMap<Bytes, usize> = HashMap::new();
        for value in &values {
            *counts.entry(value.clone()).or_insert(0) += 1;
        }
        if counts.len() > 1 {
            warn!(
                "got {} distinct values for key {}, keeping the plurality",
                counts.len(),
                self.target
            );
        }
        let value = counts
            .into_iter()
            .max_by_key(|(_, n)| *n)
            .map(|(v, _)| v)
            .unwrap_or_default();

        if let Some(peer) = without_value.closest().next().copied() {
            debug!("caching value for {} at {:?}", self.target, peer.id);
            let _ = self.proto.store(&peer, self.target, value.clone()).await;
        }
        value
    }
}
