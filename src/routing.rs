//! K-bucket routing table with on-demand bucket splitting.
//!
//! The table starts as a single bucket covering the whole 160-bit key space
//! and splits buckets as they fill, so the neighborhood around the local id
//! stays finely divided while distant regions stay coarse. Liveness of
//! displaced bucket heads is checked out-of-band: the table owns only a
//! narrow ping channel, and the server side decides eviction from the RPC
//! outcome.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng as _;
use tokio::sync::mpsc;
use tracing::debug;

use crate::node::{Distance, Node, NodeId};

/// A contiguous id range holding up to `ksize` peers.
pub(crate) struct KBucket {
    lo: NodeId,
    hi: NodeId,
    ksize: usize,
    /// Main set in insertion order; the tail is the most recently seen.
    nodes: Vec<Node>,
    /// Candidates displaced while the bucket was full; newest offer wins.
    replacements: Vec<Node>,
    last_updated: Instant,
}

impl KBucket {
    fn new(lo: NodeId, hi: NodeId, ksize: usize) -> Self {
        Self {
            lo,
            hi,
            ksize,
            nodes: Vec::with_capacity(ksize),
            replacements: Vec::new(),
            last_updated: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_updated = Instant::now();
    }

    /// Adds or refreshes a node. Returns false when the bucket is full, in
    /// which case the node is parked on the replacement list instead.
    fn add(&mut self, node: Node) -> bool {
        self.touch();
        if let Some(pos) = self.nodes.iter().position(|n| n.id == node.id) {
            self.nodes.remove(pos);
            self.nodes.push(node);
            return true;
        }
        if self.nodes.len() < self.ksize {
            self.nodes.push(node);
            return true;
        }
        if let Some(pos) = self.replacements.iter().position(|n| n.id == node.id) {
            self.replacements.remove(pos);
        }
        self.replacements.push(node);
        if self.replacements.len() > self.ksize {
            self.replacements.remove(0);
        }
        false
    }

    /// Drops a node; a vacated main-set slot is refilled with the newest
    /// replacement candidate.
    fn remove(&mut self, id: &NodeId) {
        if let Some(pos) = self.replacements.iter().position(|n| n.id == *id) {
            self.replacements.remove(pos);
        }
        if let Some(pos) = self.nodes.iter().position(|n| n.id == *id) {
            self.nodes.remove(pos);
            if let Some(promoted) = self.replacements.pop() {
                self.nodes.push(promoted);
            }
        }
    }

    /// Halves the bucket at its midpoint. Ids equal to the midpoint land in
    /// the lower half. The replacement list does not survive a split.
    fn split(self) -> (KBucket, KBucket) {
        let mid = midpoint(&self.lo, &self.hi);
        let mut lower = KBucket::new(self.lo, mid, self.ksize);
        let mut upper = KBucket::new(successor(&mid), self.hi, self.ksize);
        for node in self.nodes {
            if node.id <= mid {
                lower.nodes.push(node);
            } else {
                upper.nodes.push(node);
            }
        }
        (lower, upper)
    }

    /// Length of the bit prefix shared by every id in the bucket.
    fn depth(&self) -> usize {
        if self.nodes.is_empty() {
            return 0;
        }
        let mut all_or = [0u8; 20];
        let mut all_and = [0xffu8; 20];
        for node in &self.nodes {
            for i in 0..20 {
                all_or[i] |= node.id.0[i];
                all_and[i] &= node.id.0[i];
            }
        }
        let mut diverging = [0u8; 20];
        for i in 0..20 {
            diverging[i] = all_or[i] ^ all_and[i];
        }
        Distance(diverging).leading_zeros()
    }

    fn has_in_range(&self, id: &NodeId) -> bool {
        self.lo <= *id && *id <= self.hi
    }

    fn head(&self) -> Option<Node> {
        self.nodes.first().copied()
    }
}

/// `(lo + hi) / 2` over 160-bit ids, computed through a 161-bit intermediate.
fn midpoint(lo: &NodeId, hi: &NodeId) -> NodeId {
    let mut sum = [0u8; 21];
    let mut carry = 0u16;
    for i in (0..20).rev() {
        let s = lo.0[i] as u16 + hi.0[i] as u16 + carry;
        sum[i + 1] = s as u8;
        carry = s >> 8;
    }
    sum[0] = carry as u8;

    let mut mid = [0u8; 20];
    let mut prev = sum[0] & 1;
    for i in 1..21 {
        mid[i - 1] = (sum[i] >> 1) | (prev << 7);
        prev = sum[i] & 1;
    }
    NodeId(mid)
}

/// `id + 1` with carry; never called on the all-ones id.
fn successor(id: &NodeId) -> NodeId {
    let mut next = id.0;
    for byte in next.iter_mut().rev() {
        let (sum, overflow) = byte.overflowing_add(1);
        *byte = sum;
        if !overflow {
            break;
        }
    }
    NodeId(next)
}

/// A uniform random id in `[lo, hi]`. Bucket ranges are binary-aligned (the
/// bounds agree on a prefix and differ in every remaining bit), so masking a
/// random suffix onto the shared prefix is exact.
fn random_in_range(lo: &NodeId, hi: &NodeId) -> NodeId {
    let mut suffix = [0u8; 20];
    rand::rng().fill(&mut suffix);
    let mut id = [0u8; 20];
    for i in 0..20 {
        id[i] = lo.0[i] | (suffix[i] & (lo.0[i] ^ hi.0[i]));
    }
    NodeId(id)
}

/// The peer index: an ordered, contiguous partition of the key space.
pub struct RoutingTable {
    local_id: NodeId,
    ksize: usize,
    stale_after: Duration,
    buckets: Mutex<Vec<KBucket>>,
    ping_tx: mpsc::UnboundedSender<Node>,
}

fn index_of(buckets: &[KBucket], id: &NodeId) -> usize {
    buckets
        .iter()
        .position(|b| b.has_in_range(id))
        .unwrap_or(buckets.len() - 1)
}

impl RoutingTable {
    /// `ping_tx` receives bucket heads whose liveness must be probed; a
    /// probe timeout is expected to come back as [`remove_contact`].
    ///
    /// [`remove_contact`]: RoutingTable::remove_contact
    pub fn new(
        local_id: NodeId,
        ksize: usize,
        stale_after: Duration,
        ping_tx: mpsc::UnboundedSender<Node>,
    ) -> Self {
        Self {
            local_id,
            ksize,
            stale_after,
            buckets: Mutex::new(vec![KBucket::new(NodeId::MIN, NodeId::MAX, ksize)]),
            ping_tx,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Inserts or refreshes a contact.
    ///
    /// A full bucket splits when it covers the local id or when its depth is
    /// not a multiple of five; otherwise the bucket head is handed to the
    /// pinger and this attempt is dropped (the candidate waits on the
    /// replacement list).
    pub fn add_contact(&self, node: Node) {
        if node.id == self.local_id {
            return;
        }
        let mut buckets = self.buckets.lock();
        loop {
            let idx = index_of(&buckets, &node.id);
            if buckets[idx].add(node) {
                return;
            }
            let splittable = buckets[idx].has_in_range(&self.local_id)
                || buckets[idx].depth() % 5 != 0;
            if splittable {
                let bucket = buckets.remove(idx);
                let (lower, upper) = bucket.split();
                buckets.insert(idx, lower);
                buckets.insert(idx + 1, upper);
                continue;
            }
            if let Some(head) = buckets[idx].head() {
                debug!("bucket full, probing head {:?}", head.id);
                let _ = self.ping_tx.send(head);
            }
            return;
        }
    }

    pub fn remove_contact(&self, id: &NodeId) {
        let mut buckets = self.buckets.lock();
        let idx = index_of(&buckets, id);
        buckets[idx].remove(id);
    }

    pub fn has(&self, id: &NodeId) -> bool {
        let buckets = self.buckets.lock();
        let idx = index_of(&buckets, id);
        buckets[idx].nodes.iter().any(|n| n.id == *id)
    }

    pub fn is_new_node(&self, node: &Node) -> bool {
        !self.has(&node.id)
    }

    pub fn node_count(&self) -> usize {
        self.buckets.lock().iter().map(|b| b.nodes.len()).sum()
    }

    /// Up to `count` nodes nearest `target`, ascending by distance.
    ///
    /// The target id itself and any node at `exclude`'s address are skipped.
    /// Buckets are visited covering-bucket first, then alternately below and
    /// above it, and every visited bucket counts as touched.
    pub fn find_neighbors(
        &self,
        target: &NodeId,
        count: usize,
        exclude: Option<SocketAddr>,
    ) -> Vec<Node> {
        let mut buckets = self.buckets.lock();
        let len = buckets.len();
        let start = index_of(&buckets, target);

        let mut order = Vec::with_capacity(len);
        order.push(start);
        for d in 1..len {
            if start >= d {
                order.push(start - d);
            }
            if start + d < len {
                order.push(start + d);
            }
        }

        let mut found: Vec<(Distance, Node)> = Vec::new();
        'outer: for idx in order {
            let bucket = &mut buckets[idx];
            bucket.touch();
            for node in &bucket.nodes {
                if node.id == *target {
                    continue;
                }
                if exclude == Some(node.addr) {
                    continue;
                }
                found.push((node.id.distance(target), *node));
                if found.len() == count {
                    break 'outer;
                }
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        found.into_iter().map(|(_, node)| node).collect()
    }

    /// One uniform random id per bucket that has not been touched within the
    /// staleness window; crawling these re-warms the lonely buckets.
    pub fn refresh_ids(&self) -> Vec<NodeId> {
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .filter(|b| b.last_updated.elapsed() > self.stale_after)
            .map(|b| random_in_range(&b.lo, &b.hi))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn node(first_byte: u8, port: u16) -> Node {
        let mut id = [0u8; 20];
        id[0] = first_byte;
        Node::new(NodeId(id), addr(port))
    }

    fn table(ksize: usize) -> (RoutingTable, mpsc::UnboundedReceiver<Node>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RoutingTable::new(NodeId::MIN, ksize, Duration::from_secs(3600), tx),
            rx,
        )
    }

    fn check_partition(table: &RoutingTable) {
        let buckets = table.buckets.lock();
        assert_eq!(buckets[0].lo, NodeId::MIN);
        assert_eq!(buckets[buckets.len() - 1].hi, NodeId::MAX);
        for pair in buckets.windows(2) {
            assert_eq!(pair[1].lo, successor(&pair[0].hi));
            assert!(pair[0].hi < pair[1].lo);
        }
        for bucket in buckets.iter() {
            assert!(bucket.nodes.len() <= bucket.ksize);
            for n in &bucket.nodes {
                assert!(bucket.has_in_range(&n.id));
            }
        }
    }

    #[test]
    fn test_midpoint_and_successor() {
        let mid = midpoint(&NodeId::MIN, &NodeId::MAX);
        let mut expected = [0xffu8; 20];
        expected[0] = 0x7f;
        assert_eq!(mid, NodeId(expected));

        let next = successor(&mid);
        let mut upper_lo = [0u8; 20];
        upper_lo[0] = 0x80;
        assert_eq!(next, NodeId(upper_lo));
    }

    #[test]
    fn test_random_in_range_stays_in_range() {
        let mid = midpoint(&NodeId::MIN, &NodeId::MAX);
        let lo = successor(&mid);
        for _ in 0..50 {
            let id = random_in_range(&lo, &NodeId::MAX);
            assert!(lo <= id && id <= NodeId::MAX);
        }
    }

    #[test]
    fn test_bucket_add_refreshes_position() {
        let mut bucket = KBucket::new(NodeId::MIN, NodeId::MAX, 4);
        let a = node(1, 1);
        let b = node(2, 2);
        assert!(bucket.add(a));
        assert!(bucket.add(b));
        assert!(bucket.add(a));
        assert_eq!(bucket.nodes.len(), 2);
        assert_eq!(bucket.nodes[1].id, a.id);
    }

    #[test]
    fn test_bucket_remove_promotes_newest_replacement() {
        let mut bucket = KBucket::new(NodeId::MIN, NodeId::MAX, 2);
        bucket.add(node(1, 1));
        bucket.add(node(2, 2));
        assert!(!bucket.add(node(3, 3)));
        assert!(!bucket.add(node(4, 4)));

        bucket.remove(&node(1, 1).id);
        assert_eq!(bucket.nodes.len(), 2);
        // The most recently offered replacement takes the slot.
        assert_eq!(bucket.nodes[1].id, node(4, 4).id);
    }

    #[test]
    fn test_split_preserves_set() {
        let mut bucket = KBucket::new(NodeId::MIN, NodeId::MAX, 8);
        let members = [0x01u8, 0x42, 0x7f, 0x80, 0xc0, 0xff];
        for (i, byte) in members.iter().enumerate() {
            bucket.add(node(*byte, i as u16));
        }

        let (lower, upper) = bucket.split();
        assert_eq!(lower.nodes.len() + upper.nodes.len(), members.len());
        for n in &lower.nodes {
            assert!(lower.has_in_range(&n.id));
            assert!(n.id <= lower.hi);
        }
        for n in &upper.nodes {
            assert!(upper.has_in_range(&n.id));
        }
        assert_eq!(lower.nodes.len(), 3);
        assert_eq!(upper.nodes.len(), 3);
    }

    #[test]
    fn test_depth() {
        let mut bucket = KBucket::new(NodeId::MIN, NodeId::MAX, 8);
        // 10101000, 10101010, 10101100, 10101110 share exactly five bits.
        for (i, byte) in [0xa8u8, 0xaa, 0xac, 0xae].iter().enumerate() {
            bucket.add(node(*byte, i as u16));
        }
        assert_eq!(bucket.depth(), 5);
    }

    #[test]
    fn test_table_splits_and_keeps_partition() {
        let (table, _rx) = table(4);
        for i in 0..64u16 {
            let mut id = [0u8; 20];
            id[0] = (i * 4) as u8;
            id[19] = i as u8;
            table.add_contact(Node::new(NodeId(id), addr(9000 + i)));
        }
        assert!(table.buckets.lock().len() > 1);
        check_partition(&table);
    }

    #[test]
    fn test_local_id_never_stored() {
        let (table, _rx) = table(4);
        table.add_contact(Node::new(NodeId::MIN, addr(1)));
        assert_eq!(table.node_count(), 0);
    }

    #[test]
    fn test_full_unsplittable_bucket_pings_head_once() {
        let (table, mut rx) = table(4);
        // Four ids sharing a five-bit prefix fill the upper half; the local
        // id lives in the lower half.
        for (i, byte) in [0xa8u8, 0xaa, 0xac, 0xae].iter().enumerate() {
            table.add_contact(node(*byte, i as u16));
        }
        table.add_contact(node(0xa9, 99));

        let probed = rx.try_recv().expect("head should be probed");
        assert_eq!(probed.id, node(0xa8, 0).id);
        assert!(rx.try_recv().is_err());
        assert!(!table.has(&node(0xa9, 99).id));
        check_partition(&table);
    }

    #[test]
    fn test_find_neighbors_sorted_and_bounded() {
        let (table, _rx) = table(20);
        for i in 1..=10u8 {
            table.add_contact(node(i, i as u16));
        }

        let target = NodeId::MIN;
        let neighbors = table.find_neighbors(&target, 5, None);
        assert_eq!(neighbors.len(), 5);
        let firsts: Vec<u8> = neighbors.iter().map(|n| n.id.0[0]).collect();
        assert_eq!(firsts, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_find_neighbors_excludes_target_and_home() {
        let (table, _rx) = table(20);
        let a = node(1, 1);
        let b = node(2, 2);
        table.add_contact(a);
        table.add_contact(b);

        let neighbors = table.find_neighbors(&a.id, 20, None);
        assert!(neighbors.iter().all(|n| n.id != a.id));

        let neighbors = table.find_neighbors(&NodeId::MIN, 20, Some(b.addr));
        assert!(neighbors.iter().all(|n| n.addr != b.addr));
    }

    #[test]
    fn test_empty_table_has_no_neighbors() {
        let (table, _rx) = table(20);
        assert!(table.find_neighbors(&NodeId::random(), 20, None).is_empty());
    }

    #[test]
    fn test_refresh_ids_cover_lonely_buckets() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let table = RoutingTable::new(NodeId::MIN, 4, Duration::ZERO, tx);
        for i in 0..32u16 {
            let mut id = [0u8; 20];
            id[0] = (i * 8) as u8;
            id[19] = i as u8;
            table.add_contact(Node::new(NodeId(id), addr(9100 + i)));
        }

        std::thread::sleep(Duration::from_millis(5));
        let ids = table.refresh_ids();
        let buckets = table.buckets.lock();
        assert_eq!(ids.len(), buckets.len());
        for (id, bucket) in ids.iter().zip(buckets.iter()) {
            assert!(bucket.has_in_range(id));
        }
    }
}
