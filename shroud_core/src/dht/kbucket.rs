/*!
Bucket of DHT nodes sharing one prefix length with our router id.

Nodes are kept in least-recently-seen order; a full bucket evicts its
least-recently-seen entry for a fresh candidate, since candidates only
reach the table after their contact passed verification.
*/

use std::cmp::Ordering;

use tokio::time::Instant;

use shroud_crypto::{RouterId, PUBLIC_KEY_LENGTH};
use shroud_packet::rc::RouterContact;

use crate::time::clock_now;

/// Number of nodes a bucket can hold.
pub const KBUCKET_SIZE: u8 = 8;

/** Calculate the bucket index of a router id relative to our own: the
number of leading bits both keys share.

Fails (returns `None`) only if the supplied keys are equal.
*/
pub fn kbucket_index(own: &RouterId, other: &RouterId) -> Option<u8> {
    let xoring = own
        .as_bytes()
        .iter()
        .zip(other.as_bytes().iter())
        .map(|(x, y)| x ^ y);
    for (i, byte) in xoring.enumerate() {
        for j in 0..8 {
            if byte & (0x80 >> j) != 0 {
                return Some(i as u8 * 8 + j);
            }
        }
    }
    None
}

/// XOR-metric comparisons relative to a base key.
pub trait Distance {
    /// Order `id_1` and `id_2` by their distance from `self`.
    fn distance(&self, id_1: &RouterId, id_2: &RouterId) -> Ordering;
}

impl Distance for RouterId {
    fn distance(&self, id_1: &RouterId, id_2: &RouterId) -> Ordering {
        for i in 0..PUBLIC_KEY_LENGTH {
            if id_1.as_bytes()[i] != id_2.as_bytes()[i] {
                return Ord::cmp(
                    &(self.as_bytes()[i] ^ id_1.as_bytes()[i]),
                    &(self.as_bytes()[i] ^ id_2.as_bytes()[i]),
                );
            }
        }
        Ordering::Equal
    }
}

/// A peer in the DHT routing table.
#[derive(Clone, Debug)]
pub struct DhtNode {
    pub id: RouterId,
    pub rc: RouterContact,
    /// Last time we heard anything attributable to this peer.
    pub last_seen: Instant,
}

impl DhtNode {
    pub fn new(rc: RouterContact) -> DhtNode {
        DhtNode {
            id: rc.router_id(),
            rc,
            last_seen: clock_now(),
        }
    }
}

/// Nodes with one shared-prefix length, least-recently-seen first.
#[derive(Clone, Debug, Default)]
pub struct Kbucket {
    nodes: Vec<DhtNode>,
}

impl Kbucket {
    pub fn new() -> Kbucket {
        Kbucket { nodes: Vec::new() }
    }

    fn find(&self, id: &RouterId) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == *id)
    }

    /** Insert or refresh a node.

    A known node is refreshed and moved to the most-recently-seen end. In
    a full bucket the least-recently-seen node makes room.

    Returns `true` if the node is in the bucket afterwards.
    */
    pub fn try_add(&mut self, node: DhtNode) -> bool {
        if let Some(index) = self.find(&node.id) {
            self.nodes.remove(index);
            self.nodes.push(node);
            return true;
        }
        if self.is_full() {
            self.nodes.remove(0);
        }
        self.nodes.push(node);
        true
    }

    pub fn remove(&mut self, id: &RouterId) -> Option<DhtNode> {
        self.find(id).map(|index| self.nodes.remove(index))
    }

    pub fn contains(&self, id: &RouterId) -> bool {
        self.find(id).is_some()
    }

    pub fn get(&self, id: &RouterId) -> Option<&DhtNode> {
        self.find(id).map(|index| &self.nodes[index])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= KBUCKET_SIZE as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = &DhtNode> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::nodedb::tests::make_contact;
    use rand::thread_rng;

    #[test]
    fn kbucket_index_of_equal_keys() {
        let id = RouterId([7; PUBLIC_KEY_LENGTH]);
        assert_eq!(kbucket_index(&id, &id), None);
    }

    #[test]
    fn kbucket_index_counts_shared_prefix() {
        let own = RouterId([0; PUBLIC_KEY_LENGTH]);
        let mut other = [0; PUBLIC_KEY_LENGTH];
        other[0] = 0b1000_0000;
        assert_eq!(kbucket_index(&own, &RouterId(other)), Some(0));
        other[0] = 0b0010_0000;
        assert_eq!(kbucket_index(&own, &RouterId(other)), Some(2));
        let mut far = [0; PUBLIC_KEY_LENGTH];
        far[1] = 1;
        assert_eq!(kbucket_index(&own, &RouterId(far)), Some(15));
    }

    #[test]
    fn distance_ordering() {
        let base = RouterId([0; PUBLIC_KEY_LENGTH]);
        let near = RouterId([1; PUBLIC_KEY_LENGTH]);
        let far = RouterId([0xff; PUBLIC_KEY_LENGTH]);
        assert_eq!(base.distance(&near, &far), Ordering::Less);
        assert_eq!(base.distance(&far, &near), Ordering::Greater);
        assert_eq!(base.distance(&near, &near), Ordering::Equal);
    }

    #[tokio::test]
    async fn full_bucket_evicts_least_recently_seen() {
        let mut rng = thread_rng();
        let mut bucket = Kbucket::new();
        let first = DhtNode::new(make_contact(&mut rng, true));
        let first_id = first.id;
        bucket.try_add(first);
        for _ in 1..KBUCKET_SIZE {
            bucket.try_add(DhtNode::new(make_contact(&mut rng, true)));
        }
        assert!(bucket.is_full());
        assert!(bucket.contains(&first_id));

        bucket.try_add(DhtNode::new(make_contact(&mut rng, true)));
        assert_eq!(bucket.len(), KBUCKET_SIZE as usize);
        assert!(!bucket.contains(&first_id));
    }

    #[tokio::test]
    async fn refresh_moves_node_to_back() {
        let mut rng = thread_rng();
        let mut bucket = Kbucket::new();
        let first = DhtNode::new(make_contact(&mut rng, true));
        let first_id = first.id;
        bucket.try_add(first.clone());
        for _ in 1..KBUCKET_SIZE {
            bucket.try_add(DhtNode::new(make_contact(&mut rng, true)));
        }
        // refresh the oldest node, then overflow
        bucket.try_add(first);
        bucket.try_add(DhtNode::new(make_contact(&mut rng, true)));
        assert!(bucket.contains(&first_id));
    }
}
