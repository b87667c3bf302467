/*!
Routing table over the whole 256-bit key space: one bucket per
shared-prefix length with our own router id.
*/

use std::collections::HashSet;

use shroud_crypto::{RouterId, PUBLIC_KEY_LENGTH};
use shroud_packet::rc::RouterContact;

use super::kbucket::{kbucket_index, DhtNode, Distance, Kbucket};

/// Number of buckets, one per possible shared-prefix length.
pub const KTREE_BUCKETS: usize = PUBLIC_KEY_LENGTH * 8;

/// The k-tree of DHT peers.
#[derive(Clone, Debug)]
pub struct Ktree {
    own_id: RouterId,
    buckets: Vec<Kbucket>,
}

impl Ktree {
    pub fn new(own_id: RouterId) -> Ktree {
        trace!("Creating a new Ktree with own id {}", own_id);
        Ktree {
            own_id,
            buckets: vec![Kbucket::new(); KTREE_BUCKETS],
        }
    }

    fn bucket_of(&self, id: &RouterId) -> Option<usize> {
        kbucket_index(&self.own_id, id).map(usize::from)
    }

    /// Insert or refresh a peer. Our own id is never stored.
    pub fn put_node(&mut self, rc: RouterContact) -> bool {
        match self.bucket_of(&rc.router_id()) {
            Some(index) => self.buckets[index].try_add(DhtNode::new(rc)),
            None => false,
        }
    }

    pub fn remove_node(&mut self, id: &RouterId) -> Option<DhtNode> {
        let index = self.bucket_of(id)?;
        self.buckets[index].remove(id)
    }

    pub fn has_node(&self, id: &RouterId) -> bool {
        self.bucket_of(id)
            .map_or(false, |index| self.buckets[index].contains(id))
    }

    pub fn get_node(&self, id: &RouterId) -> Option<&DhtNode> {
        self.buckets[self.bucket_of(id)?].get(id)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Kbucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Kbucket::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DhtNode> {
        self.buckets.iter().flat_map(Kbucket::iter)
    }

    /** The `n` known peers closest to `target` by XOR distance, excluding
    the given ids.
    */
    pub fn closest(
        &self,
        target: &RouterId,
        n: usize,
        exclude: &HashSet<RouterId>,
    ) -> Vec<DhtNode> {
        let mut nodes: Vec<&DhtNode> = self
            .iter()
            .filter(|node| !exclude.contains(&node.id))
            .collect();
        nodes.sort_by(|a, b| target.distance(&a.id, &b.id));
        nodes.into_iter().take(n).cloned().collect()
    }

    /// The single closest known peer to `target`, excluding the given ids.
    pub fn closest_one(&self, target: &RouterId, exclude: &HashSet<RouterId>) -> Option<DhtNode> {
        self.closest(target, 1, exclude).into_iter().next()
    }
}
