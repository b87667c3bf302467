/*!
Kademlia-style DHT over router ids and hidden-service addresses.

The component owns the routing table, the introset store and the book of
outstanding transactions. It never touches sockets: outgoing messages are
pushed as events for the orchestrator, incoming ones arrive through
`handle_message` with their source attached.
*/

pub mod kbucket;
pub mod ktree;
pub mod request_queue;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use rand::{thread_rng, Rng};
use tokio::sync::RwLock;

use shroud_crypto::{PathId, RouterId, PUBLIC_KEY_LENGTH};
use shroud_packet::dht::{
    DhtMessage, FindIntro, FindRouter, GotIntro, GotRouter, PublishIntro,
};
use shroud_packet::intro::{IntroSet, ServiceAddress};
use shroud_packet::link::{DhtImmediate, LinkMessage};
use shroud_packet::rc::RouterContact;
use shroud_packet::routing::{DhtCarrier, RoutingMessage};

use crate::event::{EventTx, LookupHandler, RouterEvent};
use crate::nodedb::NodeDb;
use crate::time::unix_now_ms;

use self::kbucket::Distance;
use self::ktree::Ktree;
use self::request_queue::RequestQueue;

/// Lookup parallelism: how many peers a lookup queries at once.
pub const DHT_ALPHA: usize = 3;

/// How many contacts an exploritory reply may carry.
pub const EXPLORE_REPLY_MAX: usize = kbucket::KBUCKET_SIZE as usize;

/// Outstanding transactions older than this are failed.
pub const TX_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the relayed-lookup replay guard.
const SEEN_RELAYED_CAP: usize = 1024;

/// Where a DHT message physically came from; replies go back the same way.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DhtSource {
    /// Directly over a link session with this peer.
    Link(RouterId),
    /// Over one of our transit paths.
    Path(PathId),
}

enum PendingTx {
    /// One round of an iterative lookup we drive ourselves.
    Lookup { target: RouterId },
    /// A link peer's lookup we forwarded; the reply goes back over the
    /// link.
    RelayLink {
        requester: RouterId,
        orig_tx: u64,
        target: RouterId,
    },
    /// A path-bound lookup we forwarded; the reply goes back down the
    /// path.
    RelayPath {
        path_id: PathId,
        orig_tx: u64,
        target: RouterId,
    },
    /// An exploritory probe for new peers.
    Explore,
    /// A hidden-service introset lookup.
    IntroLookup(oneshot::Sender<Option<IntroSet>>),
}

struct LookupState {
    handler: LookupHandler,
    /// Unqueried candidates, sorted closest-first.
    shortlist: Vec<RouterId>,
    queried: HashSet<RouterId>,
    inflight: usize,
    found: Vec<RouterContact>,
    /// Closest candidate seen so far; rounds that do not beat it end the
    /// lookup.
    closest_seen: Option<RouterId>,
}

struct DhtState {
    ktree: Ktree,
    services: HashMap<ServiceAddress, IntroSet>,
    pending: RequestQueue<PendingTx>,
    lookups: HashMap<RouterId, LookupState>,
    seen_relayed: HashSet<(DhtSource, u64)>,
    allow_transit: bool,
}

/// Shared handle to the DHT component.
#[derive(Clone)]
pub struct Dht {
    our_id: RouterId,
    our_rc: Arc<RwLock<RouterContact>>,
    nodedb: NodeDb,
    event_tx: EventTx,
    state: Arc<RwLock<DhtState>>,
}

impl Dht {
    pub fn new(
        our_id: RouterId,
        our_rc: Arc<RwLock<RouterContact>>,
        nodedb: NodeDb,
        event_tx: EventTx,
    ) -> Dht {
        debug!("initialize dht with key {}", our_id);
        Dht {
            our_id,
            our_rc,
            nodedb,
            event_tx,
            state: Arc::new(RwLock::new(DhtState {
                ktree: Ktree::new(our_id),
                services: HashMap::new(),
                pending: RequestQueue::new(TX_TIMEOUT),
                lookups: HashMap::new(),
                seen_relayed: HashSet::new(),
                allow_transit: false,
            })),
        }
    }

    /// Service nodes relay lookups for others; clients do not.
    pub async fn set_allow_transit(&self, allow: bool) {
        self.state.write().await.allow_transit = allow;
    }

    /// Track a verified peer in the routing table.
    pub async fn put_node(&self, rc: RouterContact) {
        self.state.write().await.ktree.put_node(rc);
    }

    pub async fn remove_node(&self, id: &RouterId) {
        self.state.write().await.ktree.remove_node(id);
    }

    pub async fn has_node(&self, id: &RouterId) -> bool {
        self.state.read().await.ktree.has_node(id)
    }

    pub async fn num_nodes(&self) -> usize {
        self.state.read().await.ktree.len()
    }

    pub async fn has_router_lookup(&self, target: &RouterId) -> bool {
        self.state.read().await.lookups.contains_key(target)
    }

    fn send_dht(&self, to: RouterId, msg: DhtMessage) {
        let envelope = LinkMessage::DhtImmediate(DhtImmediate { msgs: vec![msg] });
        self.event_tx
            .unbounded_send(RouterEvent::SendLinkMessage(to, envelope))
            .ok();
    }

    fn reply_to(&self, source: DhtSource, msg: DhtMessage) {
        match source {
            DhtSource::Link(peer) => self.send_dht(peer, msg),
            DhtSource::Path(path_id) => {
                let carrier = RoutingMessage::Dht(DhtCarrier {
                    msgs: vec![msg],
                    seq: 0,
                });
                self.event_tx
                    .unbounded_send(RouterEvent::PathReply(path_id, carrier))
                    .ok();
            }
        }
    }

    fn complete_lookup(&self, target: RouterId, state: LookupState) {
        debug!(
            "router lookup for {} finished with {} contacts",
            target,
            state.found.len()
        );
        self.event_tx
            .unbounded_send(RouterEvent::LookupDone {
                target,
                handler: state.handler,
                contacts: state.found,
            })
            .ok();
    }

    /** Start an iterative lookup for a router contact.

    The handler fires exactly once with whatever contacts turned up. At
    most one lookup per target runs at a time; an overlapping request is
    dropped (a channel handler gets an empty result).
    */
    pub async fn lookup_router(&self, target: RouterId, handler: LookupHandler) {
        let mut state = self.state.write().await;
        if state.lookups.contains_key(&target) {
            debug!("router lookup for {} already running", target);
            if let LookupHandler::Channel(sender) = handler {
                sender.send(Vec::new()).ok();
            }
            return;
        }

        // the routing table may already hold the contact
        if let Some(node) = state.ktree.get_node(&target) {
            let found = vec![node.rc.clone()];
            drop(state);
            self.complete_lookup(
                target,
                LookupState {
                    handler,
                    shortlist: Vec::new(),
                    queried: HashSet::new(),
                    inflight: 0,
                    found,
                    closest_seen: None,
                },
            );
            return;
        }

        // never ask the target about itself, it would drop the query
        let exclude: HashSet<RouterId> = [self.our_id, target].into_iter().collect();
        let seeds = state.ktree.closest(&target, DHT_ALPHA, &exclude);
        if seeds.is_empty() {
            drop(state);
            warn!("cannot look up {}, no dht peers", target);
            self.complete_lookup(
                target,
                LookupState {
                    handler,
                    shortlist: Vec::new(),
                    queried: HashSet::new(),
                    inflight: 0,
                    found: Vec::new(),
                    closest_seen: None,
                },
            );
            return;
        }

        let mut lookup = LookupState {
            handler,
            shortlist: Vec::new(),
            queried: HashSet::new(),
            inflight: 0,
            found: Vec::new(),
            closest_seen: Some(seeds[0].id),
        };
        for seed in &seeds {
            let tx_id = state.pending.new_tx_id(PendingTx::Lookup { target });
            lookup.queried.insert(seed.id);
            lookup.inflight += 1;
            self.send_dht(
                seed.id,
                DhtMessage::FindRouter(FindRouter {
                    exploritory: false,
                    iterative: true,
                    key: target,
                    tx_id,
                }),
            );
        }
        state.lookups.insert(target, lookup);
    }

    /** Relayed lookup on behalf of one of our transit paths: ask `peer`
    and deliver the reply over the path under the original transaction id.
    */
    pub async fn lookup_router_for_path(
        &self,
        target: RouterId,
        orig_tx: u64,
        path_id: PathId,
        peer: RouterId,
    ) {
        let tx_id = self.state.write().await.pending.new_tx_id(PendingTx::RelayPath {
            path_id,
            orig_tx,
            target,
        });
        self.send_dht(
            peer,
            DhtMessage::FindRouter(FindRouter {
                exploritory: false,
                iterative: false,
                key: target,
                tx_id,
            }),
        );
    }

    /// Probe `peer` for routers near a random key to discover new peers.
    pub async fn explore_network_via(&self, peer: RouterId) {
        let mut key = [0; PUBLIC_KEY_LENGTH];
        thread_rng().fill(&mut key);
        let tx_id = self.state.write().await.pending.new_tx_id(PendingTx::Explore);
        debug!("exploring network via {}", peer);
        self.send_dht(
            peer,
            DhtMessage::FindRouter(FindRouter {
                exploritory: true,
                iterative: false,
                key: RouterId(key),
                tx_id,
            }),
        );
    }

    /// Look up a hidden-service introset near its address.
    pub async fn lookup_intro(
        &self,
        address: ServiceAddress,
        result: oneshot::Sender<Option<IntroSet>>,
    ) {
        let mut state = self.state.write().await;
        if let Some(intro_set) = state.services.get(&address) {
            result.send(Some(intro_set.clone())).ok();
            return;
        }
        let exclude: HashSet<RouterId> = [self.our_id].into_iter().collect();
        let peer = match state.ktree.closest_one(&address, &exclude) {
            Some(peer) => peer.id,
            None => {
                result.send(None).ok();
                return;
            }
        };
        let tx_id = state.pending.new_tx_id(PendingTx::IntroLookup(result));
        self.send_dht(
            peer,
            DhtMessage::FindIntro(FindIntro { address, tx_id }),
        );
    }

    /// Store an introset locally and push it towards the routers closest
    /// to its service address.
    pub async fn publish_intro(&self, intro_set: IntroSet) {
        if let Err(error) = intro_set.verify(unix_now_ms()) {
            warn!("refusing to publish invalid introset: {}", error);
            return;
        }
        let mut state = self.state.write().await;
        let address = intro_set.address;
        state.services.insert(address, intro_set.clone());
        let exclude: HashSet<RouterId> = [self.our_id].into_iter().collect();
        for node in state.ktree.closest(&address, DHT_ALPHA, &exclude) {
            let tx_id = state.pending.new_tx_id(PendingTx::Explore);
            self.send_dht(
                node.id,
                DhtMessage::PublishIntro(PublishIntro {
                    intro_set: intro_set.clone(),
                    tx_id,
                }),
            );
        }
    }

    /// Dispatch one DHT message from a link session or a transit path.
    pub async fn handle_message(&self, from: DhtSource, msg: DhtMessage) {
        match msg {
            DhtMessage::FindRouter(msg) => self.handle_find_router(from, msg).await,
            DhtMessage::GotRouter(msg) => self.handle_got_router(from, msg).await,
            DhtMessage::FindIntro(msg) => self.handle_find_intro(from, msg).await,
            DhtMessage::GotIntro(msg) => self.handle_got_intro(from, msg).await,
            DhtMessage::PublishIntro(msg) => self.handle_publish_intro(from, msg).await,
        }
    }

    async fn handle_find_router(&self, from: DhtSource, msg: FindRouter) {
        {
            let mut state = self.state.write().await;
            if !state.allow_transit {
                debug!("dropping lookup from {:?}, transit not allowed", from);
                return;
            }
            if state.seen_relayed.len() >= SEEN_RELAYED_CAP {
                state.seen_relayed.clear();
            }
            if !state.seen_relayed.insert((from, msg.tx_id)) {
                debug!("dropping replayed lookup {:?}/{}", from, msg.tx_id);
                return;
            }
        }

        if msg.exploritory {
            return self.handle_exploritory_lookup(from, msg).await;
        }

        // looking for us
        if msg.key == self.our_id {
            match from {
                DhtSource::Path(_) => {
                    let rc = self.our_rc.read().await.clone();
                    self.reply_to(
                        from,
                        DhtMessage::GotRouter(GotRouter {
                            key: msg.key,
                            more: false,
                            contacts: vec![rc],
                            tx_id: msg.tx_id,
                        }),
                    );
                }
                DhtSource::Link(_) => {
                    debug!("dropping off-path lookup for our own key");
                }
            }
            return;
        }

        // we know the target
        if let Some(rc) = self.nodedb.get(&msg.key).await {
            self.reply_to(
                from,
                DhtMessage::GotRouter(GotRouter {
                    key: msg.key,
                    more: false,
                    contacts: vec![rc],
                    tx_id: msg.tx_id,
                }),
            );
            return;
        }

        // find someone closer
        let mut exclude: HashSet<RouterId> = [self.our_id].into_iter().collect();
        if let DhtSource::Link(requester) = from {
            exclude.insert(requester);
        }
        let next = {
            let state = self.state.read().await;
            state.ktree.closest_one(&msg.key, &exclude)
        };
        let next = match next {
            Some(next) => next,
            None => {
                self.reply_to(
                    from,
                    DhtMessage::GotRouter(GotRouter {
                        key: msg.key,
                        more: false,
                        contacts: Vec::new(),
                        tx_id: msg.tx_id,
                    }),
                );
                return;
            }
        };

        if msg.iterative {
            // tell the requester who is closer instead of recursing
            self.reply_to(
                from,
                DhtMessage::GotRouter(GotRouter {
                    key: msg.key,
                    more: false,
                    contacts: vec![next.rc],
                    tx_id: msg.tx_id,
                }),
            );
            return;
        }

        // recursive: forward when the next peer is closer to the target
        // than we are
        if msg.key.distance(&next.id, &self.our_id) == std::cmp::Ordering::Less {
            let pending = match from {
                DhtSource::Link(requester) => PendingTx::RelayLink {
                    requester,
                    orig_tx: msg.tx_id,
                    target: msg.key,
                },
                DhtSource::Path(path_id) => PendingTx::RelayPath {
                    path_id,
                    orig_tx: msg.tx_id,
                    target: msg.key,
                },
            };
            let tx_id = self.state.write().await.pending.new_tx_id(pending);
            self.send_dht(
                next.id,
                DhtMessage::FindRouter(FindRouter {
                    exploritory: false,
                    iterative: false,
                    key: msg.key,
                    tx_id,
                }),
            );
        } else {
            // we are the closest; the requester has to go iterative
            self.reply_to(
                from,
                DhtMessage::GotRouter(GotRouter {
                    key: msg.key,
                    more: false,
                    contacts: Vec::new(),
                    tx_id: msg.tx_id,
                }),
            );
        }
    }

    async fn handle_exploritory_lookup(&self, from: DhtSource, msg: FindRouter) {
        let mut exclude: HashSet<RouterId> = [self.our_id].into_iter().collect();
        if let DhtSource::Link(requester) = from {
            exclude.insert(requester);
        }
        let contacts: Vec<RouterContact> = {
            let state = self.state.read().await;
            state
                .ktree
                .closest(&msg.key, EXPLORE_REPLY_MAX, &exclude)
                .into_iter()
                .map(|node| node.rc)
                .collect()
        };
        self.reply_to(
            from,
            DhtMessage::GotRouter(GotRouter {
                key: msg.key,
                more: false,
                contacts,
                tx_id: msg.tx_id,
            }),
        );
    }

    async fn handle_got_router(&self, _from: DhtSource, msg: GotRouter) {
        let pending = {
            let mut state = self.state.write().await;
            state.pending.check_tx_id(msg.tx_id, |_| true)
        };
        match pending {
            Some(PendingTx::Lookup { target }) => self.lookup_round(target, msg).await,
            Some(PendingTx::RelayLink {
                requester,
                orig_tx,
                target,
            }) => {
                self.send_dht(
                    requester,
                    DhtMessage::GotRouter(GotRouter {
                        key: target,
                        more: false,
                        contacts: msg.contacts,
                        tx_id: orig_tx,
                    }),
                );
            }
            Some(PendingTx::RelayPath {
                path_id,
                orig_tx,
                target,
            }) => {
                self.reply_to(
                    DhtSource::Path(path_id),
                    DhtMessage::GotRouter(GotRouter {
                        key: target,
                        more: false,
                        contacts: msg.contacts,
                        tx_id: orig_tx,
                    }),
                );
            }
            Some(PendingTx::Explore) => {
                self.event_tx
                    .unbounded_send(RouterEvent::LookupDone {
                        target: msg.key,
                        handler: LookupHandler::Explore,
                        contacts: msg.contacts,
                    })
                    .ok();
            }
            Some(PendingTx::IntroLookup(sender)) => {
                // unexpected reply type for an intro tx
                sender.send(None).ok();
            }
            None => {
                debug!("unwarranted GotRouter with tx {}", msg.tx_id);
            }
        }
    }

    /// Fold one reply into a running iterative lookup and decide whether
    /// to query further, finish, or keep waiting.
    async fn lookup_round(&self, target: RouterId, msg: GotRouter) {
        let mut state = self.state.write().await;
        let mut lookup = match state.lookups.remove(&target) {
            Some(lookup) => lookup,
            None => return,
        };
        lookup.inflight = lookup.inflight.saturating_sub(1);

        let mut done = false;
        for rc in msg.contacts {
            let id = rc.router_id();
            if id == target {
                lookup.found.push(rc);
                done = true;
                continue;
            }
            if id == self.our_id
                || lookup.queried.contains(&id)
                || lookup.shortlist.contains(&id)
            {
                continue;
            }
            // only candidates that get us closer count as progress
            let closer = match lookup.closest_seen {
                Some(best) => target.distance(&id, &best) == std::cmp::Ordering::Less,
                None => true,
            };
            if closer {
                lookup.closest_seen = Some(id);
                lookup.shortlist.push(id);
            }
        }

        if done {
            drop(state);
            self.complete_lookup(target, lookup);
            return;
        }

        lookup.shortlist.sort_by(|a, b| target.distance(a, b));
        while lookup.inflight < DHT_ALPHA && !lookup.shortlist.is_empty() {
            let next = lookup.shortlist.remove(0);
            let tx_id = state.pending.new_tx_id(PendingTx::Lookup { target });
            lookup.queried.insert(next);
            lookup.inflight += 1;
            self.send_dht(
                next,
                DhtMessage::FindRouter(FindRouter {
                    exploritory: false,
                    iterative: true,
                    key: target,
                    tx_id,
                }),
            );
        }

        if lookup.inflight == 0 {
            // no round produced anyone closer
            drop(state);
            self.complete_lookup(target, lookup);
        } else {
            state.lookups.insert(target, lookup);
        }
    }

    async fn handle_find_intro(&self, from: DhtSource, msg: FindIntro) {
        let allowed = self.state.read().await.allow_transit;
        if !allowed {
            return;
        }
        let intro_set = self.state.read().await.services.get(&msg.address).cloned();
        self.reply_to(
            from,
            DhtMessage::GotIntro(GotIntro {
                intro_set,
                tx_id: msg.tx_id,
            }),
        );
    }

    async fn handle_got_intro(&self, _from: DhtSource, msg: GotIntro) {
        let pending = {
            let mut state = self.state.write().await;
            state.pending.check_tx_id(msg.tx_id, |_| true)
        };
        match pending {
            Some(PendingTx::IntroLookup(sender)) => {
                let intro_set = msg.intro_set.filter(|intro_set| {
                    intro_set
                        .verify(unix_now_ms())
                        .map_err(|error| warn!("received invalid introset: {}", error))
                        .is_ok()
                });
                sender.send(intro_set).ok();
            }
            Some(_) | None => {
                debug!("unwarranted GotIntro with tx {}", msg.tx_id);
            }
        }
    }

    async fn handle_publish_intro(&self, from: DhtSource, msg: PublishIntro) {
        let allowed = self.state.read().await.allow_transit;
        if !allowed {
            debug!("dropping introset publish from {:?}", from);
            return;
        }
        if let Err(error) = msg.intro_set.verify(unix_now_ms()) {
            warn!("rejecting published introset: {}", error);
            return;
        }
        let mut state = self.state.write().await;
        let entry = state.services.entry(msg.intro_set.address);
        match entry {
            std::collections::hash_map::Entry::Occupied(mut known)
                if known.get().timestamp < msg.intro_set.timestamp =>
            {
                known.insert(msg.intro_set);
            }
            std::collections::hash_map::Entry::Occupied(_) => {}
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(msg.intro_set);
            }
        }
    }

    /// Expire outstanding transactions and stale introsets.
    pub async fn tick(&self) {
        let now = unix_now_ms();
        let mut finished = Vec::new();
        {
            let mut state = self.state.write().await;
            state.services.retain(|_, intro_set| !intro_set.expired(now));

            for (_tx_id, pending) in state.pending.drain_timed_out() {
                match pending {
                    PendingTx::Lookup { target } => {
                        if let Some(mut lookup) = state.lookups.remove(&target) {
                            lookup.inflight = lookup.inflight.saturating_sub(1);
                            if lookup.inflight == 0 && lookup.shortlist.is_empty() {
                                finished.push((target, lookup));
                            } else {
                                state.lookups.insert(target, lookup);
                            }
                        }
                    }
                    PendingTx::IntroLookup(sender) => {
                        sender.send(None).ok();
                    }
                    PendingTx::RelayLink { target, .. } | PendingTx::RelayPath { target, .. } => {
                        debug!("relayed lookup for {} timed out", target);
                    }
                    PendingTx::Explore => {}
                }
            }
        }
        for (target, lookup) in finished {
            self.complete_lookup(target, lookup);
        }
    }
}
