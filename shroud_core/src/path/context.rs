/*!
Router-local index of paths: the sets we own, keyed under both their ids,
and the transit hops we relay for, keyed under both of theirs.

Lookups are tagged by which neighbour a message came from, so the shared
id at each splice point (one hop's tx id is the next hop's rx id) never
resolves ambiguously.
*/

use std::collections::HashMap;
use std::sync::Arc;

use rand::thread_rng;
use tokio::sync::RwLock;
use tokio::time::Instant;

use shroud_binary_io::FromBytes;
use shroud_crypto::{PathId, RouterId, SecretKey};
use shroud_packet::link::{LinkMessage, RelayCommit, RelayDownstream, RelayUpstream};
use shroud_packet::rc::RouterContact;
use shroud_packet::routing::RoutingMessage;

use crate::event::RouterEvent;
use crate::path::builder::{Builder, PathSet};
use crate::path::transit::{TransitHop, TransitHopInfo};
use crate::path::PathEnv;

/// A message target resolved from the indices: one of our own path sets
/// or a hop we relay for.
pub enum HopHandler {
    Own(Arc<RwLock<PathSet>>),
    Transit(Arc<TransitHop>),
}

struct ContextState {
    /// PathId → owning set, inserted under both tx and rx ids.
    our_paths: HashMap<PathId, Arc<RwLock<PathSet>>>,
    /// PathId → transit hops, inserted under both ids; multiple hops may
    /// share an id at a splice point.
    transit: HashMap<PathId, Vec<Arc<TransitHop>>>,
    builders: Vec<Builder>,
    allow_transit: bool,
    allow_exit: bool,
}

/// Shared handle to the path index.
#[derive(Clone)]
pub struct PathContext {
    env: PathEnv,
    onion_key: Arc<RwLock<SecretKey>>,
    state: Arc<RwLock<ContextState>>,
}

impl PathContext {
    pub fn new(env: PathEnv, onion_key: Arc<RwLock<SecretKey>>) -> PathContext {
        PathContext {
            env,
            onion_key,
            state: Arc::new(RwLock::new(ContextState {
                our_paths: HashMap::new(),
                transit: HashMap::new(),
                builders: Vec::new(),
                allow_transit: false,
                allow_exit: false,
            })),
        }
    }

    pub fn env(&self) -> &PathEnv {
        &self.env
    }

    /// Service nodes relay others' paths.
    pub async fn set_allow_transit(&self, allow: bool) {
        self.state.write().await.allow_transit = allow;
    }

    pub async fn allowing_transit(&self) -> bool {
        self.state.read().await.allow_transit
    }

    /// Whether this router grants exit requests on its transit paths.
    pub async fn set_allow_exit(&self, allow: bool) {
        self.state.write().await.allow_exit = allow;
    }

    pub async fn add_builder(&self, builder: Builder) {
        self.state.write().await.builders.push(builder);
    }

    /// Index a freshly built path under both of its ids.
    pub async fn add_own_path(&self, set: Arc<RwLock<PathSet>>, path: crate::path::Path) {
        let tx_id = path.tx_id();
        let rx_id = path.rx_id();
        set.write().await.add_path(path);
        let mut state = self.state.write().await;
        state.our_paths.insert(tx_id, set.clone());
        state.our_paths.insert(rx_id, set);
    }

    /// Index a transit hop under both of its ids.
    pub async fn put_transit_hop(&self, hop: Arc<TransitHop>) {
        let mut state = self.state.write().await;
        state
            .transit
            .entry(hop.info.tx_id)
            .or_default()
            .push(hop.clone());
        state.transit.entry(hop.info.rx_id).or_default().push(hop);
    }

    pub async fn has_transit_hop(&self, info: &TransitHopInfo) -> bool {
        self.state
            .read()
            .await
            .transit
            .get(&info.tx_id)
            .map_or(false, |hops| hops.iter().any(|hop| hop.info == *info))
    }

    pub async fn num_transit_hops(&self) -> usize {
        // every hop is indexed twice
        self.state
            .read()
            .await
            .transit
            .values()
            .map(Vec::len)
            .sum::<usize>()
            / 2
    }

    /// Resolve a message arriving from `remote` on the upstream side.
    pub async fn get_by_upstream(&self, remote: &RouterId, id: &PathId) -> Option<HopHandler> {
        let state = self.state.read().await;
        if let Some(set) = state.our_paths.get(id) {
            return Some(HopHandler::Own(set.clone()));
        }
        state
            .transit
            .get(id)
            .and_then(|hops| hops.iter().find(|hop| hop.info.upstream == *remote))
            .cloned()
            .map(HopHandler::Transit)
    }

    /// Resolve a message arriving from `remote` on the downstream side.
    pub async fn get_by_downstream(&self, remote: &RouterId, id: &PathId) -> Option<HopHandler> {
        self.state
            .read()
            .await
            .transit
            .get(id)
            .and_then(|hops| hops.iter().find(|hop| hop.info.downstream == *remote))
            .cloned()
            .map(HopHandler::Transit)
    }

    /// The transit hop terminating a circuit at this router.
    pub async fn get_path_for_transfer(&self, id: &PathId) -> Option<Arc<TransitHop>> {
        self.state
            .read()
            .await
            .transit
            .get(id)
            .and_then(|hops| hops.iter().find(|hop| hop.is_terminal(&self.env.our_id)))
            .cloned()
    }

    /// Drop expired transit hops and delegate expiry to every builder.
    pub async fn expire_paths(&self, now: Instant) {
        let mut state = self.state.write().await;
        state.transit.retain(|_, hops| {
            hops.retain(|hop| !hop.expired(now));
            !hops.is_empty()
        });

        let builders = state.builders.clone();
        for builder in builders {
            let removed = builder.set().write().await.expire(now);
            for id in removed {
                state.our_paths.remove(&id);
            }
        }
    }

    /// Tick every owned path's state machine.
    pub async fn tick_paths(&self, now: Instant) {
        let builders = self.state.read().await.builders.clone();
        for builder in builders {
            builder.set().write().await.tick(now, &self.env).await;
        }
    }

    /** Run one build round: every builder below its target starts one
    build, and the resulting commit leaves through the first hop.
    */
    pub async fn build_paths(&self, now: Instant, first_hop_pool: &[RouterContact]) {
        let builders = self.state.read().await.builders.clone();
        for builder in builders {
            if !builder.should_build_more(now).await {
                continue;
            }
            let job = match builder.build_one(first_hop_pool).await {
                Some(job) => job,
                None => continue,
            };
            debug!("forwarding path build to {}", job.first_hop);
            self.env
                .event_tx
                .unbounded_send(RouterEvent::SendLinkMessage(
                    job.first_hop,
                    LinkMessage::RelayCommit(job.commit),
                ))
                .ok();
            self.env
                .event_tx
                .unbounded_send(RouterEvent::PersistSession {
                    peer: job.first_hop,
                    until: job.path.expire_time(),
                })
                .ok();
            self.add_own_path(builder.set(), job.path).await;
        }
    }

    /** Handle a path build message from a neighbour: open our frame,
    install the transit hop and either confirm (terminal) or rotate and
    forward.
    */
    pub async fn handle_relay_commit(&self, from: RouterId, msg: RelayCommit) {
        if !self.allowing_transit().await {
            debug!("dropping relay commit from {}, transit not allowed", from);
            return;
        }
        let record = {
            let onion_key = self.onion_key.read().await;
            match msg.frames.first().map(|frame| frame.open(&onion_key)) {
                Some(Ok(record)) => record,
                Some(Err(_)) | None => {
                    warn!("relay commit from {} without a frame for us", from);
                    return;
                }
            }
        };

        let hop = Arc::new(TransitHop::from_record(&record, from));
        if self.has_transit_hop(&hop.info).await {
            warn!("duplicate transit hop {:?}", hop.info);
            return;
        }
        self.put_transit_hop(hop.clone()).await;

        if hop.is_terminal(&self.env.our_id) {
            debug!("terminal hop for rx={}, confirming", hop.info.rx_id);
            hop.send_path_confirm(&self.env);
        } else {
            let rotated = msg.rotate(&mut thread_rng());
            self.env
                .event_tx
                .unbounded_send(RouterEvent::SendLinkMessage(
                    hop.info.upstream,
                    LinkMessage::RelayCommit(rotated),
                ))
                .ok();
        }
    }

    /// Relay tunnel data flowing away from its owner.
    pub async fn handle_relay_upstream(&self, from: RouterId, msg: RelayUpstream) {
        let hop = match self.get_by_downstream(&from, &msg.path_id).await {
            Some(HopHandler::Transit(hop)) => hop,
            _ => {
                debug!("no transit hop for upstream {} from {}", msg.path_id, from);
                return;
            }
        };
        let mut payload = msg.payload;
        let mut nonce = msg.nonce;
        hop.crypt_and_step(&mut payload, &mut nonce);

        if hop.is_terminal(&self.env.our_id) {
            let allow_exit = self.state.read().await.allow_exit;
            match RoutingMessage::from_bytes(&payload) {
                Ok((_, routing_msg)) => {
                    hop.handle_routing_message(routing_msg, allow_exit, &self.env)
                        .await;
                }
                Err(_) => {
                    warn!("failed to parse routing message on {}", hop.info.rx_id);
                }
            }
        } else {
            self.env
                .event_tx
                .unbounded_send(RouterEvent::SendLinkMessage(
                    hop.info.upstream,
                    LinkMessage::RelayUpstream(RelayUpstream {
                        path_id: hop.info.tx_id,
                        payload,
                        nonce,
                    }),
                ))
                .ok();
        }
    }

    /// Relay or consume tunnel data flowing towards its owner.
    pub async fn handle_relay_downstream(&self, from: RouterId, msg: RelayDownstream) {
        // one of our own paths?
        let own = {
            let state = self.state.read().await;
            state.our_paths.get(&msg.path_id).cloned()
        };
        if let Some(set) = own {
            let mut set = set.write().await;
            let events = set.events.clone();
            if let Some(path) = set.get_mut_by_id(&msg.path_id) {
                if path.upstream() == from {
                    path.handle_downstream(msg.payload, msg.nonce, &events, &self.env)
                        .await;
                    return;
                }
            }
            warn!("downstream data for {} from wrong peer {}", msg.path_id, from);
            return;
        }

        // a circuit we relay for
        let hop = match self.get_by_upstream(&from, &msg.path_id).await {
            Some(HopHandler::Transit(hop)) => hop,
            _ => {
                debug!("no hop for downstream {} from {}", msg.path_id, from);
                return;
            }
        };
        let mut payload = msg.payload;
        let mut nonce = msg.nonce;
        hop.crypt_and_step(&mut payload, &mut nonce);
        self.env
            .event_tx
            .unbounded_send(RouterEvent::SendLinkMessage(
                hop.info.downstream,
                LinkMessage::RelayDownstream(RelayDownstream {
                    path_id: hop.info.rx_id,
                    payload,
                    nonce,
                }),
            ))
            .ok();
    }

    /** Send a routing message "on" a path id: upstream when we own the
    path, downstream when a circuit terminates here.

    Used by the DHT to answer lookups that arrived over paths.
    */
    pub async fn send_on_path(&self, id: &PathId, msg: &RoutingMessage) -> bool {
        let own = {
            let state = self.state.read().await;
            state.our_paths.get(id).cloned()
        };
        if let Some(set) = own {
            let set = set.read().await;
            if let Some(path) = set.get_by_id(id) {
                return path.send_routing_message(msg, &self.env);
            }
            return false;
        }
        match self.get_path_for_transfer(id).await {
            Some(hop) => hop.send_downstream(msg, &self.env),
            None => {
                warn!("no path to reply on for {}", id);
                false
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    use std::collections::VecDeque;

    use futures::channel::mpsc;
    use rand::thread_rng;

    use crate::dht::Dht;
    use crate::event::{EventRx, RouterEvent};
    use crate::nodedb::NodeDb;
    use crate::path::builder::Builder;
    use crate::path::{
        NullPathEvents, PathStatus, DEFAULT_HOP_COUNT, DEFAULT_NUM_PATHS, ROLE_TRANSIT,
    };
    use crate::profiler::Profiler;
    use crate::time::unix_now_ms;
    use shroud_crypto::{SigningKey, TunnelNonce};
    use shroud_packet::rc::{AddressInfo, RouterContact, DEFAULT_NET_ID};

    /// One simulated router with its own context and event queue.
    pub struct SimNode {
        pub rc: RouterContact,
        pub context: PathContext,
        pub events: EventRx,
        pub nodedb: NodeDb,
    }

    pub async fn make_node(service: bool) -> SimNode {
        let mut rng = thread_rng();
        let identity = SigningKey::generate(&mut rng);
        let onion_secret = SecretKey::generate(&mut rng);
        let mut rc = RouterContact::new(
            shroud_crypto::RouterId::from(identity.verifying_key()),
            onion_secret.public_key(),
            DEFAULT_NET_ID,
            unix_now_ms(),
        );
        rc.addrs.push(AddressInfo {
            key: SecretKey::generate(&mut rng).public_key(),
            ip: "192.0.2.77".parse().unwrap(),
            port: 1090,
        });
        rc.sign(&identity).unwrap();

        let (event_tx, events) = mpsc::unbounded();
        let nodedb = NodeDb::new(DEFAULT_NET_ID);
        let our_rc = Arc::new(RwLock::new(rc.clone()));
        let dht = Dht::new(rc.router_id(), our_rc, nodedb.clone(), event_tx.clone());
        dht.set_allow_transit(service).await;
        let env = PathEnv {
            our_id: rc.router_id(),
            identity: Arc::new(identity),
            event_tx,
            profiler: Profiler::new(),
            dht,
        };
        let context = PathContext::new(env, Arc::new(RwLock::new(onion_secret)));
        context.set_allow_transit(service).await;
        SimNode {
            rc,
            context,
            events,
            nodedb,
        }
    }

    /// Pump queued link messages between the simulated routers until the
    /// network goes quiet. Non-link events are returned to the caller.
    pub async fn pump(nodes: &mut [SimNode]) -> Vec<(RouterId, RouterEvent)> {
        let mut leftovers = Vec::new();
        let mut work: VecDeque<(RouterId, RouterId, LinkMessage)> = VecDeque::new();
        loop {
            for node in nodes.iter_mut() {
                let from = node.rc.router_id();
                while let Ok(Some(event)) = node.events.try_next() {
                    match event {
                        RouterEvent::SendLinkMessage(to, msg) => {
                            work.push_back((from, to, msg));
                        }
                        other => leftovers.push((from, other)),
                    }
                }
            }
            let (from, to, msg) = match work.pop_front() {
                Some(item) => item,
                None => break,
            };
            let target = nodes
                .iter()
                .position(|node| node.rc.router_id() == to)
                .expect("message to unknown node");
            let context = nodes[target].context.clone();
            match msg {
                LinkMessage::RelayCommit(commit) => {
                    context.handle_relay_commit(from, commit).await
                }
                LinkMessage::RelayUpstream(upstream) => {
                    context.handle_relay_upstream(from, upstream).await
                }
                LinkMessage::RelayDownstream(downstream) => {
                    context.handle_relay_downstream(from, downstream).await
                }
                LinkMessage::DhtImmediate(_) => {}
            }
        }
        leftovers
    }

    #[tokio::test]
    async fn transit_indexing_under_both_ids() {
        let node = make_node(true).await;
        let mut rng = thread_rng();
        let hop = Arc::new(TransitHop {
            info: TransitHopInfo {
                tx_id: PathId::random(&mut rng),
                rx_id: PathId::random(&mut rng),
                upstream: RouterId(rand::Rng::gen(&mut rng)),
                downstream: RouterId(rand::Rng::gen(&mut rng)),
            },
            session_key: shroud_crypto::gen_session_key(&mut rng),
            nonce_xor: TunnelNonce::random(&mut rng),
            started: crate::time::clock_now(),
            lifetime: std::time::Duration::from_secs(600),
            exit: RwLock::new(None),
        });
        node.context.put_transit_hop(hop.clone()).await;

        match node
            .context
            .get_by_upstream(&hop.info.upstream, &hop.info.tx_id)
            .await
        {
            Some(HopHandler::Transit(found)) => assert_eq!(found.info, hop.info),
            _ => panic!("upstream lookup failed"),
        }
        match node
            .context
            .get_by_downstream(&hop.info.downstream, &hop.info.rx_id)
            .await
        {
            Some(HopHandler::Transit(found)) => assert_eq!(found.info, hop.info),
            _ => panic!("downstream lookup failed"),
        }
        assert!(node.context.has_transit_hop(&hop.info).await);
    }

    #[tokio::test]
    async fn own_path_indexed_under_both_ids() {
        let node = make_node(false).await;
        let mut rng = thread_rng();
        let contacts: Vec<_> = (0..2)
            .map(|_| crate::nodedb::tests::make_contact(&mut rng, true))
            .collect();
        let path = crate::path::Path::new(&mut rng, contacts, ROLE_TRANSIT);
        let tx_id = path.tx_id();
        let rx_id = path.rx_id();

        let builder = Builder::new(
            node.nodedb.clone(),
            Profiler::new(),
            2,
            DEFAULT_NUM_PATHS,
            ROLE_TRANSIT,
            Arc::new(NullPathEvents),
        );
        let set = builder.set();
        node.context.add_own_path(set.clone(), path).await;

        for id in [tx_id, rx_id] {
            match node.context.get_by_upstream(&RouterId([9; 32]), &id).await {
                Some(HopHandler::Own(found)) => assert!(Arc::ptr_eq(&found, &set)),
                _ => panic!("own path lookup failed for {}", id),
            }
        }
    }

    #[tokio::test]
    async fn four_hop_build_confirm_and_latency() {
        // one client plus a pool of relays
        let mut nodes = vec![make_node(false).await];
        for _ in 0..8 {
            nodes.push(make_node(true).await);
        }
        // the client knows every relay
        for idx in 1..nodes.len() {
            let rc = nodes[idx].rc.clone();
            nodes[0].nodedb.insert(rc).await;
        }

        let builder = Builder::new(
            nodes[0].nodedb.clone(),
            Profiler::new(),
            DEFAULT_HOP_COUNT,
            DEFAULT_NUM_PATHS,
            ROLE_TRANSIT,
            Arc::new(NullPathEvents),
        );
        let set = builder.set();
        nodes[0].context.add_builder(builder).await;
        for _ in 0..10 {
            nodes[0]
                .context
                .build_paths(crate::time::clock_now(), &[])
                .await;
            if set.read().await.iter().next().is_some() {
                break;
            }
        }

        // deliver the commit chain, the confirm and the latency exchange
        let leftovers = pump(&mut nodes).await;

        // exactly one hop per selected relay was installed
        let mut installed = 0;
        for relay in &nodes[1..] {
            installed += relay.context.num_transit_hops().await;
        }
        assert_eq!(installed, DEFAULT_HOP_COUNT);

        // the client path went all the way to established
        let set = set.read().await;
        let path = set.iter().next().expect("path exists");
        assert_eq!(path.status(), PathStatus::Established);
        assert!(path.is_ready());

        // the build asked to persist the session with the first hop
        assert!(leftovers.iter().any(|(_, event)| matches!(
            event,
            RouterEvent::PersistSession { .. }
        )));
    }

    #[tokio::test]
    async fn unconfirmed_build_times_out_and_is_swept() {
        tokio::time::pause();
        let mut nodes = vec![make_node(false).await];
        for _ in 0..8 {
            nodes.push(make_node(true).await);
        }
        for idx in 1..nodes.len() {
            let rc = nodes[idx].rc.clone();
            nodes[0].nodedb.insert(rc).await;
        }

        let builder = Builder::new(
            nodes[0].nodedb.clone(),
            Profiler::new(),
            DEFAULT_HOP_COUNT,
            DEFAULT_NUM_PATHS,
            ROLE_TRANSIT,
            Arc::new(NullPathEvents),
        );
        let set = builder.set();
        nodes[0].context.add_builder(builder).await;
        for _ in 0..10 {
            nodes[0]
                .context
                .build_paths(crate::time::clock_now(), &[])
                .await;
            if set.read().await.iter().next().is_some() {
                break;
            }
        }
        // nobody answers: no pump, the confirm never arrives
        let hop_ids: Vec<RouterId> = {
            let set = set.read().await;
            let path = set.iter().next().expect("path exists");
            path.hops.iter().map(|hop| hop.rc.router_id()).collect()
        };

        tokio::time::advance(crate::path::PATH_BUILD_TIMEOUT + std::time::Duration::from_millis(1))
            .await;
        let now = crate::time::clock_now();
        nodes[0].context.tick_paths(now).await;

        {
            let set = set.read().await;
            let path = set.iter().next().unwrap();
            assert_eq!(path.status(), PathStatus::Timeout);
        }
        // every hop took a profiling hit
        let profiler = nodes[0].context.env().profiler.clone();
        for id in &hop_ids {
            assert_eq!(profiler.get(id).await.unwrap().path_fails, 1);
        }

        // the sweep drops the dead path and its index entries
        nodes[0].context.expire_paths(now).await;
        assert!(set.read().await.iter().next().is_none());
    }

    #[tokio::test]
    async fn wrong_peer_downstream_is_ignored() {
        let mut nodes = vec![make_node(false).await];
        for _ in 0..3 {
            nodes.push(make_node(true).await);
        }
        for idx in 1..nodes.len() {
            let rc = nodes[idx].rc.clone();
            nodes[0].nodedb.insert(rc).await;
        }

        let builder = Builder::new(
            nodes[0].nodedb.clone(),
            Profiler::new(),
            2,
            DEFAULT_NUM_PATHS,
            ROLE_TRANSIT,
            Arc::new(NullPathEvents),
        );
        let set = builder.set();
        nodes[0].context.add_builder(builder).await;
        for _ in 0..10 {
            nodes[0]
                .context
                .build_paths(crate::time::clock_now(), &[])
                .await;
            if set.read().await.iter().next().is_some() {
                break;
            }
        }
        pump(&mut nodes).await;

        let (rx_id, status_before) = {
            let set = set.read().await;
            let path = set.iter().next().unwrap();
            (path.rx_id(), path.status())
        };

        // downstream data claiming to come from a stranger is dropped
        let stranger = RouterId([3; 32]);
        nodes[0]
            .context
            .handle_relay_downstream(
                stranger,
                RelayDownstream {
                    path_id: rx_id,
                    payload: vec![0; 128],
                    nonce: TunnelNonce::random(&mut thread_rng()),
                },
            )
            .await;
        let set = set.read().await;
        assert_eq!(set.iter().next().unwrap().status(), status_before);
    }
}
