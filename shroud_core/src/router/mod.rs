/*!
The router orchestrator: the single logic loop tying the node database,
DHT, link sessions and the path subsystem together.

Everything that mutates core state happens on this loop; crypto runs on
the blocking pool and disk writes on the file-system pool, both returning
through the event channel.
*/

pub mod config;
pub mod connect;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::{thread_rng, Rng};
use tokio::sync::RwLock;
use tokio::time::Instant;

use shroud_binary_io::{encode_to_vec, FromBytes};
use shroud_crypto::{PublicKey, RouterId, SecretKey, SigningKey};
use shroud_packet::link::{LinkMessage, MAX_LINK_MSG_SIZE};
use shroud_packet::rc::{AddressInfo, RouterContact, MAX_CONTACT_SIZE};

use crate::dht::{Dht, DhtSource};
use crate::event::{EventRx, EventTx, LookupHandler, RouterEvent};
use crate::link::LinkManager;
use crate::nodedb::NodeDb;
use crate::path::builder::Builder;
use crate::path::context::PathContext;
use crate::path::{PathEnv, NullPathEvents, DEFAULT_HOP_COUNT, DEFAULT_NUM_PATHS, ROLE_DHT, ROLE_TRANSIT};
use crate::profiler::Profiler;
use crate::time::{clock_now, unix_now_ms};

pub use self::config::RouterConfig;
use self::connect::{
    TryConnectJob, BOOTSTRAP_CONNECT_TRIES, CASUAL_CONNECT_TRIES, SEND_QUEUE_CONNECT_TRIES,
};

/// Cadence of the orchestrator tick.
pub const MAIN_LOOP_INTERVAL: Duration = Duration::from_secs(1);

/// Per-peer cap of messages queued while no session exists.
pub const MAX_SEND_QUEUE_SIZE: usize = 8;

/// Contact regeneration fires early by a random jitter below this bound.
const RC_REGEN_JITTER_MS: u64 = 10_000;

/// Profiles hit the disk every this many ticks.
const PROFILE_SAVE_TICKS: u64 = 60;

/// Settling pause between the stages of a graceful stop.
const STOP_GRACE: Duration = Duration::from_millis(200);

struct RouterState {
    valid_routers: HashMap<RouterId, RouterContact>,
    pending_verify: HashSet<RouterId>,
    pending_establish: HashMap<RouterId, TryConnectJob>,
    outbound_queue: HashMap<RouterId, VecDeque<Vec<u8>>>,
    persisting: HashMap<RouterId, Instant>,
    bootstrap: Vec<RouterContact>,
    stopping: bool,
    ticks: u64,
}

/// Shared handle to the orchestrator.
#[derive(Clone)]
pub struct Router {
    identity: Arc<SigningKey>,
    onion_key: Arc<RwLock<SecretKey>>,
    our_rc: Arc<RwLock<RouterContact>>,
    config: Arc<RouterConfig>,
    nodedb: NodeDb,
    dht: Dht,
    paths: PathContext,
    links: LinkManager,
    profiler: Profiler,
    event_tx: EventTx,
    state: Arc<RwLock<RouterState>>,
}

impl Router {
    /** Assemble the orchestrator and its components.

    `transport_key` is the public half of the link transport key, pinned
    into our advertised addresses.
    */
    pub async fn new(
        identity: SigningKey,
        onion_key: SecretKey,
        transport_key: PublicKey,
        config: RouterConfig,
        links: LinkManager,
        event_tx: EventTx,
    ) -> Router {
        let our_id = RouterId::from(identity.verifying_key());
        let service_node = links.is_service_node();

        let mut rc = RouterContact::new(our_id, onion_key.public_key(), &config.netid, unix_now_ms());
        rc.nickname = config.nickname.clone();
        rc.exit = config.exit && service_node;
        if let Some(ip) = config.public_address {
            rc.addrs.push(AddressInfo {
                key: transport_key,
                ip,
                port: config.public_port.unwrap_or(1090),
            });
        }
        if let Err(error) = rc.sign(&identity) {
            error!("failed to sign our contact: {}", error);
        }

        let identity = Arc::new(identity);
        let onion_key = Arc::new(RwLock::new(onion_key));
        let our_rc = Arc::new(RwLock::new(rc));
        let nodedb = NodeDb::new(&config.netid);
        let profiler = Profiler::new();
        let dht = Dht::new(our_id, our_rc.clone(), nodedb.clone(), event_tx.clone());
        dht.set_allow_transit(service_node).await;

        let env = PathEnv {
            our_id,
            identity: identity.clone(),
            event_tx: event_tx.clone(),
            profiler: profiler.clone(),
            dht: dht.clone(),
        };
        let paths = PathContext::new(env, onion_key.clone());
        paths.set_allow_transit(service_node).await;
        paths.set_allow_exit(config.exit && service_node).await;

        if !service_node {
            // clients consume paths; give them a default builder
            let builder = Builder::new(
                nodedb.clone(),
                profiler.clone(),
                DEFAULT_HOP_COUNT,
                DEFAULT_NUM_PATHS,
                ROLE_TRANSIT | ROLE_DHT,
                Arc::new(NullPathEvents),
            );
            paths.add_builder(builder).await;
        }

        Router {
            identity,
            onion_key,
            our_rc,
            config: Arc::new(config),
            nodedb,
            dht,
            paths,
            links,
            profiler,
            event_tx,
            state: Arc::new(RwLock::new(RouterState {
                valid_routers: HashMap::new(),
                pending_verify: HashSet::new(),
                pending_establish: HashMap::new(),
                outbound_queue: HashMap::new(),
                persisting: HashMap::new(),
                bootstrap: Vec::new(),
                stopping: false,
                ticks: 0,
            })),
        }
    }

    pub fn our_id(&self) -> RouterId {
        RouterId::from(self.identity.verifying_key())
    }

    pub async fn our_rc(&self) -> RouterContact {
        self.our_rc.read().await.clone()
    }

    pub fn nodedb(&self) -> &NodeDb {
        &self.nodedb
    }

    pub fn dht(&self) -> &Dht {
        &self.dht
    }

    pub fn paths(&self) -> &PathContext {
        &self.paths
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn is_service_node(&self) -> bool {
        self.links.is_service_node()
    }

    pub async fn number_of_connected_routers(&self) -> usize {
        self.state.read().await.valid_routers.len()
    }

    /// Hand a bootstrap contact to the orchestrator; it is dialed from
    /// the tick loop whenever the node database runs low.
    pub async fn add_bootstrap_rc(&self, rc: RouterContact) {
        self.state.write().await.bootstrap.push(rc);
    }

    pub async fn is_stopping(&self) -> bool {
        self.state.read().await.stopping
    }

    /// Load persisted state (node database and profiles) from disk.
    pub async fn load_disk_state(&self) -> std::io::Result<usize> {
        NodeDb::ensure_dir(&self.config.netdb_dir).await?;
        let loaded = self.nodedb.load_dir(&self.config.netdb_dir).await?;
        self.profiler.load(&self.config.profiles_path).await?;
        Ok(loaded)
    }

    /// Drive the logic loop until the router stops.
    pub async fn run(&self, mut event_rx: EventRx) {
        let mut ticker = tokio::time::interval(MAIN_LOOP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if self.is_stopping().await {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                event = event_rx.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!("logic loop finished");
    }

    /** Graceful stop: flag, give consumers a moment, close the links,
    give the transport a moment.
    */
    pub async fn stop(&self) {
        info!("stopping router");
        self.state.write().await.stopping = true;
        // hidden-service and exit handlers live outside the core and
        // observe the stopping flag
        tokio::time::sleep(STOP_GRACE).await;

        let mut peers = Vec::new();
        self.links
            .for_each_session(|session| peers.push(session.remote))
            .await;
        for peer in peers {
            self.links.close_session_to(&peer).await;
        }
        tokio::time::sleep(STOP_GRACE).await;
        info!("router stopped");
    }

    /// Dispatch one event from the logic channel.
    pub async fn handle_event(&self, event: RouterEvent) {
        match event {
            RouterEvent::SendLinkMessage(to, msg) => {
                let bound_path = matches!(
                    msg,
                    LinkMessage::RelayUpstream(_) | LinkMessage::RelayDownstream(_)
                );
                self.send_to_or_queue(&to, &msg, bound_path).await;
            }
            RouterEvent::PathReply(path_id, msg) => {
                self.paths.send_on_path(&path_id, &msg).await;
            }
            RouterEvent::VerifyDone { rc, valid } => {
                self.on_verify_done(rc, valid).await;
            }
            RouterEvent::LookupDone {
                target,
                handler,
                contacts,
            } => {
                self.on_lookup_done(target, handler, contacts).await;
            }
            RouterEvent::PersistSession { peer, until } => {
                self.persist_session_until(peer, until).await;
            }
            RouterEvent::SessionEstablished(rc, kind) => {
                info!("session with {} established ({:?})", rc.router_id(), kind);
                self.async_verify_rc(rc).await;
            }
            RouterEvent::SessionClosed(id) => {
                self.dht.remove_node(&id).await;
                self.state.write().await.valid_routers.remove(&id);
                info!("session to {} fully closed", id);
            }
            RouterEvent::InboundMessage { from, data } => {
                self.handle_recv_link_message_buffer(from, &data).await;
            }
        }
    }

    /// Parse and dispatch a raw link-layer message from a session.
    pub async fn handle_recv_link_message_buffer(&self, from: RouterId, data: &[u8]) {
        if self.is_stopping().await {
            return;
        }
        let msg = match LinkMessage::from_bytes(data) {
            Ok((_, msg)) => msg,
            Err(_) => {
                warn!("unparseable link message from {}", from);
                return;
            }
        };
        match msg {
            LinkMessage::RelayCommit(commit) => {
                self.paths.handle_relay_commit(from, commit).await;
            }
            LinkMessage::RelayUpstream(upstream) => {
                self.paths.handle_relay_upstream(from, upstream).await;
            }
            LinkMessage::RelayDownstream(downstream) => {
                self.paths.handle_relay_downstream(from, downstream).await;
            }
            LinkMessage::DhtImmediate(envelope) => {
                for dht_msg in envelope.msgs {
                    self.dht
                        .handle_message(DhtSource::Link(from), dht_msg)
                        .await;
                }
            }
        }
    }

    /** Send a link message, or queue it and work on getting a session.

    Messages bound to an existing path never fall back to another link;
    everything else may try every link holding a session.
    */
    pub async fn send_to_or_queue(
        &self,
        remote: &RouterId,
        msg: &LinkMessage,
        bound_path: bool,
    ) -> bool {
        let encoded = match encode_to_vec(msg, MAX_LINK_MSG_SIZE) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!("failed to encode message to {}: {:?}", remote, error);
                return false;
            }
        };

        let mut candidates = Vec::new();
        for link in self.links.inbound() {
            if link.has_session_to(remote).await {
                candidates.push(link.clone());
            }
        }
        if self.links.outbound().has_session_to(remote).await {
            candidates.push(self.links.outbound().clone());
        }
        if !candidates.is_empty() {
            for link in &candidates {
                if link.send_to(remote, encoded.clone()).await {
                    return true;
                }
                if bound_path {
                    warn!("path-bound message to {} dropped", remote);
                    return false;
                }
            }
            warn!("message to {} was dropped", remote);
            return false;
        }

        // no session: queue and work on one
        {
            let mut state = self.state.write().await;
            let queue = state.outbound_queue.entry(*remote).or_default();
            if queue.len() < MAX_SEND_QUEUE_SIZE {
                queue.push_back(encoded);
            } else {
                warn!(
                    "outbound queue to {} is full, dropping message",
                    remote
                );
            }
        }

        if let Some(rc) = self.nodedb.get(remote).await {
            self.try_connect(rc, SEND_QUEUE_CONNECT_TRIES).await;
        } else {
            self.dht.lookup_router(*remote, LookupHandler::SendTo).await;
        }
        true
    }

    /// Queued messages waiting for a session to this peer.
    pub async fn pending_queue_len(&self, remote: &RouterId) -> usize {
        self.state
            .read()
            .await
            .outbound_queue
            .get(remote)
            .map_or(0, VecDeque::len)
    }

    /// Ship every queued message now that a session exists.
    pub async fn flush_outbound_for(&self, remote: &RouterId) {
        let queue = {
            let mut state = self.state.write().await;
            state.pending_establish.remove(remote);
            state.outbound_queue.remove(remote)
        };
        let queue = match queue {
            Some(queue) => queue,
            None => return,
        };
        debug!("flushing {} messages to {}", queue.len(), remote);
        match self.links.link_with_session(remote).await {
            Some(link) => {
                for data in queue {
                    if !link.send_to(remote, data).await {
                        warn!("failed to flush queued message to {}", remote);
                    }
                }
            }
            None => warn!("flush for {} without a session", remote),
        }
    }

    /// Throw away everything queued for this peer.
    pub async fn discard_outbound_for(&self, remote: &RouterId) {
        self.state.write().await.outbound_queue.remove(remote);
    }

    /// Whether dialing this peer is permitted by strict-connect policy.
    pub async fn connection_allowed(&self, remote: &RouterId) -> bool {
        self.config.strict_connect.is_empty() || self.config.strict_connect.contains(remote)
    }

    /** Start a connect attempt with retries.

    No-ops when an attempt to the peer is already pending.
    */
    pub async fn try_connect(&self, rc: RouterContact, tries: u16) -> bool {
        let id = rc.router_id();
        if id == self.our_id() {
            return false;
        }
        if !self.connection_allowed(&id).await {
            warn!("not connecting to {}, not permitted by config", id);
            return false;
        }
        {
            let mut state = self.state.write().await;
            if state.pending_establish.contains_key(&id) {
                debug!("already have a pending connect job to {}", id);
                return false;
            }
            state.pending_establish.insert(id, TryConnectJob::new(rc, tries));
        }
        self.attempt(&id).await;
        true
    }

    pub async fn has_pending_connect_job(&self, remote: &RouterId) -> bool {
        self.state
            .read()
            .await
            .pending_establish
            .contains_key(remote)
    }

    async fn attempt(&self, id: &RouterId) {
        let rc = {
            let mut state = self.state.write().await;
            match state.pending_establish.get_mut(id) {
                Some(job) => {
                    job.arm_attempt();
                    job.rc.clone()
                }
                None => return,
            }
        };
        if !self.links.try_establish_to(&rc).await {
            debug!("did not attempt connection to {}", id);
        }
    }

    /// One attempt ran out of time: mark it, retry or give up.
    async fn attempt_timed_out(&self, id: RouterId) {
        self.profiler.mark_connect_timeout(&id).await;
        let retry = {
            let state = self.state.read().await;
            state
                .pending_establish
                .get(&id)
                .map_or(false, TryConnectJob::should_retry)
        };
        if retry {
            self.attempt(&id).await;
            return;
        }
        if !self.is_service_node() && self.profiler.is_bad(&id).await {
            debug!("removing unreliable router {}", id);
            self.nodedb.remove(&id).await;
        }
        self.state.write().await.pending_establish.remove(&id);
    }

    /** Kick off the three-stage verification of a received contact:
    signature check on the crypto pool, node-database insert on the disk
    pool, completion hook back on the logic loop.

    At most one verification per peer is in flight.
    */
    pub async fn async_verify_rc(&self, rc: RouterContact) {
        let id = rc.router_id();
        {
            let mut state = self.state.write().await;
            if state.stopping || !state.pending_verify.insert(id) {
                return;
            }
        }
        let router = self.clone();
        tokio::spawn(async move {
            let netid = router.config.netid.clone();
            let checked = rc.clone();
            let valid = tokio::task::spawn_blocking(move || {
                checked.verify(&netid, unix_now_ms()).is_ok()
            })
            .await
            .unwrap_or(false);

            let valid = if valid && rc.is_public() {
                router.nodedb.insert(rc.clone()).await
            } else {
                valid
            };
            router
                .event_tx
                .unbounded_send(RouterEvent::VerifyDone { rc, valid })
                .ok();
        });
    }

    /// Completion hook of the verify pipeline, on the logic loop.
    async fn on_verify_done(&self, rc: RouterContact, valid: bool) {
        let id = rc.router_id();
        self.state.write().await.pending_verify.remove(&id);

        if !valid {
            debug!("contact of {} failed verification", id);
            self.profiler.mark_connect_timeout(&id).await;
            let had_job = self.state.write().await.pending_establish.remove(&id).is_some();
            if had_job {
                self.links.close_session_to(&id).await;
            }
            self.discard_outbound_for(&id).await;
            return;
        }

        debug!("contact of {} verified and saved", id);
        if rc.is_public() {
            let mut state = self.state.write().await;
            state.valid_routers.insert(id, rc.clone());
            drop(state);
            self.dht.put_node(rc.clone()).await;
            self.profiler.mark_connect_success(&id).await;
        }

        if self.links.has_session_to(&id).await {
            self.flush_outbound_for(&id).await;
        } else {
            let queued = self.pending_queue_len(&id).await > 0;
            if queued && !self.has_pending_connect_job(&id).await {
                self.try_connect(rc, SEND_QUEUE_CONNECT_TRIES).await;
            }
        }
    }

    /// Completion of an iterative router lookup.
    async fn on_lookup_done(
        &self,
        target: RouterId,
        handler: LookupHandler,
        contacts: Vec<RouterContact>,
    ) {
        match handler {
            LookupHandler::Explore => {
                for rc in contacts {
                    self.async_verify_rc(rc).await;
                }
            }
            LookupHandler::SendTo => {
                if contacts.is_empty() {
                    debug!("lookup for {} found nothing, discarding queue", target);
                    self.discard_outbound_for(&target).await;
                    return;
                }
                for rc in contacts {
                    self.async_verify_rc(rc).await;
                }
            }
            LookupHandler::TryEstablish => {
                if contacts.is_empty() {
                    if !self.is_service_node() {
                        self.profiler.mark_connect_timeout(&target).await;
                    }
                    return;
                }
                for rc in contacts {
                    self.async_verify_rc(rc.clone()).await;
                    self.try_connect(rc, SEND_QUEUE_CONNECT_TRIES).await;
                }
            }
            LookupHandler::Channel(sender) => {
                sender.send(contacts).ok();
            }
        }
    }

    /// Keep the session to this peer alive until at least `until`.
    pub async fn persist_session_until(&self, peer: RouterId, until: Instant) {
        debug!("persist session to {}", peer);
        let mut state = self.state.write().await;
        let entry = state.persisting.entry(peer).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    /// Dial a peer by id, resolving its contact locally or via the DHT.
    pub async fn try_establish_to_id(&self, remote: RouterId) {
        if !self.connection_allowed(&remote).await {
            warn!("not connecting to {}, not permitted by config", remote);
            return;
        }
        if let Some(rc) = self.nodedb.get(&remote).await {
            self.try_connect(rc, CASUAL_CONNECT_TRIES).await;
            return;
        }
        if self.is_service_node() || !self.profiler.is_bad(&remote).await {
            if !self.dht.has_router_lookup(&remote).await {
                info!("looking up router {}", remote);
                self.dht
                    .lookup_router(remote, LookupHandler::TryEstablish)
                    .await;
            }
        } else {
            warn!("not connecting to {} as it's unreliable", remote);
        }
    }

    /// Re-stamp and re-sign our contact; service nodes also rotate the
    /// onion key.
    pub async fn update_our_rc(&self, rotate_keys: bool) -> bool {
        let mut rc = self.our_rc.read().await.clone();
        if rotate_keys {
            let next = SecretKey::generate(&mut thread_rng());
            rc.onion_key = next.public_key();
            *self.onion_key.write().await = next;
        }
        rc.last_updated = unix_now_ms();
        if rc.sign(&self.identity).is_err() {
            error!("failed to re-sign our contact");
            return false;
        }
        *self.our_rc.write().await = rc.clone();

        if rotate_keys {
            self.links.renegotiate_sessions().await;
        }
        match encode_to_vec(&rc, MAX_CONTACT_SIZE) {
            Ok(encoded) => {
                if let Err(error) =
                    tokio::fs::write(&self.config.contact_file, encoded).await
                {
                    warn!("failed to save our contact: {}", error);
                }
            }
            Err(error) => warn!("failed to encode our contact: {:?}", error),
        }
        true
    }

    /// Dial random known routers until the connected count looks healthy.
    pub async fn connect_to_random_routers(&self, want: usize) {
        let connected = self.number_of_connected_routers().await;
        let mut budget = want.saturating_sub(connected);
        let mut tries = want * 2;
        let anchor = self.our_rc().await;
        while budget > 0 && tries > 0 {
            tries -= 1;
            let rc = match self.nodedb.select_random_hop(&anchor, 0).await {
                Some(rc) => rc,
                None => return,
            };
            let id = rc.router_id();
            if id == self.our_id()
                || self.links.has_session_to(&id).await
                || self.has_pending_connect_job(&id).await
            {
                continue;
            }
            if self.try_connect(rc, CASUAL_CONNECT_TRIES).await {
                budget -= 1;
            }
        }
    }

    /// One pass of the orchestrator loop, scheduled every second.
    pub async fn tick(&self) {
        let now = clock_now();
        let now_ms = unix_now_ms();
        let service_node = self.is_service_node();

        // regenerate our contact shortly before it expires
        let jitter = thread_rng().gen_range(0..RC_REGEN_JITTER_MS);
        if self.our_rc.read().await.expires_soon(now_ms, jitter) {
            info!("regenerating our contact");
            if !self.update_our_rc(service_node).await {
                error!("failed to update our contact");
            }
        }

        // service nodes refresh other contacts about to expire
        if service_node {
            let mut expiring = Vec::new();
            let jitter = thread_rng().gen_range(0..RC_REGEN_JITTER_MS);
            self.nodedb
                .visit(|rc| {
                    if rc.expires_soon(now_ms, jitter) {
                        expiring.push(rc.router_id());
                    }
                })
                .await;
            for id in expiring {
                self.dht.lookup_router(id, LookupHandler::Explore).await;
            }
        }

        self.paths.tick_paths(now).await;
        self.paths.expire_paths(now).await;
        self.dht.tick().await;

        // connect attempts that ran out of time
        let timed_out: Vec<RouterId> = {
            let state = self.state.read().await;
            state
                .pending_establish
                .iter()
                .filter(|(_, job)| job.timed_out(now))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in timed_out {
            self.attempt_timed_out(id).await;
        }

        // keep promised sessions alive
        let persisting: Vec<(RouterId, Instant)> = {
            let state = self.state.read().await;
            state.persisting.iter().map(|(id, until)| (*id, *until)).collect()
        };
        for (peer, until) in persisting {
            if now < until {
                if self.links.has_session_to(&peer).await {
                    trace!("keepalive to {}", peer);
                    self.links.keep_alive_session_to(&peer).await;
                } else if !self.has_pending_connect_job(&peer).await {
                    debug!("establish to {}", peer);
                    self.try_establish_to_id(peer).await;
                }
            } else {
                debug!("session promise to {} expired", peer);
                self.state.write().await.persisting.remove(&peer);
            }
        }

        // not enough routers known: hit the bootstrap list
        if self.nodedb.num_loaded().await < self.config.min_required_routers {
            let bootstrap = self.state.read().await.bootstrap.clone();
            if bootstrap.is_empty() {
                warn!("we have no bootstrap nodes specified");
            }
            for rc in bootstrap {
                self.async_verify_rc(rc.clone()).await;
                self.try_connect(rc.clone(), BOOTSTRAP_CONNECT_TRIES).await;
                self.dht.explore_network_via(rc.router_id()).await;
            }
        }

        // clients keep their path pool filled
        if !service_node {
            let connected: Vec<RouterContact> = {
                let state = self.state.read().await;
                state.valid_routers.values().cloned().collect()
            };
            self.paths.build_paths(now, &connected).await;
        }

        // not enough live sessions: dial random routers
        if self.number_of_connected_routers().await < self.config.min_connected_routers {
            self.connect_to_random_routers(self.config.min_connected_routers)
                .await;
        }

        // periodic profile persistence
        let ticks = {
            let mut state = self.state.write().await;
            state.ticks += 1;
            state.ticks
        };
        if ticks % PROFILE_SAVE_TICKS == 0 {
            if let Err(error) = self.profiler.save(&self.config.profiles_path).await {
                warn!("failed to save profiles: {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::channel::mpsc;
    use rand::thread_rng;

    use crate::link::tests::signed_peer;
    use crate::link::{Link, LinkKind, WireCommand, WireEvent, WireRx};
    use shroud_crypto::Signer;
    use shroud_packet::dht::{DhtMessage, FindRouter};
    use shroud_packet::link::DhtImmediate;

    async fn make_router() -> (Router, EventRx, WireRx) {
        let mut rng = thread_rng();
        let (event_tx, event_rx) = mpsc::unbounded();
        let (wire_tx, wire_rx) = mpsc::unbounded();
        let outbound = Link::new(LinkKind::Outbound, "outbound", wire_tx, event_tx.clone());
        let links = LinkManager::new(outbound, Vec::new());
        let identity = SigningKey::generate(&mut rng);
        let onion_key = SecretKey::generate(&mut rng);
        let transport_key = SecretKey::generate(&mut rng).public_key();
        let router = Router::new(
            identity,
            onion_key,
            transport_key,
            RouterConfig::default(),
            links,
            event_tx,
        )
        .await;
        (router, event_rx, wire_rx)
    }

    fn test_message(rng: &mut rand::rngs::ThreadRng) -> LinkMessage {
        LinkMessage::DhtImmediate(DhtImmediate {
            msgs: vec![DhtMessage::FindRouter(FindRouter {
                exploritory: false,
                iterative: true,
                key: RouterId(rand::Rng::gen(rng)),
                tx_id: 1,
            })],
        })
    }

    async fn next_event(event_rx: &mut EventRx) -> RouterEvent {
        tokio::time::timeout(Duration::from_secs(5), event_rx.next())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn bootstrap_then_connect() {
        let mut rng = thread_rng();
        let (router, mut event_rx, mut wire_rx) = make_router().await;
        let (_identity, bootstrap) = signed_peer(&mut rng);
        let bootstrap_id = bootstrap.router_id();
        router.add_bootstrap_rc(bootstrap.clone()).await;

        router.tick().await;

        // a connect attempt to the bootstrap peer went out
        match wire_rx.next().await.unwrap() {
            WireCommand::Connect(dialed) => assert_eq!(dialed.router_id(), bootstrap_id),
            other => panic!("expected Connect, got {:?}", other),
        }
        assert!(router.has_pending_connect_job(&bootstrap_id).await);

        // an exploritory lookup via the bootstrap peer and the verify
        // pipeline completion both surface as events
        let mut saw_explore = false;
        let mut saw_verify = false;
        while !(saw_explore && saw_verify) {
            match next_event(&mut event_rx).await {
                RouterEvent::SendLinkMessage(to, LinkMessage::DhtImmediate(envelope)) => {
                    assert_eq!(to, bootstrap_id);
                    match &envelope.msgs[0] {
                        DhtMessage::FindRouter(find) => assert!(find.exploritory),
                        other => panic!("expected FindRouter, got {:?}", other),
                    }
                    saw_explore = true;
                }
                RouterEvent::VerifyDone { rc, valid } => {
                    assert_eq!(rc.router_id(), bootstrap_id);
                    assert!(valid);
                    router.handle_event(RouterEvent::VerifyDone { rc, valid }).await;
                    saw_verify = true;
                }
                _ => {}
            }
        }
        // the pipeline inserted the contact and counted the router valid
        assert!(router.nodedb().has(&bootstrap_id).await);
        assert_eq!(router.number_of_connected_routers().await, 1);
    }

    #[tokio::test]
    async fn send_with_no_session_queues_and_dials() {
        let mut rng = thread_rng();
        let (router, mut event_rx, mut wire_rx) = make_router().await;
        let (identity, peer) = signed_peer(&mut rng);
        let peer_id = peer.router_id();
        router.nodedb().insert(peer.clone()).await;

        assert!(
            router
                .send_to_or_queue(&peer_id, &test_message(&mut rng), false)
                .await
        );
        assert_eq!(router.pending_queue_len(&peer_id).await, 1);
        assert!(router.has_pending_connect_job(&peer_id).await);
        match wire_rx.next().await.unwrap() {
            WireCommand::Connect(dialed) => assert_eq!(dialed.router_id(), peer_id),
            other => panic!("expected Connect, got {:?}", other),
        }

        // the session comes up: authenticate, verify, flush
        let transcript = b"handshake transcript".to_vec();
        let signature = identity.sign(&transcript);
        router
            .links
            .outbound()
            .handle_wire_event(WireEvent::HandshakeDone {
                rc: peer.clone(),
                ip: peer.addrs[0].ip,
                transcript,
                signature,
            })
            .await;
        loop {
            let event = next_event(&mut event_rx).await;
            let was_verify = matches!(&event, RouterEvent::VerifyDone { .. });
            router.handle_event(event).await;
            if was_verify {
                break;
            }
        }

        assert_eq!(router.pending_queue_len(&peer_id).await, 0);
        assert!(!router.has_pending_connect_job(&peer_id).await);
        match wire_rx.next().await.unwrap() {
            WireCommand::Send(to, _) => assert_eq!(to, peer_id),
            other => panic!("expected Send, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn outbound_queue_is_capped() {
        let mut rng = thread_rng();
        let (router, _event_rx, _wire_rx) = make_router().await;
        let (_identity, peer) = signed_peer(&mut rng);
        let peer_id = peer.router_id();
        router.nodedb().insert(peer).await;

        for _ in 0..MAX_SEND_QUEUE_SIZE + 1 {
            router
                .send_to_or_queue(&peer_id, &test_message(&mut rng), false)
                .await;
        }
        assert_eq!(router.pending_queue_len(&peer_id).await, MAX_SEND_QUEUE_SIZE);
    }

    #[tokio::test]
    async fn at_most_one_verify_per_peer() {
        let mut rng = thread_rng();
        let (router, mut event_rx, _wire_rx) = make_router().await;
        let (_identity, peer) = signed_peer(&mut rng);

        router.async_verify_rc(peer.clone()).await;
        router.async_verify_rc(peer.clone()).await;

        match next_event(&mut event_rx).await {
            RouterEvent::VerifyDone { rc, valid } => {
                assert_eq!(rc.router_id(), peer.router_id());
                assert!(valid);
            }
            other => panic!("expected VerifyDone, got {:?}", other),
        }
        // the duplicate call produced no second completion
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(event_rx.try_next().is_err());
    }

    #[tokio::test]
    async fn invalid_contact_is_rejected() {
        let mut rng = thread_rng();
        let (router, mut event_rx, _wire_rx) = make_router().await;
        let (_identity, mut peer) = signed_peer(&mut rng);
        peer.last_updated += 1; // break the signature

        router.async_verify_rc(peer.clone()).await;
        match next_event(&mut event_rx).await {
            RouterEvent::VerifyDone { rc, valid } => {
                assert!(!valid);
                router.handle_event(RouterEvent::VerifyDone { rc, valid }).await;
            }
            other => panic!("expected VerifyDone, got {:?}", other),
        }
        assert!(!router.nodedb().has(&peer.router_id()).await);
        assert_eq!(router.number_of_connected_routers().await, 0);
    }

    #[tokio::test]
    async fn connect_job_retries_then_gives_up() {
        tokio::time::pause();
        let mut rng = thread_rng();
        let (router, _event_rx, mut wire_rx) = make_router().await;
        let (_identity, peer) = signed_peer(&mut rng);
        let peer_id = peer.router_id();
        // enough contacts that the tick loop has no bootstrap worries
        router.nodedb().insert(peer.clone()).await;

        assert!(router.try_connect(peer.clone(), 2).await);
        assert!(router.has_pending_connect_job(&peer_id).await);
        // a second job for the same peer is refused while one is pending
        assert!(!router.try_connect(peer.clone(), 2).await);

        // first attempt times out, the job retries
        tokio::time::advance(connect::ESTABLISH_TIMEOUT).await;
        router.attempt_timed_out(peer_id).await;
        assert!(router.has_pending_connect_job(&peer_id).await);

        // second timeout exhausts the tries
        tokio::time::advance(connect::ESTABLISH_TIMEOUT).await;
        router.attempt_timed_out(peer_id).await;
        assert!(!router.has_pending_connect_job(&peer_id).await);

        // only the first dial reaches the transport; the retry is refused
        // while the half-open session lingers
        let mut connects = 0;
        while let Ok(Some(cmd)) = wire_rx.try_next() {
            if matches!(cmd, WireCommand::Connect(_)) {
                connects += 1;
            }
        }
        assert_eq!(connects, 1);
        assert_eq!(
            router.profiler().get(&peer_id).await.unwrap().connect_timeouts,
            2
        );
    }

    #[tokio::test]
    async fn garbage_link_message_is_dropped() {
        let (router, _event_rx, _wire_rx) = make_router().await;
        router
            .handle_recv_link_message_buffer(RouterId([1; 32]), b"definitely not bencode")
            .await;
    }

    #[tokio::test]
    async fn persisting_session_triggers_establish() {
        let mut rng = thread_rng();
        let (router, _event_rx, mut wire_rx) = make_router().await;
        let (_identity, peer) = signed_peer(&mut rng);
        let peer_id = peer.router_id();
        router.nodedb().insert(peer).await;

        router
            .persist_session_until(peer_id, clock_now() + Duration::from_secs(600))
            .await;
        router.tick().await;

        let mut dialed = false;
        while let Ok(Some(cmd)) = wire_rx.try_next() {
            if let WireCommand::Connect(rc) = cmd {
                if rc.router_id() == peer_id {
                    dialed = true;
                }
            }
        }
        assert!(dialed);
    }

    #[tokio::test]
    async fn stopping_refuses_new_work() {
        let mut rng = thread_rng();
        let (router, mut event_rx, _wire_rx) = make_router().await;
        router.state.write().await.stopping = true;

        let (_identity, peer) = signed_peer(&mut rng);
        // verification is refused while stopping
        router.async_verify_rc(peer).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(event_rx.try_next().is_err());
    }
}
