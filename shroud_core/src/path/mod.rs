/*!
The path subsystem: building onion circuits, owning their state machines,
relaying for circuits passing through us and routing the messages that
flow inside them.
*/

pub mod builder;
pub mod context;
pub mod transit;

use std::sync::Arc;
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::time::Instant;

use shroud_binary_io::FromBytes;
use shroud_crypto::{
    tunnel_crypt, PathId, RouterId, SessionKey, SigningKey, TunnelNonce,
};
use shroud_packet::link::{LinkMessage, RelayUpstream};
use shroud_packet::rc::RouterContact;
use shroud_packet::routing::{
    CloseExit, ObtainExit, PathLatency, RoutingMessage, UpdateExit, TRAFFIC_COUNTER_SIZE,
};
use shroud_packet::zero_signature;

use crate::dht::{Dht, DhtSource};
use crate::event::{EventTx, RouterEvent};
use crate::profiler::Profiler;
use crate::time::clock_now;

/// Hops of a freshly built path.
pub const DEFAULT_HOP_COUNT: usize = 4;

/// How long a hop keeps relaying for a path.
pub const DEFAULT_PATH_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// A building path that saw no confirm within this budget has failed.
pub const PATH_BUILD_TIMEOUT: Duration = Duration::from_secs(30);

/// An established path without inbound traffic for this long is dead.
pub const PATH_ALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// An established path must hear anything at all within this window.
pub const PATH_FIRST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between latency probes.
pub const LATENCY_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Established paths per set the builder aims for.
pub const DEFAULT_NUM_PATHS: usize = 4;

/// Role bits a path can carry.
pub type PathRole = u8;

pub const ROLE_NONE: PathRole = 0;
/// Plain transit traffic.
pub const ROLE_TRANSIT: PathRole = 1 << 0;
/// Internet egress through the terminal hop.
pub const ROLE_EXIT: PathRole = 1 << 1;
/// Hidden-service endpoint traffic.
pub const ROLE_SVC: PathRole = 1 << 2;
/// DHT lookups over the path.
pub const ROLE_DHT: PathRole = 1 << 3;

/// Handles side effects the path layer cannot perform itself.
#[derive(Clone)]
pub struct PathEnv {
    pub our_id: RouterId,
    pub identity: Arc<SigningKey>,
    pub event_tx: EventTx,
    pub profiler: Profiler,
    pub dht: Dht,
}

/// Hooks into the modules consuming finished paths (hidden-service and
/// exit handlers live outside the core).
pub trait PathEvents: Send + Sync {
    /// A hop discarded traffic of ours.
    fn on_drop(&self, _path: PathId, _relay_of: PathId, _seq: u64) {}
    /// A hidden-service frame arrived on the path.
    fn on_hidden_service_frame(&self, _path: PathId, _payload: Vec<u8>) {}
    /// Exit traffic arrived, demuxed by flow counter.
    fn on_exit_traffic(&self, _path: PathId, _counter: u64, _payload: Vec<u8>) {}
    /// The path produced its first latency measurement and went into
    /// service.
    fn on_built(&self, _path: PathId) {}
    /// An exit request was granted or rejected.
    fn on_exit_result(&self, _path: PathId, _granted: bool, _backoff: u64) {}
    /// Consulted before a quiet established path is declared dead.
    fn check_for_dead(&self, _path: PathId, _since_last: Duration) -> bool {
        true
    }
}

/// Default hooks: drop everything, declare quiet paths dead.
pub struct NullPathEvents;

impl PathEvents for NullPathEvents {}

/// Everything the owner knows about one hop of its path.
#[derive(Clone, Debug)]
pub struct HopConfig {
    pub rc: RouterContact,
    pub tx_id: PathId,
    pub rx_id: PathId,
    pub session_key: SessionKey,
    pub nonce_xor: TunnelNonce,
    pub lifetime: Duration,
}

/// Rendezvous information of an established path.
#[derive(Clone, Debug)]
pub struct PathIntro {
    pub endpoint: RouterId,
    pub path_id: PathId,
    pub latency: Duration,
    pub expires_at: Instant,
}

/// Lifecycle of an owned path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathStatus {
    Building,
    Established,
    Timeout,
    Expired,
}

/// A locally owned onion circuit.
pub struct Path {
    pub hops: Vec<HopConfig>,
    status: PathStatus,
    roles: PathRole,
    build_started: Instant,
    established_at: Option<Instant>,
    pub intro: PathIntro,
    last_recv: Option<Instant>,
    seq: u64,
    latency_probe: Option<(u64, Instant)>,
    exit_obtain_tx: Option<u64>,
    exit_update_tx: Option<u64>,
    exit_close_tx: Option<u64>,
}

impl Path {
    /** Assemble a path over the given contacts.

    Ids, session keys and nonce masks are freshly random; tx ids are
    stitched so each hop forwards upstream under the next hop's rx id.
    */
    pub fn new<R: Rng>(rng: &mut R, hop_contacts: Vec<RouterContact>, roles: PathRole) -> Path {
        assert!(!hop_contacts.is_empty(), "a path needs at least one hop");
        let mut hops: Vec<HopConfig> = hop_contacts
            .into_iter()
            .map(|rc| HopConfig {
                rc,
                tx_id: PathId::random(rng),
                rx_id: PathId::random(rng),
                session_key: shroud_crypto::gen_session_key(rng),
                nonce_xor: TunnelNonce::random(rng),
                lifetime: DEFAULT_PATH_LIFETIME,
            })
            .collect();
        for idx in 0..hops.len() - 1 {
            hops[idx].tx_id = hops[idx + 1].rx_id;
        }

        let now = clock_now();
        let last = hops.last().expect("a path has at least one hop");
        let intro = PathIntro {
            endpoint: last.rc.router_id(),
            path_id: last.tx_id,
            latency: Duration::ZERO,
            expires_at: now + hops[0].lifetime,
        };
        info!(
            "path tx={} rx={} is building",
            hops[0].tx_id, hops[0].rx_id
        );
        Path {
            hops,
            status: PathStatus::Building,
            roles,
            build_started: now,
            established_at: None,
            intro,
            last_recv: None,
            seq: 0,
            latency_probe: None,
            exit_obtain_tx: None,
            exit_update_tx: None,
            exit_close_tx: None,
        }
    }

    pub fn tx_id(&self) -> PathId {
        self.hops[0].tx_id
    }

    pub fn rx_id(&self) -> PathId {
        self.hops[0].rx_id
    }

    /// First hop, the peer we physically talk to.
    pub fn upstream(&self) -> RouterId {
        self.hops[0].rc.router_id()
    }

    /// Terminal hop of the circuit.
    pub fn endpoint(&self) -> RouterId {
        self.hops[self.hops.len() - 1].rc.router_id()
    }

    pub fn status(&self) -> PathStatus {
        self.status
    }

    pub fn roles(&self) -> PathRole {
        self.roles
    }

    pub fn supports_any_roles(&self, mask: PathRole) -> bool {
        self.roles & mask != 0
    }

    pub fn is_ready(&self) -> bool {
        self.status == PathStatus::Established && self.intro.latency > Duration::ZERO
    }

    pub fn expire_time(&self) -> Instant {
        self.intro.expires_at
    }

    pub fn expired(&self, now: Instant) -> bool {
        match self.status {
            PathStatus::Established => now >= self.intro.expires_at,
            PathStatus::Building => false,
            PathStatus::Timeout | PathStatus::Expired => true,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn mark_active(&mut self, now: Instant) {
        self.last_recv = Some(now);
    }

    /// Layer the tunnel encryption over an encoded routing message and
    /// hand it to the first hop.
    pub fn send_routing_message(&self, msg: &RoutingMessage, env: &PathEnv) -> bool {
        let mut rng = thread_rng();
        let mut payload = match msg.encode_padded(&mut rng) {
            Ok(payload) => payload,
            Err(error) => {
                warn!("failed to encode routing message: {:?}", error);
                return false;
            }
        };
        let nonce = TunnelNonce::random(&mut rng);
        let mut layer_nonce = nonce;
        for hop in &self.hops {
            tunnel_crypt(&hop.session_key, &layer_nonce, &mut payload);
            layer_nonce.xor(&hop.nonce_xor);
        }
        let wire = LinkMessage::RelayUpstream(RelayUpstream {
            path_id: self.tx_id(),
            payload,
            nonce,
        });
        env.event_tx
            .unbounded_send(RouterEvent::SendLinkMessage(self.upstream(), wire))
            .is_ok()
    }

    fn send_latency_probe(&mut self, env: &PathEnv) -> bool {
        let probe = thread_rng().gen::<u64>() | 1;
        self.latency_probe = Some((probe, clock_now()));
        let msg = RoutingMessage::PathLatency(PathLatency {
            echo: 0,
            seq: self.next_seq(),
            probe,
        });
        self.send_routing_message(&msg, env)
    }

    /// Ask the terminal hop for internet egress.
    pub fn send_exit_request(&mut self, flag: u64, env: &PathEnv) -> bool {
        let tx_id = thread_rng().gen::<u64>() | 1;
        self.exit_obtain_tx = Some(tx_id);
        let mut msg = ObtainExit {
            flag,
            identity: RouterId::from(env.identity.verifying_key()),
            seq: self.next_seq(),
            tx_id,
            signature: zero_signature(),
        };
        if msg.sign(&env.identity).is_err() {
            return false;
        }
        info!("path {} requesting exit from {}", self.rx_id(), self.endpoint());
        self.send_routing_message(&RoutingMessage::ObtainExit(msg), env)
    }

    /// Move our exit grant over to another of our paths.
    pub fn request_exit_update(&mut self, new_path_id: PathId, env: &PathEnv) -> bool {
        let tx_id = thread_rng().gen::<u64>() | 1;
        self.exit_update_tx = Some(tx_id);
        let mut msg = UpdateExit {
            path_id: new_path_id,
            seq: self.next_seq(),
            tx_id,
            signature: zero_signature(),
        };
        if msg.sign(&env.identity).is_err() {
            return false;
        }
        info!(
            "path {} moving exit grant to {}",
            self.rx_id(),
            new_path_id
        );
        self.send_routing_message(&RoutingMessage::UpdateExit(msg), env)
    }

    /// Drop the exit role and tell the terminal hop.
    pub fn send_exit_close(&mut self, env: &PathEnv) -> bool {
        let tx_id = thread_rng().gen::<u64>() | 1;
        self.exit_close_tx = Some(tx_id);
        self.roles &= !ROLE_EXIT;
        let mut msg = CloseExit {
            seq: self.next_seq(),
            tx_id,
            signature: zero_signature(),
        };
        if msg.sign(&env.identity).is_err() {
            return false;
        }
        self.send_routing_message(&RoutingMessage::CloseExit(msg), env)
    }

    /** Strip all tunnel layers off a downstream payload and handle the
    routing message inside.
    */
    pub async fn handle_downstream(
        &mut self,
        mut payload: Vec<u8>,
        nonce: TunnelNonce,
        events: &Arc<dyn PathEvents>,
        env: &PathEnv,
    ) -> bool {
        let mut layer_nonce = nonce;
        for hop in &self.hops {
            layer_nonce.xor(&hop.nonce_xor);
            tunnel_crypt(&hop.session_key, &layer_nonce, &mut payload);
        }
        let msg = match RoutingMessage::from_bytes(&payload) {
            Ok((_, msg)) => msg,
            Err(_) => {
                warn!("failed to parse inbound routing message on {}", self.rx_id());
                return false;
            }
        };
        self.handle_routing_message(msg, events, env).await
    }

    /// Dispatch one routing message addressed to this path.
    pub async fn handle_routing_message(
        &mut self,
        msg: RoutingMessage,
        events: &Arc<dyn PathEvents>,
        env: &PathEnv,
    ) -> bool {
        let now = clock_now();
        match msg {
            RoutingMessage::PathConfirm(confirm) => {
                if self.status != PathStatus::Building {
                    warn!("unwarranted path confirm on rx={}", self.rx_id());
                    return false;
                }
                self.intro.expires_at = self.build_started + self.hops[0].lifetime;
                info!(
                    "path is built tx={} rx={} lifetime={}ms",
                    self.tx_id(),
                    self.rx_id(),
                    confirm.lifetime
                );
                env.event_tx
                    .unbounded_send(RouterEvent::PersistSession {
                        peer: self.upstream(),
                        until: self.intro.expires_at,
                    })
                    .ok();
                self.mark_active(now);
                self.send_latency_probe(env)
            }
            RoutingMessage::PathLatency(latency) => {
                self.mark_active(now);
                match self.latency_probe {
                    Some((probe, sent)) if probe == latency.echo => {
                        self.intro.latency = now - sent;
                        self.latency_probe = None;
                        if self.status == PathStatus::Building {
                            self.status = PathStatus::Established;
                            self.established_at = Some(now);
                            for hop in &self.hops {
                                env.profiler.mark_path_success(&hop.rc.router_id()).await;
                            }
                            events.on_built(self.rx_id());
                        }
                        true
                    }
                    _ => {
                        warn!("unwarranted path latency via {}", self.upstream());
                        false
                    }
                }
            }
            RoutingMessage::Dht(carrier) => {
                self.mark_active(now);
                let source = DhtSource::Path(self.rx_id());
                for dht_msg in carrier.msgs {
                    env.dht.handle_message(source, dht_msg).await;
                }
                true
            }
            RoutingMessage::DataDiscard(discard) => {
                self.mark_active(now);
                events.on_drop(self.rx_id(), discard.path_id, discard.seq);
                true
            }
            RoutingMessage::GrantExit(grant) => {
                if self.exit_obtain_tx != Some(grant.tx_id) {
                    warn!("unwarranted exit grant on {}", self.rx_id());
                    return false;
                }
                if grant.verify(&self.endpoint()).is_err() {
                    warn!("exit grant with bad signature on {}", self.rx_id());
                    return false;
                }
                self.exit_obtain_tx = None;
                self.roles |= ROLE_EXIT;
                self.mark_active(now);
                info!("path {} was granted exit by {}", self.rx_id(), self.endpoint());
                events.on_exit_result(self.rx_id(), true, 0);
                true
            }
            RoutingMessage::RejectExit(reject) => {
                if self.exit_obtain_tx != Some(reject.tx_id) {
                    warn!("unwarranted exit reject on {}", self.rx_id());
                    return false;
                }
                if reject.verify(&self.endpoint()).is_err() {
                    warn!("exit reject with bad signature on {}", self.rx_id());
                    return false;
                }
                self.exit_obtain_tx = None;
                self.mark_active(now);
                info!("path {} was refused exit by {}", self.rx_id(), self.endpoint());
                events.on_exit_result(self.rx_id(), false, reject.backoff);
                true
            }
            RoutingMessage::UpdateExit(update) => {
                // acks of our own update and close transactions
                if self.exit_update_tx == Some(update.tx_id) {
                    if update.verify(&self.endpoint()).is_err() {
                        warn!("exit update ack with bad signature on {}", self.rx_id());
                        return false;
                    }
                    self.exit_update_tx = None;
                    self.mark_active(now);
                    true
                } else if self.exit_close_tx == Some(update.tx_id) {
                    if update.verify(&self.endpoint()).is_err() {
                        warn!("exit close ack with bad signature on {}", self.rx_id());
                        return false;
                    }
                    self.exit_close_tx = None;
                    self.mark_active(now);
                    true
                } else {
                    warn!("unwarranted exit update on {}", self.rx_id());
                    false
                }
            }
            RoutingMessage::CloseExit(close) => {
                if !self.supports_any_roles(ROLE_EXIT | ROLE_SVC) {
                    warn!("unwarranted exit close on {}", self.rx_id());
                    return false;
                }
                if close.verify(&self.endpoint()).is_err() {
                    warn!("exit close with bad signature on {}", self.rx_id());
                    return false;
                }
                info!("path {} had its exit closed", self.rx_id());
                self.roles &= !ROLE_EXIT;
                self.mark_active(now);
                true
            }
            RoutingMessage::TransferTraffic(traffic) => {
                if !self.supports_any_roles(ROLE_EXIT | ROLE_SVC) {
                    return false;
                }
                self.mark_active(now);
                let sent = !traffic.pkts.is_empty();
                for pkt in traffic.pkts {
                    if pkt.len() <= TRAFFIC_COUNTER_SIZE {
                        return false;
                    }
                    let counter =
                        u64::from_be_bytes(pkt[..TRAFFIC_COUNTER_SIZE].try_into().unwrap());
                    events.on_exit_traffic(
                        self.rx_id(),
                        counter,
                        pkt[TRAFFIC_COUNTER_SIZE..].to_vec(),
                    );
                }
                sent
            }
            RoutingMessage::HiddenServiceFrame(frame) => {
                self.mark_active(now);
                events.on_hidden_service_frame(self.rx_id(), frame.payload);
                true
            }
            RoutingMessage::ObtainExit(_) => {
                warn!("unwarranted exit request on own path {}", self.rx_id());
                false
            }
        }
    }

    /** Advance the state machine.

    Returns the hops whose profiler records should take a failure when a
    timeout fired (build timeout or dead established path).
    */
    pub async fn tick(&mut self, now: Instant, events: &Arc<dyn PathEvents>, env: &PathEnv) {
        if self.expired(now) {
            if self.status == PathStatus::Established {
                self.status = PathStatus::Expired;
            }
            return;
        }

        match self.status {
            PathStatus::Building => {
                if now - self.build_started >= PATH_BUILD_TIMEOUT {
                    info!("path build timeout tx={} rx={}", self.tx_id(), self.rx_id());
                    self.fail_hops(env).await;
                    self.status = PathStatus::Timeout;
                }
            }
            PathStatus::Established => {
                // periodic latency probe
                let need_probe = match self.latency_probe {
                    Some((_, sent)) => now - sent > LATENCY_PROBE_INTERVAL,
                    None => true,
                };
                if need_probe && self.last_recv.map_or(false, |last| now - last > LATENCY_PROBE_INTERVAL) {
                    self.send_latency_probe(env);
                }

                match self.last_recv {
                    Some(last) if now > last && now - last > PATH_ALIVE_TIMEOUT => {
                        if events.check_for_dead(self.rx_id(), now - last) {
                            self.fail_hops(env).await;
                            self.status = PathStatus::Timeout;
                        }
                    }
                    None => {
                        let established = self.established_at.unwrap_or(self.build_started);
                        if now - established >= PATH_FIRST_MESSAGE_TIMEOUT {
                            self.fail_hops(env).await;
                            self.status = PathStatus::Timeout;
                        }
                    }
                    _ => {}
                }
            }
            PathStatus::Timeout | PathStatus::Expired => {}
        }
    }

    async fn fail_hops(&self, env: &PathEnv) {
        for hop in &self.hops {
            env.profiler.mark_path_fail(&hop.rc.router_id()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::nodedb::tests::make_contact;
    use rand::thread_rng;

    #[tokio::test]
    async fn path_stitches_tx_to_next_rx() {
        let mut rng = thread_rng();
        let contacts: Vec<_> = (0..DEFAULT_HOP_COUNT)
            .map(|_| make_contact(&mut rng, true))
            .collect();
        let path = Path::new(&mut rng, contacts, ROLE_TRANSIT);
        for idx in 0..path.hops.len() - 1 {
            assert_eq!(path.hops[idx].tx_id, path.hops[idx + 1].rx_id);
        }
        assert_eq!(path.status(), PathStatus::Building);
        assert_eq!(path.intro.endpoint, path.endpoint());
    }

    #[tokio::test]
    async fn expiry_boundaries() {
        tokio::time::pause();
        let mut rng = thread_rng();
        let contacts: Vec<_> = (0..2).map(|_| make_contact(&mut rng, true)).collect();
        let mut path = Path::new(&mut rng, contacts, ROLE_TRANSIT);

        // building paths do not expire
        assert!(!path.expired(clock_now() + Duration::from_secs(3600)));

        path.status = PathStatus::Established;
        let expiry = path.intro.expires_at;
        assert!(!path.expired(expiry - Duration::from_millis(1)));
        assert!(path.expired(expiry));
    }

    #[tokio::test]
    async fn exit_obtain_update_and_ack_flow() {
        use crate::link::tests::signed_peer;
        use shroud_packet::routing::{GrantExit, UpdateExit};

        let mut rng = thread_rng();
        let node = crate::path::context::tests::make_node(false).await;
        let env = node.context.env().clone();
        let events: Arc<dyn PathEvents> = Arc::new(NullPathEvents);

        let (_, entry_rc) = signed_peer(&mut rng);
        let (exit_identity, exit_rc) = signed_peer(&mut rng);
        let mut path = Path::new(&mut rng, vec![entry_rc, exit_rc], ROLE_NONE);

        // obtain: the signed grant from the endpoint unlocks the role
        assert!(path.send_exit_request(1, &env));
        let obtain_tx = path.exit_obtain_tx.unwrap();
        let mut grant = GrantExit {
            backoff: 0,
            seq: 0,
            tx_id: obtain_tx,
            signature: zero_signature(),
        };
        grant.sign(&exit_identity).unwrap();
        assert!(
            path.handle_routing_message(RoutingMessage::GrantExit(grant), &events, &env)
                .await
        );
        assert!(path.supports_any_roles(ROLE_EXIT));

        // move the grant to another path id
        let new_path = PathId::random(&mut rng);
        assert!(path.request_exit_update(new_path, &env));
        let update_tx = path.exit_update_tx.unwrap();

        // an ack forged by a stranger leaves the transaction open
        let stranger = SigningKey::generate(&mut rng);
        let mut forged = UpdateExit {
            path_id: new_path,
            seq: 0,
            tx_id: update_tx,
            signature: zero_signature(),
        };
        forged.sign(&stranger).unwrap();
        assert!(
            !path
                .handle_routing_message(RoutingMessage::UpdateExit(forged), &events, &env)
                .await
        );
        assert_eq!(path.exit_update_tx, Some(update_tx));

        // the endpoint's ack settles it
        let mut ack = UpdateExit {
            path_id: new_path,
            seq: 0,
            tx_id: update_tx,
            signature: zero_signature(),
        };
        ack.sign(&exit_identity).unwrap();
        assert!(
            path.handle_routing_message(RoutingMessage::UpdateExit(ack), &events, &env)
                .await
        );
        assert_eq!(path.exit_update_tx, None);

        // an ack for an unknown transaction is unwarranted
        let mut stray = UpdateExit {
            path_id: new_path,
            seq: 0,
            tx_id: 12345,
            signature: zero_signature(),
        };
        stray.sign(&exit_identity).unwrap();
        assert!(
            !path
                .handle_routing_message(RoutingMessage::UpdateExit(stray), &events, &env)
                .await
        );
    }
}
