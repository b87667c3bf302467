/*!
Building paths: hop selection, commit message assembly and the set of
paths one consumer owns.
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::sync::RwLock;
use tokio::time::Instant;

use shroud_crypto::{PathId, RouterId};
use shroud_packet::link::{EncryptedFrame, HopRecord, RelayCommit, NUM_FRAMES};
use shroud_packet::rc::RouterContact;

use crate::nodedb::NodeDb;
use crate::path::{Path, PathEnv, PathEvents, PathRole, PathStatus};
use crate::profiler::Profiler;
use crate::time::clock_now;

/// Back-to-back builds are capped at this pace.
pub const MIN_BUILD_INTERVAL: Duration = Duration::from_secs(1);

/// Retries for picking one hop before the whole build fails.
const HOP_PICK_TRIES: usize = 5;

/// The set of paths one consumer (endpoint, exit session, …) owns.
pub struct PathSet {
    paths: HashMap<PathId, Path>,
    num_target: usize,
    roles: PathRole,
    pub events: Arc<dyn PathEvents>,
    last_build: Option<Instant>,
}

impl PathSet {
    pub fn new(num_target: usize, roles: PathRole, events: Arc<dyn PathEvents>) -> PathSet {
        PathSet {
            paths: HashMap::new(),
            num_target,
            roles,
            events,
            last_build: None,
        }
    }

    pub fn roles(&self) -> PathRole {
        self.roles
    }

    /// Store a path, keyed by its rx id.
    pub fn add_path(&mut self, path: Path) {
        self.paths.insert(path.rx_id(), path);
    }

    /// Find a path by either of its ids.
    pub fn get_mut_by_id(&mut self, id: &PathId) -> Option<&mut Path> {
        if self.paths.contains_key(id) {
            return self.paths.get_mut(id);
        }
        self.paths.values_mut().find(|path| path.tx_id() == *id)
    }

    pub fn get_by_id(&self, id: &PathId) -> Option<&Path> {
        self.paths
            .get(id)
            .or_else(|| self.paths.values().find(|path| path.tx_id() == *id))
    }

    /// Paths still working towards or in service.
    pub fn num_active(&self, now: Instant) -> usize {
        self.paths
            .values()
            .filter(|path| match path.status() {
                PathStatus::Building => true,
                PathStatus::Established => !path.expired(now),
                PathStatus::Timeout | PathStatus::Expired => false,
            })
            .count()
    }

    /// Established paths ready to carry traffic.
    pub fn num_ready(&self) -> usize {
        self.paths.values().filter(|path| path.is_ready()).count()
    }

    /// Whether the builder should start another build now.
    pub fn should_build_more(&self, now: Instant) -> bool {
        if self.num_active(now) >= self.num_target {
            return false;
        }
        match self.last_build {
            Some(last) => now >= last && now - last >= MIN_BUILD_INTERVAL,
            None => true,
        }
    }

    pub fn note_build_started(&mut self, now: Instant) {
        self.last_build = Some(now);
    }

    /// Tick every path's state machine.
    pub async fn tick(&mut self, now: Instant, env: &PathEnv) {
        let events = self.events.clone();
        for path in self.paths.values_mut() {
            path.tick(now, &events, env).await;
        }
    }

    /// Drop timed out and expired paths; returns the removed ids (both
    /// directions) so the owner can unindex them.
    pub fn expire(&mut self, now: Instant) -> Vec<PathId> {
        let mut removed = Vec::new();
        self.paths.retain(|_, path| {
            if path.expired(now) {
                removed.push(path.rx_id());
                removed.push(path.tx_id());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.values()
    }
}

/// A finished build ready to leave through the first hop.
pub struct BuildJob {
    pub path: Path,
    pub first_hop: RouterId,
    pub commit: RelayCommit,
}

/// Selects hops and assembles commit messages for one `PathSet`.
#[derive(Clone)]
pub struct Builder {
    set: Arc<RwLock<PathSet>>,
    nodedb: NodeDb,
    profiler: Profiler,
    num_hops: usize,
}

impl Builder {
    pub fn new(
        nodedb: NodeDb,
        profiler: Profiler,
        num_hops: usize,
        num_target: usize,
        roles: PathRole,
        events: Arc<dyn PathEvents>,
    ) -> Builder {
        Builder {
            set: Arc::new(RwLock::new(PathSet::new(num_target, roles, events))),
            nodedb,
            profiler,
            num_hops,
        }
    }

    pub fn set(&self) -> Arc<RwLock<PathSet>> {
        self.set.clone()
    }

    pub fn num_hops(&self) -> usize {
        self.num_hops
    }

    pub async fn should_build_more(&self, now: Instant) -> bool {
        self.set.read().await.should_build_more(now)
    }

    /** Select a full hop sequence.

    The entry hop comes from the connected-peer pool when one is offered,
    any known router otherwise; later hops are random picks retried past
    duplicates, addressless contacts and profiler-flagged peers.
    */
    pub async fn select_hops(&self, first_hop_pool: &[RouterContact]) -> Option<Vec<RouterContact>> {
        let mut hops: Vec<RouterContact> = Vec::with_capacity(self.num_hops);

        let first = if first_hop_pool.is_empty() {
            let any = self.nodedb.select_random_hop(&placeholder_contact(), 0).await?;
            any
        } else {
            let idx = thread_rng().gen_range(0..first_hop_pool.len());
            first_hop_pool[idx].clone()
        };
        hops.push(first);

        for n in 1..self.num_hops {
            let mut picked = None;
            for _ in 0..HOP_PICK_TRIES {
                let candidate = match self.nodedb.select_random_hop(&hops[n - 1], n).await {
                    Some(candidate) => candidate,
                    None => return None,
                };
                let id = candidate.router_id();
                if hops.iter().any(|hop| hop.router_id() == id) {
                    continue;
                }
                if self.profiler.is_bad(&id).await {
                    continue;
                }
                picked = Some(candidate);
                break;
            }
            match picked {
                Some(candidate) => hops.push(candidate),
                None => {
                    warn!("failed to select hop {}", n);
                    return None;
                }
            }
        }
        Some(hops)
    }

    /** Build one path: pick hops, derive per-hop secrets and seal one
    commit frame per hop, padding the rest of the message with random
    frames.
    */
    pub async fn build_one(&self, first_hop_pool: &[RouterContact]) -> Option<BuildJob> {
        let hop_contacts = self.select_hops(first_hop_pool).await?;
        let roles = self.set.read().await.roles();

        // keep the rng out of scope of any await point
        let (path, commit) = {
            let mut rng = thread_rng();
            let path = Path::new(&mut rng, hop_contacts, roles);
            let mut frames = Vec::with_capacity(NUM_FRAMES);
            let last = path.hops.len() - 1;
            for (idx, hop) in path.hops.iter().enumerate() {
                let next_hop = if idx == last {
                    hop.rc.router_id()
                } else {
                    path.hops[idx + 1].rc.router_id()
                };
                let record = HopRecord {
                    lifetime: hop.lifetime.as_millis() as u64,
                    nonce_xor: hop.nonce_xor,
                    rx_id: hop.rx_id,
                    session_key: hop.session_key,
                    tx_id: hop.tx_id,
                    next_hop,
                };
                frames.push(EncryptedFrame::seal(&mut rng, &record, &hop.rc.onion_key));
            }
            while frames.len() < NUM_FRAMES {
                frames.push(EncryptedFrame::random(&mut rng));
            }
            (path, RelayCommit { frames })
        };

        let first_hop = path.upstream();
        self.set.write().await.note_build_started(clock_now());
        Some(BuildJob {
            path,
            first_hop,
            commit,
        })
    }
}

/// Stand-in "previous hop" for the entry pick, matching nothing real.
fn placeholder_contact() -> RouterContact {
    use shroud_crypto::{PublicKey, PUBLIC_KEY_LENGTH};
    RouterContact::new(
        RouterId([0; PUBLIC_KEY_LENGTH]),
        PublicKey::from([0; 32]),
        b"none",
        0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::nodedb::tests::make_contact;
    use crate::path::{NullPathEvents, DEFAULT_HOP_COUNT, DEFAULT_NUM_PATHS, ROLE_TRANSIT};
    use rand::thread_rng;
    use shroud_packet::rc::DEFAULT_NET_ID;

    async fn make_builder(routers: usize) -> (Builder, NodeDb) {
        let mut rng = thread_rng();
        let nodedb = NodeDb::new(DEFAULT_NET_ID);
        for _ in 0..routers {
            nodedb.insert(make_contact(&mut rng, true)).await;
        }
        let builder = Builder::new(
            nodedb.clone(),
            Profiler::new(),
            DEFAULT_HOP_COUNT,
            DEFAULT_NUM_PATHS,
            ROLE_TRANSIT,
            Arc::new(NullPathEvents),
        );
        (builder, nodedb)
    }

    #[tokio::test]
    async fn select_hops_returns_distinct_public_hops() {
        let (builder, _nodedb) = make_builder(10).await;
        let hops = builder.select_hops(&[]).await.unwrap();
        assert_eq!(hops.len(), DEFAULT_HOP_COUNT);
        for (idx, hop) in hops.iter().enumerate() {
            assert!(hop.is_public());
            for other in &hops[idx + 1..] {
                assert_ne!(hop.router_id(), other.router_id());
            }
        }
    }

    #[tokio::test]
    async fn select_hops_fails_on_small_nodedb() {
        let (builder, _nodedb) = make_builder(2).await;
        assert!(builder.select_hops(&[]).await.is_none());
    }

    #[tokio::test]
    async fn select_hops_prefers_connected_first_hop() {
        let mut rng = thread_rng();
        let (builder, _nodedb) = make_builder(10).await;
        let connected = make_contact(&mut rng, true);
        let hops = builder.select_hops(&[connected.clone()]).await.unwrap();
        assert_eq!(hops[0].router_id(), connected.router_id());
    }

    #[tokio::test]
    async fn build_one_seals_one_frame_per_hop() {
        use shroud_crypto::{SecretKey, SigningKey};
        use shroud_packet::rc::AddressInfo;

        let mut rng = thread_rng();
        let nodedb = NodeDb::new(DEFAULT_NET_ID);
        // hops whose onion secrets we keep so the frames can be opened
        let mut onion_keys = HashMap::new();
        for port in 0..10u16 {
            let identity = SigningKey::generate(&mut rng);
            let onion_secret = SecretKey::generate(&mut rng);
            let mut rc = RouterContact::new(
                RouterId::from(identity.verifying_key()),
                onion_secret.public_key(),
                DEFAULT_NET_ID,
                crate::time::unix_now_ms(),
            );
            rc.addrs.push(AddressInfo {
                key: SecretKey::generate(&mut rng).public_key(),
                ip: "198.51.100.9".parse().unwrap(),
                port: 1000 + port,
            });
            rc.sign(&identity).unwrap();
            onion_keys.insert(rc.router_id(), onion_secret);
            nodedb.insert(rc).await;
        }

        let builder = Builder::new(
            nodedb,
            Profiler::new(),
            DEFAULT_HOP_COUNT,
            DEFAULT_NUM_PATHS,
            ROLE_TRANSIT,
            Arc::new(NullPathEvents),
        );
        let job = builder.build_one(&[]).await.unwrap();

        assert_eq!(job.commit.frames.len(), NUM_FRAMES);
        assert_eq!(job.first_hop, job.path.upstream());
        assert_eq!(job.path.status(), PathStatus::Building);

        let last = job.path.hops.len() - 1;
        for (idx, hop) in job.path.hops.iter().enumerate() {
            let secret = &onion_keys[&hop.rc.router_id()];
            let record = job.commit.frames[idx].open(secret).unwrap();
            assert_eq!(record.tx_id, hop.tx_id);
            assert_eq!(record.rx_id, hop.rx_id);
            assert_eq!(record.session_key, hop.session_key);
            if idx == last {
                // the terminal hop names itself and detects that
                assert_eq!(record.next_hop, hop.rc.router_id());
            } else {
                assert_eq!(record.next_hop, job.path.hops[idx + 1].rc.router_id());
            }
            // a hop cannot open anyone else's frame
            for (other_idx, frame) in job.commit.frames.iter().enumerate() {
                if other_idx != idx {
                    assert!(frame.open(secret).is_err());
                }
            }
        }
        assert_eq!(job.path.intro.endpoint, job.path.hops[last].rc.router_id());
    }

    #[tokio::test]
    async fn should_build_more_honors_target_and_cooldown() {
        tokio::time::pause();
        let (builder, _nodedb) = make_builder(10).await;
        let now = clock_now();
        assert!(builder.should_build_more(now).await);

        builder.set().write().await.note_build_started(now);
        assert!(!builder.should_build_more(now).await);
        tokio::time::advance(MIN_BUILD_INTERVAL).await;
        assert!(builder.should_build_more(clock_now()).await);
    }

    #[tokio::test]
    async fn bad_profiled_peers_are_avoided() {
        let mut rng = thread_rng();
        let nodedb = NodeDb::new(DEFAULT_NET_ID);
        let good: Vec<_> = (0..DEFAULT_HOP_COUNT)
            .map(|_| make_contact(&mut rng, true))
            .collect();
        for rc in &good {
            nodedb.insert(rc.clone()).await;
        }
        let bad = make_contact(&mut rng, true);
        nodedb.insert(bad.clone()).await;

        let profiler = Profiler::new();
        for _ in 0..20 {
            profiler.mark_connect_timeout(&bad.router_id()).await;
        }

        let builder = Builder::new(
            nodedb,
            profiler,
            DEFAULT_HOP_COUNT,
            DEFAULT_NUM_PATHS,
            ROLE_TRANSIT,
            Arc::new(NullPathEvents),
        );
        for _ in 0..10 {
            if let Some(hops) = builder.select_hops(&[]).await {
                // the bad peer may only ever appear as the entry hop,
                // where guard policy belongs to the caller
                for hop in &hops[1..] {
                    assert_ne!(hop.router_id(), bad.router_id());
                }
            }
        }
    }
}
