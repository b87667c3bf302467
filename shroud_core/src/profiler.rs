/*! Per-peer rolling success/failure statistics.

Hop selection and connect retry logic consult the profiler to avoid peers
that keep wasting our time. The stats are persisted periodically so a
restart does not forget which peers were bad.
*/

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use nom_parse::parse_profiles;
use tokio::sync::RwLock;

use shroud_binary_io::{encode_to_vec, GenError, ToBytes};
use shroud_crypto::RouterId;

/// Peers with fewer observations than this are never considered bad.
pub const MIN_OBSERVATIONS: u64 = 10;

/// Failure ratio at which a peer becomes bad.
pub const BAD_FAILURE_RATIO: f64 = 0.5;

/// Upper bound of the encoded profile file.
const MAX_PROFILES_SIZE: usize = 256 * 1024;

/// Rolling counters for one peer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PeerStats {
    pub connect_successes: u64,
    pub connect_timeouts: u64,
    pub path_successes: u64,
    pub path_fails: u64,
}

impl PeerStats {
    fn observations(&self) -> u64 {
        self.connect_successes + self.connect_timeouts + self.path_successes + self.path_fails
    }

    fn failures(&self) -> u64 {
        self.connect_timeouts + self.path_fails
    }

    fn is_bad(&self) -> bool {
        let total = self.observations();
        total >= MIN_OBSERVATIONS && self.failures() as f64 >= total as f64 * BAD_FAILURE_RATIO
    }
}

/// Shared handle to the per-peer statistics.
#[derive(Clone, Default)]
pub struct Profiler {
    state: Arc<RwLock<HashMap<RouterId, PeerStats>>>,
}

impl Profiler {
    pub fn new() -> Profiler {
        Profiler::default()
    }

    pub async fn mark_connect_success(&self, id: &RouterId) {
        self.state.write().await.entry(*id).or_default().connect_successes += 1;
    }

    pub async fn mark_connect_timeout(&self, id: &RouterId) {
        self.state.write().await.entry(*id).or_default().connect_timeouts += 1;
    }

    pub async fn mark_path_success(&self, id: &RouterId) {
        self.state.write().await.entry(*id).or_default().path_successes += 1;
    }

    pub async fn mark_path_fail(&self, id: &RouterId) {
        self.state.write().await.entry(*id).or_default().path_fails += 1;
    }

    /// Whether the peer's failure ratio disqualifies it from selection.
    pub async fn is_bad(&self, id: &RouterId) -> bool {
        self.state
            .read()
            .await
            .get(id)
            .map_or(false, PeerStats::is_bad)
    }

    pub async fn get(&self, id: &RouterId) -> Option<PeerStats> {
        self.state.read().await.get(id).cloned()
    }

    /// Forget a peer entirely.
    pub async fn forget(&self, id: &RouterId) {
        self.state.write().await.remove(id);
    }

    /// Persist all profiles to `path` as a bencoded list.
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        let profiles = ProfileList(
            self.state
                .read()
                .await
                .iter()
                .map(|(id, stats)| (*id, stats.clone()))
                .collect(),
        );
        let encoded = encode_to_vec(&profiles, MAX_PROFILES_SIZE)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "encode failed"))?;
        tokio::fs::write(path, encoded).await
    }

    /// Load profiles from `path`, replacing the in-memory table. A missing
    /// file is not an error, it just means a fresh start.
    pub async fn load(&self, path: &Path) -> std::io::Result<usize> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(error),
        };
        let profiles = match parse_profiles(&data) {
            Ok((_, profiles)) => profiles,
            Err(error) => {
                warn!("failed to parse profiles {}: {:?}", path.display(), error);
                return Ok(0);
            }
        };
        let count = profiles.0.len();
        *self.state.write().await = profiles.0.into_iter().collect();
        Ok(count)
    }
}

struct ProfileList(Vec<(RouterId, PeerStats)>);

impl ToBytes for ProfileList {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        use shroud_binary_io::{gen_bbytes, gen_bint};
        do_gen!(buf,
            gen_slice!(b"l") >>
            gen_many_ref!(&self.0, |buf: (&'a mut [u8], usize), entry: &(RouterId, PeerStats)| {
                do_gen!(buf,
                    gen_slice!(b"d") >>
                    gen_slice!(b"1:f") >>
                    gen_call!(gen_bint, entry.1.path_fails) >>
                    gen_slice!(b"1:k") >>
                    gen_call!(gen_bbytes, entry.0.as_bytes()) >>
                    gen_slice!(b"1:s") >>
                    gen_call!(gen_bint, entry.1.path_successes) >>
                    gen_slice!(b"1:t") >>
                    gen_call!(gen_bint, entry.1.connect_timeouts) >>
                    gen_slice!(b"1:u") >>
                    gen_call!(gen_bint, entry.1.connect_successes) >>
                    gen_slice!(b"e")
                )
            }) >>
            gen_slice!(b"e")
        )
    }
}

mod nom_parse {
    use nom::bytes::complete::tag;
    use nom::combinator::map_opt;
    use nom::multi::many0;
    use nom::IResult;

    use shroud_binary_io::{bbytes_exact, bint, bkey};
    use shroud_crypto::{RouterId, PUBLIC_KEY_LENGTH};

    use super::{PeerStats, ProfileList};

    fn profile(input: &[u8]) -> IResult<&[u8], (RouterId, PeerStats)> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"f")(input)?;
        let (input, path_fails) = bint(input)?;
        let (input, _) = bkey(b"k")(input)?;
        let (input, id) = map_opt(bbytes_exact(PUBLIC_KEY_LENGTH), |bytes: &[u8]| {
            bytes.try_into().ok().map(RouterId)
        })(input)?;
        let (input, _) = bkey(b"s")(input)?;
        let (input, path_successes) = bint(input)?;
        let (input, _) = bkey(b"t")(input)?;
        let (input, connect_timeouts) = bint(input)?;
        let (input, _) = bkey(b"u")(input)?;
        let (input, connect_successes) = bint(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((
            input,
            (
                id,
                PeerStats {
                    connect_successes,
                    connect_timeouts,
                    path_successes,
                    path_fails,
                },
            ),
        ))
    }

    pub(super) fn parse_profiles(input: &[u8]) -> IResult<&[u8], ProfileList> {
        let (input, _) = tag(&b"l"[..])(input)?;
        let (input, profiles) = many0(profile)(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((input, ProfileList(profiles)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;
    use shroud_crypto::SigningKey;

    fn random_id() -> RouterId {
        RouterId::from(SigningKey::generate(&mut thread_rng()).verifying_key())
    }

    #[tokio::test]
    async fn fresh_peer_is_not_bad() {
        let profiler = Profiler::new();
        assert!(!profiler.is_bad(&random_id()).await);
    }

    #[tokio::test]
    async fn needs_min_observations() {
        let profiler = Profiler::new();
        let id = random_id();
        for _ in 0..MIN_OBSERVATIONS - 1 {
            profiler.mark_connect_timeout(&id).await;
        }
        assert!(!profiler.is_bad(&id).await);
        profiler.mark_connect_timeout(&id).await;
        assert!(profiler.is_bad(&id).await);
    }

    #[tokio::test]
    async fn half_failures_is_bad() {
        let profiler = Profiler::new();
        let id = random_id();
        for _ in 0..5 {
            profiler.mark_path_success(&id).await;
            profiler.mark_path_fail(&id).await;
        }
        assert!(profiler.is_bad(&id).await);
    }

    #[tokio::test]
    async fn mostly_good_peer_is_fine() {
        let profiler = Profiler::new();
        let id = random_id();
        for _ in 0..9 {
            profiler.mark_connect_success(&id).await;
        }
        profiler.mark_connect_timeout(&id).await;
        assert!(!profiler.is_bad(&id).await);
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.dat");

        let profiler = Profiler::new();
        let id_1 = random_id();
        let id_2 = random_id();
        profiler.mark_connect_success(&id_1).await;
        profiler.mark_path_fail(&id_2).await;
        profiler.save(&path).await.unwrap();

        let restored = Profiler::new();
        assert_eq!(restored.load(&path).await.unwrap(), 2);
        assert_eq!(restored.get(&id_1).await, profiler.get(&id_1).await);
        assert_eq!(restored.get(&id_2).await, profiler.get(&id_2).await);
    }

    #[tokio::test]
    async fn load_missing_file_is_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let profiler = Profiler::new();
        assert_eq!(
            profiler.load(&dir.path().join("none.dat")).await.unwrap(),
            0
        );
    }
}
