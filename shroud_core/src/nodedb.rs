/*! Persistent store of verified router contacts.

On disk the database is a two-level "skiplist" directory: one subdirectory
per hex digit, keyed by the last character of the lowercase-hex router id,
holding one canonical bencoded contact per file:

```text
<root>/
  0/ 1/ … 9/ a/ … f/
    <64-hex-router-id>.signed
```

The in-memory map is the source of truth for reads; disk writes happen on
the blocking file-system pool and reads never wait for them.
*/

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use std::sync::Arc;
use tokio::sync::RwLock;

use rand::{thread_rng, Rng};
use shroud_binary_io::{encode_to_vec, FromBytes};
use shroud_crypto::RouterId;
use shroud_packet::rc::{RouterContact, MAX_CONTACT_SIZE};

use crate::time::unix_now_ms;

/// File extension of stored contacts.
const CONTACT_FILE_EXT: &str = ".signed";

/// Subdirectory names of the skiplist layout.
const SKIPLIST_SUBDIRS: &[u8] = b"0123456789abcdef";

/// Paths need at least this many distinct routers to be worth building.
const MIN_ROUTERS_FOR_HOP: usize = 3;

/// Retries of a random pick before giving up on hop selection.
const HOP_SELECT_TRIES: usize = 5;

struct NodeDbState {
    entries: HashMap<RouterId, RouterContact>,
    root: Option<PathBuf>,
}

/// Store of known router contacts, shared between the logic loop and
/// worker tasks.
#[derive(Clone)]
pub struct NodeDb {
    netid: Vec<u8>,
    state: Arc<RwLock<NodeDbState>>,
}

impl NodeDb {
    /// Create an empty database accepting contacts of the given network.
    pub fn new(netid: &[u8]) -> NodeDb {
        NodeDb {
            netid: netid.to_vec(),
            state: Arc::new(RwLock::new(NodeDbState {
                entries: HashMap::new(),
                root: None,
            })),
        }
    }

    fn file_path(root: &Path, id: &RouterId) -> PathBuf {
        let hex = id.to_hex();
        let subdir = &hex[hex.len() - 1..];
        root.join(subdir).join(format!("{}{}", hex, CONTACT_FILE_EXT))
    }

    /// Create the skiplist directory layout under `root`.
    pub async fn ensure_dir(root: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(root).await?;
        for subdir in SKIPLIST_SUBDIRS {
            tokio::fs::create_dir_all(root.join((*subdir as char).to_string())).await?;
        }
        Ok(())
    }

    /** Insert a contact, committing memory first and then the file.

    Returns `false` when the disk write failed; the in-memory entry stays
    so callers that need durability can retry through the verify pipeline.
    */
    pub async fn insert(&self, rc: RouterContact) -> bool {
        let id = rc.router_id();
        let encoded = match encode_to_vec(&rc, MAX_CONTACT_SIZE) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!("failed to encode contact {}: {:?}", id, error);
                return false;
            }
        };

        let root = {
            let mut state = self.state.write().await;
            state.entries.insert(id, rc);
            state.root.clone()
        };

        let root = match root {
            Some(root) => root,
            None => return true,
        };
        match tokio::fs::write(Self::file_path(&root, &id), encoded).await {
            Ok(()) => true,
            Err(error) => {
                warn!("failed to store contact {}: {}", id, error);
                false
            }
        }
    }

    /// Remove a contact from memory and disk. Returns whether it existed.
    pub async fn remove(&self, id: &RouterId) -> bool {
        let (existed, root) = {
            let mut state = self.state.write().await;
            (state.entries.remove(id).is_some(), state.root.clone())
        };
        if let Some(root) = root {
            if let Err(error) = tokio::fs::remove_file(Self::file_path(&root, id)).await {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove contact file for {}: {}", id, error);
                }
            }
        }
        existed
    }

    pub async fn get(&self, id: &RouterId) -> Option<RouterContact> {
        self.state.read().await.entries.get(id).cloned()
    }

    pub async fn has(&self, id: &RouterId) -> bool {
        self.state.read().await.entries.contains_key(id)
    }

    pub async fn num_loaded(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Drop every in-memory entry. Files are left alone.
    pub async fn clear(&self) {
        self.state.write().await.entries.clear();
    }

    /// Visit every contact.
    pub async fn visit<F: FnMut(&RouterContact)>(&self, mut visitor: F) {
        for rc in self.state.read().await.entries.values() {
            visitor(rc);
        }
    }

    /** Pick a random hop for position `n` of a path.

    Fails when fewer than three routers are known. For positions past the
    entry the pick is retried a few times to avoid repeating `prev` and
    addressless contacts; the entry position returns any pick since guard
    policy belongs to the caller.
    */
    pub async fn select_random_hop(
        &self,
        prev: &RouterContact,
        n: usize,
    ) -> Option<RouterContact> {
        let state = self.state.read().await;
        let total = state.entries.len();
        if total < MIN_ROUTERS_FOR_HOP {
            return None;
        }
        let mut rng = thread_rng();
        if n == 0 {
            let idx = rng.gen_range(0..total);
            return state.entries.values().nth(idx).cloned();
        }
        for _ in 0..HOP_SELECT_TRIES {
            let idx = rng.gen_range(0..total);
            let candidate = state.entries.values().nth(idx);
            let candidate = match candidate {
                Some(candidate) => candidate,
                None => continue,
            };
            if candidate.router_id() == prev.router_id() {
                continue;
            }
            if candidate.is_public() {
                return Some(candidate.clone());
            }
        }
        None
    }

    /// Scan from a random start index, wrapping once, and return the first
    /// exit-capable contact.
    pub async fn select_random_exit(&self) -> Option<RouterContact> {
        let state = self.state.read().await;
        let total = state.entries.len();
        if total < MIN_ROUTERS_FOR_HOP {
            return None;
        }
        let start = thread_rng().gen_range(0..total);
        state
            .entries
            .values()
            .cycle()
            .skip(start)
            .take(total)
            .find(|rc| rc.is_exit())
            .cloned()
    }

    /** Load every stored contact under `root` and remember the root for
    later writes.

    Contacts that fail to decode or verify are skipped with a warning, so
    loading the same directory twice is harmless.
    */
    pub async fn load_dir(&self, root: &Path) -> std::io::Result<usize> {
        self.state.write().await.root = Some(root.to_path_buf());

        let now = unix_now_ms();
        let mut loaded = 0;
        for subdir in SKIPLIST_SUBDIRS {
            let dir = root.join((*subdir as char).to_string());
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) => {
                    warn!("skipping nodedb dir {}: {}", dir.display(), error);
                    continue;
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if !path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map_or(false, |name| name.ends_with(CONTACT_FILE_EXT))
                {
                    continue;
                }
                let data = match tokio::fs::read(&path).await {
                    Ok(data) => data,
                    Err(error) => {
                        warn!("failed to read {}: {}", path.display(), error);
                        continue;
                    }
                };
                let rc = match RouterContact::from_bytes(&data) {
                    Ok((_, rc)) => rc,
                    Err(error) => {
                        warn!("failed to decode {}: {:?}", path.display(), error);
                        continue;
                    }
                };
                if let Err(error) = rc.verify(&self.netid, now) {
                    warn!("rejecting {}: {}", path.display(), error);
                    continue;
                }
                self.state.write().await.entries.insert(rc.router_id(), rc);
                loaded += 1;
            }
        }
        debug!("loaded {} contacts from {}", loaded, root.display());
        Ok(loaded)
    }
}
