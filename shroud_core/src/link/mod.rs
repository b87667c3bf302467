/*!
Link session management.

The wire transport itself (a reliable authenticated datagram protocol) is
an external collaborator: a link hands it commands over a channel and is
driven back through `handle_wire_event`. What lives here is the session
lifecycle — `Pending → Authed → Closed` — and the authentication rule: a
session becomes `Authed` only once the peer's identity signature over the
handshake transcript checks out against the contact it claims, with the
transport key pinned to the matching advertised address.
*/

pub mod session;

use std::io::{ErrorKind, Read, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use futures::channel::mpsc;
use rand::thread_rng;
use tokio::sync::RwLock;

use shroud_crypto::{RouterId, SecretKey, Signature, Verifier, KEY_SIZE};
use shroud_packet::rc::RouterContact;

use crate::event::{EventTx, RouterEvent};

pub use self::session::{Session, SessionStatus};

/// Whether a link accepts sessions or dials them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkKind {
    Inbound,
    Outbound,
}

/// Commands a link issues to its wire transport.
#[derive(Clone, Debug)]
pub enum WireCommand {
    /// Dial the peer at one of its advertised addresses and run the
    /// handshake.
    Connect(Box<RouterContact>),
    /// Ship an encoded link message to an authed peer.
    Send(RouterId, Vec<u8>),
    /// Tear the session down.
    Close(RouterId),
    /// Keep the session from idling out.
    KeepAlive(RouterId),
}

/// Feedback from the wire transport into the link layer.
#[derive(Debug)]
pub enum WireEvent {
    /// The transport finished a handshake; the link still has to
    /// authenticate it.
    HandshakeDone {
        rc: RouterContact,
        /// Address the peer was reached at (or came from).
        ip: IpAddr,
        /// Transcript both sides agree on.
        transcript: Vec<u8>,
        /// Peer identity signature over the transcript.
        signature: Signature,
    },
    /// The transport lost or closed the session.
    Closed(RouterId),
    /// One datagram of link-message bytes from an authed session.
    Datagram { from: RouterId, data: Vec<u8> },
}

/// Transmit half of a link's wire command channel.
pub type WireTx = mpsc::UnboundedSender<WireCommand>;

/// Receive half of a link's wire command channel.
pub type WireRx = mpsc::UnboundedReceiver<WireCommand>;

struct LinkState {
    /// Multimap: transient duplicates are allowed during renegotiation.
    sessions: std::collections::HashMap<RouterId, Vec<Session>>,
}

/// One link endpoint: the outbound connector or one inbound listener.
#[derive(Clone)]
pub struct Link {
    kind: LinkKind,
    name: String,
    wire_tx: WireTx,
    event_tx: EventTx,
    state: Arc<RwLock<LinkState>>,
}

impl Link {
    pub fn new(kind: LinkKind, name: &str, wire_tx: WireTx, event_tx: EventTx) -> Link {
        Link {
            kind,
            name: name.to_string(),
            wire_tx,
            event_tx,
            state: Arc::new(RwLock::new(LinkState {
                sessions: std::collections::HashMap::new(),
            })),
        }
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether an authed session to the peer exists.
    pub async fn has_session_to(&self, id: &RouterId) -> bool {
        self.state.read().await.sessions.get(id).map_or(false, |sessions| {
            sessions
                .iter()
                .any(|session| session.status == SessionStatus::Authed)
        })
    }

    /** Start establishing a session to the peer.

    Returns `false` without dialing when the contact advertises no
    addresses or a session attempt is already underway.
    */
    pub async fn try_establish_to(&self, rc: &RouterContact) -> bool {
        if !rc.is_public() {
            debug!("cannot establish to {}, no addresses", rc.router_id());
            return false;
        }
        let id = rc.router_id();
        {
            let mut state = self.state.write().await;
            let sessions = state.sessions.entry(id).or_default();
            if sessions
                .iter()
                .any(|session| session.status != SessionStatus::Closed)
            {
                return false;
            }
            sessions.push(Session::pending(id, self.kind));
        }
        debug!("{}: establishing session to {}", self.name, id);
        self.wire_tx
            .unbounded_send(WireCommand::Connect(Box::new(rc.clone())))
            .is_ok()
    }

    /// Close every session to the peer.
    pub async fn close_session_to(&self, id: &RouterId) {
        let mut state = self.state.write().await;
        if let Some(sessions) = state.sessions.get_mut(id) {
            for session in sessions.iter_mut() {
                session.status = SessionStatus::Closed;
            }
        }
        self.wire_tx.unbounded_send(WireCommand::Close(*id)).ok();
    }

    pub async fn keep_alive_session_to(&self, id: &RouterId) {
        if self.has_session_to(id).await {
            self.wire_tx.unbounded_send(WireCommand::KeepAlive(*id)).ok();
        }
    }

    /// Ship encoded bytes to the peer. `false` means no authed session or
    /// the transport refused.
    pub async fn send_to(&self, id: &RouterId, data: Vec<u8>) -> bool {
        if !self.has_session_to(id).await {
            return false;
        }
        self.wire_tx
            .unbounded_send(WireCommand::Send(*id, data))
            .is_ok()
    }

    /// Visit every session of this link.
    pub async fn for_each_session<F: FnMut(&Session)>(&self, mut visitor: F) {
        for sessions in self.state.read().await.sessions.values() {
            for session in sessions {
                visitor(session);
            }
        }
    }

    pub async fn num_authed(&self) -> usize {
        self.state
            .read()
            .await
            .sessions
            .values()
            .flatten()
            .filter(|session| session.status == SessionStatus::Authed)
            .count()
    }

    /// Ask the transport to re-run the handshake on every authed
    /// session, e.g. after a key rotation.
    pub async fn renegotiate_all(&self) {
        let rcs: Vec<RouterContact> = self
            .state
            .read()
            .await
            .sessions
            .values()
            .flatten()
            .filter(|session| session.status == SessionStatus::Authed)
            .filter_map(|session| session.rc.clone())
            .collect();
        for rc in rcs {
            self.wire_tx
                .unbounded_send(WireCommand::Connect(Box::new(rc)))
                .ok();
        }
    }

    /// Drive the session state machine from a transport event.
    pub async fn handle_wire_event(&self, event: WireEvent) {
        match event {
            WireEvent::HandshakeDone {
                rc,
                ip,
                transcript,
                signature,
            } => self.authenticate(rc, ip, transcript, signature).await,
            WireEvent::Closed(id) => {
                let mut state = self.state.write().await;
                if let Some(sessions) = state.sessions.get_mut(&id) {
                    for session in sessions.iter_mut() {
                        session.status = SessionStatus::Closed;
                    }
                    sessions.retain(|session| session.status != SessionStatus::Closed);
                    if sessions.is_empty() {
                        state.sessions.remove(&id);
                    }
                }
                drop(state);
                self.event_tx
                    .unbounded_send(RouterEvent::SessionClosed(id))
                    .ok();
            }
            WireEvent::Datagram { from, data } => {
                if self.has_session_to(&from).await {
                    self.event_tx
                        .unbounded_send(RouterEvent::InboundMessage { from, data })
                        .ok();
                } else {
                    debug!("{}: datagram from {} without session", self.name, from);
                }
            }
        }
    }

    /** Authenticate a finished handshake.

    The contact must advertise the address the transport used, and the
    identity signature over the transcript must verify. Failure closes
    the session.
    */
    async fn authenticate(
        &self,
        rc: RouterContact,
        ip: IpAddr,
        transcript: Vec<u8>,
        signature: Signature,
    ) {
        let id = rc.router_id();
        let authed = rc.addr_for_ip(ip).is_some()
            && rc
                .identity
                .verifying_key()
                .map_or(false, |key| key.verify(&transcript, &signature).is_ok());

        if !authed {
            warn!("{}: session auth to {} failed", self.name, id);
            self.close_session_to(&id).await;
            return;
        }

        {
            let mut state = self.state.write().await;
            let sessions = state.sessions.entry(id).or_default();
            // outbound: flip the pending session; inbound: accept fresh
            match sessions
                .iter_mut()
                .find(|session| session.status == SessionStatus::Pending)
            {
                Some(session) => session.auth(rc.clone()),
                None => {
                    let mut session = Session::pending(id, self.kind);
                    session.auth(rc.clone());
                    sessions.push(session);
                }
            }
        }
        info!("{}: session with {} established", self.name, id);
        self.event_tx
            .unbounded_send(RouterEvent::SessionEstablished(rc, self.kind))
            .ok();
    }
}

/// The link session manager: one outbound connector plus any number of
/// inbound listeners.
#[derive(Clone)]
pub struct LinkManager {
    outbound: Link,
    inbound: Vec<Link>,
}

impl LinkManager {
    pub fn new(outbound: Link, inbound: Vec<Link>) -> LinkManager {
        LinkManager { outbound, inbound }
    }

    /// A node with at least one inbound link is a service node.
    pub fn is_service_node(&self) -> bool {
        !self.inbound.is_empty()
    }

    pub fn outbound(&self) -> &Link {
        &self.outbound
    }

    pub fn inbound(&self) -> &[Link] {
        &self.inbound
    }

    pub async fn has_session_to(&self, id: &RouterId) -> bool {
        self.link_with_session(id).await.is_some()
    }

    /// The link currently holding an authed session to the peer, inbound
    /// links first.
    pub async fn link_with_session(&self, id: &RouterId) -> Option<&Link> {
        for link in &self.inbound {
            if link.has_session_to(id).await {
                return Some(link);
            }
        }
        if self.outbound.has_session_to(id).await {
            return Some(&self.outbound);
        }
        None
    }

    /// Dial a peer on the outbound link.
    pub async fn try_establish_to(&self, rc: &RouterContact) -> bool {
        self.outbound.try_establish_to(rc).await
    }

    pub async fn close_session_to(&self, id: &RouterId) {
        self.outbound.close_session_to(id).await;
        for link in &self.inbound {
            link.close_session_to(id).await;
        }
    }

    pub async fn keep_alive_session_to(&self, id: &RouterId) {
        if let Some(link) = self.link_with_session(id).await {
            link.keep_alive_session_to(id).await;
        }
    }

    pub async fn num_authed(&self) -> usize {
        let mut count = self.outbound.num_authed().await;
        for link in &self.inbound {
            count += link.num_authed().await;
        }
        count
    }

    pub async fn for_each_session<F: FnMut(&Session)>(&self, mut visitor: F) {
        self.outbound.for_each_session(&mut visitor).await;
        for link in &self.inbound {
            link.for_each_session(&mut visitor).await;
        }
    }

    /// Re-run the handshake on every authed session after a key rotation.
    pub async fn renegotiate_sessions(&self) {
        self.outbound.renegotiate_all().await;
        for link in &self.inbound {
            link.renegotiate_all().await;
        }
    }
}

/** Load the transport secret key from `path`, generating and storing a
fresh one on first run.
*/
pub fn ensure_transport_keys(path: &Path) -> std::io::Result<SecretKey> {
    match std::fs::File::open(path) {
        Ok(mut file) => {
            let mut bytes = [0; KEY_SIZE];
            file.read_exact(&mut bytes)?;
            Ok(SecretKey::from(bytes))
        }
        Err(error) if error.kind() == ErrorKind::NotFound => {
            info!("generating new transport keys at '{}'", path.display());
            let key = SecretKey::generate(&mut thread_rng());
            let mut file = create_private_file(path)?;
            file.write_all(&key.to_bytes())?;
            Ok(key)
        }
        Err(error) => Err(error),
    }
}

#[cfg(unix)]
fn create_private_file(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private_file(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::File::create(path)
}
