//! Per-peer link session state.

use tokio::time::Instant;

use shroud_crypto::RouterId;
use shroud_packet::rc::RouterContact;

use crate::link::LinkKind;
use crate::time::clock_now;

/// Lifecycle of a link session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStatus {
    /// Handshake underway, nothing may be sent yet.
    Pending,
    /// Peer identity verified; traffic flows.
    Authed,
    /// Torn down; kept only until swept.
    Closed,
}

/// One session of a link to a remote router.
#[derive(Clone, Debug)]
pub struct Session {
    pub remote: RouterId,
    /// The verified contact, known once authed.
    pub rc: Option<RouterContact>,
    pub status: SessionStatus,
    pub kind: LinkKind,
    pub established_at: Option<Instant>,
}

impl Session {
    pub fn pending(remote: RouterId, kind: LinkKind) -> Session {
        Session {
            remote,
            rc: None,
            status: SessionStatus::Pending,
            kind,
            established_at: None,
        }
    }

    /// Flip to `Authed` with the verified contact.
    pub fn auth(&mut self, rc: RouterContact) {
        self.rc = Some(rc);
        self.status = SessionStatus::Authed;
        self.established_at = Some(clock_now());
    }
}
