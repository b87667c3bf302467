/*! Events funneled onto the orchestrator's logic loop.

Components never call into the orchestrator directly; they push typed
events into one unbounded channel the orchestrator drains. Worker results
(crypto, disk) come back the same way, which keeps all state mutation on
one task.
*/

use std::fmt;

use futures::channel::{mpsc, oneshot};
use tokio::time::Instant;

use shroud_crypto::{PathId, RouterId};
use shroud_packet::link::LinkMessage;
use shroud_packet::rc::RouterContact;
use shroud_packet::routing::RoutingMessage;

use crate::link::LinkKind;

/// Transmit half of the orchestrator event channel.
pub type EventTx = mpsc::UnboundedSender<RouterEvent>;

/// Receive half of the orchestrator event channel.
pub type EventRx = mpsc::UnboundedReceiver<RouterEvent>;

/// What to do with the contacts a router lookup produced.
pub enum LookupHandler {
    /// Network exploration: verify, insert and dial the results.
    Explore,
    /// `send_to_or_queue` is waiting for this peer's contact; failure
    /// discards the queued messages.
    SendTo,
    /// A connect attempt needs the contact; failure marks the profiler.
    TryEstablish,
    /// Hand the raw results to the caller.
    Channel(oneshot::Sender<Vec<RouterContact>>),
}

impl fmt::Debug for LookupHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LookupHandler::Explore => f.write_str("Explore"),
            LookupHandler::SendTo => f.write_str("SendTo"),
            LookupHandler::TryEstablish => f.write_str("TryEstablish"),
            LookupHandler::Channel(_) => f.write_str("Channel"),
        }
    }
}

/// Events consumed by the orchestrator loop.
#[derive(Debug)]
pub enum RouterEvent {
    /// Send a link message to a peer, queueing and dialing when no session
    /// exists.
    SendLinkMessage(RouterId, LinkMessage),
    /// Send a routing message over a local or transit path.
    PathReply(PathId, RoutingMessage),
    /// The verify pipeline finished for a contact.
    VerifyDone { rc: RouterContact, valid: bool },
    /// An iterative router lookup completed.
    LookupDone {
        target: RouterId,
        handler: LookupHandler,
        contacts: Vec<RouterContact>,
    },
    /// Keep the session to this peer alive until the deadline; a path
    /// depends on it.
    PersistSession { peer: RouterId, until: Instant },
    /// A link session reached `Authed`.
    SessionEstablished(RouterContact, LinkKind),
    /// A link session closed.
    SessionClosed(RouterId),
    /// Raw link-layer message bytes from an authed session.
    InboundMessage { from: RouterId, data: Vec<u8> },
}
