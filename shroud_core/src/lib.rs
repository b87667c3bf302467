/*!
Core runtime of the shroud onion-routed overlay router.

The five components live here: the node database of signed router contacts,
the link session manager, the Kademlia-style DHT, the path subsystem that
builds and relays onion circuits, and the orchestrator tying them together
on a single logic loop.
*/

#![forbid(unsafe_code)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate cookie_factory;

pub mod dht;
pub mod event;
pub mod link;
pub mod nodedb;
pub mod path;
pub mod profiler;
pub mod router;
pub mod time;
