/*!
Relay state for paths passing through us.

A transit hop applies the same transform in both directions: XSalsa20 with
its session key under the nonce as received, then folding its nonce mask
in before forwarding. Stream layers commute, so the owner's layered
encryption peels correctly no matter where this hop sits on the path.
*/

use std::time::Duration;

use rand::thread_rng;
use tokio::sync::RwLock;
use tokio::time::Instant;

use shroud_crypto::{tunnel_crypt, PathId, RouterId, SessionKey, TunnelNonce};
use shroud_packet::link::{HopRecord, LinkMessage, RelayDownstream};
use shroud_packet::routing::{GrantExit, PathLatency, RejectExit, RoutingMessage, UpdateExit};
use shroud_packet::zero_signature;

use crate::dht::DhtSource;
use crate::event::RouterEvent;
use crate::path::PathEnv;
use crate::time::clock_now;

/// Identity of one transit hop: both path ids and both neighbours.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransitHopInfo {
    pub tx_id: PathId,
    pub rx_id: PathId,
    pub upstream: RouterId,
    pub downstream: RouterId,
}

/// Egress state an exit hop keeps for the owner it granted exit to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExitGrant {
    /// Identity the grant was signed out to; update and close messages
    /// must carry its signature.
    pub identity: RouterId,
    /// Path the grant currently rides on.
    pub path_id: PathId,
}

/// Relay state of one path through us, indexed under both its ids.
#[derive(Debug)]
pub struct TransitHop {
    pub info: TransitHopInfo,
    pub session_key: SessionKey,
    pub nonce_xor: TunnelNonce,
    pub started: Instant,
    pub lifetime: Duration,
    /// Active egress grant, when this hop serves as the owner's exit.
    pub exit: RwLock<Option<ExitGrant>>,
}

impl TransitHop {
    /// Build relay state from an opened commit record; `downstream` is
    /// the peer the commit arrived from.
    pub fn from_record(record: &HopRecord, downstream: RouterId) -> TransitHop {
        TransitHop {
            info: TransitHopInfo {
                tx_id: record.tx_id,
                rx_id: record.rx_id,
                upstream: record.next_hop,
                downstream,
            },
            session_key: record.session_key,
            nonce_xor: record.nonce_xor,
            started: clock_now(),
            lifetime: Duration::from_millis(record.lifetime),
            exit: RwLock::new(None),
        }
    }

    /// Path id the active exit grant is bound to, when any.
    pub async fn exit_grant_path(&self) -> Option<PathId> {
        self.exit.read().await.as_ref().map(|grant| grant.path_id)
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.started + self.lifetime
    }

    /// Whether this hop terminates the circuit at our router.
    pub fn is_terminal(&self, our_id: &RouterId) -> bool {
        self.info.upstream == *our_id
    }

    /// Apply our tunnel layer and advance the nonce, identical for both
    /// directions.
    pub fn crypt_and_step(&self, payload: &mut [u8], nonce: &mut TunnelNonce) {
        tunnel_crypt(&self.session_key, nonce, payload);
        nonce.xor(&self.nonce_xor);
    }

    /// Send a routing message towards the path owner, adding our layer.
    pub fn send_downstream(&self, msg: &RoutingMessage, env: &PathEnv) -> bool {
        let mut rng = thread_rng();
        let mut payload = match msg.encode_padded(&mut rng) {
            Ok(payload) => payload,
            Err(error) => {
                warn!("failed to encode downstream message: {:?}", error);
                return false;
            }
        };
        let mut nonce = TunnelNonce::random(&mut rng);
        self.crypt_and_step(&mut payload, &mut nonce);
        let wire = LinkMessage::RelayDownstream(RelayDownstream {
            path_id: self.info.rx_id,
            payload,
            nonce,
        });
        env.event_tx
            .unbounded_send(RouterEvent::SendLinkMessage(self.info.downstream, wire))
            .is_ok()
    }

    /** Handle a routing message that surfaced at the end of the circuit.

    Only runs on the terminal hop, after the upstream transform stripped
    the last layer. `allow_exit` is this router's egress policy.
    */
    pub async fn handle_routing_message(
        &self,
        msg: RoutingMessage,
        allow_exit: bool,
        env: &PathEnv,
    ) -> bool {
        match msg {
            RoutingMessage::PathLatency(latency) => {
                // echo the probe back to the owner
                let reply = RoutingMessage::PathLatency(PathLatency {
                    echo: latency.probe,
                    seq: 0,
                    probe: 0,
                });
                self.send_downstream(&reply, env)
            }
            RoutingMessage::Dht(carrier) => {
                let source = DhtSource::Path(self.info.rx_id);
                for dht_msg in carrier.msgs {
                    env.dht.handle_message(source, dht_msg).await;
                }
                true
            }
            RoutingMessage::ObtainExit(obtain) => {
                if obtain.verify(&obtain.identity).is_err() {
                    warn!(
                        "exit request with bad signature on transit {}",
                        self.info.rx_id
                    );
                    return false;
                }
                if allow_exit {
                    let mut grant = GrantExit {
                        backoff: 0,
                        seq: 0,
                        tx_id: obtain.tx_id,
                        signature: zero_signature(),
                    };
                    if grant.sign(&env.identity).is_err() {
                        return false;
                    }
                    *self.exit.write().await = Some(ExitGrant {
                        identity: obtain.identity,
                        path_id: self.info.rx_id,
                    });
                    info!("granting exit to {} on {}", obtain.identity, self.info.rx_id);
                    self.send_downstream(&RoutingMessage::GrantExit(grant), env)
                } else {
                    let mut reject = RejectExit {
                        backoff: 60_000,
                        seq: 0,
                        tx_id: obtain.tx_id,
                        signature: zero_signature(),
                    };
                    if reject.sign(&env.identity).is_err() {
                        return false;
                    }
                    self.send_downstream(&RoutingMessage::RejectExit(reject), env)
                }
            }
            RoutingMessage::UpdateExit(update) => {
                // the grant owner moves its egress to another of its paths
                {
                    let mut exit = self.exit.write().await;
                    match exit.as_mut() {
                        Some(grant) if update.verify(&grant.identity).is_ok() => {
                            grant.path_id = update.path_id;
                        }
                        Some(_) => {
                            warn!(
                                "exit update with bad signature on transit {}",
                                self.info.rx_id
                            );
                            return false;
                        }
                        None => {
                            warn!("unwarranted exit update on transit {}", self.info.rx_id);
                            return false;
                        }
                    }
                }
                let mut ack = UpdateExit {
                    path_id: update.path_id,
                    seq: 0,
                    tx_id: update.tx_id,
                    signature: zero_signature(),
                };
                if ack.sign(&env.identity).is_err() {
                    return false;
                }
                self.send_downstream(&RoutingMessage::UpdateExit(ack), env)
            }
            RoutingMessage::CloseExit(close) => {
                // owner tears its grant down
                {
                    let mut exit = self.exit.write().await;
                    match exit.take() {
                        Some(grant) if close.verify(&grant.identity).is_ok() => {}
                        Some(grant) => {
                            warn!(
                                "exit close with bad signature on transit {}",
                                self.info.rx_id
                            );
                            *exit = Some(grant);
                            return false;
                        }
                        // nothing granted, nothing to tear down
                        None => return true,
                    }
                }
                let mut ack = UpdateExit {
                    path_id: self.info.rx_id,
                    seq: 0,
                    tx_id: close.tx_id,
                    signature: zero_signature(),
                };
                if ack.sign(&env.identity).is_err() {
                    return false;
                }
                self.send_downstream(&RoutingMessage::UpdateExit(ack), env)
            }
            RoutingMessage::TransferTraffic(_) if !allow_exit => {
                // not an exit: report the drop to the owner
                let discard = RoutingMessage::DataDiscard(shroud_packet::routing::DataDiscard {
                    path_id: self.info.rx_id,
                    seq: 0,
                });
                self.send_downstream(&discard, env);
                false
            }
            RoutingMessage::TransferTraffic(_) => {
                // egress itself happens in the exit handler outside the
                // core
                true
            }
            other => {
                debug!(
                    "dropping routing message {:?} on transit {}",
                    other, self.info.rx_id
                );
                false
            }
        }
    }

    /// Answer a finished path build with a confirm towards the owner.
    pub fn send_path_confirm(&self, env: &PathEnv) -> bool {
        let confirm = RoutingMessage::PathConfirm(shroud_packet::routing::PathConfirm {
            lifetime: self.lifetime.as_millis() as u64,
            seq: 0,
        });
        self.send_downstream(&confirm, env)
    }
}
