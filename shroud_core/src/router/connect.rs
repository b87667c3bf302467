/*! Outbound connect attempts with retry.

At most one job per peer exists at any time; it dies on session success,
on running out of tries, or when the queued traffic it was dialed for is
discarded.
*/

use std::time::Duration;

use tokio::time::Instant;

use shroud_packet::rc::RouterContact;

use crate::time::clock_now;

/// How long one establish attempt may take before it counts as timed out.
pub const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Dial attempts for peers we queued traffic for.
pub const SEND_QUEUE_CONNECT_TRIES: u16 = 10;

/// Dial attempts for bootstrap contacts.
pub const BOOTSTRAP_CONNECT_TRIES: u16 = 4;

/// Dial attempts for keepalive and random fill dials.
pub const CASUAL_CONNECT_TRIES: u16 = 5;

/// One pending establish attempt towards a peer.
#[derive(Clone, Debug)]
pub struct TryConnectJob {
    pub rc: RouterContact,
    pub tries_left: u16,
    pub deadline: Instant,
}

impl TryConnectJob {
    pub fn new(rc: RouterContact, tries: u16) -> TryConnectJob {
        TryConnectJob {
            rc,
            tries_left: tries,
            deadline: clock_now() + ESTABLISH_TIMEOUT,
        }
    }

    /// Burn one try and re-arm the timeout.
    pub fn arm_attempt(&mut self) {
        self.tries_left = self.tries_left.saturating_sub(1);
        self.deadline = clock_now() + ESTABLISH_TIMEOUT;
    }

    pub fn should_retry(&self) -> bool {
        self.tries_left > 0
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::nodedb::tests::make_contact;
    use rand::thread_rng;

    #[tokio::test]
    async fn job_burns_tries() {
        let rc = make_contact(&mut thread_rng(), true);
        let mut job = TryConnectJob::new(rc, 2);
        assert!(job.should_retry());
        job.arm_attempt();
        assert!(job.should_retry());
        job.arm_attempt();
        assert!(!job.should_retry());
    }

    #[tokio::test]
    async fn job_timeout() {
        tokio::time::pause();
        let rc = make_contact(&mut thread_rng(), true);
        let mut job = TryConnectJob::new(rc, 1);
        job.arm_attempt();
        assert!(!job.timed_out(clock_now()));
        tokio::time::advance(ESTABLISH_TIMEOUT).await;
        assert!(job.timed_out(clock_now()));
    }
}
