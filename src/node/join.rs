//! Join protocol: bootstrapping synchronization, routing and scheduling
//! (spec §4.7).

use crate::engine::scheduler::EventTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    /// Not yet synchronized (no EB heard).
    Unsynced,
    /// Synced, minimal cells installed, waiting to initiate the token
    /// exchange (with jitter).
    SyncedPendingJoin,
    /// Token exchange in flight.
    Joining,
    /// Fully joined: EB/DIO/DAO emission and MSF are active.
    Joined,
}

#[derive(Debug, Clone)]
pub struct JoinState {
    pub phase: JoinPhase,
    pub remaining_tokens: u8,
    pub retry_tag: Option<EventTag>,
}

impl Default for JoinState {
    fn default() -> Self {
        JoinState {
            phase: JoinPhase::Unsynced,
            remaining_tokens: 0,
            retry_tag: None,
        }
    }
}

impl JoinState {
    pub fn root() -> Self {
        JoinState {
            phase: JoinPhase::Joined,
            remaining_tokens: 0,
            retry_tag: None,
        }
    }

    /// First EB reception: mark synced (spec §4.7).
    pub fn on_eb_received(&mut self) {
        if self.phase == JoinPhase::Unsynced {
            self.phase = JoinPhase::SyncedPendingJoin;
        }
    }

    /// Begin the token exchange with `num_exchanges` round trips remaining.
    pub fn initiate(&mut self, num_exchanges: u8) {
        self.phase = JoinPhase::Joining;
        self.remaining_tokens = num_exchanges;
    }

    /// The root replies with `token - 1`; reaching zero marks the node
    /// joined (spec §4.7).
    pub fn on_token_reply(&mut self, token: u8) -> bool {
        self.remaining_tokens = token;
        if token == 0 {
            self.phase = JoinPhase::Joined;
            true
        } else {
            false
        }
    }

    pub fn is_joined(&self) -> bool {
        self.phase == JoinPhase::Joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_exchange_reaches_joined_at_zero() {
        let mut j = JoinState::default();
        j.on_eb_received();
        j.initiate(2);
        assert!(!j.on_token_reply(1));
        assert!(j.on_token_reply(0));
        assert!(j.is_joined());
    }
}
