// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bully leader election state machine.
//!
//! Higher `peer_id` wins. The async driving logic (sending ELECTION
//! messages, arming the timeout, broadcasting COORDINATOR) lives in
//! [`crate::peer`]; this module holds the pure state transitions so the
//! safety property — at most one peer declares itself coordinator per term
//! — can be unit-tested without a network.

use crate::wire::Term;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    /// A campaign is in flight: ELECTION sent to higher peers, timer armed.
    Campaigning,
    /// The campaign timer resolved with an OK received from a higher peer;
    /// waiting for that peer's COORDINATOR to arrive and settle the term.
    Deferring,
}

pub struct Election {
    current_term: Term,
    state: ElectionState,
    received_ok: bool,
    // The term this peer is campaigning for, set by `begin_campaign` and
    // cleared whenever the campaign concludes (by any means). Compared
    // against `current_term` at timeout resolution to detect a campaign
    // that was settled out from under it by an intervening
    // `accept_coordinator` — the only way a stale `resolve_timeout` can
    // tell its own result is moot.
    campaign_term: Option<Term>,
}

impl Default for Election {
    fn default() -> Self {
        Self::new()
    }
}

impl Election {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            state: ElectionState::Idle,
            received_ok: false,
            campaign_term: None,
        }
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn is_campaigning(&self) -> bool {
        self.state == ElectionState::Campaigning
    }

    /// Adopt a strictly higher term observed on any incoming message.
    pub fn adopt_term(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
        }
    }

    /// Begin a campaign: bumps the term and returns it. No-op (returns
    /// `None`) if a campaign is already in progress.
    pub fn begin_campaign(&mut self) -> Option<Term> {
        if self.state == ElectionState::Campaigning {
            return None;
        }
        self.state = ElectionState::Campaigning;
        self.received_ok = false;
        self.current_term += 1;
        self.campaign_term = Some(self.current_term);
        Some(self.current_term)
    }

    pub fn record_election_ok(&mut self) {
        self.received_ok = true;
    }

    pub fn received_ok(&self) -> bool {
        self.received_ok
    }

    /// Resolve the campaign timer. Returns `true` only if this campaign is
    /// still the live one and no OK arrived — the caller should then
    /// become coordinator. Returns `false` both for the ordinary "defer to
    /// a higher peer" case and for a campaign that was already settled
    /// out from under it: if `accept_coordinator` fired while the timer
    /// was armed, `state` is no longer `Campaigning` (or `current_term`
    /// has moved past the term this campaign started for), and the
    /// timer's result is ignored rather than acted on, per §5's
    /// "by ignoring its result" rule.
    pub fn resolve_timeout(&mut self) -> bool {
        let still_live =
            self.state == ElectionState::Campaigning && self.campaign_term == Some(self.current_term);
        self.campaign_term = None;
        if !still_live {
            return false;
        }
        let become_coordinator = !self.received_ok;
        self.state = if become_coordinator {
            ElectionState::Idle
        } else {
            ElectionState::Deferring
        };
        become_coordinator
    }

    /// Accept a COORDINATOR announcement if its term is not stale.
    /// Returns `true` if accepted. Settles any in-flight campaign
    /// (Campaigning or Deferring) by transitioning to Idle and clearing
    /// `campaign_term`, so a `resolve_timeout` still pending for that
    /// campaign will find it no longer live.
    pub fn accept_coordinator(&mut self, term: Term) -> bool {
        if term >= self.current_term {
            self.current_term = term;
            self.state = ElectionState::Idle;
            self.campaign_term = None;
            true
        } else {
            false
        }
    }

    /// Reset to idle after unconditionally becoming coordinator (no higher
    /// peers existed, so no timer was armed).
    pub fn finish_uncontested_campaign(&mut self) {
        self.state = ElectionState::Idle;
        self.campaign_term = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_campaign_increments_term() {
        let mut e = Election::new();
        assert_eq!(e.begin_campaign(), Some(1));
        assert_eq!(e.current_term(), 1);
    }

    #[test]
    fn begin_campaign_is_noop_while_campaigning() {
        let mut e = Election::new();
        e.begin_campaign();
        assert_eq!(e.begin_campaign(), None);
    }

    #[test]
    fn resolve_timeout_without_ok_wins() {
        let mut e = Election::new();
        e.begin_campaign();
        assert!(e.resolve_timeout());
        assert_eq!(e.state(), ElectionState::Idle);
    }

    #[test]
    fn resolve_timeout_with_ok_defers() {
        let mut e = Election::new();
        e.begin_campaign();
        e.record_election_ok();
        assert!(!e.resolve_timeout());
        assert_eq!(e.state(), ElectionState::Deferring);
    }

    #[test]
    fn resolve_timeout_ignores_result_when_coordinator_accepted_mid_campaign() {
        let mut e = Election::new();
        e.begin_campaign(); // term 1, no OK ever arrives
        // A higher peer's COORDINATOR lands while our timer is still armed.
        assert!(e.accept_coordinator(2));
        assert_eq!(e.state(), ElectionState::Idle);
        // The timer fires afterwards; its "no OK, I win" result must be
        // ignored rather than override the already-accepted leader.
        assert!(!e.resolve_timeout());
        assert_eq!(e.state(), ElectionState::Idle);
        assert_eq!(e.current_term(), 2);
    }

    #[test]
    fn resolve_timeout_ignores_result_when_term_advanced_without_state_change() {
        let mut e = Election::new();
        e.begin_campaign(); // term 1
        e.adopt_term(3); // e.g. a HEARTBEAT for a newer term observed mid-campaign
        assert!(!e.resolve_timeout());
    }

    #[test]
    fn accept_coordinator_rejects_stale_term() {
        let mut e = Election::new();
        e.begin_campaign(); // term 1
        e.begin_campaign(); // no-op, already campaigning
        assert!(!e.accept_coordinator(0));
        assert_eq!(e.current_term(), 1);
    }

    #[test]
    fn accept_coordinator_adopts_higher_term() {
        let mut e = Election::new();
        assert!(e.accept_coordinator(5));
        assert_eq!(e.current_term(), 5);
    }

    #[test]
    fn adopt_term_never_decreases() {
        let mut e = Election::new();
        e.accept_coordinator(5);
        e.adopt_term(2);
        assert_eq!(e.current_term(), 5);
    }
}
