//! Edge confirmation state machine
//!
//! ```text
//! Observing -> Confirming -> Confirmed -> Entered
//!     ^            |             |
//!     +------------+-------------+   (edge below threshold)
//! any non-entered state -> Expired    (market gone)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

use super::OutcomeEdge;
use crate::persistence::SignalRecord;
use crate::types::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalState {
    Observing,
    Confirming,
    Confirmed,
    Entered,
    Expired,
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalState::Observing => "OBSERVING",
            SignalState::Confirming => "CONFIRMING",
            SignalState::Confirmed => "CONFIRMED",
            SignalState::Entered => "ENTERED",
            SignalState::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdSignal {
    pub market_id: String,
    pub outcome: Outcome,
    pub model_probability: f64,
    pub market_probability: f64,
    pub edge_pts: f64,
    pub confirmations: u32,
    pub state: SignalState,
    pub updated_at: DateTime<Utc>,
}

/// A state change, journaled by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct SignalTransition {
    pub from: SignalState,
    pub signal: CdSignal,
}

impl SignalTransition {
    pub fn to_record(&self) -> SignalRecord {
        SignalRecord {
            timestamp: self.signal.updated_at.timestamp_millis(),
            kind: "signal_transition".to_string(),
            market_id: self.signal.market_id.clone(),
            outcome: self.signal.outcome.to_string(),
            from_state: self.from.to_string(),
            to_state: self.signal.state.to_string(),
            model_probability: self.signal.model_probability,
            market_probability: self.signal.market_probability,
            edge_pts: self.signal.edge_pts,
            confirmations: self.signal.confirmations,
        }
    }
}

pub struct SignalTracker {
    confirmation_cycles: u32,
    signals: HashMap<String, CdSignal>,
    /// Signals seen per lifetime, for post-trade analysis
    observed_total: usize,
    entered_total: usize,
}

impl SignalTracker {
    pub fn new(confirmation_cycles: u32) -> Self {
        Self {
            confirmation_cycles: confirmation_cycles.max(1),
            signals: HashMap::new(),
            observed_total: 0,
            entered_total: 0,
        }
    }

    pub fn get(&self, market_id: &str) -> Option<&CdSignal> {
        self.signals.get(market_id)
    }

    pub fn state(&self, market_id: &str) -> SignalState {
        self.signals
            .get(market_id)
            .map_or(SignalState::Observing, |s| s.state)
    }

    pub fn counts(&self) -> (usize, usize) {
        (self.observed_total, self.entered_total)
    }

    /// Feed one cycle's edge. Returns the transition, if any.
    ///
    /// The count resets when the edge drops under `min_edge_pts` or the
    /// favoured outcome flips.
    pub fn observe(
        &mut self,
        market_id: &str,
        edge: &OutcomeEdge,
        min_edge_pts: f64,
        now: DateTime<Utc>,
    ) -> Option<SignalTransition> {
        let is_new = !self.signals.contains_key(market_id);
        let signal = self
            .signals
            .entry(market_id.to_string())
            .or_insert_with(|| CdSignal {
                market_id: market_id.to_string(),
                outcome: edge.outcome,
                model_probability: edge.model_probability,
                market_probability: edge.market_probability,
                edge_pts: edge.edge_pts,
                confirmations: 0,
                state: SignalState::Observing,
                updated_at: now,
            });
        if is_new {
            self.observed_total += 1;
        }
        if signal.state == SignalState::Entered {
            return None;
        }

        let from = signal.state;
        let flipped = signal.outcome != edge.outcome;
        signal.outcome = edge.outcome;
        signal.model_probability = edge.model_probability;
        signal.market_probability = edge.market_probability;
        signal.edge_pts = edge.edge_pts;
        signal.updated_at = now;

        if edge.edge_pts >= min_edge_pts {
            signal.confirmations = if flipped { 1 } else { signal.confirmations + 1 };
            signal.state = if signal.confirmations >= self.confirmation_cycles {
                SignalState::Confirmed
            } else {
                SignalState::Confirming
            };
        } else {
            signal.confirmations = 0;
            signal.state = SignalState::Observing;
        }

        if signal.state == from && !(flipped && from != SignalState::Observing) {
            return None;
        }
        debug!(
            market = %market_id,
            from = %from,
            to = %signal.state,
            edge_pts = edge.edge_pts,
            confirmations = signal.confirmations,
            "Signal transition"
        );
        Some(SignalTransition {
            from,
            signal: signal.clone(),
        })
    }

    /// Only confirmed signals may size and enter
    pub fn is_confirmed(&self, market_id: &str) -> bool {
        self.state(market_id) == SignalState::Confirmed
    }

    pub fn mark_entered(&mut self, market_id: &str, now: DateTime<Utc>) -> Option<SignalTransition> {
        let signal = self.signals.get_mut(market_id)?;
        if signal.state != SignalState::Confirmed {
            return None;
        }
        let from = signal.state;
        signal.state = SignalState::Entered;
        signal.updated_at = now;
        self.entered_total += 1;
        Some(SignalTransition {
            from,
            signal: signal.clone(),
        })
    }

    /// Position closed: start observing again from scratch
    pub fn release(&mut self, market_id: &str) {
        self.signals.remove(market_id);
    }

    /// Expire signals for markets no longer listed. Entered signals stay
    /// until their position closes.
    pub fn expire_missing(&mut self, listed: &HashSet<String>, now: DateTime<Utc>) -> Vec<SignalTransition> {
        let gone: Vec<String> = self
            .signals
            .iter()
            .filter(|(id, s)| !listed.contains(*id) && s.state != SignalState::Entered)
            .map(|(id, _)| id.clone())
            .collect();
        let mut transitions = Vec::new();
        for id in gone {
            if let Some(mut signal) = self.signals.remove(&id) {
                let from = signal.state;
                signal.state = SignalState::Expired;
                signal.updated_at = now;
                transitions.push(SignalTransition { from, signal });
            }
        }
        transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_edge(outcome: Outcome, edge_pts: f64) -> OutcomeEdge {
        OutcomeEdge {
            outcome,
            model_probability: 0.6,
            market_probability: 0.6 - edge_pts / 100.0,
            edge_pts,
        }
    }

    #[test]
    fn confirms_after_consecutive_cycles() {
        let mut tracker = SignalTracker::new(2);
        let now = Utc::now();
        let t = tracker.observe("m", &make_edge(Outcome::Yes, 6.0), 5.0, now).unwrap();
        assert_eq!((t.from, t.signal.state), (SignalState::Observing, SignalState::Confirming));
        assert!(!tracker.is_confirmed("m"));

        let t = tracker.observe("m", &make_edge(Outcome::Yes, 7.0), 5.0, now).unwrap();
        assert_eq!(t.signal.state, SignalState::Confirmed);
        assert!(tracker.is_confirmed("m"));

        // Staying confirmed is not a transition
        assert!(tracker.observe("m", &make_edge(Outcome::Yes, 8.0), 5.0, now).is_none());
    }

    #[test]
    fn dip_below_threshold_resets() {
        let mut tracker = SignalTracker::new(2);
        let now = Utc::now();
        tracker.observe("m", &make_edge(Outcome::Yes, 6.0), 5.0, now);
        let t = tracker.observe("m", &make_edge(Outcome::Yes, 4.0), 5.0, now).unwrap();
        assert_eq!(t.signal.state, SignalState::Observing);
        assert_eq!(t.signal.confirmations, 0);
        tracker.observe("m", &make_edge(Outcome::Yes, 6.0), 5.0, now);
        assert_eq!(tracker.state("m"), SignalState::Confirming);
    }

    #[test]
    fn outcome_flip_restarts_count() {
        let mut tracker = SignalTracker::new(2);
        let now = Utc::now();
        tracker.observe("m", &make_edge(Outcome::Yes, 6.0), 5.0, now);
        let t = tracker.observe("m", &make_edge(Outcome::No, 6.0), 5.0, now).unwrap();
        assert_eq!(t.signal.state, SignalState::Confirming);
        assert_eq!(t.signal.outcome, Outcome::No);
    }

    #[test]
    fn entered_is_sticky_until_release() {
        let mut tracker = SignalTracker::new(1);
        let now = Utc::now();
        tracker.observe("m", &make_edge(Outcome::Yes, 6.0), 5.0, now);
        assert!(tracker.mark_entered("m", now).is_some());
        assert!(tracker.observe("m", &make_edge(Outcome::Yes, 1.0), 5.0, now).is_none());
        assert_eq!(tracker.state("m"), SignalState::Entered);

        let listed = HashSet::new();
        assert!(tracker.expire_missing(&listed, now).is_empty());
        tracker.release("m");
        assert_eq!(tracker.state("m"), SignalState::Observing);
        assert_eq!(tracker.counts(), (1, 1));
    }

    #[test]
    fn missing_markets_expire() {
        let mut tracker = SignalTracker::new(2);
        let now = Utc::now();
        tracker.observe("gone", &make_edge(Outcome::Yes, 6.0), 5.0, now);
        let transitions = tracker.expire_missing(&HashSet::new(), now);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].signal.state, SignalState::Expired);
        assert_eq!(transitions[0].to_record().to_state, "EXPIRED");
    }
}
