//! Directional exit rules

use serde::{Deserialize, Serialize};

use super::DirectionalPosition;

/// Why a directional position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    EdgeReversal,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitReason::EdgeReversal => write!(f, "EDGE_REVERSAL"),
        }
    }
}

impl ExitReason {
    /// Price-based exits go straight to market; reversal asks the oracle first
    pub fn needs_confirmation(&self) -> bool {
        matches!(self, ExitReason::EdgeReversal)
    }
}

/// First exit rule that fires, checked in order: stop-loss, take-profit,
/// edge reversal. `edge_now` is `None` when the edge could not be
/// recomputed this cycle.
pub fn check_exit(
    position: &DirectionalPosition,
    current_price: f64,
    edge_now: Option<f64>,
    stop_loss_pts: f64,
    take_profit_pts: f64,
    edge_reversal_pts: f64,
) -> Option<ExitReason> {
    let move_pts = (current_price - position.entry_price) * 100.0;
    if -move_pts >= stop_loss_pts {
        return Some(ExitReason::StopLoss);
    }
    if move_pts >= take_profit_pts {
        return Some(ExitReason::TakeProfit);
    }
    match edge_now {
        Some(edge) if edge <= edge_reversal_pts => Some(ExitReason::EdgeReversal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directional::book::tests::make_position;

    #[test]
    fn price_rules_fire_first() {
        let position = make_position("m", 0.50, 10.0);
        assert_eq!(
            check_exit(&position, 0.34, Some(10.0), 15.0, 20.0, -3.0),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(
            check_exit(&position, 0.71, Some(-10.0), 15.0, 20.0, -3.0),
            Some(ExitReason::TakeProfit)
        );
        assert_eq!(check_exit(&position, 0.36, Some(1.0), 15.0, 20.0, -3.0), None);
    }

    #[test]
    fn reversal_needs_recomputed_edge() {
        let position = make_position("m", 0.50, 10.0);
        assert_eq!(
            check_exit(&position, 0.52, Some(-3.0), 15.0, 20.0, -3.0),
            Some(ExitReason::EdgeReversal)
        );
        assert_eq!(check_exit(&position, 0.52, Some(-2.9), 15.0, 20.0, -3.0), None);
        assert_eq!(check_exit(&position, 0.52, None, 15.0, 20.0, -3.0), None);
        assert!(ExitReason::EdgeReversal.needs_confirmation());
        assert!(!ExitReason::StopLoss.needs_confirmation());
    }
}
