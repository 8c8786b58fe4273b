//! # engine::triggers — Stop-Loss / Target Evaluator
//!
//! Side-aware threshold checks, pure per position. Either threshold may be
//! absent. When both are breached in the same tick, **stop-loss wins** —
//! the protective exit takes precedence over profit-taking.

// ─── Trigger ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    StopLoss,
    Target,
}

impl ExitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitTrigger::StopLoss => "STOP_LOSS",
            ExitTrigger::Target => "TARGET",
        }
    }
}

/// Evaluate both thresholds for one position at `current_price`.
///
/// Long (quantity > 0): stop-loss at `current <= sl`, target at
/// `current >= tp`. Short (quantity < 0): stop-loss at `current >= sl`,
/// target at `current <= tp`. A flat position never triggers.
pub fn check_exit_triggers(
    quantity: i64,
    stop_loss: Option<f64>,
    target: Option<f64>,
    current_price: f64,
) -> Option<ExitTrigger> {
    if quantity == 0 || current_price <= 0.0 {
        return None;
    }
    let long = quantity > 0;

    let sl_hit = stop_loss.is_some_and(|sl| {
        if long {
            current_price <= sl
        } else {
            current_price >= sl
        }
    });

    // Stop-loss precedence: checked first, target never overrides it.
    if sl_hit {
        return Some(ExitTrigger::StopLoss);
    }

    let tp_hit = target.is_some_and(|tp| {
        if long {
            current_price >= tp
        } else {
            current_price <= tp
        }
    });

    tp_hit.then_some(ExitTrigger::Target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_side_thresholds() {
        // Long 50 @ avg 100, sl 95, tp 110.
        assert_eq!(
            check_exit_triggers(50, Some(95.0), Some(110.0), 94.0),
            Some(ExitTrigger::StopLoss)
        );
        assert_eq!(
            check_exit_triggers(50, Some(95.0), Some(110.0), 95.0),
            Some(ExitTrigger::StopLoss)
        );
        assert_eq!(
            check_exit_triggers(50, Some(95.0), Some(110.0), 110.0),
            Some(ExitTrigger::Target)
        );
        assert_eq!(check_exit_triggers(50, Some(95.0), Some(110.0), 100.0), None);
    }

    #[test]
    fn short_stop_loss_at_exactly_110() {
        // qty=-10, sl=110 triggers at 110, not at 109.
        assert_eq!(
            check_exit_triggers(-10, Some(110.0), None, 110.0),
            Some(ExitTrigger::StopLoss)
        );
        assert_eq!(check_exit_triggers(-10, Some(110.0), None, 109.0), None);
    }

    #[test]
    fn short_target_triggers_below() {
        assert_eq!(
            check_exit_triggers(-10, None, Some(90.0), 89.5),
            Some(ExitTrigger::Target)
        );
        assert_eq!(check_exit_triggers(-10, None, Some(90.0), 91.0), None);
    }

    #[test]
    fn stop_loss_wins_when_both_breach() {
        // Degenerate config where one tick breaches both: protective exit wins.
        assert_eq!(
            check_exit_triggers(10, Some(100.0), Some(100.0), 100.0),
            Some(ExitTrigger::StopLoss)
        );
        assert_eq!(
            check_exit_triggers(-10, Some(100.0), Some(100.0), 100.0),
            Some(ExitTrigger::StopLoss)
        );
    }

    #[test]
    fn absent_thresholds_skip_checks() {
        assert_eq!(check_exit_triggers(10, None, None, 1.0), None);
        assert_eq!(check_exit_triggers(0, Some(95.0), Some(110.0), 94.0), None);
    }
}
