//! # engine::risk — Risk Threshold Evaluator
//!
//! Computes per-account loss utilization and, past the auto-close threshold,
//! ranks positions for forced exit. Pure: the tick worker feeds it exposures
//! it aggregated during the scan, the ledger does the closing.
//!
//! Candidate selection is deterministic (worst unrealized loss first, ties
//! broken by position id) so repeated evaluation of an unresolved situation
//! never thrashes between different victims.

use uuid::Uuid;

// ─── Inputs ───────────────────────────────────────────────────────────────────

/// One open position's contribution to account exposure.
#[derive(Debug, Clone)]
pub struct ExposureLine {
    pub position_id:    Uuid,
    pub symbol:         String,
    pub quantity:       i64,
    pub unrealized_pnl: f64,
}

/// Thresholds are read fresh each tick — never cached across ticks.
#[derive(Debug, Clone, Copy)]
pub struct RiskThresholds {
    /// Loss utilization at which the account is flagged (e.g. 0.80).
    pub warning: f64,
    /// Loss utilization past which positions are force-closed (e.g. 0.90).
    pub auto_close: f64,
}

// ─── Output ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskStatus {
    Safe,
    Warning,
    Critical,
}

impl RiskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskStatus::Safe => "SAFE",
            RiskStatus::Warning => "WARNING",
            RiskStatus::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub status:           RiskStatus,
    pub loss_utilization: f64,
    pub total_unrealized: f64,
    /// Positions to force-close, worst loss first. Empty unless Critical.
    pub candidates: Vec<Uuid>,
}

// ─── Evaluation ───────────────────────────────────────────────────────────────

/// Evaluate one account.
///
/// `loss_utilization = max(0, -Σ unrealized) / total_funds`. When
/// `total_funds <= 0` the ratio is undefined; utilization is defined as 0 so
/// a zero-funds edge case neither divides by zero nor force-closes the book.
///
/// `max_candidates` caps forced closes per account per tick so one bad tick
/// cannot liquidate an entire book.
pub fn evaluate_account(
    lines: &[ExposureLine],
    total_funds: f64,
    thresholds: RiskThresholds,
    max_candidates: usize,
) -> RiskAssessment {
    let total_unrealized: f64 = lines.iter().map(|l| l.unrealized_pnl).sum();

    let loss_utilization = if total_funds > 0.0 {
        (-total_unrealized).max(0.0) / total_funds
    } else {
        0.0
    };

    let status = if loss_utilization >= thresholds.auto_close {
        RiskStatus::Critical
    } else if loss_utilization >= thresholds.warning {
        RiskStatus::Warning
    } else {
        RiskStatus::Safe
    };

    let candidates = if status == RiskStatus::Critical {
        select_candidates(lines, max_candidates)
    } else {
        Vec::new()
    };

    RiskAssessment {
        status,
        loss_utilization,
        total_unrealized,
        candidates,
    }
}

/// Only loss-making positions qualify — closing a winner does not reduce the
/// account's unrealized loss.
fn select_candidates(lines: &[ExposureLine], max_candidates: usize) -> Vec<Uuid> {
    let mut losers: Vec<&ExposureLine> =
        lines.iter().filter(|l| l.unrealized_pnl < 0.0).collect();

    losers.sort_by(|a, b| {
        a.unrealized_pnl
            .partial_cmp(&b.unrealized_pnl)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.position_id.cmp(&b.position_id))
    });

    losers
        .into_iter()
        .take(max_candidates)
        .map(|l| l.position_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: RiskThresholds = RiskThresholds {
        warning: 0.80,
        auto_close: 0.90,
    };

    fn line(id: u128, unrealized: f64) -> ExposureLine {
        ExposureLine {
            position_id: Uuid::from_u128(id),
            symbol: "TEST".into(),
            quantity: 10,
            unrealized_pnl: unrealized,
        }
    }

    #[test]
    fn moderate_loss_is_safe() {
        // Long 50 @ 100, current 95 → -250 unrealized; funds 1000 → 0.25.
        let a = evaluate_account(&[line(1, -250.0)], 1000.0, T, 3);
        assert_eq!(a.status, RiskStatus::Safe);
        assert!((a.loss_utilization - 0.25).abs() < 1e-9);
        assert!(a.candidates.is_empty());
    }

    #[test]
    fn loss_past_total_funds_is_critical() {
        // Same position, price 10 → -4500, exceeds funds 1000 → utilization > 1.
        let a = evaluate_account(&[line(1, -4500.0)], 1000.0, T, 3);
        assert_eq!(a.status, RiskStatus::Critical);
        assert!(a.loss_utilization > 1.0);
        assert_eq!(a.candidates, vec![Uuid::from_u128(1)]);
    }

    #[test]
    fn warning_band() {
        let a = evaluate_account(&[line(1, -850.0)], 1000.0, T, 3);
        assert_eq!(a.status, RiskStatus::Warning);
        assert!(a.candidates.is_empty());
    }

    #[test]
    fn utilization_monotone_in_losses() {
        let mut previous = -1.0;
        for loss in [0.0, 100.0, 400.0, 900.0, 5000.0] {
            let a = evaluate_account(&[line(1, -loss)], 1000.0, T, 3);
            assert!(a.loss_utilization >= previous);
            previous = a.loss_utilization;
        }
    }

    #[test]
    fn gains_never_produce_utilization() {
        let a = evaluate_account(&[line(1, 500.0)], 1000.0, T, 3);
        assert_eq!(a.loss_utilization, 0.0);
        assert_eq!(a.status, RiskStatus::Safe);
    }

    #[test]
    fn zero_or_negative_funds_is_defined_as_zero_utilization() {
        let a = evaluate_account(&[line(1, -4500.0)], 0.0, T, 3);
        assert_eq!(a.loss_utilization, 0.0);
        assert_eq!(a.status, RiskStatus::Safe);

        let a = evaluate_account(&[line(1, -4500.0)], -100.0, T, 3);
        assert_eq!(a.status, RiskStatus::Safe);
    }

    #[test]
    fn candidates_ranked_worst_first_capped_and_stable() {
        let lines = vec![
            line(3, -100.0),
            line(1, -900.0),
            line(4, 250.0),  // winner: never a candidate
            line(2, -900.0), // ties with id 1, loses the tie-break
            line(5, -500.0),
        ];
        let a = evaluate_account(&lines, 1000.0, T, 2);
        assert_eq!(a.status, RiskStatus::Critical);
        assert_eq!(
            a.candidates,
            vec![Uuid::from_u128(1), Uuid::from_u128(2)]
        );

        // Re-running the same unresolved situation picks the same victims.
        let b = evaluate_account(&lines, 1000.0, T, 2);
        assert_eq!(a.candidates, b.candidates);
    }
}
