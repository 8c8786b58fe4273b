//! # events
//!
//! Defines [`PushEvent`] — everything the engine fans out to connected
//! dashboard clients over the WebSocket monitor stream.
//!
//! Events travel on a `tokio::sync::broadcast` channel as pre-serialized
//! `(scope, JSON)` frames: `scope = Some(user_id)` routes to that user's
//! sockets only, `None` is visible to every socket.

use serde::Serialize;
use uuid::Uuid;

use crate::models::AlertLevel;

// ─── Payload pieces ───────────────────────────────────────────────────────────

/// One position's fresh marks inside a `POSITIONS_PNL_UPDATED` batch.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PnlUpdate {
    pub position_id:    Uuid,
    pub unrealized_pnl: f64,
    pub day_pnl:        f64,
    pub current_price:  f64,
    pub updated_at_ms:  i64,
}

// ─── PushEvent ────────────────────────────────────────────────────────────────

/// Every event shape a dashboard client can receive in real time.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushEvent {
    /// Batched P&L deltas for one user, chunked to `event_chunk_size`.
    PositionsPnlUpdated {
        user_id: Uuid,
        updates: Vec<PnlUpdate>,
    },

    /// A position was settled and closed (any trigger: manual, stop-loss,
    /// target, risk auto-close).
    PositionClosed {
        user_id:       Uuid,
        position_id:   Uuid,
        symbol:        String,
        exit_price:    f64,
        realized_pnl:  f64,
        /// "MANUAL" | "STOP_LOSS" | "TARGET" | "RISK_AUTO_CLOSE"
        trigger: String,
    },

    /// Account crossed a loss-utilization threshold (throttled per account).
    RiskAlert {
        user_id:          Uuid,
        account_id:       Uuid,
        level:            AlertLevel,
        loss_utilization: f64,
        message:          String,
    },

    /// Worker vitals, broadcast after every tick so dashboards stay alive.
    EngineStats {
        scanned:    u64,
        updated:    u64,
        errors:     u64,
        elapsed_ms: u64,
        mode:       String,
    },
}

impl PushEvent {
    /// Serialize for the wire.
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }

    /// Which user this event belongs to; `None` = every connected socket.
    pub fn user_scope(&self) -> Option<Uuid> {
        match self {
            PushEvent::PositionsPnlUpdated { user_id, .. } => Some(*user_id),
            PushEvent::PositionClosed { user_id, .. } => Some(*user_id),
            PushEvent::RiskAlert { user_id, .. } => Some(*user_id),
            PushEvent::EngineStats { .. } => None,
        }
    }
}

// ─── Chunking ─────────────────────────────────────────────────────────────────

/// Split one user's update batch into events of at most `max` entries.
/// `max == 0` is treated as 1 rather than producing an infinite loop.
pub fn chunk_updates(updates: Vec<PnlUpdate>, max: usize) -> Vec<Vec<PnlUpdate>> {
    let max = max.max(1);
    let mut chunks = Vec::with_capacity(updates.len().div_ceil(max));
    let mut rest = updates;
    while rest.len() > max {
        let tail = rest.split_off(max);
        chunks.push(rest);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(i: u128) -> PnlUpdate {
        PnlUpdate {
            position_id: Uuid::from_u128(i),
            unrealized_pnl: 0.0,
            day_pnl: 0.0,
            current_price: 100.0,
            updated_at_ms: 0,
        }
    }

    #[test]
    fn chunking_respects_max_and_keeps_order() {
        let chunks = chunk_updates((0..7).map(update).collect(), 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 3);
        assert_eq!(chunks[1].len(), 3);
        assert_eq!(chunks[2].len(), 1);
        assert_eq!(chunks[2][0].position_id, Uuid::from_u128(6));

        assert!(chunk_updates(Vec::new(), 3).is_empty());
        assert_eq!(chunk_updates((0..2).map(update).collect(), 0).len(), 2);
    }

    #[test]
    fn scoping_routes_user_events_only() {
        let stats = PushEvent::EngineStats {
            scanned: 1,
            updated: 1,
            errors: 0,
            elapsed_ms: 5,
            mode: "active".into(),
        };
        assert_eq!(stats.user_scope(), None);

        let user = Uuid::from_u128(9);
        let batch = PushEvent::PositionsPnlUpdated {
            user_id: user,
            updates: vec![update(1)],
        };
        assert_eq!(batch.user_scope(), Some(user));
        assert!(batch.to_json().contains("POSITIONS_PNL_UPDATED"));
    }
}
