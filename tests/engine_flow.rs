//! End-to-end engine flows against the in-memory ledger: marking, the
//! update threshold, exit triggers, risk auto-close, the close race, dry
//! runs and the backstop. No database, no network.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use ballast::cache::{InMemoryPnlCache, PnlCache};
use ballast::config::EngineConfig;
use ballast::engine::backstop::run_backstop;
use ballast::engine::close;
use ballast::engine::tick::{heartbeat_from_report, process_tick, TickParams, TickReport};
use ballast::ledger::{memory::MemLedger, CloseTrigger, Ledger, SkipReason};
use ballast::models::{
    Heartbeat, HeartbeatRole, Position, ProductType, Segment, TradingAccount,
};
use ballast::quotes::{Quote, StaticQuoteSource};
use ballast::state::{build_state, SharedState};

// ─── Fixtures ─────────────────────────────────────────────────────────────────

struct Harness {
    state:  SharedState,
    ledger: MemLedger,
    quotes: Arc<StaticQuoteSource>,
    cache:  Arc<InMemoryPnlCache>,
}

fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

fn harness_with(config: EngineConfig) -> Harness {
    let ledger = MemLedger::new();
    let quotes = Arc::new(StaticQuoteSource::new());
    let cache = Arc::new(InMemoryPnlCache::new());

    let state = build_state(
        Arc::new(ledger.clone()),
        quotes.clone(),
        cache.clone(),
        config,
    );

    Harness { state, ledger, quotes, cache }
}

fn account(user_id: Uuid, balance: f64, available: f64, used: f64) -> TradingAccount {
    TradingAccount {
        id: Uuid::new_v4(),
        user_id,
        balance,
        available_margin: available,
        used_margin: used,
    }
}

fn position(account: &TradingAccount, token: i64, quantity: i64, avg: f64) -> Position {
    let now = Utc::now();
    Position {
        id: Uuid::new_v4(),
        account_id: account.id,
        user_id: account.user_id,
        symbol: format!("SYM{token}"),
        instrument_token: token,
        segment: Segment::Equity,
        quantity,
        average_price: avg,
        stop_loss: None,
        target: None,
        last_price: None,
        unrealized_pnl: 0.0,
        day_pnl: 0.0,
        realized_pnl: None,
        lot_size: 1,
        created_at: now,
        updated_at: now,
        closed_at: None,
    }
}

fn fresh_worker_heartbeat(scanned: u64, errors: u64) -> Heartbeat {
    Heartbeat {
        mode: "active".into(),
        scanned,
        errors,
        ..heartbeat_from_report(&TickReport::default(), &EngineConfig::default())
    }
}

// ─── Tick: marking & caching ──────────────────────────────────────────────────

#[tokio::test]
async fn tick_marks_positions_and_fills_the_cache() {
    let h = harness();
    let acct = account(Uuid::new_v4(), 10_000.0, 5_000.0, 1_000.0);
    let pos = position(&acct, 11, 10, 100.0); // long 10 @ 100
    h.ledger.upsert_account(acct);
    h.ledger.upsert_position(pos.clone());
    h.quotes.set_quote(11, Quote::new(105.0, 98.0)).await;

    let report = process_tick(&h.state, &TickParams::from_config(&h.state.config)).await;

    assert_eq!(report.scanned, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(report.mode, "active");

    // Durable marks: (105 - 100) * 10 and (105 - 98) * 10.
    let stored = h.ledger.get_position(pos.id).unwrap();
    assert!((stored.unrealized_pnl - 50.0).abs() < 1e-9);
    assert!((stored.day_pnl - 70.0).abs() < 1e-9);
    assert_eq!(stored.last_price, Some(105.0));
    assert!(stored.is_open());

    // Fast read path.
    let snap = h.cache.get(pos.id).await.unwrap();
    assert!((snap.unrealized_pnl - 50.0).abs() < 1e-9);
    assert_eq!(snap.current_price, 105.0);

    // Feed was asked to stream the token.
    assert!(h.quotes.subscribed_tokens().await.contains(&11));
}

#[tokio::test]
async fn update_threshold_suppresses_durable_write_but_not_cache() {
    let h = harness(); // update_threshold = 1.0
    let acct = account(Uuid::new_v4(), 10_000.0, 5_000.0, 0.0);
    let mut pos = position(&acct, 12, 10, 100.0);
    // Stored marks already almost current: Δ = 0.5 < threshold for both.
    pos.unrealized_pnl = 49.5;
    pos.day_pnl = 69.5;
    h.ledger.upsert_account(acct);
    h.ledger.upsert_position(pos.clone());
    h.quotes.set_quote(12, Quote::new(105.0, 98.0)).await;

    let report = process_tick(&h.state, &TickParams::from_config(&h.state.config)).await;

    assert_eq!(report.updated, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.cache_writes, 1);

    // The row keeps its old marks, the cache carries the fresh ones.
    let stored = h.ledger.get_position(pos.id).unwrap();
    assert!((stored.unrealized_pnl - 49.5).abs() < 1e-9);
    let snap = h.cache.get(pos.id).await.unwrap();
    assert!((snap.unrealized_pnl - 50.0).abs() < 1e-9);
}

#[tokio::test]
async fn missing_quote_falls_back_to_stored_last_price() {
    let h = harness();
    let acct = account(Uuid::new_v4(), 10_000.0, 5_000.0, 0.0);
    let mut pos = position(&acct, 13, 10, 100.0);
    pos.last_price = Some(103.0); // no live quote for token 13
    h.ledger.upsert_account(acct);
    h.ledger.upsert_position(pos.clone());

    let report = process_tick(&h.state, &TickParams::from_config(&h.state.config)).await;

    assert_eq!(report.errors, 0);
    let snap = h.cache.get(pos.id).await.unwrap();
    assert_eq!(snap.current_price, 103.0);
    // No prev close anywhere → day P&L falls back to the same reference.
    assert!((snap.unrealized_pnl - 30.0).abs() < 1e-9);
}

// ─── Tick: exit triggers ──────────────────────────────────────────────────────

#[tokio::test]
async fn stop_loss_breach_auto_closes_through_the_tick() {
    let h = harness();
    let acct = account(Uuid::new_v4(), 10_000.0, 5_000.0, 1_000.0);
    let mut pos = position(&acct, 21, 10, 100.0);
    pos.stop_loss = Some(95.0);
    h.ledger.upsert_account(acct.clone());
    h.ledger.upsert_position(pos.clone());
    h.quotes.set_quote(21, Quote::new(94.0, 99.0)).await;

    let report = process_tick(&h.state, &TickParams::from_config(&h.state.config)).await;

    assert_eq!(report.stop_loss_auto_closed, 1);
    assert_eq!(report.target_auto_closed, 0);

    let closed = h.ledger.get_position(pos.id).unwrap();
    assert_eq!(closed.quantity, 0);
    assert!(closed.closed_at.is_some());
    // Settled at the breach price: (94 - 100) * 10.
    assert_eq!(closed.realized_pnl, Some(-60.0));
    assert_eq!(closed.last_price, Some(94.0));

    // Offsetting SELL order, executed immediately.
    let orders = h.ledger.orders_for(acct.id, &pos.symbol);
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].quantity, 10);

    // Loss settled against the balance.
    let settled = h.ledger.get_account(acct.id).unwrap();
    assert!((settled.balance - 9_940.0).abs() < 1e-9);
}

#[tokio::test]
async fn short_position_target_triggers_on_price_drop() {
    let h = harness();
    let acct = account(Uuid::new_v4(), 10_000.0, 5_000.0, 1_000.0);
    let mut pos = position(&acct, 22, -10, 100.0); // short 10 @ 100
    pos.target = Some(90.0);
    h.ledger.upsert_account(acct.clone());
    h.ledger.upsert_position(pos.clone());
    h.quotes.set_quote(22, Quote::new(89.0, 101.0)).await;

    let report = process_tick(&h.state, &TickParams::from_config(&h.state.config)).await;

    assert_eq!(report.target_auto_closed, 1);
    let closed = h.ledger.get_position(pos.id).unwrap();
    assert_eq!(closed.quantity, 0);
    // Short gain: (89 - 100) * -10 = +110.
    assert_eq!(closed.realized_pnl, Some(110.0));
}

// ─── Tick: risk phase ─────────────────────────────────────────────────────────

#[tokio::test]
async fn critical_utilization_alerts_and_closes_worst_losers_first() {
    let h = harness(); // warning 0.80, auto-close 0.90
    let user = Uuid::new_v4();
    let acct = account(user, 500.0, 500.0, 2_000.0); // total funds 1000
    let worst = position(&acct, 31, 10, 100.0); // quote 30 → -700
    let lesser = position(&acct, 32, 10, 100.0); // quote 75 → -250
    h.ledger.upsert_account(acct.clone());
    h.ledger.upsert_position(worst.clone());
    h.ledger.upsert_position(lesser.clone());
    h.quotes.set_quote(31, Quote::new(30.0, 100.0)).await;
    h.quotes.set_quote(32, Quote::new(75.0, 100.0)).await;

    // Combined loss 950 of 1000 funds → utilization 0.95, CRITICAL.
    let report = process_tick(&h.state, &TickParams::from_config(&h.state.config)).await;

    assert_eq!(report.risk_alerts_created, 1);
    assert_eq!(report.risk_auto_closed, 2);

    let alerts = h.ledger.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].account_id, acct.id);
    assert!((alerts[0].loss_utilization - 0.95).abs() < 1e-9);

    assert_eq!(h.ledger.get_position(worst.id).unwrap().quantity, 0);
    assert_eq!(h.ledger.get_position(lesser.id).unwrap().quantity, 0);
}

#[tokio::test]
async fn warning_band_alerts_without_closing_anything() {
    let h = harness();
    let acct = account(Uuid::new_v4(), 500.0, 500.0, 1_000.0);
    let pos = position(&acct, 33, 10, 100.0);
    h.ledger.upsert_account(acct.clone());
    h.ledger.upsert_position(pos.clone());
    // Quote 15 → -850 of 1000 funds → 0.85: inside the warning band.
    h.quotes.set_quote(33, Quote::new(15.0, 100.0)).await;

    let report = process_tick(&h.state, &TickParams::from_config(&h.state.config)).await;

    assert_eq!(report.risk_alerts_created, 1);
    assert_eq!(report.risk_auto_closed, 0);
    assert!(h.ledger.get_position(pos.id).unwrap().is_open());
}

#[tokio::test]
async fn risk_alerts_are_throttled_by_the_cooldown() {
    let h = harness(); // cooldown 600s
    let acct = account(Uuid::new_v4(), 500.0, 500.0, 1_000.0);
    let pos = position(&acct, 34, 10, 100.0);
    h.ledger.upsert_account(acct.clone());
    h.ledger.upsert_position(pos);
    h.quotes.set_quote(34, Quote::new(15.0, 100.0)).await;

    let params = TickParams::from_config(&h.state.config);
    let first = process_tick(&h.state, &params).await;
    let second = process_tick(&h.state, &params).await;

    assert_eq!(first.risk_alerts_created, 1);
    assert_eq!(second.risk_alerts_created, 0);
    assert_eq!(h.ledger.alerts().len(), 1);
}

// ─── Close: exactly-once under contention ─────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_closes_settle_exactly_once() {
    let h = harness();
    let acct = account(Uuid::new_v4(), 10_000.0, 5_000.0, 1_000.0);
    let pos = position(&acct, 41, 10, 100.0);
    h.ledger.upsert_account(acct.clone());
    h.ledger.upsert_position(pos.clone());

    // Worker, backstop and user all fire at once.
    let mut handles = Vec::new();
    for _ in 0..8 {
        let state = h.state.clone();
        let position_id = pos.id;
        let account_id = acct.id;
        handles.push(tokio::spawn(async move {
            close::close_position(&state, position_id, account_id, Some(102.0), CloseTrigger::Manual)
                .await
        }));
    }

    let mut settled = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.skipped {
            assert!(matches!(
                outcome.reason,
                Some(SkipReason::LockNotAcquired) | Some(SkipReason::AlreadyClosed)
            ));
        } else {
            settled += 1;
        }
    }
    assert_eq!(settled, 1);

    // Exactly one exit order, account settled exactly once: pnl +20,
    // margin 1000 (equity delivery, 10 * 100) released exactly once.
    assert_eq!(h.ledger.orders_for(acct.id, &pos.symbol).len(), 1);
    let after = h.ledger.get_account(acct.id).unwrap();
    assert!((after.balance - 10_020.0).abs() < 1e-9);
    assert!((after.available_margin - 6_000.0).abs() < 1e-9);
    assert!((after.used_margin - 0.0).abs() < 1e-9);
}

#[tokio::test]
async fn second_close_is_an_idempotent_no_op() {
    let h = harness();
    let acct = account(Uuid::new_v4(), 10_000.0, 5_000.0, 1_000.0);
    let pos = position(&acct, 42, -5, 200.0); // short
    h.ledger.upsert_account(acct.clone());
    h.ledger.upsert_position(pos.clone());

    let first = close::close_position(&h.state, pos.id, acct.id, Some(190.0), CloseTrigger::Manual)
        .await
        .unwrap();
    assert!(!first.skipped);
    assert_eq!(first.realized_pnl, 50.0); // (190 - 200) * -5

    let balance_after_first = h.ledger.get_account(acct.id).unwrap().balance;

    let second = close::close_position(&h.state, pos.id, acct.id, Some(190.0), CloseTrigger::Manual)
        .await
        .unwrap();
    assert!(second.skipped);
    assert_eq!(second.reason, Some(SkipReason::AlreadyClosed));

    // Nothing moved the second time.
    assert_eq!(h.ledger.get_account(acct.id).unwrap().balance, balance_after_first);
    assert_eq!(h.ledger.orders_for(acct.id, &pos.symbol).len(), 1);
    assert_eq!(
        h.ledger.get_position(pos.id).unwrap().realized_pnl,
        Some(first.realized_pnl)
    );
}

#[tokio::test]
async fn close_without_override_falls_back_to_stored_last_price() {
    let h = harness();
    let acct = account(Uuid::new_v4(), 10_000.0, 5_000.0, 1_000.0);
    let mut pos = position(&acct, 43, 10, 100.0);
    pos.last_price = Some(101.0); // no live quote for this token
    h.ledger.upsert_account(acct.clone());
    h.ledger.upsert_position(pos.clone());

    let outcome = close::close_position(&h.state, pos.id, acct.id, None, CloseTrigger::Manual)
        .await
        .unwrap();

    assert!(!outcome.skipped);
    assert_eq!(outcome.exit_price, 101.0);
    assert_eq!(outcome.realized_pnl, 10.0); // (101 - 100) * 10
}

// ─── Dry run ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn dry_run_counts_everything_and_writes_nothing() {
    let h = harness();
    let acct = account(Uuid::new_v4(), 500.0, 500.0, 1_000.0);
    let mut pos = position(&acct, 51, 10, 100.0);
    pos.stop_loss = Some(95.0);
    h.ledger.upsert_account(acct.clone());
    h.ledger.upsert_position(pos.clone());
    h.quotes.set_quote(51, Quote::new(5.0, 100.0)).await; // breach + critical

    let mut params = TickParams::from_config(&h.state.config);
    params.dry_run = true;
    let report = process_tick(&h.state, &params).await;

    // Counted...
    assert_eq!(report.mode, "dry_run");
    assert_eq!(report.scanned, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.stop_loss_auto_closed, 1);
    assert!(report.risk_auto_closed >= 1);

    // ...but nothing happened.
    let untouched = h.ledger.get_position(pos.id).unwrap();
    assert!(untouched.is_open());
    assert_eq!(untouched.unrealized_pnl, 0.0);
    assert!(h.cache.get(pos.id).await.is_none());
    assert!(h.ledger.alerts().is_empty());
    assert!(h.ledger.orders_for(acct.id, &pos.symbol).is_empty());
    assert!(h
        .ledger
        .read_heartbeat(HeartbeatRole::Worker)
        .await
        .unwrap()
        .is_none());
}

// ─── Soft-disable ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn disabled_engine_skips_unless_forced() {
    let h = harness();
    let acct = account(Uuid::new_v4(), 10_000.0, 5_000.0, 0.0);
    let pos = position(&acct, 61, 10, 100.0);
    h.ledger.upsert_account(acct);
    h.ledger.upsert_position(pos.clone());
    h.quotes.set_quote(61, Quote::new(110.0, 100.0)).await;

    h.state.set_enabled(false);

    let params = TickParams::from_config(&h.state.config);
    let skipped = process_tick(&h.state, &params).await;
    assert_eq!(skipped.mode, "disabled");
    assert_eq!(skipped.scanned, 0);

    let mut forced = TickParams::from_config(&h.state.config);
    forced.force_run = true;
    let report = process_tick(&h.state, &forced).await;
    assert_eq!(report.mode, "forced");
    assert_eq!(report.scanned, 1);
    assert!((h.ledger.get_position(pos.id).unwrap().unrealized_pnl - 100.0).abs() < 1e-9);
}

// ─── Events ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn tick_fans_out_scoped_pnl_events() {
    let h = harness();
    let user = Uuid::new_v4();
    let acct = account(user, 10_000.0, 5_000.0, 0.0);
    let pos = position(&acct, 71, 10, 100.0);
    h.ledger.upsert_account(acct);
    h.ledger.upsert_position(pos);
    h.quotes.set_quote(71, Quote::new(105.0, 98.0)).await;

    let mut rx = h.state.broadcast_tx.subscribe();
    let report = process_tick(&h.state, &TickParams::from_config(&h.state.config)).await;
    assert!(report.events_emitted >= 1);

    let mut saw_scoped_pnl = false;
    let mut saw_engine_stats = false;
    while let Ok((scope, json)) = rx.try_recv() {
        if json.contains("POSITIONS_PNL_UPDATED") {
            assert_eq!(scope, Some(user));
            saw_scoped_pnl = true;
        }
        if json.contains("ENGINE_STATS") {
            assert_eq!(scope, None);
            saw_engine_stats = true;
        }
    }
    assert!(saw_scoped_pnl);
    assert!(saw_engine_stats);
}

// ─── Backstop ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn backstop_stands_down_while_the_worker_is_healthy() {
    let h = harness();
    h.ledger
        .write_heartbeat(HeartbeatRole::Worker, &fresh_worker_heartbeat(10, 0))
        .await
        .unwrap();

    let report = run_backstop(&h.state, false).await;

    assert!(!report.ran);
    assert!(report.tick.is_none());
    let own = h
        .ledger
        .read_heartbeat(HeartbeatRole::Backstop)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(own.mode, "backstop_skipped");
}

#[tokio::test]
async fn backstop_engages_on_stale_or_missing_heartbeat() {
    let h = harness();
    let acct = account(Uuid::new_v4(), 10_000.0, 5_000.0, 0.0);
    let pos = position(&acct, 81, 10, 100.0);
    h.ledger.upsert_account(acct);
    h.ledger.upsert_position(pos.clone());
    h.quotes.set_quote(81, Quote::new(110.0, 100.0)).await;

    // No worker heartbeat at all → assume dead.
    let report = run_backstop(&h.state, false).await;
    assert!(report.ran);
    let tick = report.tick.unwrap();
    assert_eq!(tick.scanned, 1);

    // The forced tick did real work.
    assert!((h.ledger.get_position(pos.id).unwrap().unrealized_pnl - 100.0).abs() < 1e-9);

    let own = h
        .ledger
        .read_heartbeat(HeartbeatRole::Backstop)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(own.mode, "backstop");
    assert!(own.nested.is_some());

    // A worker record from ten minutes ago counts as stale too.
    let mut stale = fresh_worker_heartbeat(10, 0);
    stale.last_run_at = Utc::now() - chrono::Duration::seconds(600);
    h.ledger
        .write_heartbeat(HeartbeatRole::Worker, &stale)
        .await
        .unwrap();
    assert!(run_backstop(&h.state, false).await.ran);
}

#[tokio::test]
async fn backstop_flags_error_heavy_worker_as_unhealthy() {
    let h = harness(); // heartbeat_error_ratio 0.5
    h.ledger
        .write_heartbeat(HeartbeatRole::Worker, &fresh_worker_heartbeat(10, 8))
        .await
        .unwrap();

    assert!(run_backstop(&h.state, false).await.ran);
}

// ─── Margin on close ──────────────────────────────────────────────────────────

#[tokio::test]
async fn close_releases_margin_per_the_entry_product() {
    use ballast::models::{Order, OrderSide, OrderStatus};

    let h = harness();
    let acct = account(Uuid::new_v4(), 10_000.0, 0.0, 5_000.0);
    let pos = position(&acct, 91, 10, 100.0);
    // Entry was intraday: only notional / 5 was ever blocked.
    h.ledger.insert_order(Order {
        id: Uuid::new_v4(),
        account_id: acct.id,
        symbol: pos.symbol.clone(),
        side: OrderSide::Buy,
        quantity: 10,
        price: 100.0,
        product_type: ProductType::Intraday,
        status: OrderStatus::Executed,
        executed_at: Some(Utc::now()),
        created_at: Utc::now(),
    });
    h.ledger.upsert_account(acct.clone());
    h.ledger.upsert_position(pos.clone());

    let outcome = close::close_position(&h.state, pos.id, acct.id, Some(100.0), CloseTrigger::Manual)
        .await
        .unwrap();

    // Equity intraday: 10 * 100 / 5 = 200 released, not the full 1000.
    assert!((outcome.margin_released - 200.0).abs() < 1e-9);
    let after = h.ledger.get_account(acct.id).unwrap();
    assert!((after.available_margin - 200.0).abs() < 1e-9);
    assert!((after.used_margin - 4_800.0).abs() < 1e-9);
}

#[tokio::test]
async fn entry_product_survives_a_heavily_churned_symbol() {
    use ballast::models::{Order, OrderSide, OrderStatus};

    let h = harness();
    let acct = account(Uuid::new_v4(), 10_000.0, 0.0, 5_000.0);
    let pos = position(&acct, 92, 10, 100.0);

    let order = |side: OrderSide, product: ProductType, age_secs: i64| Order {
        id: Uuid::new_v4(),
        account_id: acct.id,
        symbol: pos.symbol.clone(),
        side,
        quantity: 10,
        price: 100.0,
        product_type: product,
        status: OrderStatus::Executed,
        executed_at: Some(Utc::now() - chrono::Duration::seconds(age_secs)),
        created_at: Utc::now() - chrono::Duration::seconds(age_secs),
    };

    // The reducing-side intraday order is old and buried under a pile of
    // newer non-reducing executions on the same symbol.
    h.ledger.insert_order(order(OrderSide::Sell, ProductType::Intraday, 3_600));
    for i in 0..25 {
        h.ledger.insert_order(order(OrderSide::Buy, ProductType::Delivery, i));
    }
    h.ledger.upsert_account(acct.clone());
    h.ledger.upsert_position(pos.clone());

    let outcome = close::close_position(&h.state, pos.id, acct.id, Some(100.0), CloseTrigger::Manual)
        .await
        .unwrap();

    // Still recovered as intraday: 10 * 100 / 5 = 200, not the delivery 1000.
    assert!((outcome.margin_released - 200.0).abs() < 1e-9);
}
