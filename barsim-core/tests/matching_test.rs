//! Matching engine integration tests: the three-step sequence, sub-bar
//! iteration, strict fill prices, and OCO semantics.

use barsim_core::book::OrderBook;
use barsim_core::bus::{EventBus, EventType};
use barsim_core::domain::{
    Bar, IdGen, OrderDraft, OrderRole, OrderSide, OrderStatus, SubBar, TradeId,
};
use barsim_core::ledger::PositionLedger;
use std::cell::RefCell;
use std::rc::Rc;

const TICK: f64 = 0.25;

fn setup() -> (Rc<EventBus>, OrderBook, PositionLedger) {
    setup_with_commission(0.0)
}

fn setup_with_commission(commission: f64) -> (Rc<EventBus>, OrderBook, PositionLedger) {
    let bus = EventBus::new();
    let id_gen = Rc::new(RefCell::new(IdGen::default()));
    let book = OrderBook::new(Rc::clone(&bus), Rc::clone(&id_gen), TICK, commission);
    let ledger = PositionLedger::new(Rc::clone(&bus), id_gen, 100_000.0);
    (bus, book, ledger)
}

fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        time: 1_700_000_000,
        open,
        high,
        low,
        close,
        volume: None,
    }
}

fn sub(parent: usize, open: f64, high: f64, low: f64, close: f64) -> SubBar {
    SubBar {
        parent_bar_index: parent,
        time: 1_700_000_000,
        open,
        high,
        low,
        close,
        volume: None,
    }
}

/// Open a long position by filling a market buy on a flat bar, and return
/// its trade id.
fn open_long(book: &mut OrderBook, ledger: &mut PositionLedger, price: f64, qty: f64) -> TradeId {
    book.submit(OrderDraft::market("ES", OrderSide::Buy, qty));
    book.process_bar(&bar(price, price, price, price), &[], 0, ledger)
        .unwrap();
    ledger.position("ES").expect("position opened").id
}

fn open_short(book: &mut OrderBook, ledger: &mut PositionLedger, price: f64, qty: f64) -> TradeId {
    book.submit(OrderDraft::market("ES", OrderSide::Sell, qty));
    book.process_bar(&bar(price, price, price, price), &[], 0, ledger)
        .unwrap();
    ledger.position("ES").expect("position opened").id
}

// ── Submission & validation ──────────────────────────────────────────

#[test]
fn zero_quantity_is_rejected_with_message() {
    let (_bus, mut book, _ledger) = setup();
    let order = book.submit(OrderDraft::market("ES", OrderSide::Buy, 0.0));
    assert_eq!(order.status, OrderStatus::Rejected);
    assert_eq!(order.message.as_deref(), Some("Invalid quantity"));
    assert!(!book.has_active_orders());
}

#[test]
fn limit_without_price_is_rejected() {
    let (_bus, mut book, _ledger) = setup();
    let mut draft = OrderDraft::market("ES", OrderSide::Buy, 1.0);
    draft.order_type = barsim_core::domain::OrderType::Limit;
    let order = book.submit(draft);
    assert_eq!(order.status, OrderStatus::Rejected);
    assert_eq!(order.message.as_deref(), Some("Missing limit price"));
}

#[test]
fn protective_order_requires_parent_trade() {
    let (_bus, mut book, _ledger) = setup();
    let mut draft = OrderDraft::stop("ES", OrderSide::Sell, 1.0, 95.0);
    draft.role = OrderRole::StopLoss;
    let order = book.submit(draft);
    assert_eq!(order.status, OrderStatus::Rejected);
    assert_eq!(order.message.as_deref(), Some("Stop-loss requires a parent trade"));
}

#[test]
fn submitted_prices_are_rounded_to_tick() {
    let (_bus, mut book, _ledger) = setup();
    let order = book.submit(OrderDraft::limit("ES", OrderSide::Buy, 1.0, 99.37));
    assert_eq!(order.limit_price, Some(99.25));
}

#[test]
fn cancel_of_unknown_order_returns_false() {
    let (_bus, mut book, _ledger) = setup();
    assert!(!book.cancel(barsim_core::domain::OrderId(999)));
}

#[test]
fn modify_adjusts_price_with_tick_rounding() {
    let (_bus, mut book, _ledger) = setup();
    let order = book.submit(OrderDraft::limit("ES", OrderSide::Buy, 1.0, 99.0));
    book.modify(&barsim_core::domain::ModifyRequest {
        order_id: order.id,
        quantity: None,
        limit_price: Some(98.13),
        stop_price: None,
    })
    .unwrap();
    assert_eq!(book.order(order.id).unwrap().limit_price, Some(98.25));
}

// ── Step 2: market & limit ───────────────────────────────────────────

#[test]
fn market_order_fills_at_bar_open() {
    let (_bus, mut book, mut ledger) = setup();
    book.submit(OrderDraft::market("ES", OrderSide::Buy, 1.0));
    let fills = book
        .process_bar(&bar(100.0, 105.0, 95.0, 102.0), &[], 0, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].price, 100.0);
}

#[test]
fn market_order_fills_at_first_sub_bar_open() {
    let (_bus, mut book, mut ledger) = setup();
    book.submit(OrderDraft::market("ES", OrderSide::Buy, 1.0));
    let subs = vec![
        sub(0, 100.0, 101.0, 99.5, 100.5),
        sub(0, 100.5, 105.0, 95.0, 102.0),
    ];
    let fills = book
        .process_bar(&bar(100.0, 105.0, 95.0, 102.0), &subs, 0, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].price, 100.0);
    assert_eq!(fills[0].sub_bar_index, 0);
}

#[test]
fn buy_limit_fills_at_limit_price_not_bar_low() {
    let (_bus, mut book, mut ledger) = setup();
    let order = book.submit(OrderDraft::limit("ES", OrderSide::Buy, 1.0, 99.5));
    let subs = vec![sub(0, 100.0, 101.0, 99.0, 100.5)];
    let fills = book
        .process_bar(&bar(100.0, 101.0, 99.0, 100.5), &subs, 0, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].price, 99.5);
    assert_eq!(book.order(order.id).unwrap().status, OrderStatus::Filled);
}

#[test]
fn sell_limit_fills_when_high_reaches() {
    let (_bus, mut book, mut ledger) = setup();
    open_long(&mut book, &mut ledger, 100.0, 1.0);
    book.submit(
        OrderDraft::limit("ES", OrderSide::Sell, 1.0, 103.0).with_role(OrderRole::Exit),
    );
    let fills = book
        .process_bar(&bar(101.0, 103.5, 100.0, 102.0), &[], 1, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].price, 103.0);
    assert!(ledger.position("ES").is_none());
}

#[test]
fn buy_limit_below_range_stays_pending() {
    let (_bus, mut book, mut ledger) = setup();
    let order = book.submit(OrderDraft::limit("ES", OrderSide::Buy, 1.0, 90.0));
    for index in 0..3 {
        let fills = book
            .process_bar(&bar(100.0, 104.0, 95.0, 101.0), &[], index, &mut ledger)
            .unwrap();
        assert!(fills.is_empty());
    }
    assert_eq!(book.order(order.id).unwrap().status, OrderStatus::Pending);
}

#[test]
fn fill_on_earlier_sub_bar_consumes_order() {
    let (_bus, mut book, mut ledger) = setup();
    book.submit(OrderDraft::limit("ES", OrderSide::Buy, 1.0, 99.5));
    // Both sub-bars dip below the limit; only the first may fill.
    let subs = vec![
        sub(0, 100.0, 100.5, 99.0, 99.8),
        sub(0, 99.8, 100.2, 99.2, 100.0),
    ];
    let fills = book
        .process_bar(&bar(100.0, 100.5, 99.0, 100.0), &subs, 0, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].sub_bar_index, 0);
}

// ── Step 1: standalone stops ─────────────────────────────────────────

#[test]
fn buy_stop_triggers_on_high_and_fills_at_stop() {
    let (_bus, mut book, mut ledger) = setup();
    book.submit(OrderDraft::stop("ES", OrderSide::Buy, 1.0, 102.0));
    let fills = book
        .process_bar(&bar(100.0, 103.0, 99.0, 102.5), &[], 0, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].price, 102.0);
}

#[test]
fn sell_stop_triggers_on_low() {
    let (_bus, mut book, mut ledger) = setup();
    book.submit(OrderDraft::stop("ES", OrderSide::Sell, 1.0, 98.0));
    let fills = book
        .process_bar(&bar(100.0, 101.0, 97.5, 99.0), &[], 0, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].price, 98.0);
}

#[test]
fn stop_outside_range_does_not_trigger() {
    let (_bus, mut book, mut ledger) = setup();
    let order = book.submit(OrderDraft::stop("ES", OrderSide::Buy, 1.0, 110.0));
    let fills = book
        .process_bar(&bar(100.0, 104.0, 96.0, 101.0), &[], 0, &mut ledger)
        .unwrap();
    assert!(fills.is_empty());
    assert_eq!(book.order(order.id).unwrap().status, OrderStatus::Pending);
}

// ── Step 3: OCO SL/TP pairs ──────────────────────────────────────────

#[test]
fn sl_fill_cancels_tp_sibling() {
    let (_bus, mut book, mut ledger) = setup();
    let trade_id = open_long(&mut book, &mut ledger, 101.0, 1.0);
    let sl = book.submit(OrderDraft::stop_loss("ES", OrderSide::Sell, 1.0, 100.0, trade_id));
    let tp = book.submit(OrderDraft::take_profit("ES", OrderSide::Sell, 1.0, 102.0, trade_id));

    // Only the stop side trades.
    let fills = book
        .process_bar(&bar(101.0, 101.5, 99.0, 99.5), &[], 1, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].order_id, sl.id);
    assert_eq!(fills[0].price, 100.0);
    assert_eq!(book.order(sl.id).unwrap().status, OrderStatus::Filled);
    assert_eq!(book.order(tp.id).unwrap().status, OrderStatus::Cancelled);
    assert!(ledger.position("ES").is_none());
}

#[test]
fn tp_fill_cancels_sl_sibling() {
    let (_bus, mut book, mut ledger) = setup();
    let trade_id = open_long(&mut book, &mut ledger, 101.0, 1.0);
    let sl = book.submit(OrderDraft::stop_loss("ES", OrderSide::Sell, 1.0, 100.0, trade_id));
    let tp = book.submit(OrderDraft::take_profit("ES", OrderSide::Sell, 1.0, 102.0, trade_id));

    let fills = book
        .process_bar(&bar(101.0, 103.0, 100.5, 102.5), &[], 1, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].order_id, tp.id);
    assert_eq!(fills[0].price, 102.0);
    assert_eq!(book.order(sl.id).unwrap().status, OrderStatus::Cancelled);

    let trade = &ledger.closed_trades()[0];
    assert_eq!(
        trade.exit_reason,
        barsim_core::domain::ExitReason::TakeProfit
    );
    assert!((trade.profit_or_loss - 1.0).abs() < 1e-12);
}

#[test]
fn both_triggered_open_between_prefers_sl() {
    let (_bus, mut book, mut ledger) = setup();
    let trade_id = open_long(&mut book, &mut ledger, 101.0, 1.0);
    let sl = book.submit(OrderDraft::stop_loss("ES", OrderSide::Sell, 1.0, 100.0, trade_id));
    let tp = book.submit(OrderDraft::take_profit("ES", OrderSide::Sell, 1.0, 102.0, trade_id));

    let fills = book
        .process_bar(&bar(101.0, 103.0, 99.0, 100.5), &[], 1, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].order_id, sl.id);
    assert_eq!(fills[0].price, 100.0);
    assert_eq!(book.order(tp.id).unwrap().status, OrderStatus::Cancelled);
}

#[test]
fn both_triggered_open_beyond_tp_prefers_tp() {
    let (_bus, mut book, mut ledger) = setup();
    let trade_id = open_long(&mut book, &mut ledger, 101.0, 1.0);
    let sl = book.submit(OrderDraft::stop_loss("ES", OrderSide::Sell, 1.0, 100.0, trade_id));
    let tp = book.submit(OrderDraft::take_profit("ES", OrderSide::Sell, 1.0, 102.0, trade_id));

    // Gaps open above the target, then trades through both levels.
    let fills = book
        .process_bar(&bar(102.5, 103.0, 99.0, 100.0), &[], 1, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].order_id, tp.id);
    assert_eq!(book.order(sl.id).unwrap().status, OrderStatus::Cancelled);
}

#[test]
fn both_triggered_open_beyond_sl_prefers_sl() {
    let (_bus, mut book, mut ledger) = setup();
    let trade_id = open_long(&mut book, &mut ledger, 101.0, 1.0);
    let sl = book.submit(OrderDraft::stop_loss("ES", OrderSide::Sell, 1.0, 100.0, trade_id));
    let tp = book.submit(OrderDraft::take_profit("ES", OrderSide::Sell, 1.0, 102.0, trade_id));

    // Gaps open below the stop.
    let fills = book
        .process_bar(&bar(99.5, 103.0, 99.0, 102.5), &[], 1, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].order_id, sl.id);
    assert_eq!(book.order(tp.id).unwrap().status, OrderStatus::Cancelled);
}

#[test]
fn short_position_oco_sl_precedence() {
    let (_bus, mut book, mut ledger) = setup();
    let trade_id = open_short(&mut book, &mut ledger, 100.0, 1.0);
    // Short: SL is a buy stop above, TP a buy limit below.
    let sl = book.submit(OrderDraft::stop_loss("ES", OrderSide::Buy, 1.0, 101.0, trade_id));
    let tp = book.submit(OrderDraft::take_profit("ES", OrderSide::Buy, 1.0, 99.0, trade_id));

    let fills = book
        .process_bar(&bar(100.0, 102.0, 98.0, 100.0), &[], 1, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].order_id, sl.id);
    assert_eq!(fills[0].price, 101.0);
    assert_eq!(book.order(tp.id).unwrap().status, OrderStatus::Cancelled);

    let trade = &ledger.closed_trades()[0];
    assert!((trade.profit_or_loss - (-1.0)).abs() < 1e-12);
}

#[test]
fn oco_resolves_on_correct_sub_bar() {
    let (_bus, mut book, mut ledger) = setup();
    let trade_id = open_long(&mut book, &mut ledger, 101.0, 1.0);
    book.submit(OrderDraft::stop_loss("ES", OrderSide::Sell, 1.0, 100.0, trade_id));
    let tp = book.submit(OrderDraft::take_profit("ES", OrderSide::Sell, 1.0, 102.0, trade_id));

    // First sub-bar only reaches the target; second would hit the stop.
    // The sub-bar path resolves the ambiguity the main bar alone could not.
    let subs = vec![
        sub(1, 101.0, 102.5, 100.8, 102.0),
        sub(1, 102.0, 102.2, 99.0, 99.5),
    ];
    let fills = book
        .process_bar(&bar(101.0, 102.5, 99.0, 99.5), &subs, 1, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].order_id, tp.id);
    assert_eq!(fills[0].sub_bar_index, 0);
}

#[test]
fn sl_capped_by_position_size_cancels_remainder() {
    let (_bus, mut book, mut ledger) = setup();
    let trade_id = open_long(&mut book, &mut ledger, 101.0, 1.0);
    // SL quantity exceeds the open size.
    let sl = book.submit(OrderDraft::stop_loss("ES", OrderSide::Sell, 3.0, 100.0, trade_id));

    let fills = book
        .process_bar(&bar(101.0, 101.5, 99.0, 99.5), &[], 1, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].quantity, 1.0);

    let order = book.order(sl.id).unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.filled_quantity, 1.0);
    assert!(ledger.position("ES").is_none());
}

#[test]
fn closing_fill_cancels_other_protective_orders() {
    let (_bus, mut book, mut ledger) = setup();
    let trade_id = open_long(&mut book, &mut ledger, 101.0, 1.0);
    let sl = book.submit(OrderDraft::stop_loss("ES", OrderSide::Sell, 1.0, 95.0, trade_id));
    // Strategy closes with an explicit exit while the stop rests far away.
    book.submit(OrderDraft::market("ES", OrderSide::Sell, 1.0).with_role(OrderRole::Exit));

    book.process_bar(&bar(101.0, 101.5, 100.5, 101.0), &[], 1, &mut ledger)
        .unwrap();
    assert!(ledger.position("ES").is_none());
    assert_eq!(book.order(sl.id).unwrap().status, OrderStatus::Cancelled);
    assert_eq!(
        book.order(sl.id).unwrap().message.as_deref(),
        Some("parent position closed")
    );
}

#[test]
fn exit_order_capped_by_position_size() {
    let (_bus, mut book, mut ledger) = setup();
    open_long(&mut book, &mut ledger, 100.0, 2.0);
    let exit = book.submit(
        OrderDraft::market("ES", OrderSide::Sell, 5.0).with_role(OrderRole::Exit),
    );
    let fills = book
        .process_bar(&bar(101.0, 101.5, 100.5, 101.0), &[], 1, &mut ledger)
        .unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].quantity, 2.0);
    assert_eq!(book.order(exit.id).unwrap().status, OrderStatus::Cancelled);
    assert!(ledger.position("ES").is_none());
}

// ── Event ordering & marks ───────────────────────────────────────────

#[test]
fn oco_fill_event_precedes_sibling_cancel_and_position_close() {
    let (bus, mut book, mut ledger) = setup();
    let trade_id = open_long(&mut book, &mut ledger, 101.0, 1.0);
    book.submit(OrderDraft::stop_loss("ES", OrderSide::Sell, 1.0, 100.0, trade_id));
    book.submit(OrderDraft::take_profit("ES", OrderSide::Sell, 1.0, 102.0, trade_id));
    bus.clear_history();

    book.process_bar(&bar(101.0, 101.5, 99.0, 99.5), &[], 1, &mut ledger)
        .unwrap();

    let types: Vec<EventType> = bus
        .history_snapshot()
        .iter()
        .map(|m| m.event_type)
        .collect();
    let filled = types
        .iter()
        .position(|t| *t == EventType::OrderFilled)
        .unwrap();
    let cancelled = types
        .iter()
        .position(|t| *t == EventType::OrderCancelled)
        .unwrap();
    let closed = types
        .iter()
        .position(|t| *t == EventType::PositionClosed)
        .unwrap();
    assert!(filled < cancelled, "fill must precede sibling cancel");
    assert!(cancelled < closed, "sibling cancel is atomic with the fill");
}

#[test]
fn unrealized_marks_to_main_bar_close() {
    let (_bus, mut book, mut ledger) = setup();
    book.submit(OrderDraft::market("ES", OrderSide::Buy, 1.0));
    book.process_bar(&bar(100.0, 105.0, 95.0, 102.0), &[], 0, &mut ledger)
        .unwrap();
    let pos = ledger.position("ES").unwrap();
    assert!((pos.unrealized_pnl - 2.0).abs() < 1e-12);
}

#[test]
fn commission_accumulates_per_unit() {
    let (_bus, mut book, mut ledger) = setup_with_commission(0.5);
    book.submit(OrderDraft::market("ES", OrderSide::Buy, 2.0));
    let fills = book
        .process_bar(&bar(100.0, 101.0, 99.0, 100.0), &[], 0, &mut ledger)
        .unwrap();
    assert!((fills[0].commission - 1.0).abs() < 1e-12);
    let pos = ledger.position("ES").unwrap();
    assert!((pos.realized_pnl - (-1.0)).abs() < 1e-12);
}
