//! Engine driver — lifecycle and the bar-by-bar pipeline.
//!
//! Per bar, in order: publish `BarReceived`; run every strategy and route
//! its signal, indicators and orders onto the bus; drain queued commands
//! into the book; match the bar; sample equity; emit `ProgressUpdate`.
//! The loop is strictly sequential — one bar's full pipeline completes
//! before the next bar begins, which is what makes replays deterministic.

use crate::book::{BookError, OrderBook};
use crate::bus::{EventBus, EventType, Payload, Subscription, Topic};
use crate::cache::StateCache;
use crate::domain::{
    validate_sub_bars, Bar, BarError, ExitReason, IdGen, ModifyRequest, OrderDraft, OrderId,
    RunId, SubBar,
};
use crate::engine::{BacktestReport, EngineConfig};
use crate::ledger::PositionLedger;
use crate::strategy::Strategy;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
    Paused,
    Stopped,
    Error,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid lifecycle transition: {from:?} → {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: &'static str,
    },

    #[error("cannot start: no strategies registered")]
    NoStrategies,

    #[error("cannot start: no bars loaded")]
    NoData,

    #[error("sub-bar references bar {parent_index} but only {bar_count} bars are loaded")]
    SubBarOutOfRange {
        parent_index: usize,
        bar_count: usize,
    },

    #[error(transparent)]
    Bar(#[from] BarError),

    #[error(transparent)]
    Matching(#[from] BookError),
}

/// How a `run`/`resume` call ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(Box<BacktestReport>),
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ControlRequest {
    #[default]
    None,
    Pause,
    Stop,
}

/// Cloneable handle for requesting pause/stop from inside bus handlers or
/// strategies. Requests take effect at the top of the next bar; the current
/// bar's matching always completes.
#[derive(Clone, Default)]
pub struct EngineControl {
    request: Rc<Cell<ControlRequest>>,
}

impl EngineControl {
    pub fn pause(&self) {
        // Stop wins over pause if both were requested in one bar.
        if self.request.get() != ControlRequest::Stop {
            self.request.set(ControlRequest::Pause);
        }
    }

    pub fn stop(&self) {
        self.request.set(ControlRequest::Stop);
    }

    fn take(&self) -> ControlRequest {
        let req = self.request.get();
        self.request.set(ControlRequest::None);
        req
    }
}

/// Commands strategies published on the bus, waiting to be drained into the
/// book before matching.
#[derive(Default)]
struct CommandInbox {
    cancels: Vec<OrderId>,
    modifies: Vec<ModifyRequest>,
    submissions: Vec<OrderDraft>,
}

/// The backtest engine.
pub struct Engine {
    config: EngineConfig,
    bus: Rc<EventBus>,
    cache: Rc<RefCell<StateCache>>,
    book: OrderBook,
    ledger: PositionLedger,
    id_gen: Rc<RefCell<IdGen>>,
    strategies: Vec<Box<dyn Strategy>>,
    bars: Vec<Bar>,
    sub_bars: HashMap<usize, Vec<SubBar>>,
    state: LifecycleState,
    control: EngineControl,
    inbox: Rc<RefCell<CommandInbox>>,
    subscriptions: Vec<Subscription>,
    cursor: usize,
    /// Equity sampled after each bar's matching, aligned to bar indices.
    equity_curve: Vec<f64>,
}

impl Engine {
    /// Wire an engine to an existing bus and cache. The caller keeps the
    /// cache subscription alive by holding the cache `Rc`; each test can
    /// construct a fully isolated engine this way.
    pub fn new(config: EngineConfig, bus: Rc<EventBus>, cache: Rc<RefCell<StateCache>>) -> Self {
        bus.set_history_limit(config.history_limit);

        let id_gen = Rc::new(RefCell::new(IdGen::default()));
        let book = OrderBook::new(
            Rc::clone(&bus),
            Rc::clone(&id_gen),
            config.tick_size,
            config.commission_per_unit,
        );
        let ledger = PositionLedger::new(Rc::clone(&bus), Rc::clone(&id_gen), config.initial_balance);

        let inbox = Rc::new(RefCell::new(CommandInbox::default()));
        let subscriptions = Self::subscribe_commands(&bus, &inbox);

        Self {
            config,
            bus,
            cache,
            book,
            ledger,
            id_gen,
            strategies: Vec::new(),
            bars: Vec::new(),
            sub_bars: HashMap::new(),
            state: LifecycleState::Idle,
            control: EngineControl::default(),
            inbox,
            subscriptions,
            cursor: 0,
            equity_curve: Vec::new(),
        }
    }

    /// Route `SubmitOrder` / `CancelOrder` / `ModifyOrder` messages into the
    /// command inbox, drained before each bar's matching.
    fn subscribe_commands(
        bus: &Rc<EventBus>,
        inbox: &Rc<RefCell<CommandInbox>>,
    ) -> Vec<Subscription> {
        let mut subscriptions = Vec::new();

        let submissions = Rc::clone(inbox);
        subscriptions.push(bus.subscribe(Topic::Type(EventType::SubmitOrder), move |msg| {
            if let Payload::Draft(draft) = &msg.payload {
                submissions.borrow_mut().submissions.push(draft.clone());
            }
            Ok(())
        }));
        let cancels = Rc::clone(inbox);
        subscriptions.push(bus.subscribe(Topic::Type(EventType::CancelOrder), move |msg| {
            if let Payload::Cancel { order_id } = &msg.payload {
                cancels.borrow_mut().cancels.push(*order_id);
            }
            Ok(())
        }));
        let modifies = Rc::clone(inbox);
        subscriptions.push(bus.subscribe(Topic::Type(EventType::ModifyOrder), move |msg| {
            if let Payload::Modify(req) = &msg.payload {
                modifies.borrow_mut().modifies.push(req.clone());
            }
            Ok(())
        }));

        subscriptions
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> Rc<EventBus> {
        Rc::clone(&self.bus)
    }

    pub fn cache(&self) -> Rc<RefCell<StateCache>> {
        Rc::clone(&self.cache)
    }

    /// Handle for cooperative pause/stop from handlers and strategies.
    pub fn control(&self) -> EngineControl {
        self.control.clone()
    }

    pub fn order_book(&self) -> &OrderBook {
        &self.book
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    // ── Setup (Idle only) ──────────────────────────────────────────────

    pub fn add_strategy(&mut self, strategy: Box<dyn Strategy>) -> Result<(), EngineError> {
        self.require_idle("add_strategy")?;
        self.bus.publish(
            EventType::StrategyInitialized,
            "engine",
            Payload::Strategy {
                name: strategy.name().to_string(),
                version: strategy.version().to_string(),
            },
        );
        self.strategies.push(strategy);
        Ok(())
    }

    /// Load the bar series, validating the range invariant of every bar.
    pub fn load_bars(&mut self, bars: Vec<Bar>) -> Result<(), EngineError> {
        self.require_idle("load_bars")?;
        for bar in &bars {
            bar.validate()?;
        }
        self.bars = bars;
        Ok(())
    }

    /// Load sub-bar refinements, grouped and validated per parent bar.
    /// Bars must be loaded first.
    pub fn load_sub_bars(&mut self, sub_bars: Vec<SubBar>) -> Result<(), EngineError> {
        self.require_idle("load_sub_bars")?;
        let mut grouped: HashMap<usize, Vec<SubBar>> = HashMap::new();
        for sb in sub_bars {
            if sb.parent_bar_index >= self.bars.len() {
                return Err(EngineError::SubBarOutOfRange {
                    parent_index: sb.parent_bar_index,
                    bar_count: self.bars.len(),
                });
            }
            grouped.entry(sb.parent_bar_index).or_default().push(sb);
        }
        for (index, subs) in &grouped {
            validate_sub_bars(&self.bars[*index], *index, subs)?;
        }
        self.sub_bars = grouped;
        Ok(())
    }

    fn require_idle(&self, operation: &'static str) -> Result<(), EngineError> {
        if self.state == LifecycleState::Idle {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                from: self.state,
                to: operation,
            })
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Start the replay. Requires at least one strategy and a non-empty bar
    /// sequence.
    pub fn run(&mut self) -> Result<RunOutcome, EngineError> {
        self.require_idle("run")?;
        if self.strategies.is_empty() {
            return Err(EngineError::NoStrategies);
        }
        if self.bars.is_empty() {
            return Err(EngineError::NoData);
        }

        self.state = LifecycleState::Running;
        for strategy in &self.strategies {
            self.bus.publish(
                EventType::StrategyStarted,
                "engine",
                Payload::Strategy {
                    name: strategy.name().to_string(),
                    version: strategy.version().to_string(),
                },
            );
        }
        self.drive()
    }

    /// Continue a paused replay.
    pub fn resume(&mut self) -> Result<RunOutcome, EngineError> {
        if self.state != LifecycleState::Paused {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to: "resume",
            });
        }
        self.state = LifecycleState::Running;
        self.drive()
    }

    /// Stop a paused replay without finishing it.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        if self.state != LifecycleState::Paused {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to: "stop",
            });
        }
        self.finish_stopped();
        Ok(())
    }

    /// Publish `StrategyDisposed` for every strategy and release the
    /// engine's bus subscriptions.
    pub fn dispose(&mut self) {
        for strategy in &self.strategies {
            self.bus.publish(
                EventType::StrategyDisposed,
                "engine",
                Payload::Strategy {
                    name: strategy.name().to_string(),
                    version: strategy.version().to_string(),
                },
            );
        }
        self.subscriptions.clear();
        self.state = LifecycleState::Stopped;
    }

    /// Return to `Idle` with fresh book, ledger and cache state. Strategies
    /// stay registered but are reset. Idempotent.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        if self.state == LifecycleState::Running {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to: "reset",
            });
        }
        self.book = OrderBook::new(
            Rc::clone(&self.bus),
            Rc::clone(&self.id_gen),
            self.config.tick_size,
            self.config.commission_per_unit,
        );
        self.ledger.reset();
        self.cache.borrow_mut().reset();
        for strategy in &mut self.strategies {
            strategy.reset();
        }
        *self.inbox.borrow_mut() = CommandInbox::default();
        // A prior `stop` released the command subscriptions; restore them.
        if self.subscriptions.is_empty() {
            self.subscriptions = Self::subscribe_commands(&self.bus, &self.inbox);
        }
        self.cursor = 0;
        self.equity_curve.clear();
        self.state = LifecycleState::Idle;
        Ok(())
    }

    // ── The loop ───────────────────────────────────────────────────────

    fn drive(&mut self) -> Result<RunOutcome, EngineError> {
        let total = self.bars.len();
        while self.cursor < total {
            match self.control.take() {
                ControlRequest::Pause => {
                    self.state = LifecycleState::Paused;
                    return Ok(RunOutcome::Paused);
                }
                ControlRequest::Stop => {
                    self.finish_stopped();
                    return Ok(RunOutcome::Stopped);
                }
                ControlRequest::None => {}
            }

            let index = self.cursor;
            if let Err(err) = self.process_one_bar(index) {
                self.state = LifecycleState::Error;
                return Err(err);
            }
            self.cursor += 1;
        }

        Ok(RunOutcome::Completed(Box::new(self.finish_completed())))
    }

    fn process_one_bar(&mut self, index: usize) -> Result<(), EngineError> {
        let bar = self.bars[index].clone();
        let subs: Vec<SubBar> = self.sub_bars.get(&index).cloned().unwrap_or_default();
        let is_last = index + 1 == self.bars.len();

        self.bus.set_time(bar.time);
        self.bus.publish(
            EventType::BarReceived,
            "engine",
            Payload::Bar {
                contract_id: self.config.symbol.clone(),
                timeframe: self.config.timeframe.clone(),
                index,
                bar: bar.clone(),
            },
        );

        // Strategies see the bar before any matching happens.
        for strategy in self.strategies.iter_mut() {
            let output = strategy.process_bar(&bar, &subs, index, &self.bars[..index]);

            if let Some(signal) = output.signal {
                self.bus
                    .publish(EventType::SignalGenerated, "engine", Payload::Signal(signal));
            }
            if !output.indicators.is_empty() {
                self.bus.publish(
                    EventType::MarketUpdate,
                    "engine",
                    Payload::Indicators {
                        strategy: strategy.name().to_string(),
                        values: output.indicators,
                    },
                );
            }
            self.inbox
                .borrow_mut()
                .submissions
                .extend(output.orders);
        }

        // Drain queued commands: cancels and modifies first so a
        // cancel-and-replace settles before the replacement is matched.
        let inbox = std::mem::take(&mut *self.inbox.borrow_mut());
        for order_id in inbox.cancels {
            if !self.book.cancel(order_id) {
                eprintln!("engine: cancel of unknown or terminal order {order_id}");
            }
        }
        for request in inbox.modifies {
            if let Err(err) = self.book.modify(&request) {
                eprintln!("engine: modify rejected: {err}");
            }
        }
        for draft in inbox.submissions {
            self.book.submit(draft);
        }

        // Match the bar; fills, OCO cancels and position events publish
        // from inside the book and ledger.
        self.book
            .process_bar(&bar, &subs, index, &mut self.ledger)?;

        // End of data: close whatever is still open at the last close, and
        // retire resting orders, before the final equity sample.
        if is_last {
            let open_contracts: Vec<String> = self
                .ledger
                .open_positions()
                .map(|p| p.contract_id.clone())
                .collect();
            for contract in open_contracts {
                self.ledger
                    .close_position(&contract, bar.close, bar.time, ExitReason::Manual);
            }
            self.book.cancel_all_by_contract(None);
        }

        let balance = self.ledger.balance();
        let unrealized = self.ledger.unrealized_total();
        self.equity_curve.push(balance + unrealized);
        self.bus.publish(
            EventType::MarketUpdate,
            "engine",
            Payload::Equity {
                bar_index: index,
                balance,
                unrealized_pnl: unrealized,
                equity: balance + unrealized,
            },
        );

        let interval = self.config.progress_update_interval;
        if interval > 0 && (index + 1) % interval == 0 {
            self.bus.publish(
                EventType::ProgressUpdate,
                "engine",
                Payload::Progress {
                    current: index + 1,
                    total: self.bars.len(),
                    equity: balance + unrealized,
                },
            );
        }

        Ok(())
    }

    fn finish_completed(&mut self) -> BacktestReport {
        let run_id = self.run_id();
        let equity_curve = self.equity_curve.clone();
        let report = BacktestReport::compute(
            run_id.clone(),
            &self.config,
            self.bars.len(),
            equity_curve,
            self.ledger.closed_trades().to_vec(),
            self.ledger.balance(),
            self.ledger.equity(),
        );

        self.bus.publish(
            EventType::BacktestComplete,
            "engine",
            Payload::Complete {
                bars_processed: report.bars_processed,
                trade_count: report.trade_count,
                final_equity: report.final_equity,
                run_id,
            },
        );
        self.emit_strategy_stopped();
        self.state = LifecycleState::Stopped;
        report
    }

    fn finish_stopped(&mut self) {
        self.emit_strategy_stopped();
        self.subscriptions.clear();
        self.state = LifecycleState::Stopped;
    }

    fn emit_strategy_stopped(&self) {
        for strategy in &self.strategies {
            self.bus.publish(
                EventType::StrategyStopped,
                "engine",
                Payload::Strategy {
                    name: strategy.name().to_string(),
                    version: strategy.version().to_string(),
                },
            );
        }
    }

    /// BLAKE3 fingerprint over the config and the loaded bar series.
    fn run_id(&self) -> RunId {
        let config_bytes = self.config.fingerprint_bytes();
        let mut bar_bytes = Vec::with_capacity(self.bars.len() * 16);
        for bar in &self.bars {
            bar_bytes.extend_from_slice(&bar.time.to_le_bytes());
            bar_bytes.extend_from_slice(&bar.close.to_le_bytes());
        }
        RunId::from_chunks([config_bytes.as_slice(), bar_bytes.as_slice()])
    }
}
