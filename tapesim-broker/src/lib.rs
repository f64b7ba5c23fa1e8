//! Per-client order book that matches resting orders against replayed
//! market data.
//!
//! The broker is deliberately infallible: order-domain problems (duplicate
//! ids, invalid side/effect combinations) come back as `Rejected` states
//! rather than errors, and the matching pass only ever returns updated
//! states plus fills. Iteration is insertion-ordered so a replay produces
//! the same fills on every run.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::debug;
use uuid::Uuid;

use tapesim_core::{
    Bar, Fill, LongLot, MarketRecord, OrderAmend, OrderId, OrderRequest, OrderState, OrderStatus,
    OrderType, Position, Price, Qty, Quote, ReplayBatch, ShortLot, Side, SimConfig, Symbol,
};

/// Result of one matching pass over a replay batch.
#[derive(Clone, Debug, Default)]
pub struct MatchOutcome {
    /// Every order state that changed during the pass, including stop
    /// conversions, in the order the changes happened.
    pub updated: Vec<OrderState>,
    pub fills: Vec<Fill>,
    /// Realised PnL delta per fill, parallel to `fills`; zero for fills
    /// that only open lots.
    pub realised: Vec<f64>,
}

impl MatchOutcome {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.fills.is_empty()
    }
}

/// Order book, matching engine and position ledger for one client.
pub struct Broker {
    config: SimConfig,
    open_orders: IndexMap<OrderId, OrderState>,
    open_symbols: HashMap<Symbol, usize>,
    position: Position,
    clock: DateTime<Utc>,
}

impl Broker {
    /// Seed a broker with the client's login configuration.
    #[must_use]
    pub fn new(config: SimConfig, now: DateTime<Utc>) -> Self {
        Self {
            open_orders: IndexMap::new(),
            open_symbols: HashMap::new(),
            position: Position::new(config.initial_cash, now),
            config,
            clock: now,
        }
    }

    /// Advance the broker's notion of replay time. Fills and state
    /// transitions are stamped with this clock.
    pub fn set_clock(&mut self, ts: DateTime<Utc>) {
        self.clock = ts;
    }

    #[must_use]
    pub fn position(&self) -> &Position {
        &self.position
    }

    /// Snapshot of every resting order in insertion order.
    #[must_use]
    pub fn open_orders(&self) -> Vec<OrderState> {
        self.open_orders.values().cloned().collect()
    }

    /// True when any record of the batch touches a symbol with resting
    /// orders.
    #[must_use]
    pub fn touches(&self, batch: &ReplayBatch) -> bool {
        batch
            .data
            .iter()
            .any(|record| self.open_symbols.contains_key(record.symbol()))
    }

    /// Accept or reject a batch of order requests. One state is returned
    /// per input, in input order; rejected requests never enter the book.
    pub fn submit(&mut self, orders: Vec<OrderRequest>) -> Vec<OrderState> {
        let mut states = Vec::with_capacity(orders.len());
        for request in orders {
            if let Err(reason) = request.validate() {
                debug!(id = %request.id, %reason, "order rejected");
                states.push(OrderState::rejected(request, self.clock));
                continue;
            }
            if self.open_orders.contains_key(&request.id) {
                debug!(id = %request.id, "order rejected: duplicate id");
                states.push(OrderState::rejected(request, self.clock));
                continue;
            }
            let state = OrderState::open(request, self.clock);
            *self
                .open_symbols
                .entry(state.symbol().to_string())
                .or_insert(0) += 1;
            self.open_orders.insert(state.id().to_string(), state.clone());
            states.push(state);
        }
        self.debug_check();
        states
    }

    /// Apply partial updates to resting orders. Unknown ids are skipped;
    /// shrinking an order below its filled quantity cancels it.
    pub fn amend(&mut self, amendments: &[OrderAmend]) -> Vec<OrderState> {
        let mut states = Vec::new();
        for amendment in amendments {
            let Some(state) = self.open_orders.get_mut(&amendment.id) else {
                continue;
            };
            if let Some(price) = amendment.price {
                state.request.price = Some(price);
            }
            if let Some(stop_price) = amendment.stop_price {
                state.request.stop_price = Some(stop_price);
            }
            if let Some(quantity) = amendment.quantity {
                state.request.quantity = quantity;
            }
            state.remaining_quantity = state.request.quantity - state.filled_quantity;
            state.modified = self.clock;
            if state.remaining_quantity < 0.0 {
                state.remaining_quantity = 0.0;
                state.status = OrderStatus::Cancelled;
                let snapshot = state.clone();
                self.remove_order(&amendment.id);
                states.push(snapshot);
            } else {
                states.push(state.clone());
            }
        }
        self.debug_check();
        states
    }

    /// Cancel the listed orders; only ids that were actually resting
    /// produce a state.
    pub fn cancel(&mut self, ids: &[OrderId]) -> Vec<OrderState> {
        let mut states = Vec::new();
        for id in ids {
            let Some(state) = self.open_orders.get_mut(id) else {
                continue;
            };
            state.status = OrderStatus::Cancelled;
            state.modified = self.clock;
            states.push(state.clone());
            self.remove_order(id);
        }
        self.debug_check();
        states
    }

    /// Cancel every resting order.
    pub fn cancel_all(&mut self) -> Vec<OrderState> {
        let ids: Vec<OrderId> = self.open_orders.keys().cloned().collect();
        self.cancel(&ids)
    }

    /// Run the matching pass for one replay batch: stop conversion, fill
    /// triggering/pricing, volume shaping, slippage, commission and FIFO
    /// position application.
    pub fn process_batch(&mut self, batch: &ReplayBatch) -> MatchOutcome {
        self.clock = batch.timestamp;
        let mut outcome = MatchOutcome::default();

        // Latest record per symbol; later rows win within one epoch.
        let mut records: HashMap<&str, &MarketRecord> = HashMap::new();
        for record in &batch.data {
            records.insert(record.symbol(), record);
        }

        let ids: Vec<OrderId> = self.open_orders.keys().cloned().collect();

        // Stop conversion first so freshly converted orders are eligible
        // for the fill pass of the same batch.
        for id in &ids {
            let Some(state) = self.open_orders.get_mut(id) else {
                continue;
            };
            if !matches!(
                state.request.order_type,
                OrderType::Stop | OrderType::StopLimit
            ) {
                continue;
            }
            let Some(record) = records.get(state.symbol()).copied() else {
                continue;
            };
            let Some(stop_price) = state.request.stop_price else {
                continue;
            };
            if stop_triggered(record, state.request.side, stop_price) {
                state.request.order_type = match state.request.order_type {
                    OrderType::Stop => OrderType::Market,
                    _ => OrderType::Limit,
                };
                state.modified = self.clock;
                outcome.updated.push(state.clone());
            }
        }

        let mut filled_ids = Vec::new();
        for id in &ids {
            let Some(state) = self.open_orders.get(id) else {
                continue;
            };
            if !matches!(
                state.request.order_type,
                OrderType::Market | OrderType::Limit
            ) {
                continue;
            }
            let Some(record) = records.get(state.symbol()).copied() else {
                continue;
            };
            let Some(price) = match_price(record, &state.request) else {
                continue;
            };
            let Some(quantity) = self.shape_quantity(state.remaining_quantity, record) else {
                continue;
            };
            let price = self.adjust_price(price, quantity, state.request.side, record);
            let commission = self.config.commission.charge(price * quantity);

            let Some(state) = self.open_orders.get_mut(id) else {
                continue;
            };
            let fill = Fill {
                id: Uuid::new_v4().to_string(),
                order_id: state.id().to_string(),
                symbol: state.symbol().to_string(),
                side: state.request.side,
                price,
                quantity,
                commission,
                created: self.clock,
            };
            state.filled_quantity += quantity;
            state.remaining_quantity -= quantity;
            state.status = if state.remaining_quantity > 0.0 {
                OrderStatus::Partial
            } else {
                OrderStatus::Filled
            };
            state.modified = self.clock;
            let effect = state.request.effect;
            if state.status == OrderStatus::Filled {
                filled_ids.push(id.clone());
            }
            outcome.updated.push(state.clone());
            let realised = self.apply_fill(&fill, effect);
            outcome.realised.push(realised);
            outcome.fills.push(fill);
        }

        for id in &filled_ids {
            self.remove_order(id);
        }
        self.debug_check();
        outcome
    }

    /// Quantity actually tradable this batch under the participation cap.
    fn shape_quantity(&self, remaining: Qty, record: &MarketRecord) -> Option<Qty> {
        let cap = match (
            record.volume(),
            self.config.slippage.volume.max_participation,
        ) {
            (Some(volume), Some(participation)) => volume * participation,
            _ => f64::INFINITY,
        };
        let quantity = if remaining <= cap {
            remaining
        } else if self.config.slippage.volume.allow_partial_fills {
            cap
        } else {
            return None;
        };
        (quantity > 0.0).then_some(quantity)
    }

    /// Additive price slippage: fixed basis points plus linear market
    /// impact scaled by participation.
    fn adjust_price(&self, price: Price, quantity: Qty, side: Side, record: &MarketRecord) -> Price {
        let spec = self.config.slippage.price;
        let mut slip = spec.fixed / 10_000.0 * price;
        if let Some(volume) = record.volume() {
            if volume > 0.0 {
                slip += quantity / volume * spec.market_impact * price;
            }
        }
        match side {
            Side::Buy => price + slip,
            Side::Sell => price - slip,
        }
    }

    /// FIFO position update for one fill. Returns the realised PnL delta
    /// (zero for opening fills).
    fn apply_fill(&mut self, fill: &Fill, effect: tapesim_core::OrderEffect) -> f64 {
        use tapesim_core::OrderEffect::*;
        let notional = fill.price * fill.quantity;
        let realised_before = self.position.realised_pnl;
        match effect {
            OpenLong => {
                self.position.cash -= notional;
                self.position
                    .long
                    .entry(fill.symbol.clone())
                    .or_default()
                    .push(LongLot {
                        quantity: fill.quantity,
                        price: fill.price,
                        total_cost: notional,
                    });
            }
            OpenShort => {
                self.position.cash += notional;
                self.position
                    .short
                    .entry(fill.symbol.clone())
                    .or_default()
                    .push(ShortLot {
                        quantity: fill.quantity,
                        price: fill.price,
                        total_proceeds: notional,
                    });
            }
            CloseLong => {
                let mut to_close = fill.quantity;
                if let Some(lots) = self.position.long.get_mut(&fill.symbol) {
                    while to_close > 0.0 && !lots.is_empty() {
                        let lot = &mut lots[0];
                        let consumed = lot.quantity.min(to_close);
                        lot.quantity -= consumed;
                        lot.total_cost -= consumed * lot.price;
                        self.position.realised_pnl += (fill.price - lot.price) * consumed;
                        self.position.cash += fill.price * consumed;
                        to_close -= consumed;
                        if lot.quantity <= 0.0 {
                            lots.remove(0);
                        }
                    }
                }
                if self
                    .position
                    .long
                    .get(&fill.symbol)
                    .is_some_and(Vec::is_empty)
                {
                    self.position.long.remove(&fill.symbol);
                }
            }
            CloseShort => {
                let mut to_close = fill.quantity;
                if let Some(lots) = self.position.short.get_mut(&fill.symbol) {
                    while to_close > 0.0 && !lots.is_empty() {
                        let lot = &mut lots[0];
                        let consumed = lot.quantity.min(to_close);
                        lot.quantity -= consumed;
                        lot.total_proceeds -= consumed * lot.price;
                        self.position.realised_pnl += (lot.price - fill.price) * consumed;
                        self.position.cash -= fill.price * consumed;
                        to_close -= consumed;
                        if lot.quantity <= 0.0 {
                            lots.remove(0);
                        }
                    }
                }
                if self
                    .position
                    .short
                    .get(&fill.symbol)
                    .is_some_and(Vec::is_empty)
                {
                    self.position.short.remove(&fill.symbol);
                }
            }
        }
        self.position.cash -= fill.commission;
        self.position.total_commission += fill.commission;
        self.position.modified = fill.created;
        self.position.realised_pnl - realised_before
    }

    fn remove_order(&mut self, id: &str) {
        if let Some(state) = self.open_orders.shift_remove(id) {
            let symbol = state.symbol().to_string();
            if let Some(count) = self.open_symbols.get_mut(&symbol) {
                *count -= 1;
                if *count == 0 {
                    self.open_symbols.remove(&symbol);
                }
            }
        }
    }

    /// Structural invariants checked after every mutating operation.
    /// Exposed so tests can call it directly.
    pub fn check_invariants(&self) {
        let refcount_total: usize = self.open_symbols.values().sum();
        assert_eq!(refcount_total, self.open_orders.len());
        for state in self.open_orders.values() {
            assert!(
                matches!(state.status, OrderStatus::Open | OrderStatus::Partial),
                "terminal order left in book: {:?}",
                state
            );
            assert!(
                (state.filled_quantity + state.remaining_quantity - state.request.quantity).abs()
                    < 1e-9
            );
        }
        for lots in self.position.long.values() {
            assert!(lots.iter().all(|lot| lot.quantity > 0.0));
        }
        for lots in self.position.short.values() {
            assert!(lots.iter().all(|lot| lot.quantity > 0.0));
        }
    }

    fn debug_check(&self) {
        #[cfg(debug_assertions)]
        self.check_invariants();
    }
}

/// Tick stops compare against the last trade price; bar stops against the
/// bar's extremes. The asymmetry is intentional.
fn stop_triggered(record: &MarketRecord, side: Side, stop_price: Price) -> bool {
    match (record, side) {
        (MarketRecord::Quote(quote), Side::Buy) => quote.price >= stop_price,
        (MarketRecord::Quote(quote), Side::Sell) => quote.price <= stop_price,
        (MarketRecord::Bar(bar), Side::Buy) => bar.high >= stop_price,
        (MarketRecord::Bar(bar), Side::Sell) => bar.low <= stop_price,
    }
}

/// Price an order would match at against one record, or `None` when it
/// does not trigger.
fn match_price(record: &MarketRecord, request: &OrderRequest) -> Option<Price> {
    match record {
        MarketRecord::Quote(quote) => match_quote(quote, request),
        MarketRecord::Bar(bar) => match_bar(bar, request),
    }
}

fn match_quote(quote: &Quote, request: &OrderRequest) -> Option<Price> {
    match (request.order_type, request.side) {
        (OrderType::Market, Side::Buy) => Some(quote.ask.unwrap_or(quote.price)),
        (OrderType::Market, Side::Sell) => Some(quote.bid.unwrap_or(quote.price)),
        (OrderType::Limit, Side::Buy) => {
            let ask = quote.ask.unwrap_or(quote.price);
            (ask <= request.price?).then_some(ask)
        }
        (OrderType::Limit, Side::Sell) => {
            let bid = quote.bid.unwrap_or(quote.price);
            (bid >= request.price?).then_some(bid)
        }
        _ => None,
    }
}

fn match_bar(bar: &Bar, request: &OrderRequest) -> Option<Price> {
    match (request.order_type, request.side) {
        (OrderType::Market, _) => Some(bar.open),
        (OrderType::Limit, Side::Buy) => {
            let limit = request.price?;
            (bar.low <= limit).then_some(limit.min(bar.open))
        }
        (OrderType::Limit, Side::Sell) => {
            let limit = request.price?;
            (bar.high >= limit).then_some(limit.max(bar.open))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tapesim_core::{OrderEffect, PriceSnapshot, PriceSlippage, VolumeSlippage};

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + seconds, 0).unwrap()
    }

    fn quote(symbol: &str, price: f64) -> MarketRecord {
        MarketRecord::Quote(Quote {
            symbol: symbol.into(),
            timestamp: ts(0),
            price,
            bid: None,
            ask: None,
            volume: None,
        })
    }

    fn quote_full(symbol: &str, price: f64, bid: f64, ask: f64) -> MarketRecord {
        MarketRecord::Quote(Quote {
            symbol: symbol.into(),
            timestamp: ts(0),
            price,
            bid: Some(bid),
            ask: Some(ask),
            volume: None,
        })
    }

    fn bar(symbol: &str, open: f64, high: f64, low: f64, close: f64, volume: f64) -> MarketRecord {
        MarketRecord::Bar(Bar {
            symbol: symbol.into(),
            timestamp: ts(0),
            open,
            high,
            low,
            close,
            volume: Some(volume),
            price: None,
        })
    }

    fn batch(records: Vec<MarketRecord>) -> ReplayBatch {
        ReplayBatch {
            timestamp: ts(1),
            data: records,
        }
    }

    fn market_buy(id: &str, symbol: &str, quantity: f64) -> OrderRequest {
        OrderRequest {
            id: id.into(),
            symbol: symbol.into(),
            side: Side::Buy,
            effect: OrderEffect::OpenLong,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
        }
    }

    fn limit_buy(id: &str, symbol: &str, quantity: f64, price: f64) -> OrderRequest {
        OrderRequest {
            order_type: OrderType::Limit,
            price: Some(price),
            ..market_buy(id, symbol, quantity)
        }
    }

    fn broker() -> Broker {
        Broker::new(SimConfig::default(), ts(0))
    }

    #[test]
    fn market_buy_fills_at_tick_price() {
        let mut broker = broker();
        broker.submit(vec![market_buy("o1", "X", 10.0)]);
        let outcome = broker.process_batch(&batch(vec![quote("X", 100.0)]));

        assert_eq!(outcome.fills.len(), 1);
        let fill = &outcome.fills[0];
        assert_eq!(fill.order_id, "o1");
        assert_eq!(fill.price, 100.0);
        assert_eq!(fill.quantity, 10.0);
        assert_eq!(fill.commission, 0.0);
        assert_eq!(outcome.updated.last().unwrap().status, OrderStatus::Filled);
        assert_eq!(outcome.updated.last().unwrap().filled_quantity, 10.0);

        let position = broker.position();
        assert_eq!(position.cash, 10_000.0 - 1_000.0);
        assert_eq!(position.long["X"].len(), 1);
        assert_eq!(position.long["X"][0].quantity, 10.0);
        assert_eq!(position.long["X"][0].price, 100.0);
        assert!(broker.open_orders().is_empty());
        broker.check_invariants();
    }

    #[test]
    fn limit_buy_above_ask_does_not_trigger() {
        let mut broker = broker();
        broker.submit(vec![limit_buy("o2", "X", 5.0, 99.0)]);
        let outcome = broker.process_batch(&batch(vec![quote_full("X", 100.0, 99.5, 100.0)]));
        assert!(outcome.fills.is_empty());
        let open = broker.open_orders();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, OrderStatus::Open);
    }

    #[test]
    fn participation_cap_produces_partial_fill() {
        let mut config = SimConfig::default();
        config.slippage.volume = VolumeSlippage {
            max_participation: Some(0.1),
            allow_partial_fills: true,
        };
        let mut broker = Broker::new(config, ts(0));
        broker.submit(vec![market_buy("o1", "X", 1_000.0)]);
        let outcome =
            broker.process_batch(&batch(vec![bar("X", 50.0, 51.0, 49.0, 50.5, 5_000.0)]));

        assert_eq!(outcome.fills.len(), 1);
        assert_eq!(outcome.fills[0].quantity, 500.0);
        let state = outcome.updated.last().unwrap();
        assert_eq!(state.status, OrderStatus::Partial);
        assert_eq!(state.remaining_quantity, 500.0);
        assert_eq!(broker.open_orders().len(), 1);
        broker.check_invariants();
    }

    #[test]
    fn participation_cap_without_partials_skips() {
        let mut config = SimConfig::default();
        config.slippage.volume = VolumeSlippage {
            max_participation: Some(0.1),
            allow_partial_fills: false,
        };
        let mut broker = Broker::new(config, ts(0));
        broker.submit(vec![market_buy("o1", "X", 1_000.0)]);
        let outcome =
            broker.process_batch(&batch(vec![bar("X", 50.0, 51.0, 49.0, 50.5, 5_000.0)]));
        assert!(outcome.fills.is_empty());
        assert_eq!(broker.open_orders()[0].status, OrderStatus::Open);
    }

    #[test]
    fn duplicate_id_is_rejected_without_mutation() {
        let mut broker = broker();
        let states = broker.submit(vec![market_buy("o3", "X", 1.0), market_buy("o3", "X", 2.0)]);
        assert_eq!(states[0].status, OrderStatus::Open);
        assert_eq!(states[1].status, OrderStatus::Rejected);
        let open = broker.open_orders();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].request.quantity, 1.0);
        broker.check_invariants();
    }

    #[test]
    fn invalid_side_effect_is_rejected() {
        let mut broker = broker();
        let mut bad = market_buy("o4", "X", 1.0);
        bad.effect = OrderEffect::OpenShort;
        let states = broker.submit(vec![bad]);
        assert_eq!(states[0].status, OrderStatus::Rejected);
        assert!(broker.open_orders().is_empty());
    }

    #[test]
    fn stop_converts_on_tick_and_fills_same_batch() {
        let mut broker = broker();
        let mut stop = market_buy("s1", "X", 1.0);
        stop.order_type = OrderType::Stop;
        stop.stop_price = Some(105.0);
        broker.submit(vec![stop]);

        // Below the stop: nothing happens.
        let outcome = broker.process_batch(&batch(vec![quote("X", 104.9)]));
        assert!(outcome.is_empty());

        let outcome = broker.process_batch(&batch(vec![quote("X", 105.0)]));
        // First update is the conversion snapshot, second the fill.
        assert_eq!(outcome.updated.len(), 2);
        assert_eq!(outcome.updated[0].request.order_type, OrderType::Market);
        assert_eq!(outcome.updated[0].status, OrderStatus::Open);
        assert_eq!(outcome.updated[1].status, OrderStatus::Filled);
        assert_eq!(outcome.fills.len(), 1);
    }

    #[test]
    fn bar_stop_triggers_on_high_even_when_close_is_below() {
        let mut broker = broker();
        let mut stop = market_buy("s2", "X", 1.0);
        stop.order_type = OrderType::StopLimit;
        stop.stop_price = Some(105.0);
        stop.price = Some(106.0);
        broker.submit(vec![stop]);

        let outcome =
            broker.process_batch(&batch(vec![bar("X", 100.0, 105.5, 99.0, 101.0, 10.0)]));
        let converted = &outcome.updated[0];
        assert_eq!(converted.request.order_type, OrderType::Limit);
        // Limit 106 vs bar.low 99 -> fills at min(106, open 100).
        assert_eq!(outcome.fills[0].price, 100.0);
    }

    #[test]
    fn bar_limit_sell_fills_at_max_of_limit_and_open() {
        let mut broker = broker();
        // Seed a long lot so the close has something to consume.
        broker.submit(vec![market_buy("seed", "X", 2.0)]);
        broker.process_batch(&batch(vec![quote("X", 100.0)]));

        let sell = OrderRequest {
            id: "l1".into(),
            symbol: "X".into(),
            side: Side::Sell,
            effect: OrderEffect::CloseLong,
            order_type: OrderType::Limit,
            quantity: 2.0,
            price: Some(101.0),
            stop_price: None,
        };
        broker.submit(vec![sell]);
        let outcome =
            broker.process_batch(&batch(vec![bar("X", 103.0, 104.0, 100.5, 102.0, 10.0)]));
        assert_eq!(outcome.fills[0].price, 103.0);
        assert!(broker.position().long.get("X").is_none());
    }

    #[test]
    fn fixed_and_impact_slippage_shift_fill_price() {
        let mut config = SimConfig::default();
        config.slippage.price = PriceSlippage {
            fixed: 10.0, // 10 bps
            market_impact: 0.5,
        };
        let mut broker = Broker::new(config, ts(0));
        broker.submit(vec![market_buy("o1", "X", 100.0)]);
        let outcome =
            broker.process_batch(&batch(vec![bar("X", 100.0, 101.0, 99.0, 100.0, 1_000.0)]));
        // 100 + 100*(10/10000) + (100/1000)*0.5*100 = 100 + 0.1 + 5.0
        let price = outcome.fills[0].price;
        assert!((price - 105.1).abs() < 1e-9);
    }

    #[test]
    fn commission_debits_cash_and_accumulates() {
        let mut config = SimConfig::default();
        config.commission.rate = 0.001;
        config.commission.per_trade = 1.0;
        let mut broker = Broker::new(config, ts(0));
        broker.submit(vec![market_buy("o1", "X", 10.0)]);
        let outcome = broker.process_batch(&batch(vec![quote("X", 100.0)]));
        let commission = outcome.fills[0].commission;
        assert!((commission - 2.0).abs() < 1e-9);
        assert!((broker.position().cash - (10_000.0 - 1_000.0 - 2.0)).abs() < 1e-9);
        assert_eq!(broker.position().total_commission, commission);
    }

    #[test]
    fn fifo_close_consumes_oldest_lot_first() {
        let mut broker = broker();
        broker.submit(vec![market_buy("a", "X", 5.0)]);
        broker.process_batch(&batch(vec![quote("X", 100.0)]));
        broker.submit(vec![market_buy("b", "X", 5.0)]);
        broker.process_batch(&batch(vec![quote("X", 110.0)]));

        let close = OrderRequest {
            id: "c".into(),
            symbol: "X".into(),
            side: Side::Sell,
            effect: OrderEffect::CloseLong,
            order_type: OrderType::Market,
            quantity: 7.0,
            price: None,
            stop_price: None,
        };
        broker.submit(vec![close]);
        broker.process_batch(&batch(vec![quote("X", 120.0)]));

        // 5 @ 100 fully consumed, 2 of the 110 lot consumed.
        let position = broker.position();
        let lots = &position.long["X"];
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].quantity, 3.0);
        assert_eq!(lots[0].price, 110.0);
        let expected_pnl = 5.0 * 20.0 + 2.0 * 10.0;
        assert!((position.realised_pnl - expected_pnl).abs() < 1e-9);
        broker.check_invariants();
    }

    #[test]
    fn amend_below_filled_quantity_cancels() {
        let mut config = SimConfig::default();
        config.slippage.volume = VolumeSlippage {
            max_participation: Some(0.1),
            allow_partial_fills: true,
        };
        let mut broker = Broker::new(config, ts(0));
        broker.submit(vec![market_buy("o1", "X", 100.0)]);
        broker.process_batch(&batch(vec![bar("X", 50.0, 50.0, 50.0, 50.0, 500.0)]));
        // 50 filled so far; shrink the order below that.
        let states = broker.amend(&[OrderAmend {
            id: "o1".into(),
            price: None,
            stop_price: None,
            quantity: Some(40.0),
        }]);
        assert_eq!(states[0].status, OrderStatus::Cancelled);
        assert!(broker.open_orders().is_empty());
        broker.check_invariants();
    }

    #[test]
    fn amend_ignores_unknown_ids() {
        let mut broker = broker();
        let states = broker.amend(&[OrderAmend {
            id: "ghost".into(),
            price: Some(1.0),
            stop_price: None,
            quantity: None,
        }]);
        assert!(states.is_empty());
    }

    #[test]
    fn cancel_all_clears_book_and_refcounts() {
        let mut broker = broker();
        broker.submit(vec![
            limit_buy("a", "X", 1.0, 90.0),
            limit_buy("b", "Y", 1.0, 90.0),
        ]);
        let states = broker.cancel_all();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.status == OrderStatus::Cancelled));
        assert!(broker.open_orders().is_empty());
        assert!(!broker.touches(&batch(vec![quote("X", 1.0)])));
        broker.check_invariants();
    }

    #[test]
    fn short_round_trip_realises_inverse_pnl() {
        let mut broker = broker();
        let open = OrderRequest {
            id: "s".into(),
            symbol: "X".into(),
            side: Side::Sell,
            effect: OrderEffect::OpenShort,
            order_type: OrderType::Market,
            quantity: 10.0,
            price: None,
            stop_price: None,
        };
        broker.submit(vec![open]);
        broker.process_batch(&batch(vec![quote("X", 100.0)]));
        assert_eq!(broker.position().cash, 10_000.0 + 1_000.0);

        let cover = OrderRequest {
            id: "c".into(),
            symbol: "X".into(),
            side: Side::Buy,
            effect: OrderEffect::CloseShort,
            order_type: OrderType::Market,
            quantity: 10.0,
            price: None,
            stop_price: None,
        };
        broker.submit(vec![cover]);
        broker.process_batch(&batch(vec![quote("X", 90.0)]));
        let position = broker.position();
        assert!((position.realised_pnl - 100.0).abs() < 1e-9);
        assert!(position.short.get("X").is_none());
        assert!((position.cash - 10_100.0).abs() < 1e-9);
    }

    #[test]
    fn matching_iterates_in_insertion_order() {
        let mut config = SimConfig::default();
        config.slippage.volume = VolumeSlippage {
            max_participation: Some(0.5),
            allow_partial_fills: true,
        };
        let mut broker = Broker::new(config, ts(0));
        broker.submit(vec![
            market_buy("first", "X", 10.0),
            market_buy("second", "X", 10.0),
        ]);
        let outcome = broker.process_batch(&batch(vec![bar("X", 10.0, 10.0, 10.0, 10.0, 4.0)]));
        let order_ids: Vec<_> = outcome.fills.iter().map(|f| f.order_id.as_str()).collect();
        assert_eq!(order_ids, vec!["first", "second"]);
    }

    #[test]
    fn equity_reflects_snapshot_after_fill() {
        let mut broker = broker();
        broker.submit(vec![market_buy("o1", "X", 10.0)]);
        let batch_one = batch(vec![quote("X", 100.0)]);
        broker.process_batch(&batch_one);
        let mut snapshot = PriceSnapshot::default();
        snapshot.observe(&batch_one);
        assert_eq!(broker.position().market_value(&snapshot), 10_000.0);

        let batch_two = batch(vec![quote("X", 105.0)]);
        snapshot.observe(&batch_two);
        assert_eq!(broker.position().market_value(&snapshot), 10_050.0);
    }
}
