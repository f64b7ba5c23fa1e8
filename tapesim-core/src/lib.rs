//! Fundamental data types shared across the entire workspace.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod time;

pub use time::{EpochUnit, TimeRep};

/// Alias for price precision.
pub type Price = f64;
/// Alias for quantity precision.
pub type Qty = f64;
/// Alias used for human-readable market symbols (e.g., `BTCUSDT`).
pub type Symbol = String;
/// Client-assigned order identifier, unique within one broker.
pub type OrderId = String;
/// Opaque per-connection identifier of a logical trading client.
pub type Cid = String;

/// Subscription sentinel that matches every symbol.
pub const WILDCARD_SYMBOL: &str = "*";

/// The side of an order or fill.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Whether an order opens or closes a long/short lot; drives FIFO
/// position accounting.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEffect {
    OpenLong,
    CloseLong,
    OpenShort,
    CloseShort,
}

impl OrderEffect {
    /// True when the effect consumes existing lots instead of adding one.
    #[must_use]
    pub fn is_close(self) -> bool {
        matches!(self, Self::CloseLong | Self::CloseShort)
    }

    /// The only side this effect is valid with.
    #[must_use]
    pub fn required_side(self) -> Side {
        match self {
            Self::OpenLong | Self::CloseShort => Side::Buy,
            Self::CloseLong | Self::OpenShort => Side::Sell,
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

/// Lifecycle status maintained by the broker. `Filled`, `Cancelled` and
/// `Rejected` are terminal.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

/// Raised when a client-supplied order fails structural validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum InvalidOrder {
    #[error("quantity must be positive")]
    NonPositiveQuantity,
    #[error("{0:?} orders require a positive price")]
    MissingPrice(OrderType),
    #[error("{0:?} orders require a positive stop price")]
    MissingStopPrice(OrderType),
    #[error("side {side:?} is incompatible with effect {effect:?}")]
    SideEffectMismatch { side: Side, effect: OrderEffect },
}

/// Client-supplied order parameters, exactly as they arrive on the wire.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub effect: OrderEffect,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub quantity: Qty,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Price>,
}

impl OrderRequest {
    /// Structural validation: positive quantity, type-specific prices and
    /// the side/effect compatibility rule.
    pub fn validate(&self) -> Result<(), InvalidOrder> {
        if !(self.quantity > 0.0) {
            return Err(InvalidOrder::NonPositiveQuantity);
        }
        if matches!(self.order_type, OrderType::Limit | OrderType::StopLimit)
            && !self.price.is_some_and(|p| p > 0.0)
        {
            return Err(InvalidOrder::MissingPrice(self.order_type));
        }
        if matches!(self.order_type, OrderType::Stop | OrderType::StopLimit)
            && !self.stop_price.is_some_and(|p| p > 0.0)
        {
            return Err(InvalidOrder::MissingStopPrice(self.order_type));
        }
        if self.effect.required_side() != self.side {
            return Err(InvalidOrder::SideEffectMismatch {
                side: self.side,
                effect: self.effect,
            });
        }
        Ok(())
    }
}

/// Partial update applied to a resting order.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAmend {
    pub id: OrderId,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub stop_price: Option<Price>,
    #[serde(default)]
    pub quantity: Option<Qty>,
}

/// Broker-owned order state: the request plus fill progress.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderState {
    #[serde(flatten)]
    pub request: OrderRequest,
    pub filled_quantity: Qty,
    pub remaining_quantity: Qty,
    pub status: OrderStatus,
    pub modified: DateTime<Utc>,
}

impl OrderState {
    /// Wrap a freshly accepted request.
    #[must_use]
    pub fn open(request: OrderRequest, now: DateTime<Utc>) -> Self {
        let remaining = request.quantity;
        Self {
            request,
            filled_quantity: 0.0,
            remaining_quantity: remaining,
            status: OrderStatus::Open,
            modified: now,
        }
    }

    /// Wrap a request that never entered the book.
    #[must_use]
    pub fn rejected(request: OrderRequest, now: DateTime<Utc>) -> Self {
        let remaining = request.quantity;
        Self {
            request,
            filled_quantity: 0.0,
            remaining_quantity: remaining,
            status: OrderStatus::Rejected,
            modified: now,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.request.id
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.request.symbol
    }
}

/// Execution record emitted whenever an order (partially) fills.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub id: String,
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Price,
    pub quantity: Qty,
    pub commission: f64,
    pub created: DateTime<Utc>,
}

/// One FIFO parcel of a long position.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LongLot {
    pub quantity: Qty,
    pub price: Price,
    pub total_cost: f64,
}

/// One FIFO parcel of a short position.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortLot {
    pub quantity: Qty,
    pub price: Price,
    pub total_proceeds: f64,
}

/// Cash plus FIFO lot queues per symbol. Negative cash represents margin
/// usage and is never clamped.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub cash: f64,
    pub long: BTreeMap<Symbol, Vec<LongLot>>,
    pub short: BTreeMap<Symbol, Vec<ShortLot>>,
    pub total_commission: f64,
    pub realised_pnl: f64,
    pub modified: DateTime<Utc>,
}

impl Position {
    /// Seed a position with the configured starting cash.
    #[must_use]
    pub fn new(initial_cash: f64, now: DateTime<Utc>) -> Self {
        Self {
            cash: initial_cash,
            long: BTreeMap::new(),
            short: BTreeMap::new(),
            total_commission: 0.0,
            realised_pnl: 0.0,
            modified: now,
        }
    }

    /// Total long quantity held in a symbol.
    #[must_use]
    pub fn long_quantity(&self, symbol: &str) -> Qty {
        self.long
            .get(symbol)
            .map(|lots| lots.iter().map(|l| l.quantity).sum())
            .unwrap_or(0.0)
    }

    /// Total short quantity held in a symbol.
    #[must_use]
    pub fn short_quantity(&self, symbol: &str) -> Qty {
        self.short
            .get(symbol)
            .map(|lots| lots.iter().map(|l| l.quantity).sum())
            .unwrap_or(0.0)
    }

    /// Mark-to-market equity against the latest observed prices. Lots in
    /// symbols the snapshot has never seen are valued at their entry price.
    #[must_use]
    pub fn market_value(&self, snapshot: &PriceSnapshot) -> f64 {
        let mut equity = self.cash;
        for (symbol, lots) in &self.long {
            for lot in lots {
                equity += lot.quantity * snapshot.price(symbol).unwrap_or(lot.price);
            }
        }
        for (symbol, lots) in &self.short {
            for lot in lots {
                equity -= lot.quantity * snapshot.price(symbol).unwrap_or(lot.price);
            }
        }
        equity
    }
}

/// A top-of-book observation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub price: Price,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Qty>,
}

/// An OHLC aggregate.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Qty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
}

/// A replayed row: quote or bar, distinguished on the wire by the
/// presence of `open`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MarketRecord {
    Bar(Bar),
    Quote(Quote),
}

impl MarketRecord {
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Bar(bar) => &bar.symbol,
            Self::Quote(quote) => &quote.symbol,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Bar(bar) => bar.timestamp,
            Self::Quote(quote) => quote.timestamp,
        }
    }

    /// Price used for snapshot/mark-to-market purposes.
    #[must_use]
    pub fn mark_price(&self) -> Price {
        match self {
            Self::Bar(bar) => bar.price.unwrap_or(bar.close),
            Self::Quote(quote) => quote.price,
        }
    }

    #[must_use]
    pub fn volume(&self) -> Option<Qty> {
        match self {
            Self::Bar(bar) => bar.volume,
            Self::Quote(quote) => quote.volume,
        }
    }
}

/// All rows of a replay table sharing one distinct epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplayBatch {
    pub timestamp: DateTime<Utc>,
    pub data: Vec<MarketRecord>,
}

impl ReplayBatch {
    /// Symbols present in this batch, in batch order, deduplicated.
    #[must_use]
    pub fn symbols(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for record in &self.data {
            let symbol = record.symbol();
            if !seen.contains(&symbol) {
                seen.push(symbol);
            }
        }
        seen
    }
}

/// Latest-seen price for every symbol observed so far in a replay. Grows
/// monotonically with the symbol universe.
#[derive(Clone, Debug, Default)]
pub struct PriceSnapshot {
    prices: HashMap<Symbol, Price>,
    timestamp: Option<DateTime<Utc>>,
}

impl PriceSnapshot {
    /// Merge every record of a batch and advance the snapshot time.
    pub fn observe(&mut self, batch: &ReplayBatch) {
        for record in &batch.data {
            self.prices
                .insert(record.symbol().to_string(), record.mark_price());
        }
        self.timestamp = Some(batch.timestamp);
    }

    #[must_use]
    pub fn price(&self, symbol: &str) -> Option<Price> {
        self.prices.get(symbol).copied()
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

/// Commission schedule applied to every fill.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommissionSpec {
    pub rate: f64,
    pub per_trade: f64,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

impl CommissionSpec {
    /// Commission owed on a fill of the given notional value.
    #[must_use]
    pub fn charge(&self, notional: f64) -> f64 {
        let mut commission = self.rate * notional + self.per_trade;
        if let Some(minimum) = self.minimum {
            commission = commission.max(minimum);
        }
        if let Some(maximum) = self.maximum {
            commission = commission.min(maximum);
        }
        commission
    }
}

/// Additive price slippage parameters.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PriceSlippage {
    /// Basis-points shift applied to every fill (1 bp = 0.01%).
    pub fixed: f64,
    /// Linear market-impact coefficient scaled by participation.
    pub market_impact: f64,
}

/// Volume participation limits.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeSlippage {
    /// Fraction of the observed volume an order may consume per batch.
    pub max_participation: Option<f64>,
    pub allow_partial_fills: bool,
}

/// Slippage model: price adjustment plus quantity shaping.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlippageSpec {
    pub price: PriceSlippage,
    pub volume: VolumeSlippage,
}

/// Raised when a login config fails validation.
#[derive(Debug, Error, PartialEq)]
pub enum InvalidConfig {
    #[error("initialCash must be positive")]
    NonPositiveCash,
    #[error("riskFree must be non-negative")]
    NegativeRiskFree,
    #[error("commission values must be non-negative")]
    NegativeCommission,
    #[error("slippage values must be non-negative")]
    NegativeSlippage,
    #[error("maxParticipation must lie in [0, 1]")]
    ParticipationOutOfRange,
}

/// Per-client simulation parameters supplied at login.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimConfig {
    pub initial_cash: f64,
    pub risk_free: f64,
    pub commission: CommissionSpec,
    pub slippage: SlippageSpec,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            initial_cash: 10_000.0,
            risk_free: 0.0,
            commission: CommissionSpec::default(),
            slippage: SlippageSpec::default(),
        }
    }
}

impl SimConfig {
    /// Range checks documented in the protocol.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if !(self.initial_cash > 0.0) {
            return Err(InvalidConfig::NonPositiveCash);
        }
        if self.risk_free < 0.0 {
            return Err(InvalidConfig::NegativeRiskFree);
        }
        let commission = &self.commission;
        if commission.rate < 0.0
            || commission.per_trade < 0.0
            || commission.minimum.is_some_and(|v| v < 0.0)
            || commission.maximum.is_some_and(|v| v < 0.0)
        {
            return Err(InvalidConfig::NegativeCommission);
        }
        if self.slippage.price.fixed < 0.0 || self.slippage.price.market_impact < 0.0 {
            return Err(InvalidConfig::NegativeSlippage);
        }
        if self
            .slippage
            .volume
            .max_participation
            .is_some_and(|v| !(0.0..=1.0).contains(&v))
        {
            return Err(InvalidConfig::ParticipationOutOfRange);
        }
        Ok(())
    }
}

/// Metadata describing one replayable table.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}
