use std::collections::HashMap;
use std::env;

use crate::error::{ArbError, Result};

/// Explicit, validated configuration for one bot process.
///
/// Every threshold the detector, coordinator and watchdog consult lives here
/// as a named field; components receive it at construction and never read
/// the environment themselves.
#[derive(Debug, Clone)]
pub struct Config {
    /// Enabled pivot markets, e.g. `["BTC-ETH", "USDT-BTC"]`
    pub pivot_markets: Vec<String>,
    /// Instruments scanned per pivot market, e.g. `{"BTC-ETH": ["LTC", "XRP"]}`
    pub pivot_currencies: HashMap<String, Vec<String>>,
    /// Minimum gross gap, in percent, before a triangle fires
    pub min_profit_pct: f64,
    /// Optional static per-leg fee, in percent, deducted before the
    /// threshold comparison. Zero disables net-of-fee comparison.
    pub fee_pct: f64,
    /// Per-cycle notional to commit, keyed by starting currency,
    /// e.g. `{"BTC": 0.05, "ETH": 0.5}`
    pub start_quantities: HashMap<String, f64>,
    /// Minimum top-of-book notional per leg; thinner levels are treated as
    /// dust and the next depth level is quoted instead
    pub min_leg_notional: f64,
    /// Deadline before an unfilled order is canceled and replaced
    pub unfilled_order_timeout_ms: u64,
    /// Detection tick interval per worker
    pub detection_interval_ms: u64,
    /// Open-triangle capacity per worker; detection pauses at the cap
    pub max_open_triangles: usize,
    pub paper_trading: bool,
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parses `KEY:VALUE,KEY:VALUE` maps, e.g. `BTC:0.05,ETH:0.5`.
fn parse_quantity_map(raw: &str) -> HashMap<String, f64> {
    raw.split(',')
        .filter_map(|part| {
            let mut kv = part.split(':');
            let key = kv.next()?.trim().to_string();
            let value = kv.next()?.trim().parse::<f64>().ok()?;
            Some((key, value))
        })
        .collect()
}

/// Parses `PIVOT:C1|C2,PIVOT:C3` instrument lists,
/// e.g. `BTC-ETH:LTC|XRP,USDT-BTC:LTC`.
fn parse_currency_map(raw: &str) -> HashMap<String, Vec<String>> {
    raw.split(',')
        .filter_map(|part| {
            let mut kv = part.split(':');
            let pivot = kv.next()?.trim().to_string();
            let list: Vec<String> = kv
                .next()?
                .split('|')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            if pivot.is_empty() || list.is_empty() {
                None
            } else {
                Some((pivot, list))
            }
        })
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            pivot_markets: env::var("PIVOT_MARKETS")
                .map(|s| parse_csv(&s))
                .unwrap_or_else(|_| vec!["BTC-ETH".to_string()]),
            pivot_currencies: env::var("PIVOT_CURRENCIES")
                .map(|s| parse_currency_map(&s))
                .unwrap_or_else(|_| {
                    let mut map = HashMap::new();
                    map.insert(
                        "BTC-ETH".to_string(),
                        vec!["LTC".to_string(), "XRP".to_string(), "ADA".to_string()],
                    );
                    map
                }),
            min_profit_pct: env::var("MIN_PROFIT_PCT")
                .unwrap_or_else(|_| "0.45".to_string())
                .parse()
                .unwrap_or(0.45),
            fee_pct: env::var("FEE_PCT")
                .unwrap_or_else(|_| "0.0".to_string())
                .parse()
                .unwrap_or(0.0),
            start_quantities: env::var("START_QUANTITIES")
                .map(|s| parse_quantity_map(&s))
                .unwrap_or_else(|_| {
                    let mut map = HashMap::new();
                    map.insert("BTC".to_string(), 0.05);
                    map.insert("ETH".to_string(), 0.5);
                    map.insert("USDT".to_string(), 500.0);
                    map
                }),
            min_leg_notional: env::var("MIN_LEG_NOTIONAL")
                .unwrap_or_else(|_| "0.0005".to_string())
                .parse()
                .unwrap_or(0.0005),
            unfilled_order_timeout_ms: env::var("UNFILLED_ORDER_TIMEOUT_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .unwrap_or(10_000),
            detection_interval_ms: env::var("DETECTION_INTERVAL_MS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .unwrap_or(500),
            max_open_triangles: env::var("MAX_OPEN_TRIANGLES")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),
            paper_trading: env::var("PAPER_TRADING")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pivot_markets.is_empty() {
            return Err(ArbError::ConfigError("no pivot markets enabled".to_string()));
        }
        for pivot in &self.pivot_markets {
            let (base, quote) = pivot.split_once('-').ok_or_else(|| {
                ArbError::ConfigError(format!("pivot market '{}' is not BASE-QUOTE", pivot))
            })?;
            if base.is_empty() || quote.is_empty() {
                return Err(ArbError::ConfigError(format!(
                    "pivot market '{}' is not BASE-QUOTE",
                    pivot
                )));
            }
            if self.currencies_for(pivot).is_empty() {
                return Err(ArbError::ConfigError(format!(
                    "no instruments configured for pivot '{}'",
                    pivot
                )));
            }
            for currency in [base, quote] {
                if !self.start_quantities.contains_key(currency) {
                    return Err(ArbError::ConfigError(format!(
                        "no start quantity configured for '{}'",
                        currency
                    )));
                }
            }
        }
        if self.min_profit_pct < 0.0 {
            return Err(ArbError::ConfigError(
                "MIN_PROFIT_PCT must be >= 0".to_string(),
            ));
        }
        if self.unfilled_order_timeout_ms == 0 {
            return Err(ArbError::ConfigError(
                "UNFILLED_ORDER_TIMEOUT_MS must be > 0".to_string(),
            ));
        }
        if self.max_open_triangles == 0 {
            return Err(ArbError::ConfigError(
                "MAX_OPEN_TRIANGLES must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn currencies_for(&self, pivot: &str) -> &[String] {
        self.pivot_currencies
            .get(pivot)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn start_quantity(&self, currency: &str) -> f64 {
        self.start_quantities.get(currency).copied().unwrap_or(0.0)
    }
}
