use thiserror::Error;

/// Error taxonomy for the arbitrage engine.
///
/// Four classes of failure flow through here: transient data errors that
/// abort a single detection cycle, benign order-already-terminal races,
/// fatal balance desyncs, and structural execution errors that are surfaced
/// for operator intervention.
#[derive(Debug, Clone, Error)]
pub enum ArbError {
    /// Quote/depth fetch failure from the market data collaborator
    #[error("Market Data Error: {0}")]
    MarketData(String),

    /// Malformed or empty order book snapshot
    #[error("Order Book Integrity: {0}")]
    BookIntegrity(String),

    /// Order placement rejected or failed at the broker
    #[error("Order Placement Error: {0}")]
    OrderPlacement(String),

    /// Cancellation request failed for a reason other than the order being closed
    #[error("Cancel Failed: {0}")]
    CancelFailed(String),

    /// The order reached a terminal state before the cancel landed.
    /// The watchdog branches on this variant, so it must stay distinguishable.
    #[error("Order Already Closed: {0}")]
    OrderAlreadyClosed(String),

    /// Order id unknown to the broker
    #[error("Order Not Found: {0}")]
    OrderNotFound(String),

    /// Not enough of a currency to place a leg
    #[error("Insufficient Balance: {0}")]
    InsufficientBalance(String),

    /// Local balance view disagrees with the exchange. Trading on wrong
    /// balances is unsafe, so this is never swallowed.
    #[error("Balance Desync: {0}")]
    BalanceDesync(String),

    /// Configuration errors
    #[error("Config Error: {0}")]
    ConfigError(String),

    /// Trade execution errors (invalid triangle transition, leg lost, ...)
    #[error("Execution Error: {0}")]
    ExecutionError(String),

    /// An event channel closed while a waiter was still attached
    #[error("Channel Closed: {0}")]
    ChannelClosed(String),
}

impl ArbError {
    /// Whether the current cycle may simply be abandoned and retried on the
    /// next tick without operator intervention.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ArbError::MarketData(_) => true,
            ArbError::BookIntegrity(_) => true,
            ArbError::OrderPlacement(_) => true,
            ArbError::CancelFailed(_) => true,
            ArbError::OrderAlreadyClosed(_) => true, // benign race
            ArbError::OrderNotFound(_) => false,
            ArbError::InsufficientBalance(_) => true, // balances move, retry later
            ArbError::BalanceDesync(_) => false,
            ArbError::ConfigError(_) => false,
            ArbError::ExecutionError(_) => false,
            ArbError::ChannelClosed(_) => false,
        }
    }

    /// Fatal errors stop the worker instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ArbError::BalanceDesync(_))
    }
}

pub type Result<T> = std::result::Result<T, ArbError>;
