//! Error types for the fan simulator

use ethers::types::{Address, TxHash};
use std::time::Duration;
use thiserror::Error;

/// Main error type for the simulator
#[derive(Error, Debug)]
pub enum FanError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain connection error: {0}")]
    ChainConnection(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Submission of nonce {nonce} rejected: {message}")]
    Submission { nonce: u64, message: String },

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Nonce too low: {0}")]
    NonceTooLow(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Transaction {tx_hash:?} not confirmed within {timeout:?}")]
    ConfirmationTimeout { tx_hash: TxHash, timeout: Duration },

    #[error("Transaction {tx_hash:?} is not tracked")]
    TransactionNotTracked { tx_hash: TxHash },

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Funding failed for {failed} of {total} fans")]
    Funding {
        failed: usize,
        total: usize,
        /// Recipient and reason of every failed transfer
        failures: Vec<(Address, String)>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FanError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FanError::ChainConnection(_)
                | FanError::Rpc(_)
                | FanError::Subscription(_)
                | FanError::ConfirmationTimeout { .. }
        )
    }

    /// Check if the account needs a top-up before it can send again
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, FanError::InsufficientFunds(_))
    }
}

/// Result type for simulator operations
pub type FanResult<T> = Result<T, FanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_is_distinct_from_submission() {
        let funds = FanError::InsufficientFunds("insufficient funds for gas * price + value".into());
        let submission = FanError::Submission {
            nonce: 4,
            message: "replacement transaction underpriced".into(),
        };

        assert!(funds.is_insufficient_funds());
        assert!(!submission.is_insufficient_funds());
        assert!(!funds.is_retryable());
        assert!(FanError::Subscription("closed".into()).is_retryable());
    }
}
