//! Error types for the escrow trade protocol
//!
//! This module contains the error types used throughout the engine: task,
//! wallet, transport, trade, dispute and store errors, and the `EscrowError`
//! type that unifies them all.

use crate::types::{Coin, TradeId, TxId};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors raised by the wallet collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("Transaction not found: {tx_id}")]
    TxNotFound { tx_id: TxId },
    #[error("Insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: Coin, available: Coin },
    #[error("Signing failed: {reason}")]
    SigningFailed { reason: String },
    #[error("Broadcast failed: {reason}")]
    BroadcastFailed { reason: String },
    #[error("Wallet unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Errors raised by the messaging gateway when handing a message to the transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Send failed: buffer full (capacity: {capacity})")]
    SendBufferFull { capacity: usize },
    #[error("Transport channel closed")]
    ChannelClosed,
    #[error("No address known for trading peer of trade {trade_id}")]
    NoPeerAddress { trade_id: TradeId },
}

/// Errors raised by the trade state machine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TradeError {
    #[error("Phase regression rejected for trade {trade_id}: {from} -> {to}")]
    PhaseRegression {
        trade_id: TradeId,
        from: String,
        to: String,
    },
    #[error("Trade {trade_id} has no contract yet")]
    NoContract { trade_id: TradeId },
    #[error("Missing trade data for {trade_id}: {field}")]
    MissingData { trade_id: TradeId, field: String },
}

/// Failure of a single pipeline task
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Missing data: {field}")]
    MissingData { field: String },
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },
    #[error("Verification failed: {reason}")]
    Verification { reason: String },
    #[error("Rejected by filter: {reason}")]
    Filtered { reason: String },
    #[error("Task {task} has no registered implementation")]
    NotRegistered { task: String },
    #[error("Task {task} failed by intercept: {reason}")]
    Intercepted { task: String, reason: String },
    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Trade error: {0}")]
    Trade(#[from] TradeError),
}

impl TaskError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingData {
            field: field.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    pub fn verification(reason: impl Into<String>) -> Self {
        Self::Verification {
            reason: reason.into(),
        }
    }
}

/// Typed faults of the dispute API surface
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DisputeError {
    #[error("A dispute is already open for trade {trade_id}")]
    AlreadyOpen { trade_id: TradeId },
    #[error("Sending dispute message failed: {reason}")]
    DeliveryFailed { reason: String },
    #[error("Dispute list is not loaded yet")]
    NotLoaded,
    #[error("No dispute found for trade {trade_id}")]
    NotFound { trade_id: TradeId },
    #[error("Trade {trade_id} has no contract to dispute")]
    NoContract { trade_id: TradeId },
    #[error("No agent address known for trade {trade_id}")]
    NoAgentAddress { trade_id: TradeId },
    #[error("Wrong role for dispute operation: {reason}")]
    WrongRole { reason: String },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised by persistence collaborators
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("Storage backend error: {reason}")]
    Backend { reason: String },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Unified error type for the escrow engine
#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Trade error: {0}")]
    Trade(#[from] TradeError),

    #[error("Dispute error: {0}")]
    Dispute(#[from] DisputeError),

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Trade not found: {trade_id}")]
    TradeNotFound { trade_id: TradeId },

    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EscrowError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    /// Whether the engine loop must stop after this error
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Channel { .. } | Self::Configuration { .. })
    }
}

/// Result type alias for escrow operations
pub type EscrowResult<T> = core::result::Result<T, EscrowError>;
