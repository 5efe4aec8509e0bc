//! Error types for the broadcast orchestrator
//!
//! Provider errors arrive as free-form strings; `classify` maps them into a
//! closed set of `ErrorKind`s once, and only the classified kind drives retry
//! decisions.

use thiserror::Error;

/// Main error type for broadcast operations
#[derive(Error, Debug, Clone)]
pub enum BroadcastError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Queue at capacity ({capacity})")]
    QueueFull { capacity: usize },

    #[error("Network error from provider {provider_id}: {message}")]
    Network {
        provider_id: String,
        message: String,
    },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Rate limited on provider {provider_id}")]
    RateLimited { provider_id: String },

    #[error("Transaction underpriced on provider {provider_id}")]
    Underpriced { provider_id: String },

    #[error("Insufficient funds for {address} on chain {chain_id}")]
    InsufficientFunds { address: String, chain_id: u64 },

    #[error("Nonce too low for {address} on chain {chain_id} (nonce {nonce})")]
    NonceTooLow {
        address: String,
        chain_id: u64,
        nonce: u64,
    },

    #[error("Nonce too high for {address} on chain {chain_id} (nonce {nonce})")]
    NonceTooHigh {
        address: String,
        chain_id: u64,
        nonce: u64,
    },

    #[error("All broadcasts failed after {attempts} attempts: {}", format_provider_errors(.errors))]
    AllBroadcastsFailed {
        attempts: u32,
        errors: Vec<(String, String)>,
    },

    #[error("Quorum not reached: {achieved}/{required} providers accepted")]
    QuorumNotReached {
        required: usize,
        achieved: usize,
        successful_providers: Vec<String>,
    },

    #[error("Consensus failure: {detail}")]
    ConsensusFailure {
        detail: String,
        successful_providers: Vec<String>,
    },

    #[error("Insufficient healthy providers: need {required}, have {healthy}")]
    InsufficientProviders { required: usize, healthy: usize },

    #[error("Chain {chain_id} not configured")]
    ChainNotFound { chain_id: u64 },

    #[error("Broadcast {id} not found")]
    RecordNotFound { id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_provider_errors(errors: &[(String, String)]) -> String {
    errors
        .iter()
        .map(|(id, e)| format!("{}: {}", id, e))
        .collect::<Vec<_>>()
        .join("; ")
}

impl BroadcastError {
    /// Check if the error may succeed on a retry (possibly on another provider)
    pub fn is_retryable(&self) -> bool {
        match self {
            BroadcastError::Network { .. }
            | BroadcastError::Timeout { .. }
            | BroadcastError::RateLimited { .. }
            | BroadcastError::Underpriced { .. }
            | BroadcastError::NonceTooHigh { .. } => true,
            // Provider exhaustion is retryable when any of the underlying
            // failures would itself have been
            BroadcastError::AllBroadcastsFailed { errors, .. } => errors.iter().any(|(_, m)| {
                matches!(
                    classify(m),
                    ErrorKind::Transient | ErrorKind::Underpriced | ErrorKind::NonceTooHigh
                )
            }),
            _ => false,
        }
    }

    /// Check if the error calls for gas escalation before the retry
    pub fn needs_gas_escalation(&self) -> bool {
        match self {
            BroadcastError::Underpriced { .. } => true,
            BroadcastError::AllBroadcastsFailed { errors, .. } => {
                !errors.is_empty()
                    && errors
                        .iter()
                        .all(|(_, m)| classify(m) == ErrorKind::Underpriced)
            }
            _ => false,
        }
    }
}

/// Result type for broadcast operations
pub type BroadcastResult<T> = Result<T, BroadcastError>;

/// Closed set of provider-error classifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network/timeout/rate-limit failures, retryable as-is
    Transient,
    /// Gas price below what the mempool will accept, retry with escalation
    Underpriced,
    /// Account cannot cover value + gas, fatal for the request
    InsufficientFunds,
    /// A transaction with this nonce already landed
    NonceTooLow,
    /// Nonce ahead of the account's pending count, retry after a delay
    NonceTooHigh,
    /// Node rejected the transaction outright (invalid signature, oversize, ...)
    Rejected,
}

/// Substring patterns matched against lowercased provider error text.
/// Order matters: the first match wins.
const ERROR_PATTERNS: &[(&str, ErrorKind)] = &[
    ("nonce too low", ErrorKind::NonceTooLow),
    ("already known", ErrorKind::NonceTooLow),
    ("already imported", ErrorKind::NonceTooLow),
    ("nonce too high", ErrorKind::NonceTooHigh),
    ("nonce is too high", ErrorKind::NonceTooHigh),
    ("replacement transaction underpriced", ErrorKind::Underpriced),
    ("transaction underpriced", ErrorKind::Underpriced),
    ("max fee per gas less than block base fee", ErrorKind::Underpriced),
    ("fee cap less than", ErrorKind::Underpriced),
    ("insufficient funds", ErrorKind::InsufficientFunds),
    ("insufficient balance", ErrorKind::InsufficientFunds),
    ("rate limit", ErrorKind::Transient),
    ("too many requests", ErrorKind::Transient),
    ("429", ErrorKind::Transient),
    ("timeout", ErrorKind::Transient),
    ("timed out", ErrorKind::Transient),
    ("connection reset", ErrorKind::Transient),
    ("connection refused", ErrorKind::Transient),
    ("connection closed", ErrorKind::Transient),
    ("error sending request", ErrorKind::Transient),
    ("service unavailable", ErrorKind::Transient),
    ("503", ErrorKind::Transient),
    ("internal server error", ErrorKind::Transient),
];

/// Classify a raw provider error message
pub fn classify(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    for (pattern, kind) in ERROR_PATTERNS {
        if lower.contains(pattern) {
            return *kind;
        }
    }
    ErrorKind::Rejected
}

/// Turn a classified provider failure into a `BroadcastError`
pub fn provider_error(
    provider_id: &str,
    chain_id: u64,
    address: &str,
    nonce: u64,
    message: &str,
) -> BroadcastError {
    match classify(message) {
        ErrorKind::Transient => BroadcastError::Network {
            provider_id: provider_id.to_string(),
            message: message.to_string(),
        },
        ErrorKind::Underpriced => BroadcastError::Underpriced {
            provider_id: provider_id.to_string(),
        },
        ErrorKind::InsufficientFunds => BroadcastError::InsufficientFunds {
            address: address.to_string(),
            chain_id,
        },
        ErrorKind::NonceTooLow => BroadcastError::NonceTooLow {
            address: address.to_string(),
            chain_id,
            nonce,
        },
        ErrorKind::NonceTooHigh => BroadcastError::NonceTooHigh {
            address: address.to_string(),
            chain_id,
            nonce,
        },
        ErrorKind::Rejected => BroadcastError::Network {
            provider_id: provider_id.to_string(),
            message: message.to_string(),
        },
    }
}
