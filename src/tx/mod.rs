//! Transaction building blocks: nonce allocation and gas fee policy

pub mod gas;
pub mod nonce;

pub use gas::GasFees;
pub use nonce::NonceManager;
