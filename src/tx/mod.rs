//! Transaction lifecycle: gas policies, nonce ledger and the per-account wallet

pub mod gas;
mod nonce;
mod wallet;

pub use gas::{CrazedLevel, GasPolicy};
pub use nonce::TrackedTransaction;
pub use wallet::Wallet;
