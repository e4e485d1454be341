pub mod config;
pub mod error;
pub mod ledger;

pub use error::CoreError;
pub use ledger::{HandleLedger, LedgerId, ResourceKind};
