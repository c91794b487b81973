// =============================================================================
// Protection Module
// =============================================================================
//
// Keeps every open position covered by a stop-loss and a take-profit, even
// after restarts or a partially failed entry.

pub mod legs;
pub mod scanner;

pub use scanner::{ProtectionLedger, ProtectionScanner};
