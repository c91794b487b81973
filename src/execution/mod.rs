// =============================================================================
// Execution Module
// =============================================================================
//
// Decision records from the signal source, sizing policies, and the order
// execution protocol that turns a decision into a protected position.

pub mod decision;
pub mod protocol;

pub use decision::{DecisionRecord, PriceTarget, SizingPolicy};
pub use protocol::{ExecutionOutcome, ExecutionReport, OrderExecutionProtocol, ProtocolState};
