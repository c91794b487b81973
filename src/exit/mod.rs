// =============================================================================
// Exit Management Module
// =============================================================================
//
// Per-symbol exit state layered on top of the execution protocol: tiered
// take-profit legs and one-shot stop-loss tightening.

pub mod sl_tightening;
pub mod tiered;

pub use sl_tightening::{SlTightener, SlTighteningBook};
pub use tiered::{TieredExitBook, TieredExitState};
