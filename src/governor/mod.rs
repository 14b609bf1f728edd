//! Safety governors: hard arithmetic risk checks and the graduated
//! autonomy ladder.

pub mod autonomy;
pub mod risk;

pub use autonomy::{AutonomyGovernor, Authorization, ReviewTrigger};
pub use risk::{sector_for, RejectReason, RiskGovernor, RiskSnapshot, RiskVerdict, TradeProposal};
