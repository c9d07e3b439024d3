//! Strategy engine — profit model, fleet allocation, switching gate and
//! risk management.

pub mod allocator;
pub mod profit;
pub mod risk;
pub mod switcher;

pub use allocator::{AllocationPlan, FleetAllocator};
pub use profit::{ProfitEstimate, ProfitModel};
pub use risk::{RebalanceSuggestion, RiskAssessment, RiskManager};
pub use switcher::{AlgorithmSwitcher, SwitchDecision, SwitchReason};
