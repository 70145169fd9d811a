// 限流与配额模块

pub mod quota;
pub mod rate_limit;

pub use quota::{QuotaBook, QuotaCheck, QuotaTracker, QuotaUsage, WarningLevel};
pub use rate_limit::RateGovernor;
