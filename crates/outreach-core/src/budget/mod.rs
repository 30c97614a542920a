//! Send budget: hour/day counters, warmup ramp and the per-sender actors
//! that apply them.

pub mod limiter;
pub mod warmup;
pub mod window;

pub use limiter::RateLimiter;
pub use warmup::WarmupManager;
pub use window::BudgetWindow;
