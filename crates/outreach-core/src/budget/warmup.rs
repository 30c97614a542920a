use chrono::{DateTime, Utc};

use crate::config::{LimitsConfig, WarmupConfig};
use crate::sender::Sender;

/// Day since activation, 1-based by UTC calendar date.
pub fn day_index(activated_at: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    let days = (now.date_naive() - activated_at.date_naive()).num_days();
    (days.max(0) + 1) as u32
}

/// Ramp entry for `day_index`; past the end of the table the last entry holds.
pub fn ramp_cap(ramp: &[u32], day_index: u32) -> u32 {
    let i = (day_index.max(1) - 1) as usize;
    ramp.get(i).or(ramp.last()).copied().unwrap_or(u32::MAX)
}

/// Maps sender age to the maximum daily volume it may send.
#[derive(Debug, Clone, Default)]
pub struct WarmupManager {
    config: WarmupConfig,
}

impl WarmupManager {
    pub fn new(config: WarmupConfig) -> Self {
        Self { config }
    }

    pub fn max_daily_for(&self, sender: &Sender, day_index: u32) -> u32 {
        ramp_cap(sender.ramp(&self.config), day_index)
    }

    /// The sender's daily cap intersected with its warmup allowance at `now`.
    pub fn effective_daily_cap(
        &self,
        sender: &Sender,
        limits: &LimitsConfig,
        now: DateTime<Utc>,
    ) -> u32 {
        let day = day_index(sender.activated_at, now);
        sender.daily_cap(limits).min(self.max_daily_for(sender, day))
    }
}
