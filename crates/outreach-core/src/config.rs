use crate::error::{OutreachError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// JitterConfig
// ---------------------------------------------------------------------------

/// Random pause inserted between two consecutive messages of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterConfig {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_ms: 4_000,
            max_ms: 20_000,
        }
    }
}

impl JitterConfig {
    pub fn is_valid(&self) -> bool {
        self.min_ms <= self.max_ms
    }
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub jitter: JitterConfig,
    /// `in_flight` messages older than this are considered interrupted on startup.
    #[serde(default = "default_recovery_max_age")]
    pub recovery_max_age_secs: u64,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_max_workers() -> usize {
    4
}

fn default_batch_size() -> u32 {
    50
}

fn default_recovery_max_age() -> u64 {
    300
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            jitter: JitterConfig::default(),
            recovery_max_age_secs: default_recovery_max_age(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// LimitsConfig
// ---------------------------------------------------------------------------

/// Default per-sender caps. Individual senders may override either one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_hourly_cap")]
    pub hourly_cap: u32,
    #[serde(default = "default_daily_cap")]
    pub daily_cap: u32,
}

fn default_hourly_cap() -> u32 {
    60
}

fn default_daily_cap() -> u32 {
    1000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            hourly_cap: default_hourly_cap(),
            daily_cap: default_daily_cap(),
        }
    }
}

// ---------------------------------------------------------------------------
// WarmupConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    /// Max daily sends by day since activation; the last entry is the plateau.
    #[serde(default = "default_ramp")]
    pub ramp: Vec<u32>,
}

pub fn default_ramp() -> Vec<u32> {
    vec![20, 30, 45, 65, 90, 120, 160, 210, 280, 370, 490, 650, 1000]
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            ramp: default_ramp(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// One backoff "unit"; the wait before attempt n is `base × 2^(n-1)`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Adapter error codes that mean the recipient itself is unusable.
    #[serde(default = "default_permanent_codes")]
    pub permanent_codes: Vec<String>,
    /// Adapter error codes that mean the sending account is restricted.
    #[serde(default = "default_ban_codes")]
    pub ban_codes: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_permanent_codes() -> Vec<String> {
    ["invalid_recipient", "not_on_network", "recipient_blocked", "bad_request"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_ban_codes() -> Vec<String> {
    ["banned", "account_restricted", "account_suspended", "spam_flagged"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            permanent_codes: default_permanent_codes(),
            ban_codes: default_ban_codes(),
        }
    }
}

// ---------------------------------------------------------------------------
// RiskConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskWeights {
    pub volume: f64,
    pub similarity: f64,
    pub non_response: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            volume: 0.35,
            similarity: 0.35,
            non_response: 0.30,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub medium: u32,
    pub high: u32,
    pub critical: u32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium: 40,
            high: 60,
            critical: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Trailing window for the volume factor.
    #[serde(default = "default_volume_window")]
    pub volume_window_minutes: i64,
    /// Sends per volume window that saturate the volume factor.
    #[serde(default = "default_volume_ceiling")]
    pub volume_ceiling: u32,
    /// Number of most recent bodies compared for near-duplicates.
    #[serde(default = "default_similarity_sample")]
    pub similarity_sample: usize,
    #[serde(default = "default_response_window")]
    pub response_window_hours: i64,
    /// Below this many sends the response factor stays at zero.
    #[serde(default = "default_min_response_sample")]
    pub min_response_sample: u32,
    /// Sends younger than this are left out of the response factor; their
    /// replies may not have arrived yet.
    #[serde(default = "default_reply_grace")]
    pub reply_grace_hours: i64,
    #[serde(default = "default_ban_lookback")]
    pub ban_lookback_hours: i64,
    #[serde(default)]
    pub weights: RiskWeights,
    #[serde(default)]
    pub thresholds: RiskThresholds,
}

fn default_volume_window() -> i64 {
    60
}

fn default_volume_ceiling() -> u32 {
    60
}

fn default_similarity_sample() -> usize {
    20
}

fn default_response_window() -> i64 {
    72
}

fn default_min_response_sample() -> u32 {
    20
}

fn default_reply_grace() -> i64 {
    24
}

fn default_ban_lookback() -> i64 {
    24
}

impl RiskConfig {
    /// How long send history is needed for scoring.
    pub fn log_retention(&self) -> chrono::Duration {
        let volume = chrono::Duration::minutes(self.volume_window_minutes.max(0));
        let response = chrono::Duration::hours(self.response_window_hours.max(0));
        volume.max(response)
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            volume_window_minutes: default_volume_window(),
            volume_ceiling: default_volume_ceiling(),
            similarity_sample: default_similarity_sample(),
            response_window_hours: default_response_window(),
            min_response_sample: default_min_response_sample(),
            reply_grace_hours: default_reply_grace(),
            ban_lookback_hours: default_ban_lookback(),
            weights: RiskWeights::default(),
            thresholds: RiskThresholds::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// TransportConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Accept every message without contacting any network.
    #[default]
    DryRun,
    /// POST each message as JSON to a gateway.
    Http {
        url: String,
        /// Name of the environment variable holding a bearer token.
        #[serde(default)]
        token_env: Option<String>,
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
    /// Long-running bridge process speaking JSON lines on stdin/stdout.
    Bridge {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_http_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub warmup: WarmupConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            scheduler: SchedulerConfig::default(),
            limits: LimitsConfig::default(),
            warmup: WarmupConfig::default(),
            retry: RetryConfig::default(),
            risk: RiskConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(OutreachError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Fail fast on configurations that would make the engine misbehave.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(OutreachError::Configuration(errors.join("; ")))
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if !self.scheduler.jitter.is_valid() {
            error(format!(
                "scheduler.jitter.min_ms ({}) is greater than max_ms ({})",
                self.scheduler.jitter.min_ms, self.scheduler.jitter.max_ms
            ));
        }
        if self.scheduler.max_workers == 0 {
            error("scheduler.max_workers must be at least 1".to_string());
        }
        if self.scheduler.batch_size == 0 {
            error("scheduler.batch_size must be at least 1".to_string());
        }
        if self.warmup.ramp.is_empty() {
            error("warmup.ramp must have at least one entry".to_string());
        }
        if self.retry.max_attempts == 0 {
            error("retry.max_attempts must be at least 1".to_string());
        }
        let w = self.risk.weights;
        if [w.volume, w.similarity, w.non_response]
            .iter()
            .any(|x| !x.is_finite() || *x < 0.0)
        {
            error("risk.weights must be finite and non-negative".to_string());
        }
        let t = self.risk.thresholds;
        if !(t.medium <= t.high && t.high <= t.critical && t.critical <= 100) {
            error(format!(
                "risk.thresholds must satisfy medium <= high <= critical <= 100 (got {}/{}/{})",
                t.medium, t.high, t.critical
            ));
        }

        if self.warmup.ramp.windows(2).any(|p| p[1] < p[0]) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "warmup.ramp decreases at some day; volume will drop as the sender ages"
                    .to_string(),
            });
        }
        if self.retry.max_attempts > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "retry.max_attempts={} (>10 is unusual)",
                    self.retry.max_attempts
                ),
            });
        }
        if self.risk.reply_grace_hours >= self.risk.response_window_hours {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "risk.reply_grace_hours ({}) covers the whole response window ({}h); non_response never scores",
                    self.risk.reply_grace_hours, self.risk.response_window_hours
                ),
            });
        }
        if self.limits.hourly_cap > self.limits.daily_cap {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "limits.hourly_cap ({}) exceeds limits.daily_cap ({})",
                    self.limits.hourly_cap, self.limits.daily_cap
                ),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
