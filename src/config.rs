use crate::reliability::retry::RetryConfig;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub high_amount_threshold: f64,
    pub burst_window_secs: i64,
    pub burst_threshold: u64,
    pub velocity_window_secs: i64,
    pub velocity_ceiling: f64,
    /// MVP placeholder: tolerate unsigned transactions from senders without a
    /// registered key. Must be switched off once real device signing ships.
    pub allow_simulated_signatures: bool,
    pub simulated_signature_prefix: String,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            high_amount_threshold: 5000.0,
            burst_window_secs: 300,
            burst_threshold: 5,
            velocity_window_secs: 3600,
            velocity_ceiling: 50_000.0,
            allow_simulated_signatures: true,
            simulated_signature_prefix: "simulated_sig_".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub collusion_min_txs: u64,
    pub loop_min_len: usize,
    pub loop_max_depth: usize,
    pub burst_abuse_min: u64,
    pub burst_abuse_high: u64,
    pub default_window_hours: u64,
    pub max_window_hours: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            collusion_min_txs: 3,
            loop_min_len: 3,
            loop_max_depth: 4,
            burst_abuse_min: 10,
            burst_abuse_high: 20,
            default_window_hours: 24,
            max_window_hours: 720,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrustConfig {
    pub fraud_penalty: f64,
    pub suspicious_penalty: f64,
    pub valid_reward: f64,
    pub batch_window_hours: u64,
    pub max_window_hours: u64,
    pub batch_valid_weight: f64,
    pub batch_fraud_weight: f64,
    pub batch_suspicious_weight: f64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            fraud_penalty: 0.2,
            suspicious_penalty: 0.05,
            valid_reward: 0.01,
            batch_window_hours: 168,
            max_window_hours: 720,
            batch_valid_weight: 0.05,
            batch_fraud_weight: 0.30,
            batch_suspicious_weight: 0.10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub sqlite_path: String,
    pub risk: RiskConfig,
    pub anomaly: AnomalyConfig,
    pub trust: TrustConfig,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sqlite_path: "./ledger.sqlite".to_string(),
            risk: RiskConfig::default(),
            anomaly: AnomalyConfig::default(),
            trust: TrustConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            risk: RiskConfig {
                high_amount_threshold: env_or("HIGH_AMOUNT_THRESHOLD", d.risk.high_amount_threshold),
                burst_window_secs: env_or("BURST_WINDOW_SECS", d.risk.burst_window_secs),
                burst_threshold: env_or("BURST_THRESHOLD", d.risk.burst_threshold),
                velocity_window_secs: env_or("VELOCITY_WINDOW_SECS", d.risk.velocity_window_secs),
                velocity_ceiling: env_or("VELOCITY_CEILING", d.risk.velocity_ceiling),
                allow_simulated_signatures: env_flag("ALLOW_SIMULATED_SIGS", d.risk.allow_simulated_signatures),
                simulated_signature_prefix: std::env::var("SIMULATED_SIG_PREFIX")
                    .unwrap_or(d.risk.simulated_signature_prefix),
            },
            anomaly: AnomalyConfig {
                collusion_min_txs: env_or("COLLUSION_MIN_TXS", d.anomaly.collusion_min_txs),
                loop_min_len: env_or("LOOP_MIN_LEN", d.anomaly.loop_min_len),
                loop_max_depth: env_or("LOOP_MAX_DEPTH", d.anomaly.loop_max_depth),
                burst_abuse_min: env_or("BURST_ABUSE_MIN", d.anomaly.burst_abuse_min),
                burst_abuse_high: env_or("BURST_ABUSE_HIGH", d.anomaly.burst_abuse_high),
                default_window_hours: env_or("ANOMALY_WINDOW_HOURS", d.anomaly.default_window_hours),
                max_window_hours: env_or("ANOMALY_MAX_WINDOW_HOURS", d.anomaly.max_window_hours),
            },
            trust: TrustConfig {
                batch_window_hours: env_or("TRUST_WINDOW_HOURS", d.trust.batch_window_hours),
                max_window_hours: env_or("TRUST_MAX_WINDOW_HOURS", d.trust.max_window_hours),
                ..d.trust
            },
            retry: RetryConfig {
                max_retries: env_or("RETRY_MAX", d.retry.max_retries),
                base_delay_ms: env_or("RETRY_BASE_MS", d.retry.base_delay_ms),
                breaker_threshold: env_or("STORAGE_BREAKER_THRESHOLD", d.retry.breaker_threshold),
                ..d.retry
            },
        }
    }
}
