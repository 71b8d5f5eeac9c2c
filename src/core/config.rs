use std::time::Duration;

/// Immutable dispatcher configuration. Loaded once from the environment in
/// `main` and passed into constructors; call sites never read env vars.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-attempt budget for steady-state webhook calls.
    pub webhook_timeout: Duration,
    /// One-time connectivity test at agent registration.
    pub connectivity_test_timeout: Duration,
    pub max_retry_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub jitter: Duration,
    /// Caller-facing deadline for a whole execution request.
    pub overall_deadline: Duration,
    pub per_user_concurrent_cap: usize,
    pub default_agent_price: i64,
    /// Revenue-split bookkeeping only; never changes the charge to the user.
    pub platform_fee_percent: u8,
    /// Executions stuck in pending/running longer than this are reconciled.
    pub reconcile_grace: Duration,
    pub reconcile_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            webhook_timeout: Duration::from_secs(30),
            connectivity_test_timeout: Duration::from_secs(10),
            max_retry_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            jitter: Duration::from_millis(250),
            overall_deadline: Duration::from_secs(120),
            per_user_concurrent_cap: 4,
            default_agent_price: 1,
            platform_fee_percent: 20,
            reconcile_grace: Duration::from_secs(600),
            reconcile_interval: Duration::from_secs(60),
        }
    }
}

impl DispatcherConfig {
    /// Reads `AGORA_*` overrides on top of defaults. Unparseable values fall
    /// back to the default rather than aborting startup.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env_u64("AGORA_WEBHOOK_TIMEOUT_SECS") {
            cfg.webhook_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("AGORA_MAX_RETRY_ATTEMPTS") {
            cfg.max_retry_attempts = n as u32;
        }
        if let Some(ms) = env_u64("AGORA_BACKOFF_BASE_MS") {
            cfg.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("AGORA_BACKOFF_CAP_MS") {
            cfg.backoff_cap = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("AGORA_JITTER_MS") {
            cfg.jitter = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("AGORA_OVERALL_DEADLINE_SECS") {
            cfg.overall_deadline = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("AGORA_PER_USER_CONCURRENT_CAP") {
            cfg.per_user_concurrent_cap = n as usize;
        }
        if let Some(n) = env_u64("AGORA_DEFAULT_AGENT_PRICE") {
            cfg.default_agent_price = n as i64;
        }
        if let Some(n) = env_u64("AGORA_PLATFORM_FEE_PERCENT") {
            cfg.platform_fee_percent = (n as u8).min(100);
        }
        if let Some(secs) = env_u64("AGORA_RECONCILE_GRACE_SECS") {
            cfg.reconcile_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("AGORA_RECONCILE_INTERVAL_SECS") {
            cfg.reconcile_interval = Duration::from_secs(secs);
        }
        cfg
    }

    /// Upper bound on the wall clock one execution may spend in the retry
    /// loop: 2 x per-attempt timeout x attempts. The invoker stops retrying
    /// once this is exceeded even if attempts remain.
    pub fn retry_budget(&self) -> Duration {
        self.webhook_timeout * 2 * self.max_retry_attempts
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = DispatcherConfig::default();
        assert_eq!(cfg.webhook_timeout, Duration::from_secs(30));
        assert_eq!(cfg.connectivity_test_timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_retry_attempts, 3);
    }

    #[test]
    fn retry_budget_bounds_wall_clock() {
        let cfg = DispatcherConfig {
            webhook_timeout: Duration::from_secs(30),
            max_retry_attempts: 3,
            ..Default::default()
        };
        assert_eq!(cfg.retry_budget(), Duration::from_secs(180));
    }
}
