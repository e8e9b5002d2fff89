use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Sliding window in-memory rate limiter (process local).
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    hits: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { hits: Arc::new(DashMap::new()), enabled }
    }

    /// Records a hit for `key` and returns false when the window is already full.
    pub fn check(&self, key: &str, rule: Rule) -> bool {
        if !self.enabled { return true; }
        let now = Instant::now();
        let mut window = self.hits.entry(key.to_string()).or_default();
        while window.front().is_some_and(|t| now.duration_since(*t) >= rule.window) {
            window.pop_front();
        }
        if window.len() >= rule.limit {
            return false;
        }
        window.push_back(now);
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rule {
    pub limit: usize,
    pub window: Duration,
}

impl Rule {
    pub const fn new(limit: usize, window_secs: u64) -> Self {
        Self { limit, window: Duration::from_secs(window_secs) }
    }
}

/// Per-action limits, overridable through `RL_*` variables.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub message: Rule,
    pub publish: Rule,
    pub auth: Rule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            message: Rule::new(30, 60),
            publish: Rule::new(5, 600),
            auth: Rule::new(10, 300),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        fn rule_env(prefix: &str, default: Rule) -> Rule {
            let num = |suffix: &str| std::env::var(format!("{prefix}_{suffix}")).ok().and_then(|v| v.parse::<u64>().ok());
            Rule {
                limit: num("LIMIT").map(|v| v as usize).unwrap_or(default.limit),
                window: num("WINDOW").map(Duration::from_secs).unwrap_or(default.window),
            }
        }
        let d = Self::default();
        Self {
            message: rule_env("RL_MESSAGE", d.message),
            publish: rule_env("RL_PUBLISH", d.publish),
            auth: rule_env("RL_AUTH", d.auth),
        }
    }
}

/// High level guard used by handlers.
#[derive(Clone)]
pub struct RateLimiterFacade {
    pub limiter: InMemoryRateLimiter,
    pub cfg: RateLimitConfig,
}

impl RateLimiterFacade {
    pub fn new(limiter: InMemoryRateLimiter, cfg: RateLimitConfig) -> Self { Self { limiter, cfg } }
    pub fn allow_message(&self, user: &str) -> bool { self.limiter.check(&format!("message:{user}"), self.cfg.message) }
    pub fn allow_publish(&self, user: &str) -> bool { self.limiter.check(&format!("publish:{user}"), self.cfg.publish) }
    pub fn allow_auth(&self, ip: &str) -> bool { self.limiter.check(&format!("auth:{ip}"), self.cfg.auth) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_window_basic() {
        let rl = InMemoryRateLimiter::new(true);
        let rule = Rule { limit: 3, window: Duration::from_millis(50) };
        for _ in 0..3 { assert!(rl.check("k", rule)); }
        assert!(!rl.check("k", rule));
        assert!(rl.check("other", rule));
    }

    #[test]
    fn window_expiry_frees_slots() {
        let rl = InMemoryRateLimiter::new(true);
        let rule = Rule { limit: 1, window: Duration::from_millis(20) };
        assert!(rl.check("k", rule));
        assert!(!rl.check("k", rule));
        std::thread::sleep(Duration::from_millis(30));
        assert!(rl.check("k", rule));
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let rl = InMemoryRateLimiter::new(false);
        let rule = Rule::new(0, 60);
        assert!(rl.check("k", rule));
    }
}
