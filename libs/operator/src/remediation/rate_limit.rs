use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};

/// Objects stay off limits this long after a successful remediation unless
/// the policy overrides nothing; long enough that restarts must not forget
/// them (entries with ≥ 1 h left are persisted).
pub const DEFAULT_OBJECT_COOLDOWN_MINUTES: i64 = 120;

/// `<ownerKind>:<ownerName>` when owner resolution applied, else the bare
/// object name.
pub fn object_identifier(owner_kind: &str, owner_name: &str) -> String {
    if owner_kind.is_empty() {
        owner_name.to_string()
    } else {
        format!("{owner_kind}:{owner_name}")
    }
}

/// Rate-limit bucket key. The event reason is deliberately absent: all
/// reasons for one owner-resolved object share a single budget.
pub fn rate_limit_key(
    policy_namespace: &str,
    policy_name: &str,
    object_namespace: &str,
    owner_kind: &str,
    owner_name: &str,
) -> String {
    format!(
        "{policy_namespace}/{policy_name}/{object_namespace}/{}",
        object_identifier(owner_kind, owner_name)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

#[derive(Default)]
struct Limits {
    windows: HashMap<String, Vec<DateTime<Utc>>>,
    cooldowns: HashMap<String, DateTime<Utc>>,
}

/// Sliding-window limiter with an optional per-key cooldown; one lock
/// covers both maps.
#[derive(Default)]
pub struct RateLimiter {
    inner: Mutex<Limits>,
}

impl RateLimiter {
    /// Check and (when allowed) record one event for `key`.
    pub fn check(
        &self,
        key: &str,
        events_per_minute: u32,
        cooldown_minutes: u32,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let mut limits = self.inner.lock().expect("rate limiter lock poisoned");

        if let Some(deadline) = limits.cooldowns.get(key) {
            if *deadline > now {
                return RateLimitDecision::Limited;
            }
        }

        let window = limits.windows.entry(key.to_string()).or_default();
        window.retain(|t| now.signed_duration_since(*t) < Duration::seconds(60));
        if window.len() >= events_per_minute as usize {
            return RateLimitDecision::Limited;
        }
        window.push(now);

        if cooldown_minutes > 0 {
            limits
                .cooldowns
                .insert(key.to_string(), now + Duration::minutes(cooldown_minutes as i64));
        }
        RateLimitDecision::Allowed
    }

    /// Drop expired cooldowns and empty windows.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let mut limits = self.inner.lock().expect("rate limiter lock poisoned");
        limits.cooldowns.retain(|_, deadline| *deadline > now);
        limits.windows.retain(|_, window| {
            window.retain(|t| now.signed_duration_since(*t) < Duration::seconds(60));
            !window.is_empty()
        });
    }
}

/// Always-on per-object cooldown, keyed by the full cooldown key (which,
/// unlike the rate-limit key, includes the event reason).
pub struct ObjectCooldowns {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
    minutes: i64,
}

impl ObjectCooldowns {
    pub fn new(minutes: i64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            minutes,
        }
    }

    /// Whether `key` is still cooling down.
    pub fn active(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .read()
            .expect("cooldown lock poisoned")
            .get(key)
            .map(|deadline| *deadline > now)
            .unwrap_or(false)
    }

    /// Start the cooldown after a successful remediation.
    pub fn mark(&self, key: &str, now: DateTime<Utc>) {
        self.entries
            .write()
            .expect("cooldown lock poisoned")
            .insert(key.to_string(), now + Duration::minutes(self.minutes));
    }

    /// Restore persisted entries; existing later deadlines win.
    pub fn restore(&self, loaded: HashMap<String, DateTime<Utc>>) {
        let mut entries = self.entries.write().expect("cooldown lock poisoned");
        for (key, deadline) in loaded {
            let keep = entries.get(&key).map(|d| *d >= deadline).unwrap_or(false);
            if !keep {
                entries.insert(key, deadline);
            }
        }
    }

    pub fn sweep(&self, now: DateTime<Utc>) {
        self.entries
            .write()
            .expect("cooldown lock poisoned")
            .retain(|_, deadline| *deadline > now);
    }

    pub fn snapshot(&self) -> HashMap<String, DateTime<Utc>> {
        self.entries
            .read()
            .expect("cooldown lock poisoned")
            .clone()
    }
}
