use crate::clock::SharedClock;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const MAX_TRACKED_CALLERS: usize = 10_000;
const FORGET_AFTER: Duration = Duration::from_secs(15 * 60);

// Each caller starts with `allowance` free failures and earns one back every
// `60 / per_minute` seconds.
#[derive(Clone)]
pub struct AuthFailureLimiter {
    per_minute: f64,
    allowance: f64,
    clock: SharedClock,
    callers: Arc<DashMap<IpAddr, Strikes>>,
}

#[derive(Debug, Clone, Copy)]
struct Strikes {
    credit: f64,
    updated: SystemTime,
}

impl AuthFailureLimiter {
    pub fn new(per_minute: u64, burst: u64, clock: SharedClock) -> Self {
        let allowance = match (per_minute, burst) {
            (0, _) => 0,
            (per_minute, 0) => per_minute,
            (_, burst) => burst,
        };
        Self {
            per_minute: per_minute as f64,
            allowance: allowance as f64,
            clock,
            callers: Arc::new(DashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.per_minute > 0.0
    }

    pub fn record_failure(&self, ip: IpAddr) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }
        let now = self.clock.now();
        if self.callers.len() >= MAX_TRACKED_CALLERS {
            self.forget_idle(now);
        }
        let mut strikes = self.callers.entry(ip).or_insert(Strikes {
            credit: self.allowance,
            updated: now,
        });
        let idle = now
            .duration_since(strikes.updated)
            .unwrap_or_default()
            .as_secs_f64();
        strikes.credit = (strikes.credit + idle * self.per_minute / 60.0).min(self.allowance);
        strikes.updated = now;
        if strikes.credit >= 1.0 {
            strikes.credit -= 1.0;
            return None;
        }
        let wait = ((1.0 - strikes.credit) * 60.0 / self.per_minute).ceil().max(1.0);
        Some(Duration::from_secs(wait as u64))
    }

    pub fn tracked(&self) -> usize {
        self.callers.len()
    }

    fn forget_idle(&self, now: SystemTime) {
        self.callers.retain(|_, strikes| {
            now.duration_since(strikes.updated).unwrap_or_default() < FORGET_AFTER
        });
        let overflow = self.callers.len().saturating_sub(MAX_TRACKED_CALLERS - 1);
        if overflow == 0 {
            return;
        }
        let mut oldest = self
            .callers
            .iter()
            .map(|entry| (*entry.key(), entry.value().updated))
            .collect::<Vec<_>>();
        oldest.sort_by_key(|(_, updated)| *updated);
        for (ip, _) in oldest.into_iter().take(overflow) {
            self.callers.remove(&ip);
        }
    }
}
