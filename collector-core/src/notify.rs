//! Notification Gate and per-table staleness policy (spec.md §2 component 3,
//! §4.5).
//!
//! The gate's shape is grounded in `ferrex-core::auth::rate_limit`: a rule
//! (`max_messages`/`window`/`cooldown`) plus a bounded history. Unlike the
//! teacher's `RateLimiter` trait (which dispatches across several pluggable
//! algorithms for several independent endpoints), spec.md's gate protects a
//! single outbound channel with exactly one algorithm, so the
//! algorithm-selection enum and the trait indirection are dropped — the
//! shape survives, the flexibility the rewrite doesn't need does not.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::{CollectorError, Result};

struct GateState {
    history: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
    suppressed_during_cooldown: u32,
}

/// Token-bucket-style limiter guarding the outbound chat channel.
pub struct NotificationGate {
    max_messages: usize,
    window: Duration,
    cooldown: Duration,
    state: Mutex<GateState>,
}

impl NotificationGate {
    pub fn new(max_messages: usize, window: Duration, cooldown: Duration) -> Self {
        Self {
            max_messages,
            window,
            cooldown,
            state: Mutex::new(GateState {
                history: VecDeque::new(),
                cooldown_until: None,
                suppressed_during_cooldown: 0,
            }),
        }
    }

    /// Checks whether a message may be sent right now, and if so, records
    /// the send. `force` bypasses the gate entirely (spec.md §4.5, used for
    /// critical shutdown-related messages).
    pub fn can_send(&self, force: bool) -> bool {
        if force {
            return true;
        }

        let now = Instant::now();
        let mut state = self.state.lock().expect("notification gate mutex poisoned");

        // Trim history outside the rolling window.
        while let Some(&front) = state.history.front() {
            if now.duration_since(front) > self.window {
                state.history.pop_front();
            } else {
                break;
            }
        }

        if let Some(until) = state.cooldown_until {
            if now < until {
                state.suppressed_during_cooldown += 1;
                return false;
            }
            let suppressed = state.suppressed_during_cooldown;
            state.cooldown_until = None;
            state.suppressed_during_cooldown = 0;
            if suppressed > 0 {
                info!(suppressed, "notification cooldown expired");
            }
        }

        if state.history.len() >= self.max_messages {
            state.cooldown_until = Some(now + self.cooldown);
            state.suppressed_during_cooldown += 1;
            warn!(
                max_messages = self.max_messages,
                "notification rate limit exceeded, entering cooldown"
            );
            return false;
        }

        state.history.push_back(now);
        true
    }
}

/// Per-destination-table staleness state (spec.md §3 `NotificationState`).
#[derive(Debug, Clone, Default)]
struct NotificationState {
    alert_sent: bool,
    last_observed: Option<DateTime<Utc>>,
}

/// Tracks, per destination table, whether a staleness alert has already
/// been sent for the current stale period (spec.md §4.5 "Per-table
/// staleness policy").
#[derive(Debug, Default)]
pub struct StalenessTracker {
    states: DashMap<String, NotificationState>,
}

impl StalenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe the upstream's latest timestamp for `table`. Returns `true`
    /// if a staleness alert should be enqueued right now: upstream is older
    /// than `threshold` and no alert has been sent since it last advanced.
    pub fn check(
        &self,
        table: &str,
        upstream_latest: DateTime<Utc>,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> bool {
        let mut entry = self.states.entry(table.to_string()).or_default();

        if entry.last_observed != Some(upstream_latest) {
            entry.last_observed = Some(upstream_latest);
            entry.alert_sent = false;
        }

        let age = now.signed_duration_since(upstream_latest);
        let is_stale = age
            .to_std()
            .map(|age| age > threshold)
            .unwrap_or(false);

        if is_stale && !entry.alert_sent {
            entry.alert_sent = true;
            true
        } else {
            false
        }
    }
}

/// Outbound chat notifications (spec.md §6 "Chat service").
pub struct ChatNotifier {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl ChatNotifier {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client build should not fail with default TLS config"),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }

    pub async fn send(&self, text: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let response = self
            .client
            .post(&url)
            .form(&[("chat_id", self.chat_id.as_str()), ("text", text)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CollectorError::TransientConnectivity(format!(
                "chat service responded with {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn admits_up_to_max_messages_per_window() {
        let gate = NotificationGate::new(5, Duration::from_secs(60), Duration::from_secs(300));
        for _ in 0..5 {
            assert!(gate.can_send(false));
        }
        assert!(!gate.can_send(false));
    }

    #[test]
    fn force_bypasses_the_gate() {
        let gate = NotificationGate::new(1, Duration::from_secs(60), Duration::from_secs(300));
        assert!(gate.can_send(false));
        assert!(!gate.can_send(false));
        assert!(gate.can_send(true));
    }

    /// Scenario E (rate limit): of six `can_send()` calls back to back, the
    /// first five are admitted and the sixth starts a cooldown; once the
    /// cooldown expires, the next call is admitted again.
    #[test]
    fn scenario_e_sixth_call_starts_cooldown_then_clears() {
        let gate = NotificationGate::new(5, Duration::from_millis(50), Duration::from_millis(80));
        for _ in 0..5 {
            assert!(gate.can_send(false));
        }
        assert!(!gate.can_send(false), "sixth call should start the cooldown");
        assert!(!gate.can_send(false), "still within cooldown");

        std::thread::sleep(Duration::from_millis(90));
        assert!(gate.can_send(false), "cooldown has expired");
    }

    /// Scenario C (staleness alert): once stale, one alert fires; it does
    /// not repeat while the upstream stays at the same timestamp, but a new
    /// stale period (upstream advances, then goes stale again) fires once more.
    #[test]
    fn staleness_alerts_once_per_stale_period() {
        let tracker = StalenessTracker::new();
        let upstream = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let now = upstream + chrono::Duration::hours(3);
        let threshold = Duration::from_secs(2 * 3600);

        assert!(tracker.check("Dynamic_TC2", upstream, now, threshold));
        // Same upstream timestamp, still stale: no repeat alert.
        assert!(!tracker.check("Dynamic_TC2", upstream, now, threshold));

        // Upstream advances: alert flag resets, but it's fresh now so no alert.
        let fresh = now;
        assert!(!tracker.check("Dynamic_TC2", fresh, now, threshold));

        // It goes stale again from the new timestamp: alert fires once more.
        let later = fresh + chrono::Duration::hours(3);
        assert!(tracker.check("Dynamic_TC2", fresh, later, threshold));
    }

    #[test]
    fn staleness_not_triggered_when_within_threshold() {
        let tracker = StalenessTracker::new();
        let upstream = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let now = upstream + chrono::Duration::minutes(10);
        assert!(!tracker.check("Dynamic_TC2", upstream, now, Duration::from_secs(2 * 3600)));
    }
}
