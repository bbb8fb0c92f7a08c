//! Per (subject, channel) fixed-window rate limiting

use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::model::Channel;
use crate::config::ChannelSettings;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Last delivery was less than `cooldown_ms` ago
    Cooldown,
    /// Window already holds `max_per_window` deliveries
    WindowFull,
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    window_start: Instant,
    count: u32,
    last_delivery: Option<Instant>,
}

/// Delivery counters keyed by (subject, channel)
pub struct RateLimiter {
    windows: DashMap<(String, Channel), WindowState>,
    /// Suppressed deliveries per subject
    suppressed: DashMap<String, u64>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            suppressed: DashMap::new(),
        }
    }

    /// Check and, if allowed, record a delivery now
    pub fn try_acquire(
        &self,
        subject_id: &str,
        channel: Channel,
        settings: &ChannelSettings,
    ) -> RateDecision {
        self.try_acquire_at(subject_id, channel, settings, Instant::now())
    }

    /// Check and, if allowed, record a delivery at `now`.
    ///
    /// An expired window restarts lazily at the attempt time.
    pub fn try_acquire_at(
        &self,
        subject_id: &str,
        channel: Channel,
        settings: &ChannelSettings,
        now: Instant,
    ) -> RateDecision {
        let window = Duration::from_millis(settings.window_ms);
        let cooldown = Duration::from_millis(settings.cooldown_ms);

        let decision = {
            let mut state = self
                .windows
                .entry((subject_id.to_string(), channel))
                .or_insert(WindowState {
                    window_start: now,
                    count: 0,
                    last_delivery: None,
                });

            let cooling = !cooldown.is_zero()
                && state
                    .last_delivery
                    .map(|last| now.saturating_duration_since(last) < cooldown)
                    .unwrap_or(false);

            if cooling {
                RateDecision::Cooldown
            } else {
                if now.saturating_duration_since(state.window_start) >= window {
                    state.window_start = now;
                    state.count = 0;
                }

                if state.count >= settings.max_per_window {
                    RateDecision::WindowFull
                } else {
                    state.count += 1;
                    state.last_delivery = Some(now);
                    RateDecision::Allowed
                }
            }
        };

        if !decision.is_allowed() {
            *self.suppressed.entry(subject_id.to_string()).or_insert(0) += 1;
            tracing::debug!(
                subject_id = %subject_id,
                channel = %channel,
                decision = ?decision,
                "Delivery rate limited"
            );
        }

        decision
    }

    /// Number of deliveries suppressed for a subject
    pub fn suppressed_count(&self, subject_id: &str) -> u64 {
        self.suppressed.get(subject_id).map(|c| *c).unwrap_or(0)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
