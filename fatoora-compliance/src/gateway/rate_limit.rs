//! Process-wide fixed-window request budget for authority calls.
use super::GatewayError;
use crate::config::RateLimitSettings;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug)]
struct Window {
    remaining: u32,
    resets_at: Instant,
}

/// Fixed-window limiter shared by every gateway call.
///
/// The window is normally reset by the scheduler's timer; a call arriving
/// after the window has elapsed also starts a fresh one.
#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        let window = Window {
            remaining: settings.capacity,
            resets_at: Instant::now() + settings.window,
        };
        Self {
            settings,
            window: Mutex::new(window),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn window(&self) -> Duration {
        self.settings.window
    }

    /// Take one request from the budget or fail without touching the network.
    pub fn check_budget(&self) -> Result<(), GatewayError> {
        if !self.settings.enabled {
            return Ok(());
        }
        let now = Instant::now();
        let mut window = self.window.lock();
        if now >= window.resets_at {
            window.remaining = self.settings.capacity;
            window.resets_at = now + self.settings.window;
        }
        if window.remaining == 0 {
            let retry_after = window.resets_at.saturating_duration_since(now);
            warn!(retry_after_ms = retry_after.as_millis() as u64, "gateway rate limit exhausted");
            return Err(GatewayError::RateLimitExceeded { retry_after });
        }
        window.remaining -= 1;
        Ok(())
    }

    /// Requests left in the current window.
    pub fn remaining(&self) -> u32 {
        if !self.settings.enabled {
            return self.settings.capacity;
        }
        self.window.lock().remaining
    }

    /// Start a new window with the full budget.
    pub fn reset(&self) {
        let mut window = self.window.lock();
        window.remaining = self.settings.capacity;
        window.resets_at = Instant::now() + self.settings.window;
        debug!(capacity = self.settings.capacity, "rate limit window reset");
    }
}
