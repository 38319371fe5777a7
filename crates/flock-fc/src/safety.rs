use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Spaces out repeated requests of the same kind, e.g. mode switches sent
/// while streaming setpoints every control tick.
#[derive(Debug)]
pub struct CommandRateLimit {
    last: HashMap<&'static str, Instant>,
    min_interval: Duration,
}

impl CommandRateLimit {
    pub fn new(min_interval: Duration) -> Self {
        Self { last: HashMap::new(), min_interval }
    }

    pub fn allow(&mut self, kind: &'static str) -> bool {
        let now = Instant::now();
        if let Some(t) = self.last.get(kind) {
            if now.duration_since(*t) < self.min_interval { return false; }
        }
        self.last.insert(kind, now);
        true
    }

    pub fn reset(&mut self, kind: &'static str) {
        self.last.remove(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn limits_per_kind() {
        let mut limiter = CommandRateLimit::new(Duration::from_secs(2));
        assert!(limiter.allow("offboard"));
        assert!(!limiter.allow("offboard"));
        assert!(limiter.allow("hold"));

        tokio::time::advance(Duration::from_millis(2100)).await;
        assert!(limiter.allow("offboard"));

        limiter.reset("offboard");
        assert!(limiter.allow("offboard"));
    }
}
