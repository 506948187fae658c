use std::time::Instant;

/// Deadline record for the sender and receiver inactivity timers.
///
/// Both timers are re-armed by the traffic paths themselves and their
/// expiry only matters on the next send or receive, so they are checked
/// cooperatively instead of being driven by a task.
#[derive(Debug, Default)]
pub(crate) struct InactTimer {
    deadline: Option<Instant>,
}

impl InactTimer {
    /// True once an armed deadline has passed; checking disarms it.
    pub fn check_expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn rearm(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_expiry() {
        let mut tmr = InactTimer::default();
        let now = Instant::now();
        assert!(!tmr.check_expired(now));

        tmr.rearm(now + Duration::from_millis(100));
        assert!(!tmr.check_expired(now));
        assert!(tmr.check_expired(now + Duration::from_millis(100)));
        // Disarmed by the previous check.
        assert!(!tmr.check_expired(now + Duration::from_secs(1)));

        tmr.rearm(now + Duration::from_millis(100));
        tmr.cancel();
        assert!(!tmr.check_expired(now + Duration::from_secs(1)));
    }
}
