use std::ops::Add;
use std::time::{Duration, Instant};

/// Monotonic instant stamped on a poll batch when it returns from the
/// kernel; handed to read callbacks as the event arrival time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Instant);

impl Timestamp {
    pub fn now() -> Timestamp {
        Timestamp(Instant::now())
    }

    pub fn add_secs(self, secs: u64) -> Timestamp {
        Timestamp(self.0 + Duration::from_secs(secs))
    }

    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        self.0.duration_since(earlier.0)
    }

    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

#[cfg(test)]
mod test {
    use super::Timestamp;
    use std::time::Duration;

    #[test]
    fn ordering() {
        let a = Timestamp::now();
        let b = a.add_secs(1);
        assert!(b > a);
        assert_eq!(b.duration_since(a), Duration::from_secs(1));
    }

    #[test]
    fn add_duration() {
        let a = Timestamp::now();
        assert_eq!(a + Duration::from_secs(2), a.add_secs(2));
    }
}
