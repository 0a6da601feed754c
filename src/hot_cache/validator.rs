//! Freshness and space checks for the ephemeral store.

use chrono::{DateTime, Utc};
use std::io;
use std::path::Path;
use std::time::Duration;

/// Snapshot of the backing store's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreUsage {
    pub total: u64,
    pub free: u64,
}

impl StoreUsage {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }

    pub fn usage_percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.used() as f64 / self.total as f64 * 100.0
    }
}

/// Measures free space. Swappable so tests can simulate a full store.
pub trait SpaceProbe: Send + Sync {
    fn usage(&self, dir: &Path) -> io::Result<StoreUsage>;
}

/// Reads real filesystem statistics through `fs2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn usage(&self, dir: &Path) -> io::Result<StoreUsage> {
        Ok(StoreUsage {
            total: fs2::total_space(dir)?,
            free: fs2::available_space(dir)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpacePolicy {
    pub safe_threshold_percent: u8,
    pub min_free_bytes: u64,
}

/// Why a write was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum SpaceRefusal {
    OverThreshold { usage_percent: f64, threshold: u8 },
    BelowFloor { free: u64, floor: u64 },
    WouldExhaust { required: u64, free: u64 },
}

impl std::fmt::Display for SpaceRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpaceRefusal::OverThreshold {
                usage_percent,
                threshold,
            } => write!(f, "store usage {usage_percent:.1}% exceeds {threshold}%"),
            SpaceRefusal::BelowFloor { free, floor } => {
                write!(f, "free space {free} bytes is below the {floor} byte floor")
            }
            SpaceRefusal::WouldExhaust { required, free } => {
                write!(f, "entry needs {required} bytes but only {free} are free")
            }
        }
    }
}

/// Decide whether `required` more bytes may be written.
pub fn check_space(
    usage: StoreUsage,
    policy: &SpacePolicy,
    required: u64,
) -> Result<(), SpaceRefusal> {
    let usage_percent = usage.usage_percent();
    if usage_percent > f64::from(policy.safe_threshold_percent) {
        return Err(SpaceRefusal::OverThreshold {
            usage_percent,
            threshold: policy.safe_threshold_percent,
        });
    }
    if usage.free < policy.min_free_bytes {
        return Err(SpaceRefusal::BelowFloor {
            free: usage.free,
            floor: policy.min_free_bytes,
        });
    }
    if required > usage.free.saturating_sub(policy.min_free_bytes) {
        return Err(SpaceRefusal::WouldExhaust {
            required,
            free: usage.free,
        });
    }
    Ok(())
}

/// True while an entry saved at `save_time` is younger than `ttl`.
/// Unparsable timestamps count as expired.
pub fn within_ttl(save_time: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
    let Ok(saved) = DateTime::parse_from_rfc3339(save_time) else {
        return false;
    };
    let age = now.signed_duration_since(saved.with_timezone(&Utc));
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => age <= ttl,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;

    fn policy() -> SpacePolicy {
        SpacePolicy {
            safe_threshold_percent: 80,
            min_free_bytes: 500 * MB,
        }
    }

    #[test]
    fn accepts_when_roomy() {
        let usage = StoreUsage {
            total: 10 * GB,
            free: 8 * GB,
        };
        assert!(check_space(usage, &policy(), 10 * MB).is_ok());
    }

    #[test]
    fn refuses_over_threshold() {
        let usage = StoreUsage {
            total: 10 * GB,
            free: GB,
        };
        assert!(matches!(
            check_space(usage, &policy(), 1),
            Err(SpaceRefusal::OverThreshold { threshold: 80, .. })
        ));
    }

    #[test]
    fn refuses_below_floor() {
        let usage = StoreUsage {
            total: GB,
            free: 400 * MB,
        };
        let relaxed = SpacePolicy {
            safe_threshold_percent: 100,
            ..policy()
        };
        assert!(matches!(
            check_space(usage, &relaxed, 1),
            Err(SpaceRefusal::BelowFloor { .. })
        ));
    }

    #[test]
    fn refuses_entry_that_would_cross_floor() {
        let usage = StoreUsage {
            total: 10 * GB,
            free: 9 * GB,
        };
        assert!(matches!(
            check_space(usage, &policy(), 9 * GB),
            Err(SpaceRefusal::WouldExhaust { .. })
        ));
    }

    #[test]
    fn ttl_boundaries() {
        let now = Utc::now();
        let fresh = (now - chrono::Duration::hours(1)).to_rfc3339();
        let stale = (now - chrono::Duration::hours(25)).to_rfc3339();
        let ttl = Duration::from_secs(24 * 3600);
        assert!(within_ttl(&fresh, ttl, now));
        assert!(!within_ttl(&stale, ttl, now));
        assert!(!within_ttl("yesterday", ttl, now));
    }
}
