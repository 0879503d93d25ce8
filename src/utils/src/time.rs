//! Minimal monotonic/real clock helpers, in the spirit of Firecracker's `utils::time`.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClockType {
    Monotonic,
    Real,
}

impl From<ClockType> for libc::clockid_t {
    fn from(clock: ClockType) -> Self {
        match clock {
            ClockType::Monotonic => libc::CLOCK_MONOTONIC,
            ClockType::Real => libc::CLOCK_REALTIME,
        }
    }
}

/// Returns the current time, in nanoseconds, for the given clock.
pub fn get_time(clock: ClockType) -> u64 {
    let mut timespec = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: timespec is a valid, appropriately sized destination.
    unsafe {
        libc::clock_gettime(clock.into(), &mut timespec);
    }
    timespec.tv_sec as u64 * 1_000_000_000 + timespec.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_nondecreasing() {
        let a = get_time(ClockType::Monotonic);
        let b = get_time(ClockType::Monotonic);
        assert!(b >= a);
    }
}
