use core::time::Duration;

use super::regs::SpeedMode;
use super::constant::*;

/// Monotonic time source used to bound every wait in the driver.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// How a millisecond timeout is turned into a wait bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Deadline measured on the monotonic clock.
    Monotonic,
    /// Fixed number of polls: `ms * card_clock / 1000 / cycles_per_poll`.
    BusCycles { cycles_per_poll: u32 },
}

#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    At(Duration),
    Polls(u64),
}

impl Deadline {
    pub fn after<T: Clock>(clock: &T, ms: u32) -> Self {
        Deadline::At(clock.now() + Duration::from_millis(ms as u64))
    }

    pub fn with_policy<T: Clock>(policy: TimeoutPolicy, clock: &T, ms: u32, card_clock_hz: u32) -> Self {
        match policy {
            TimeoutPolicy::Monotonic => Self::after(clock, ms),
            TimeoutPolicy::BusCycles { cycles_per_poll } => {
                let cycles = timeout_cycles(ms, card_clock_hz) as u64;
                Deadline::Polls(cycles / cycles_per_poll.max(1) as u64)
            }
        }
    }

    /// Checks the bound; a poll budget is consumed by each call.
    pub fn expired<T: Clock>(&mut self, clock: &T) -> bool {
        match self {
            Deadline::At(at) => clock.now() >= *at,
            Deadline::Polls(left) => {
                if *left == 0 {
                    true
                } else {
                    *left -= 1;
                    false
                }
            }
        }
    }
}

/// Card clock produced by an SDHCI v3 style 10-bit divider.
pub fn card_clock_hz(base_hz: u32, divider: u16) -> u32 {
    if divider == 0 {
        base_hz
    } else {
        base_hz / (2 * divider as u32)
    }
}

/// Smallest divider bringing the card clock at or below `target_hz`.
pub fn divider_for(base_hz: u32, target_hz: u32) -> u16 {
    if target_hz == 0 || base_hz <= target_hz {
        return 0;
    }
    let div = base_hz.div_ceil(2 * target_hz);
    div.min(0x3FF) as u16
}

pub fn max_dtr(mode: SpeedMode) -> u32 {
    match mode {
        SpeedMode::Default => MMC_DEFAULT_MAX_DTR,
        SpeedMode::High => MMC_HIGH_52_MAX_DTR,
    }
}

/// Millisecond timeout expressed in card clock cycles, saturating.
pub fn timeout_cycles(ms: u32, card_clock_hz: u32) -> u32 {
    let cycles = ms as u64 * (card_clock_hz as u64 / 1000);
    cycles.min(u32::MAX as u64) as u32
}
