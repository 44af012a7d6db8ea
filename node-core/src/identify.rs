//! Visual identify: a timed, non-blocking LED blink.
//!
//! Started by writing a number of seconds to the `identify_secs` command
//! register (or by the identify-info function, which performs that write),
//! stopped by a zero write or when the duration has elapsed. The pattern is
//! a pure function of the phase within a 1 s period, so cycle jitter never
//! accumulates.

use crate::registers::{holding, Bank, RegisterMap};
use embedded_hal::digital::OutputPin;

/// Blink period.
pub const PERIOD_MS: u64 = 1_000;

/// `true` while the LED should be lit at `phase_ms` into the period:
/// two 150 ms pulses 300 ms apart, then dark.
#[inline]
#[must_use]
pub const fn pattern_on(phase_ms: u64) -> bool {
    phase_ms < 150 || (phase_ms >= 300 && phase_ms < 450)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IdentifyState {
    Inactive,
    Active { start_ms: u64, duration_ms: u64 },
}

/// Identify state machine. Owns the `identify_active` register.
pub struct Identify {
    state: IdentifyState,
    seen_seq: u16,
}

impl Identify {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: IdentifyState::Inactive,
            seen_seq: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> IdentifyState {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state, IdentifyState::Active { .. })
    }

    /// Run one cycle: consume a new `identify_secs` write, then drive the LED.
    pub fn update<P: OutputPin>(&mut self, regs: &mut RegisterMap, now_ms: u64, led: &mut P) {
        let seq = regs.write_sequence(holding::IDENTIFY_SECS);
        if seq != self.seen_seq {
            self.seen_seq = seq;
            let secs = regs.get(Bank::Holding, holding::IDENTIFY_SECS);
            if secs == 0 {
                debug!("identify stopped");
                self.state = IdentifyState::Inactive;
            } else {
                debug!("identify for {} s", secs);
                self.state = IdentifyState::Active {
                    start_ms: now_ms,
                    duration_ms: u64::from(secs) * 1000,
                };
            }
        }

        let lit = match self.state {
            IdentifyState::Inactive => false,
            IdentifyState::Active {
                start_ms,
                duration_ms,
            } => {
                let elapsed = now_ms.saturating_sub(start_ms);
                if elapsed >= duration_ms {
                    self.state = IdentifyState::Inactive;
                    false
                } else {
                    pattern_on(elapsed % PERIOD_MS)
                }
            }
        };

        // a failed LED write is cosmetic
        let _ = if lit { led.set_high() } else { led.set_low() };
        regs.set(
            Bank::Holding,
            holding::IDENTIFY_ACTIVE,
            u16::from(self.is_active()),
        );
    }
}

impl Default for Identify {
    fn default() -> Self {
        Self::new()
    }
}
