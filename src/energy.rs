//! Energy integration in kWh.
//!
//! Two rules coexist on purpose:
//!
//! - **Live** ([`EnergyAccumulator`]): every emitted sample adds `P × Δt / 3600`, where
//!   `Δt` is the real time since the previous emission. Negative power (export) is
//!   integrated as is.
//! - **Replay** ([`replay_energy`]): a recorded series is integrated pairwise, skipping
//!   samples whose power is not positive and clamping negative `Δt` to zero.
//!
//! On a series containing negative power the two results differ.

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Running energy total of a live session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyAccumulator {
    total_kwh: f64,
}

impl EnergyAccumulator {
    /// Start at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `power_kw` held for `elapsed_s` seconds; returns the new total.
    pub fn advance(&mut self, power_kw: f64, elapsed_s: f64) -> f64 {
        self.total_kwh += power_kw * elapsed_s / SECONDS_PER_HOUR;
        self.total_kwh
    }

    /// Energy so far (kWh).
    pub fn total_kwh(&self) -> f64 {
        self.total_kwh
    }

    /// Back to zero.
    pub fn reset(&mut self) {
        self.total_kwh = 0.0;
    }
}

/// Energy of a recorded series.
///
/// `t` holds seconds since the first sample and `power_kw` the matching active power.
/// For each consecutive pair, the later sample's power is held over the interval.
/// Extra elements of the longer slice are ignored.
pub fn replay_energy(t: &[f64], power_kw: &[f64]) -> f64 {
    let n = t.len().min(power_kw.len());
    let mut total_kwh = 0.0;
    for i in 1..n {
        let power = power_kw[i];
        if power <= 0.0 {
            continue;
        }
        let dt = (t[i] - t[i - 1]).max(0.0);
        total_kwh += power * dt / SECONDS_PER_HOUR;
    }
    total_kwh
}
