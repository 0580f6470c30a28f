// SPDX-License-Identifier: MPL-2.0

//! Device peak-rate estimation.
//!
//! Every expiration that delivered service contributes one throughput
//! sample. The smoothed peak rate serves two purposes: it auto-tunes the
//! default budget (how many sectors fit in one activation wall slice), and
//! it classifies the device as slow or fast, which in turn selects the
//! reference (R, T) pair that sizes interactive weight-raising periods:
//! the slower the device, the longer a freshly started application deserves
//! protection.

use crate::{time::Ticks, tunables::BfqTunables};

/// Fixed-point shift of all rate values (sectors per microsecond).
pub(crate) const RATE_SHIFT: u32 = 16;

/// Samples required before the estimate is trusted for auto-tuning.
pub(crate) const PEAK_RATE_SAMPLES: u32 = 32;

// Reference rates in (sectors/usec) << RATE_SHIFT, indexed by
// rotational (0) / non-rotational (1), and the reference weight-raising
// durations for the systems typically backed by such devices.
const R_SLOW: [u64; 2] = [1536, 10752];
const R_FAST: [u64; 2] = [17415, 34791];
const T_SLOW: [Ticks; 2] = [Ticks::from_millis(3500), Ticks::from_millis(1500)];
const T_FAST: [Ticks; 2] = [Ticks::from_millis(8000), Ticks::from_millis(3000)];

const WR_DURATION_MIN: Ticks = Ticks::from_millis(500);
const WR_DURATION_MAX: Ticks = Ticks::from_millis(25_000);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum DeviceSpeed {
    Slow,
    Fast,
}

#[derive(Debug)]
pub(crate) struct PeakRateEstimator {
    /// Index into the reference tables: 0 rotational, 1 non-rotational.
    media: usize,
    /// Smoothed peak rate, (sectors/usec) << RATE_SHIFT.
    peak_rate: u64,
    samples: u32,
    speed: DeviceSpeed,
    /// Product of the active reference pair, `R * T`.
    rt_prod: u64,
}

impl PeakRateEstimator {
    /// Starts optimistic: the device is assumed fast until samples prove
    /// otherwise, so early raising periods err on the short side.
    pub fn new(rotational: bool) -> Self {
        let media = usize::from(!rotational);
        Self {
            media,
            peak_rate: R_FAST[media],
            samples: 0,
            speed: DeviceSpeed::Fast,
            rt_prod: R_FAST[media].saturating_mul(T_FAST[media].as_nanos()),
        }
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    pub fn peak_rate(&self) -> u64 {
        self.peak_rate
    }

    pub fn valid(&self) -> bool {
        self.samples >= PEAK_RATE_SAMPLES
    }

    /// Feeds one service sample: `sectors` delivered over `elapsed`.
    pub fn add_sample(&mut self, sectors: u64, elapsed: Ticks) {
        let usecs = elapsed.as_micros();
        if usecs == 0 {
            return;
        }
        let rate = (sectors << RATE_SHIFT) / usecs;
        self.peak_rate = (7 * self.peak_rate + rate) / 8;
        self.samples = self.samples.saturating_add(1);

        let threshold = (R_FAST[self.media] + R_SLOW[self.media]) / 2;
        self.speed = if self.peak_rate > threshold {
            DeviceSpeed::Fast
        } else {
            DeviceSpeed::Slow
        };
        let (r, t) = match self.speed {
            DeviceSpeed::Fast => (R_FAST[self.media], T_FAST[self.media]),
            DeviceSpeed::Slow => (R_SLOW[self.media], T_SLOW[self.media]),
        };
        self.rt_prod = r.saturating_mul(t.as_nanos());
    }

    /// Duration of an interactive weight-raising period:
    /// `(R_ref / peak_rate) * T_ref`, i.e. the reference start-up time
    /// scaled by how much slower or faster this device is than the
    /// reference one.
    pub fn wr_duration(&self) -> Ticks {
        let dur = Ticks::from_nanos(self.rt_prod / self.peak_rate.max(1));
        dur.max(WR_DURATION_MIN).min(WR_DURATION_MAX)
    }

    /// Budget that fits one sync activation slice at the estimated rate.
    pub fn calc_max_budget(&self, tunables: &BfqTunables) -> u64 {
        (self.peak_rate * tunables.timeout_sync.as_micros()) >> RATE_SHIFT
    }
}
