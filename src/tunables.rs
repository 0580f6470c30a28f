// SPDX-License-Identifier: MPL-2.0

//! Runtime-adjustable scheduler parameters.

use crate::{prelude::*, time::Ticks};

/// Maximum entity weight accepted from the host.
pub const MAX_WEIGHT: u32 = 1000;

/// Default weight assigned to producers that do not specify one.
pub const DEFAULT_WEIGHT: u32 = 100;

/// Hard cap on the number of live producer queues; past it, new producers
/// share the per-class fallback queues.
pub(crate) const MAX_QUEUES: usize = 4096;

/// Number of async requests allowed in the driver per activation.
pub(crate) const MAX_BUDGET_ASYNC_RQ: u32 = 4;

/// Arrivals-within-think-time threshold past which a queue is marked I/O-bound.
pub(crate) const REQUESTS_WITHIN_TIMER: u32 = 120;

/// Sector distance above which a queue counts as seeky.
pub(crate) const SEEK_THRESHOLD: u64 = 8 * 1024;

/// Samples after which an exponential mean is trusted.
pub(crate) const SAMPLES_VALID: u32 = 80;

/// Parallel in-driver requests that hint at internal device queueing.
pub(crate) const HW_QUEUE_THRESHOLD: u32 = 4;

/// Observation windows needed before trusting the queueing hint.
pub(crate) const HW_QUEUE_SAMPLES: u32 = 32;

/// Minimum interval at which the idle class must be served.
pub(crate) const CLASS_IDLE_TIMEOUT: Ticks = Ticks::from_millis(200);

/// Static description of the device below the scheduler.
#[derive(Copy, Clone, Debug)]
pub struct DeviceInfo {
    /// Rotational media pay for seeks; this steers both the next-request
    /// chooser statistics and the idling policy.
    pub rotational: bool,
}

/// The tunable knobs of the scheduler, all adjustable at runtime through
/// [`BfqScheduler::set_tunables`](crate::BfqScheduler::set_tunables).
#[derive(Clone, Debug)]
pub struct BfqTunables {
    /// How long to keep the device idle waiting for the next request of the
    /// in-service queue.
    pub slice_idle: Ticks,
    /// Maximum backward seek distance the chooser tolerates, in sectors.
    pub back_max: u64,
    /// Penalty multiplier applied to backward seek distances.
    pub back_penalty: u64,
    /// Wall-clock cap of a sync activation.
    pub timeout_sync: Ticks,
    /// Wall-clock cap of an async activation.
    pub timeout_async: Ticks,
    /// FIFO deadline of sync requests.
    pub fifo_expire_sync: Ticks,
    /// FIFO deadline of async requests.
    pub fifo_expire_async: Ticks,
    /// Budget cap in sectors; `None` lets the peak-rate estimator tune it.
    pub max_budget: Option<u64>,
    /// Service charge multiplier for async, non-raised queues.
    pub async_charge_factor: u64,
    /// Master enable for weight-raising.
    pub low_latency: bool,
    /// Weight multiplier applied to raised queues.
    pub wr_coeff: u32,
    /// Cap on the raising period of a soft real-time queue.
    pub wr_rt_max_time: Ticks,
    /// Idle gap that qualifies a queue as interactive.
    pub wr_min_idle_time: Ticks,
    /// Inter-arrival gap past which an async queue counts as stably
    /// backlogged and may be raised.
    pub wr_min_inter_arr_async: Ticks,
    /// Sector rate (per second) below which a producer can qualify as soft
    /// real-time; zero disables the soft real-time heuristic.
    pub wr_max_softrt_rate: u64,
    /// Window within which queue activations coalesce into one burst.
    pub burst_interval: Ticks,
    /// Burst size from which a burst counts as large.
    pub large_burst_thresh: u32,
}

impl Default for BfqTunables {
    fn default() -> Self {
        Self {
            slice_idle: Ticks::from_millis(8),
            // 16 MiB of 512-byte sectors.
            back_max: 16 * 1024 * 2,
            back_penalty: 2,
            timeout_sync: Ticks::from_millis(125),
            timeout_async: Ticks::from_millis(40),
            fifo_expire_sync: Ticks::from_millis(250),
            fifo_expire_async: Ticks::from_millis(125),
            max_budget: None,
            async_charge_factor: 10,
            low_latency: true,
            wr_coeff: 30,
            wr_rt_max_time: Ticks::from_millis(300),
            wr_min_idle_time: Ticks::from_millis(2000),
            wr_min_inter_arr_async: Ticks::from_millis(500),
            wr_max_softrt_rate: 7000,
            burst_interval: Ticks::from_millis(128),
            large_burst_thresh: 8,
        }
    }
}

/// Default budget granted to a fresh activation, in sectors.
pub(crate) const DEFAULT_MAX_BUDGET: u64 = 16 * 1024;

/// Budget floor; the feedback loop never shrinks a queue below this.
pub(crate) const MIN_BUDGET: u64 = DEFAULT_MAX_BUDGET / 32;

impl BfqTunables {
    /// Checks the ranges the setters accept.
    pub fn validate(&self) -> Result<()> {
        if self.back_penalty == 0 {
            return_errno_with_msg!(InvalidArgs, "back_penalty must be at least 1");
        }
        if self.async_charge_factor == 0 {
            return_errno_with_msg!(InvalidArgs, "async_charge_factor must be at least 1");
        }
        if self.wr_coeff == 0 {
            return_errno_with_msg!(InvalidArgs, "wr_coeff must be at least 1");
        }
        if self.large_burst_thresh < 2 {
            return_errno_with_msg!(InvalidArgs, "large_burst_thresh must be at least 2");
        }
        if let Some(max_budget) = self.max_budget {
            if max_budget < MIN_BUDGET {
                return_errno_with_msg!(InvalidArgs, "max_budget below the budget floor");
            }
        }
        Ok(())
    }

    /// The activation wall cap for a queue of the given syncness.
    pub(crate) fn timeout(&self, sync: bool) -> Ticks {
        if sync {
            self.timeout_sync
        } else {
            self.timeout_async
        }
    }

    /// The FIFO deadline for a request of the given syncness.
    pub(crate) fn fifo_expire(&self, sync: bool) -> Ticks {
        if sync {
            self.fifo_expire_sync
        } else {
            self.fifo_expire_async
        }
    }
}
