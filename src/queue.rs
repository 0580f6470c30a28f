// SPDX-License-Identifier: MPL-2.0

//! Per-producer queues.
//!
//! A queue holds the pending requests of one producer in two orders at once:
//! a sector-sorted set that drives dispatch (the elevator order) and an
//! arrival FIFO that bounds starvation (an expired FIFO head overrides the
//! elevator choice). The queue also carries the per-producer statistics the
//! latency heuristics feed on: seek distances, raising state, backlog
//! accounting.

use bitflags::bitflags;

use crate::{
    entity::EntityId,
    prelude::*,
    request::{IoClass, IoRequest, IocId, Sector},
    time::Ticks,
    tunables::{BfqTunables, SEEK_THRESHOLD},
};

bitflags! {
    pub(crate) struct QueueFlags: u32 {
        /// Has pending requests and is linked into the scheduler.
        const BUSY           = 1 << 0;
        /// The producer waits for completions.
        const SYNC           = 1 << 1;
        /// The FIFO has already been polled in the current dispatch round.
        const FIFO_EXPIRE    = 1 << 2;
        /// The queue deserves an idle window when it empties.
        const IDLE_WINDOW    = 1 << 3;
        /// The device is being held idle waiting for this queue's next
        /// request.
        const WAIT_REQUEST   = 1 << 4;
        /// A fresh budget was assigned and the activation wall-clock cap is
        /// not armed yet.
        const BUDGET_NEW     = 1 << 5;
        /// Issues requests back-to-back within the think-time window.
        const IO_BOUND       = 1 << 6;
        /// Activated as part of a large burst; barred from raising.
        const IN_LARGE_BURST = 1 << 7;
        /// Currently listed in the tentative burst list.
        const IN_BURST_LIST  = 1 << 8;
        /// The soft real-time predicate must be refreshed when the queue
        /// next empties.
        const SOFTRT_UPDATE  = 1 << 9;
    }
}

/// Key of one request within a queue: sector first, then an arrival sequence
/// number so that requests starting at the same sector stay distinct.
pub(crate) type RqKey = (Sector, u64);

#[derive(Debug)]
pub(crate) struct QueuedRq {
    pub rq: IoRequest,
    /// FIFO deadline after which this request preempts the elevator order.
    pub fifo_deadline: Ticks,
}

#[derive(Debug)]
pub(crate) struct BfqQueue {
    pub entity: EntityId,
    /// The producer owning this queue, if it is still registered.
    pub ioc: Option<IocId>,
    pub class: IoClass,
    pub flags: QueueFlags,

    /// Pending requests in sector order.
    pub sort_list: BTreeMap<RqKey, QueuedRq>,
    /// Arrival order; entries may be stale (already dispatched) and are
    /// skipped lazily.
    pub fifo: VecDeque<RqKey>,
    /// The request the elevator would dispatch next.
    pub next_rq: Option<RqKey>,
    /// Pending request counts, indexed by syncness (`[async, sync]`).
    pub queued: [u32; 2],
    /// Requests handed to the driver and not yet completed.
    pub dispatched: u32,

    /// Start sector of the most recently arrived request, for seek
    /// distance sampling.
    pub last_request_pos: Sector,
    pub seek_samples: u32,
    pub seek_total: u64,
    pub seek_mean: u64,

    /// Per-queue budget target, adapted on every expiration.
    pub max_budget: u64,
    /// Wall-clock deadline of the current activation.
    pub budget_timeout: Ticks,

    /// Weight-raising state.
    pub wr_coeff: u32,
    pub wr_cur_max_time: Ticks,
    pub last_wr_start_finish: Ticks,

    /// Earliest instant a new soft real-time raising period may start.
    pub soft_rt_next_start: Ticks,
    /// When the queue last became backlogged after being idle.
    pub last_idle_bklogged: Ticks,
    /// Sectors served since `last_idle_bklogged`.
    pub service_from_backlogged: u64,

    /// Consecutive arrivals within the think-time window; qualifies the
    /// queue as I/O-bound when it reaches the threshold.
    pub requests_within_timer: u32,

    /// References held by the io-context link, busy state and dispatched
    /// requests; the queue is freed when it drops to zero.
    pub ref_count: u32,
}

impl BfqQueue {
    pub fn new(entity: EntityId, ioc: Option<IocId>, class: IoClass, sync: bool) -> Self {
        let mut flags = QueueFlags::empty();
        if sync {
            flags |= QueueFlags::SYNC | QueueFlags::IDLE_WINDOW;
        }
        Self {
            entity,
            ioc,
            class,
            flags,
            sort_list: BTreeMap::new(),
            fifo: VecDeque::new(),
            next_rq: None,
            queued: [0, 0],
            dispatched: 0,
            last_request_pos: 0,
            seek_samples: 0,
            seek_total: 0,
            seek_mean: 0,
            max_budget: 0,
            budget_timeout: Ticks::ZERO,
            wr_coeff: 1,
            wr_cur_max_time: Ticks::ZERO,
            last_wr_start_finish: Ticks::ZERO,
            soft_rt_next_start: Ticks::ZERO,
            last_idle_bklogged: Ticks::ZERO,
            service_from_backlogged: 0,
            requests_within_timer: 0,
            ref_count: 0,
        }
    }

    pub fn is_sync(&self) -> bool {
        self.flags.contains(QueueFlags::SYNC)
    }

    pub fn is_busy(&self) -> bool {
        self.flags.contains(QueueFlags::BUSY)
    }

    pub fn is_empty(&self) -> bool {
        self.sort_list.is_empty()
    }

    pub fn nr_queued(&self) -> u32 {
        self.queued[0] + self.queued[1]
    }

    pub fn seeky(&self) -> bool {
        self.seek_mean > SEEK_THRESHOLD
    }

    /// Inserts an arrived request; returns its key. The caller refreshes
    /// `next_rq` through [`Self::choose_next`].
    pub fn add_rq(&mut self, rq: IoRequest, seq: u64, fifo_deadline: Ticks) -> RqKey {
        let key = (rq.sector, seq);
        self.queued[rq.is_sync() as usize] += 1;
        self.fifo.push_back(key);
        let old = self.sort_list.insert(key, QueuedRq { rq, fifo_deadline });
        assert!(old.is_none(), "duplicate request key");
        key
    }

    /// Removes a pending request. If it was `next_rq`, the elevator choice
    /// is recomputed from its tree neighbors first, exactly as if the
    /// request had just been dispatched from `last_position`.
    ///
    /// Returns the request and whether `next_rq` changed.
    pub fn remove_rq(&mut self, key: RqKey, tunables: &BfqTunables) -> (IoRequest, bool) {
        let mut next_changed = false;
        if self.next_rq == Some(key) {
            self.next_rq = self.find_next_rq(key, tunables);
            next_changed = true;
        }
        let queued = self.sort_list.remove(&key).expect("request not queued");
        self.queued[queued.rq.is_sync() as usize] -= 1;
        (queued.rq, next_changed)
    }

    /// The in-tree neighbors of `key`, by sector order.
    fn neighbors(&self, key: RqKey) -> (Option<RqKey>, Option<RqKey>) {
        use core::ops::Bound::{Excluded, Unbounded};
        let prev = self.sort_list.range(..key).next_back().map(|(k, _)| *k);
        let next = self
            .sort_list
            .range((Excluded(key), Unbounded))
            .next()
            .map(|(k, _)| *k);
        (prev, next)
    }

    /// The best request to serve after `last`, chosen among its sector
    /// neighbors (wrapping to the front of the queue when `last` is the
    /// highest-sector request).
    pub fn find_next_rq(&self, last: RqKey, tunables: &BfqTunables) -> Option<RqKey> {
        let (prev, mut next) = self.neighbors(last);
        if next.is_none() {
            next = self
                .sort_list
                .keys()
                .next()
                .copied()
                .filter(|first| *first != last);
        }
        self.choose_rq(tunables, last.0, next, prev)
    }

    /// Picks which of two candidate requests is best served now, given the
    /// current head position.
    ///
    /// Preference order: sync over async, metadata over plain data, then the
    /// shorter distance from the head, with backward distances allowed up to
    /// `back_max` but weighted by `back_penalty`. If both candidates are
    /// behind the reachable window, the one farther behind wins, so that a
    /// single back-seek suffices.
    pub fn choose_rq(
        &self,
        tunables: &BfqTunables,
        last: Sector,
        k1: Option<RqKey>,
        k2: Option<RqKey>,
    ) -> Option<RqKey> {
        let (k1, k2) = match (k1, k2) {
            (None, k2) => return k2,
            (k1, None) => return k1,
            (Some(a), Some(b)) if a == b => return Some(a),
            (Some(a), Some(b)) => (a, b),
        };
        let rq1 = &self.sort_list.get(&k1).expect("candidate not queued").rq;
        let rq2 = &self.sort_list.get(&k2).expect("candidate not queued").rq;

        if rq1.is_sync() && !rq2.is_sync() {
            return Some(k1);
        } else if rq2.is_sync() && !rq1.is_sync() {
            return Some(k2);
        }
        if rq1.is_meta() && !rq2.is_meta() {
            return Some(k1);
        } else if rq2.is_meta() && !rq1.is_meta() {
            return Some(k2);
        }

        let s1 = rq1.sector;
        let s2 = rq2.sector;
        let back_max = tunables.back_max;

        // Strict one-way elevator, except that short backward seeks are
        // allowed at `back_penalty` times their distance.
        let mut d1 = 0;
        let mut d2 = 0;
        let mut wrap1 = false;
        let mut wrap2 = false;
        if s1 >= last {
            d1 = s1 - last;
        } else if s1 + back_max >= last {
            d1 = (last - s1) * tunables.back_penalty;
        } else {
            wrap1 = true;
        }
        if s2 >= last {
            d2 = s2 - last;
        } else if s2 + back_max >= last {
            d2 = (last - s2) * tunables.back_penalty;
        } else {
            wrap2 = true;
        }

        match (wrap1, wrap2) {
            (false, false) => {
                if d1 < d2 {
                    Some(k1)
                } else if d2 < d1 {
                    Some(k2)
                } else if s1 >= s2 {
                    Some(k1)
                } else {
                    Some(k2)
                }
            }
            (false, true) => Some(k1),
            (true, false) => Some(k2),
            // Both are behind the head: start with the one farther behind,
            // so only one back-seek is needed.
            (true, true) => {
                if s1 <= s2 {
                    Some(k1)
                } else {
                    Some(k2)
                }
            }
        }
    }

    /// Re-evaluates `next_rq` against a candidate that just arrived.
    pub fn choose_next(&mut self, tunables: &BfqTunables, last_position: Sector, key: RqKey) {
        let next = self.choose_rq(tunables, last_position, self.next_rq, Some(key));
        assert!(next.is_some());
        self.next_rq = next;
    }

    /// Returns the FIFO head if its deadline has passed.
    ///
    /// The FIFO is polled at most once per dispatch round; the flag is
    /// cleared when the queue is selected for service.
    pub fn check_fifo(&mut self, now: Ticks) -> Option<RqKey> {
        if self.flags.contains(QueueFlags::FIFO_EXPIRE) {
            return None;
        }
        self.flags |= QueueFlags::FIFO_EXPIRE;

        // Skip entries whose request is already gone.
        while let Some(key) = self.fifo.front().copied() {
            match self.sort_list.get(&key) {
                None => {
                    self.fifo.pop_front();
                }
                Some(queued) => {
                    if now.is_before(queued.fifo_deadline) {
                        return None;
                    }
                    return Some(key);
                }
            }
        }
        None
    }

    /// Samples the seek distance between the previous arrival and `rq`.
    pub fn update_seek_stats(&mut self, rq: &IoRequest) {
        let sdist = if self.last_request_pos < rq.sector {
            rq.sector - self.last_request_pos
        } else {
            self.last_request_pos - rq.sector
        };
        self.seek_samples = (7 * self.seek_samples + 256) / 8;
        self.seek_total = (7 * self.seek_total + 256 * sdist) / 8;
        self.seek_mean = self.seek_total / self.seek_samples as u64;
    }

    /// Sector-adjacency lookups for the block layer's merge machinery.
    pub fn former_rq(&self, key: RqKey) -> Option<&IoRequest> {
        self.neighbors(key).0.map(|k| &self.sort_list[&k].rq)
    }

    pub fn latter_rq(&self, key: RqKey) -> Option<&IoRequest> {
        self.neighbors(key).1.map(|k| &self.sort_list[&k].rq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arena::Handle, request::RqFlags};

    fn test_queue() -> BfqQueue {
        BfqQueue::new(EntityId::from_raw(0), Some(IocId(1)), IoClass::Be, true)
    }

    fn rq(sector: Sector, flags: RqFlags) -> IoRequest {
        IoRequest {
            sector,
            nsectors: 8,
            flags,
            ioc: IocId(1),
            token: sector,
        }
    }

    #[test]
    fn back_seek_is_penalized_but_allowed() {
        let mut tunables = BfqTunables::default();
        tunables.back_max = 2000;
        tunables.back_penalty = 2;

        let mut queue = test_queue();
        let k1 = queue.add_rq(rq(2000, RqFlags::SYNC), 0, Ticks::ZERO);
        let k2 = queue.add_rq(rq(900, RqFlags::SYNC), 1, Ticks::ZERO);

        // d1 = 1000 forward, d2 = (1000 - 900) * 2 = 200 penalized backward.
        assert_eq!(queue.choose_rq(&tunables, 1000, Some(k1), Some(k2)), Some(k2));
    }

    #[test]
    fn sync_and_meta_take_precedence_over_distance() {
        let tunables = BfqTunables::default();
        let mut queue = test_queue();
        let near_async = queue.add_rq(rq(100, RqFlags::empty()), 0, Ticks::ZERO);
        let far_sync = queue.add_rq(rq(1_000_000, RqFlags::SYNC), 1, Ticks::ZERO);
        assert_eq!(
            queue.choose_rq(&tunables, 100, Some(near_async), Some(far_sync)),
            Some(far_sync)
        );

        let mut queue = test_queue();
        let near_plain = queue.add_rq(rq(100, RqFlags::SYNC), 0, Ticks::ZERO);
        let far_meta = queue.add_rq(rq(1_000_000, RqFlags::SYNC | RqFlags::META), 1, Ticks::ZERO);
        assert_eq!(
            queue.choose_rq(&tunables, 100, Some(near_plain), Some(far_meta)),
            Some(far_meta)
        );
    }

    #[test]
    fn both_wrapped_picks_farther_behind() {
        let mut tunables = BfqTunables::default();
        tunables.back_max = 10;

        let mut queue = test_queue();
        let k1 = queue.add_rq(rq(100, RqFlags::SYNC), 0, Ticks::ZERO);
        let k2 = queue.add_rq(rq(500, RqFlags::SYNC), 1, Ticks::ZERO);
        // Head at 10_000: both far behind, the lower sector wins.
        assert_eq!(queue.choose_rq(&tunables, 10_000, Some(k1), Some(k2)), Some(k1));
    }

    #[test]
    fn find_next_wraps_to_front() {
        let tunables = BfqTunables::default();
        let mut queue = test_queue();
        let first = queue.add_rq(rq(100, RqFlags::SYNC), 0, Ticks::ZERO);
        let last = queue.add_rq(rq(900, RqFlags::SYNC), 1, Ticks::ZERO);

        // After the highest-sector request, the elevator wraps around.
        assert_eq!(queue.find_next_rq(last, &tunables), Some(first));
    }

    #[test]
    fn remove_refreshes_next_rq() {
        let tunables = BfqTunables::default();
        let mut queue = test_queue();
        let a = queue.add_rq(rq(100, RqFlags::SYNC), 0, Ticks::ZERO);
        let b = queue.add_rq(rq(200, RqFlags::SYNC), 1, Ticks::ZERO);
        queue.next_rq = Some(a);

        let (removed, next_changed) = queue.remove_rq(a, &tunables);
        assert_eq!(removed.sector, 100);
        assert!(next_changed);
        assert_eq!(queue.next_rq, Some(b));
        assert_eq!(queue.nr_queued(), 1);

        let (_, next_changed) = queue.remove_rq(b, &tunables);
        assert!(next_changed);
        assert_eq!(queue.next_rq, None);
        assert!(queue.is_empty());
    }

    #[test]
    fn fifo_expiry_overrides_elevator_once_per_round() {
        let mut queue = test_queue();
        let old = queue.add_rq(rq(500, RqFlags::SYNC), 0, Ticks::from_millis(100));
        let _new = queue.add_rq(rq(100, RqFlags::SYNC), 1, Ticks::from_millis(400));

        // Before the deadline nothing expires.
        assert_eq!(queue.check_fifo(Ticks::from_millis(50)), None);
        queue.flags.remove(QueueFlags::FIFO_EXPIRE);

        // Past the deadline the oldest request is forced.
        assert_eq!(queue.check_fifo(Ticks::from_millis(150)), Some(old));

        // Only one poll per dispatch round.
        assert_eq!(queue.check_fifo(Ticks::from_millis(150)), None);
    }

    #[test]
    fn fifo_skips_dispatched_entries() {
        let tunables = BfqTunables::default();
        let mut queue = test_queue();
        let a = queue.add_rq(rq(500, RqFlags::SYNC), 0, Ticks::from_millis(10));
        let b = queue.add_rq(rq(600, RqFlags::SYNC), 1, Ticks::from_millis(10));
        queue.next_rq = Some(a);
        queue.remove_rq(a, &tunables);

        assert_eq!(queue.check_fifo(Ticks::from_millis(20)), Some(b));
    }

    #[test]
    fn seek_mean_tracks_distance() {
        let mut queue = test_queue();
        queue.last_request_pos = 0;
        let mut pos = 0;
        for i in 0..100 {
            let request = rq(pos, RqFlags::SYNC);
            queue.update_seek_stats(&request);
            queue.last_request_pos = request.sector + request.nsectors as u64;
            pos += if i % 2 == 0 { 8 } else { 100_000 };
        }
        assert!(queue.seeky());

        let mut queue = test_queue();
        queue.last_request_pos = 0;
        let mut pos = 0;
        for _ in 0..100 {
            let request = rq(pos, RqFlags::SYNC);
            queue.update_seek_stats(&request);
            queue.last_request_pos = request.sector + request.nsectors as u64;
            pos += 8;
        }
        assert!(!queue.seeky());
    }

    #[test]
    fn adjacency_lookups() {
        let mut queue = test_queue();
        let a = queue.add_rq(rq(100, RqFlags::SYNC), 0, Ticks::ZERO);
        let b = queue.add_rq(rq(200, RqFlags::SYNC), 1, Ticks::ZERO);
        let c = queue.add_rq(rq(300, RqFlags::SYNC), 2, Ticks::ZERO);

        assert_eq!(queue.former_rq(b).map(|rq| rq.sector), Some(100));
        assert_eq!(queue.latter_rq(b).map(|rq| rq.sector), Some(300));
        assert_eq!(queue.former_rq(a).map(|rq| rq.sector), None);
        assert_eq!(queue.latter_rq(c).map(|rq| rq.sector), None);
    }
}
