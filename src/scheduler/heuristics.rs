// SPDX-License-Identifier: MPL-2.0

//! The latency heuristics: weight-raising of interactive and soft real-time
//! producers, detection of large activation bursts (which suppress raising),
//! the device-idling policy, and the arrival-time classification feeding all
//! three.

use crate::{
    entity::QueueId,
    prelude::*,
    queue::{BfqQueue, QueueFlags, RqKey},
    request::IoClass,
    time::{Ticks, NANOS_PER_SECOND},
    tunables::{HW_QUEUE_SAMPLES, HW_QUEUE_THRESHOLD, REQUESTS_WITHIN_TIMER, SAMPLES_VALID},
};

use super::BfqData;

impl BfqData {
    /// Whether it pays off (or is needed for fairness) to keep the device
    /// idle waiting for this queue's next request.
    pub(super) fn may_idle(&self, queue: &BfqQueue) -> bool {
        if !queue.is_sync() || queue.class == IoClass::Idle {
            return false;
        }
        if queue.wr_coeff > 1 {
            return true;
        }
        if !queue.flags.contains(QueueFlags::IDLE_WINDOW) {
            return false;
        }
        let symmetric = self.symmetric_scenario();
        if queue.flags.contains(QueueFlags::IN_LARGE_BURST) && symmetric {
            return false;
        }
        // On queueing (command-tagged) devices idling buys no throughput
        // unless the workload is sequential on rotational media; it is
        // still forced when fairness is at stake.
        let idling_boosts_throughput =
            !self.hw_tag || (self.device.rotational && !queue.seeky());
        idling_boosts_throughput || !symmetric
    }

    pub(super) fn must_idle(&self, queue: &BfqQueue) -> bool {
        queue.is_empty() && self.tunables.slice_idle != Ticks::ZERO && self.may_idle(queue)
    }

    pub(super) fn arm_idle_timer(&mut self, now: Ticks) {
        let Some(qid) = self.in_service_queue else {
            return;
        };
        let queue = self.queues.get(qid);
        debug_assert!(queue.is_sync());
        let mut slice = self.tunables.slice_idle;
        if queue.seek_samples > SAMPLES_VALID && queue.seeky() && queue.wr_coeff == 1 {
            // A seeky queue gets only a token wait.
            slice = slice.min(Ticks::from_millis(2));
        } else if queue.wr_coeff > 1 {
            slice = slice.saturating_mul(3);
        }
        self.last_idling_start = now;
        self.idle_timer = Some(now + slice);
        self.queues.get_mut(qid).flags |= QueueFlags::WAIT_REQUEST;
    }

    pub(super) fn update_idle_window(&mut self, qid: QueueId) {
        let queue = self.queues.get(qid);
        if !queue.is_sync() || queue.class == IoClass::Idle {
            return;
        }
        let mut enable = queue.flags.contains(QueueFlags::IDLE_WINDOW);
        let wr_coeff = queue.wr_coeff;
        let seeky = queue.seeky();
        let ttime = queue.ioc.and_then(|ioc| {
            self.iocs
                .get(&ioc.0)
                .filter(|ioc| ioc.ttime_valid())
                .map(|ioc| ioc.ttime_mean)
        });

        if self.tunables.slice_idle == Ticks::ZERO || (self.hw_tag && seeky && wr_coeff == 1) {
            enable = false;
        } else if let Some(ttime_mean) = ttime {
            enable = !(ttime_mean > self.tunables.slice_idle.as_nanos() && wr_coeff == 1);
        }

        let flags = &mut self.queues.get_mut(qid).flags;
        if enable {
            flags.insert(QueueFlags::IDLE_WINDOW);
        } else {
            flags.remove(QueueFlags::IDLE_WINDOW);
        }
    }

    pub(super) fn update_hw_tag(&mut self) {
        self.max_rq_in_driver = self.max_rq_in_driver.max(self.rq_in_driver);
        if self.rq_in_driver + self.queued < HW_QUEUE_THRESHOLD {
            return;
        }
        if self.hw_tag_samples + 1 < HW_QUEUE_SAMPLES {
            self.hw_tag_samples += 1;
            return;
        }
        self.hw_tag = self.max_rq_in_driver > HW_QUEUE_THRESHOLD;
        self.hw_tag_samples = 0;
        self.max_rq_in_driver = 0;
    }

    // ----- weight raising --------------------------------------------------

    pub(super) fn wr_duration(&self) -> Ticks {
        self.peak_rate.wr_duration()
    }

    fn end_wr(&mut self, qid: QueueId, now: Ticks) {
        let busy = self.queues.get(qid).is_busy();
        let queue = self.queues.get_mut(qid);
        debug_assert!(queue.wr_coeff > 1);
        queue.wr_coeff = 1;
        queue.wr_cur_max_time = Ticks::ZERO;
        queue.last_wr_start_finish = now;
        self.queue_entity_mut(qid).prio_changed = true;
        if busy {
            self.wr_busy_queues -= 1;
        }
        trace!("raising ends for {:?}", qid);
    }

    /// Ends a stale raising period before the queue is served again.
    pub(super) fn update_wr_data(&mut self, qid: QueueId, now: Ticks) {
        let queue = self.queues.get(qid);
        if queue.wr_coeff == 1 {
            return;
        }
        let expired = now.is_after(queue.last_wr_start_finish + queue.wr_cur_max_time);
        if queue.flags.contains(QueueFlags::IN_LARGE_BURST) || expired {
            self.end_wr(qid, now);
        }
    }

    /// Earliest honest instant for the next soft real-time raising period:
    /// the producer must not have consumed device service faster than the
    /// soft real-time rate since it last became backlogged.
    pub(super) fn softrt_next_start(&self, qid: QueueId, now: Ticks) -> Ticks {
        let queue = self.queues.get(qid);
        let rate = self.tunables.wr_max_softrt_rate.max(1);
        let span_nanos = (queue.service_from_backlogged as u128 * NANOS_PER_SECOND as u128
            / rate as u128)
            .min(u64::MAX as u128) as u64;
        let honest = queue.last_idle_bklogged + Ticks::from_nanos(span_nanos);
        let floor = now + self.tunables.slice_idle + Ticks::from_millis(16);
        honest.max(floor)
    }

    // ----- burst handling --------------------------------------------------

    fn reset_burst_list(&mut self, qid: QueueId) {
        for member in core::mem::take(&mut self.burst_list) {
            self.queues.get_mut(member).flags.remove(QueueFlags::IN_BURST_LIST);
        }
        self.queues.get_mut(qid).flags |= QueueFlags::IN_BURST_LIST;
        self.burst_list.push(qid);
    }

    fn add_to_burst(&mut self, qid: QueueId) {
        if self.burst_list.len() + 1 >= self.tunables.large_burst_thresh as usize {
            // The burst just became large: mark everyone and drop the list,
            // which has served its purpose.
            self.large_burst = true;
            for member in core::mem::take(&mut self.burst_list) {
                let flags = &mut self.queues.get_mut(member).flags;
                flags.remove(QueueFlags::IN_BURST_LIST);
                flags.insert(QueueFlags::IN_LARGE_BURST);
            }
            self.queues.get_mut(qid).flags |= QueueFlags::IN_LARGE_BURST;
        } else {
            self.queues.get_mut(qid).flags |= QueueFlags::IN_BURST_LIST;
            self.burst_list.push(qid);
        }
    }

    /// Tracks clusters of idle-to-busy transitions. Queues activated as part
    /// of a large cluster are marked and excluded from raising (and usually
    /// from idling): such bursts come from parallel services where boosting
    /// any single member only hurts the aggregate.
    fn handle_burst(&mut self, qid: QueueId, idle_for_long_time: bool, now: Ticks) {
        if idle_for_long_time {
            // An activation after a long idle period means the queue's share
            // of the burst I/O (if any) is done.
            let flags = &mut self.queues.get_mut(qid).flags;
            if flags.contains(QueueFlags::IN_BURST_LIST) {
                flags.remove(QueueFlags::IN_BURST_LIST);
                self.burst_list.retain(|member| *member != qid);
            }
            self.queues.get_mut(qid).flags.remove(QueueFlags::IN_LARGE_BURST);
        }

        let flags = self.queues.get(qid).flags;
        if flags.contains(QueueFlags::IN_BURST_LIST) || flags.contains(QueueFlags::IN_LARGE_BURST) {
            return;
        }

        if now.is_after(self.last_ins_in_burst + self.tunables.burst_interval) {
            // Too late to belong to the previous burst: it is over, and this
            // queue may open a new one.
            self.large_burst = false;
            self.reset_burst_list(qid);
            return;
        }

        if self.large_burst {
            self.queues.get_mut(qid).flags |= QueueFlags::IN_LARGE_BURST;
            return;
        }

        self.add_to_burst(qid);
    }

    // ----- arrival classification ------------------------------------------

    /// A request arrived while the queue was idle (not busy): run the
    /// activation heuristics and link the queue into the scheduler.
    pub(super) fn activate_on_arrival(&mut self, qid: QueueId, rq_key: RqKey, now: Ticks) {
        let queue = self.queues.get(qid);
        let old_wr_coeff = queue.wr_coeff;
        let sync = queue.is_sync();
        // A queue that stayed quiet through a whole interactive idle gap is
        // a candidate for interactive raising.
        let idle_for_long_time =
            now.is_after(queue.budget_timeout + self.tunables.wr_min_idle_time);

        if sync {
            let already_in_burst = queue.flags.contains(QueueFlags::IN_BURST_LIST)
                || queue.flags.contains(QueueFlags::IN_LARGE_BURST);
            self.handle_burst(qid, idle_for_long_time, now);
            if !already_in_burst {
                self.last_ins_in_burst = now;
            }
        }

        let queue = self.queues.get(qid);
        let in_burst = queue.flags.contains(QueueFlags::IN_LARGE_BURST);
        let soft_rt = self.tunables.wr_max_softrt_rate > 0
            && !in_burst
            && now.is_after(queue.soft_rt_next_start);
        let interactive = !in_burst && idle_for_long_time;

        // Grant enough budget for the chosen next request up front.
        let budget = {
            let queue = self.queues.get(qid);
            let next_charge = self.serv_to_charge(&queue.sort_list[&rq_key].rq, queue);
            queue.max_budget.max(next_charge)
        };
        self.queue_entity_mut(qid).budget = budget;

        // I/O-bound detection: count arrivals landing within the think-time
        // window of the previous completion.
        if !self.queues.get(qid).flags.contains(QueueFlags::IO_BOUND) {
            let within = self.queues.get(qid).ioc.and_then(|ioc| self.iocs.get(&ioc.0))
                .map(|ioc| now.is_before(ioc.last_end_request + self.tunables.slice_idle))
                .unwrap_or(false);
            let queue = self.queues.get_mut(qid);
            if within {
                queue.requests_within_timer += 1;
                if queue.requests_within_timer >= REQUESTS_WITHIN_TIMER {
                    queue.flags |= QueueFlags::IO_BOUND;
                }
            } else {
                queue.requests_within_timer = 0;
            }
        }

        if self.tunables.low_latency {
            let wr_duration = self.wr_duration();
            let wr_rt_max_time = self.tunables.wr_rt_max_time;
            let wr_coeff = self.tunables.wr_coeff;
            let queue = self.queues.get_mut(qid);
            if old_wr_coeff == 1 && (interactive || soft_rt) {
                // Start a raising period.
                queue.wr_coeff = wr_coeff;
                queue.wr_cur_max_time = if interactive { wr_duration } else { wr_rt_max_time };
                queue.last_wr_start_finish = now;
            } else if old_wr_coeff > 1 {
                if interactive {
                    queue.wr_cur_max_time = wr_duration;
                } else if in_burst
                    || (queue.wr_cur_max_time == wr_rt_max_time && !soft_rt)
                {
                    queue.wr_coeff = 1;
                } else if soft_rt
                    && (queue.last_wr_start_finish + queue.wr_cur_max_time)
                        .is_before(now + wr_rt_max_time)
                {
                    // The queue requalified as soft real-time while its
                    // remaining raising time is shorter than a full soft
                    // real-time period: recharge, which can only reduce
                    // latency for its pending work.
                    queue.last_wr_start_finish = now;
                    queue.wr_cur_max_time = wr_rt_max_time;
                }
            }
            if old_wr_coeff != self.queues.get(qid).wr_coeff {
                self.queue_entity_mut(qid).prio_changed = true;
            }
        }

        let queue = self.queues.get_mut(qid);
        queue.last_idle_bklogged = now;
        queue.service_from_backlogged = 0;
        queue.flags.remove(QueueFlags::SOFTRT_UPDATE);
        self.add_bfqq_busy(qid);
    }
}
