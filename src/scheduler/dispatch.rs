// SPDX-License-Identifier: MPL-2.0

//! The budget and dispatch controller: queue selection, the expiration
//! reasons that end an activation, the multiplicative budget feedback, and
//! the completion/timer flows that drive both.

use crate::{
    entity::QueueId,
    prelude::*,
    queue::{BfqQueue, QueueFlags},
    rate::RATE_SHIFT,
    request::{IoClass, IoRequest},
    time::Ticks,
    tunables::MAX_BUDGET_ASYNC_RQ,
    wf2q,
};

use super::BfqData;

/// Why the in-service queue's activation ended.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(super) enum ExpireReason {
    /// The idle window ran out with nothing arriving.
    TooIdle,
    /// The wall-clock cap of the activation was reached.
    BudgetTimeout,
    /// The budget ran out with backlog remaining.
    BudgetExhausted,
    /// The queue has nothing left and idling is not worthwhile.
    NoMoreRequests,
}

/// Minimum trusted value of the `budgets_assigned` low-pass counter.
const STATS_MIN_BUDGETS: u32 = 194;

impl BfqData {
    pub(super) fn budget_timed_out(&self, queue: &BfqQueue, now: Ticks) -> bool {
        !queue.flags.contains(QueueFlags::BUDGET_NEW) && !queue.budget_timeout.is_after(now)
    }

    fn set_in_service_queue(&mut self, now: Ticks) -> Option<QueueId> {
        debug_assert!(self.in_service_queue.is_none());
        let qid = {
            let mut class_idle_last_service = self.class_idle_last_service;
            let mut ctx = self.ctx();
            let qid = wf2q::get_next_queue(&mut ctx, now, &mut class_idle_last_service);
            self.class_idle_last_service = class_idle_last_service;
            qid?
        };
        let flags = &mut self.queues.get_mut(qid).flags;
        flags.insert(QueueFlags::BUDGET_NEW);
        flags.remove(QueueFlags::FIFO_EXPIRE);
        self.budgets_assigned = (self.budgets_assigned * 7 + 256) / 8;
        self.in_service_queue = Some(qid);
        trace!("in-service queue is now {:?}", qid);
        Some(qid)
    }

    fn set_budget_timeout(&mut self, now: Ticks) {
        let Some(qid) = self.in_service_queue else {
            return;
        };
        let queue = self.queues.get(qid);
        // Raised queues get a proportionally longer wall slice, except in
        // the (short) soft real-time raising mode.
        let coeff = if queue.wr_cur_max_time == self.tunables.wr_rt_max_time {
            1
        } else {
            queue.wr_coeff as u64
        };
        let timeout = self.tunables.timeout(queue.is_sync());
        self.last_budget_start = now;
        let queue = self.queues.get_mut(qid);
        queue.flags.remove(QueueFlags::BUDGET_NEW);
        queue.budget_timeout = now + timeout.saturating_mul(coeff);
    }

    /// Budget feedback: adapt the queue's next budget to its observed
    /// behavior, multiplicatively.
    fn recalc_budget(&mut self, qid: QueueId, reason: ExpireReason) {
        let min_budget = self.max_budget / 32;
        let queue = self.queues.get(qid);
        let dispatched = queue.dispatched;
        let mut budget = queue.max_budget;

        if queue.is_sync() {
            match reason {
                ExpireReason::TooIdle => {
                    if dispatched > 0 {
                        // Completions were still outstanding; the queue may
                        // simply have been starved of its own backlog.
                        budget = (budget * 2).min(self.max_budget);
                    } else if budget > 5 * min_budget {
                        // The whole batch fit well within the budget: bet it
                        // will again, and lower the next one.
                        budget -= 4 * min_budget;
                    } else {
                        budget = min_budget;
                    }
                }
                ExpireReason::BudgetTimeout => {
                    budget = (budget * 2).min(self.max_budget);
                }
                ExpireReason::BudgetExhausted => {
                    // Definitely greedy: give it room to show how far it
                    // can go.
                    budget = (budget * 4).min(self.max_budget);
                }
                ExpireReason::NoMoreRequests => {}
            }
        } else {
            // Async queues always get the maximum budget; the async charge
            // factor already biases service away from them.
            budget = self.max_budget;
        }

        let queue = self.queues.get_mut(qid);
        queue.max_budget = budget;
        if self.budgets_assigned >= STATS_MIN_BUDGETS {
            queue.max_budget = queue.max_budget.min(self.max_budget);
        }

        // Make sure the next activation can serve at least the pending
        // next request, or it would take two rounds to dispatch it.
        let queue = self.queues.get(qid);
        let next_charge = queue
            .next_rq
            .map(|key| self.serv_to_charge(&queue.sort_list[&key].rq, queue))
            .unwrap_or(0);
        let entity_budget = queue.max_budget.max(next_charge);
        self.queue_entity_mut(qid).budget = entity_budget;
    }

    /// Wall time of the ending service slot; an idle window that ran dry
    /// counts only up to the instant idling started.
    fn slot_elapsed(&self, now: Ticks, compensate: bool) -> Ticks {
        let end = if compensate {
            self.last_idling_start
        } else {
            now
        };
        end.elapsed_since(self.last_budget_start)
    }

    /// Whether the ending activation made poor use of the device.
    fn queue_is_slow(&self, qid: QueueId, now: Ticks, compensate: bool) -> bool {
        let elapsed_us = self.slot_elapsed(now, compensate).as_micros();
        if elapsed_us < 1_000 {
            // Too short an interval to judge anything.
            return false;
        }
        let service = self.queue_entity(qid).service;
        if service >= self.max_budget / 3 {
            return false;
        }
        if elapsed_us > 20_000 {
            return true;
        }
        let rate = (service << RATE_SHIFT) / elapsed_us;
        rate < self.peak_rate.peak_rate() / 2
    }

    fn update_peak_rate(&mut self, qid: QueueId, now: Ticks, compensate: bool, reason: ExpireReason) {
        let elapsed = self.slot_elapsed(now, compensate);
        if elapsed.as_micros() < 1_000 {
            return;
        }
        let sample_worthy = match reason {
            ExpireReason::BudgetExhausted => true,
            ExpireReason::BudgetTimeout => !self.queues.get(qid).seeky(),
            _ => false,
        };
        if !sample_worthy {
            return;
        }
        let service = self.queue_entity(qid).service;
        self.peak_rate.add_sample(service, elapsed);

        if self.tunables.max_budget.is_none() && self.peak_rate.valid() {
            self.max_budget = self.peak_rate.calc_max_budget(&self.tunables);
        }
    }

    // ----- expiration ------------------------------------------------------

    pub(super) fn bfqq_expire(
        &mut self,
        qid: QueueId,
        now: Ticks,
        compensate: bool,
        reason: ExpireReason,
    ) {
        debug_assert_eq!(self.in_service_queue, Some(qid));
        let slow = self.queue_is_slow(qid, now, compensate);
        self.update_peak_rate(qid, now, compensate, reason);

        if reason == ExpireReason::TooIdle {
            let entity = self.queue_entity(qid);
            if entity.service <= entity.budget / 5 {
                // The queue barely used its slot; not I/O-bound after all.
                self.queues.get_mut(qid).flags.remove(QueueFlags::IO_BOUND);
            }
        }

        if self.tunables.low_latency && self.queues.get(qid).wr_coeff == 1 {
            self.queues.get_mut(qid).last_wr_start_finish = now;
        }

        // Soft real-time bookkeeping: an isochronous producer finishes its
        // backlog before (or right as) it stops being served.
        if self.tunables.low_latency
            && self.tunables.wr_max_softrt_rate > 0
            && self.queues.get(qid).is_empty()
        {
            if self.queues.get(qid).dispatched == 0 {
                let next_start = self.softrt_next_start(qid, now);
                self.queues.get_mut(qid).soft_rt_next_start = next_start;
            } else {
                // Completions still in flight; re-evaluate when they land.
                self.queues.get_mut(qid).flags |= QueueFlags::SOFTRT_UPDATE;
            }
        }

        // Punish slow (seeky) and timed-out queues by charging the full
        // budget: their fair share is then measured in device time, not in
        // sectors they never managed to transfer.
        let entity = self.queue_entity_mut(qid);
        if slow
            || (reason == ExpireReason::BudgetTimeout
                && entity.budget_left() >= entity.budget / 3)
        {
            entity.service = entity.budget;
        }
        let service = self.queue_entity(qid).service;
        self.queues.get_mut(qid).service_from_backlogged += service;

        self.recalc_budget(qid, reason);
        trace!("expire {:?}: reason {:?} slow {}", qid, reason, slow);

        // Deselect, then either park the queue (empty) or requeue it.
        self.in_service_queue = None;
        self.idle_timer = None;
        let queue = self.queues.get_mut(qid);
        queue.flags.remove(QueueFlags::WAIT_REQUEST);
        if queue.is_empty() {
            self.del_bfqq_busy(qid, true);
        } else {
            let eid = queue.entity;
            let mut ctx = self.ctx();
            wf2q::activate_entity(&mut ctx, eid);
        }
    }

    // ----- selection and dispatch ------------------------------------------

    fn select_queue(&mut self, now: Ticks) -> Option<QueueId> {
        let Some(qid) = self.in_service_queue else {
            return self.set_in_service_queue(now);
        };

        let reason;
        'expire: {
            let queue = self.queues.get(qid);
            if self.budget_timed_out(queue, now)
                && self.idle_timer.is_none()
                && !self.must_idle(queue)
            {
                reason = ExpireReason::BudgetTimeout;
                break 'expire;
            }

            if let Some(next) = queue.next_rq {
                let rq_charge = self.serv_to_charge(&queue.sort_list[&next].rq, queue);
                if rq_charge > self.queue_entity(qid).budget_left() {
                    reason = ExpireReason::BudgetExhausted;
                    break 'expire;
                }
                // A request arrived while idling but was deemed too small to
                // break the window; now that the device asks for work, stop
                // waiting.
                if self.idle_timer.is_some() {
                    self.idle_timer = None;
                    self.queues.get_mut(qid).flags.remove(QueueFlags::WAIT_REQUEST);
                }
                return Some(qid);
            }

            // Nothing to serve. Keep the queue selected while the idle
            // window runs, or while completions are outstanding and idling
            // is worthwhile.
            if self.idle_timer.is_some() || (queue.dispatched > 0 && self.may_idle(queue)) {
                return None;
            }
            reason = ExpireReason::NoMoreRequests;
        }

        self.bfqq_expire(qid, now, false, reason);
        self.set_in_service_queue(now)
    }

    fn dispatch_from(&mut self, qid: QueueId, now: Ticks, force: bool) -> Option<IoRequest> {
        let key = {
            let queue = self.queues.get_mut(qid);
            match queue.check_fifo(now) {
                Some(expired) => expired,
                None => queue.next_rq.expect("selected queue without requests"),
            }
        };

        if self.queues.get(qid).flags.contains(QueueFlags::BUDGET_NEW) {
            self.set_budget_timeout(now);
        }

        let charge = {
            let queue = self.queues.get(qid);
            self.serv_to_charge(&queue.sort_list[&key].rq, queue)
        };
        let budget_left = self.queue_entity(qid).budget_left();
        if charge > budget_left && !force {
            // The FIFO-expired request may be larger than the elevator's
            // choice; make sure the refreshed budget accounts for it.
            self.queues.get_mut(qid).next_rq = Some(key);
            self.bfqq_expire(qid, now, false, ExpireReason::BudgetExhausted);
            return None;
        }

        let served = charge.min(budget_left);
        {
            let eid = self.queues.get(qid).entity;
            let mut ctx = self.ctx();
            wf2q::entity_served(&mut ctx, eid, served);
        }

        let (rq, _) = {
            let tunables = self.tunables.clone();
            self.queues.get_mut(qid).remove_rq(key, &tunables)
        };
        self.queued -= 1;
        self.last_position = rq.end_sector();

        self.update_wr_data(qid, now);

        self.queues.get_mut(qid).dispatched += 1;
        self.rq_in_driver += 1;
        if rq.is_sync() {
            self.sync_flight += 1;
        }
        trace!("dispatch {:?} sector {} from {:?}", rq.token, rq.sector, qid);
        Some(rq)
    }

    fn forced_dispatch(&mut self, now: Ticks) -> Option<IoRequest> {
        // Drain mode: drop any idle wait, then serve whatever is pending,
        // budget or not.
        self.idle_timer = None;
        if let Some(qid) = self.in_service_queue {
            self.queues.get_mut(qid).flags.remove(QueueFlags::WAIT_REQUEST);
            if self.queues.get(qid).next_rq.is_some() {
                return self.dispatch_from(qid, now, true);
            }
            self.bfqq_expire(qid, now, false, ExpireReason::NoMoreRequests);
        }
        let qid = self.set_in_service_queue(now)?;
        self.dispatch_from(qid, now, true)
    }

    pub(super) fn dispatch(&mut self, now: Ticks, force: bool) -> Option<IoRequest> {
        if self.busy_queues == 0 {
            return None;
        }
        if force {
            return self.forced_dispatch(now);
        }

        let qid = self.select_queue(now)?;
        let queue = self.queues.get(qid);

        if !queue.is_sync() {
            // Bound how far async queues run ahead inside the driver.
            if queue.dispatched >= MAX_BUDGET_ASYNC_RQ && self.busy_queues > 1 {
                return None;
            }
            if queue.dispatched >= 4 * MAX_BUDGET_ASYNC_RQ {
                return None;
            }
            if self.sync_flight > 0 {
                return None;
            }
        }
        if queue.class == IoClass::Idle && queue.dispatched > 0 {
            // The idle class gets one request in the driver at a time.
            return None;
        }

        self.dispatch_from(qid, now, false)
    }

    // ----- completion and timer --------------------------------------------

    pub(super) fn completed_request(&mut self, rq: &IoRequest, now: Ticks) {
        let Some(qid) = self.queue_of(rq) else {
            warn!("completion for unknown request token {}", rq.token);
            return;
        };
        self.rq_owner.remove(&rq.token);

        let queue = self.queues.get_mut(qid);
        assert!(queue.dispatched > 0);
        queue.dispatched -= 1;
        self.rq_in_driver -= 1;
        if rq.is_sync() {
            self.sync_flight -= 1;
        }
        self.update_hw_tag();

        if rq.is_sync() {
            if let Some(ioc) = self.queues.get(qid).ioc {
                if let Some(ioc_data) = self.iocs.get_mut(&ioc.0) {
                    ioc_data.last_end_request = now;
                }
            }
        }

        // The just-emptied producer completed all its backlog: refresh its
        // soft real-time horizon.
        let queue = self.queues.get(qid);
        if queue.flags.contains(QueueFlags::SOFTRT_UPDATE)
            && self.tunables.wr_max_softrt_rate > 0
            && queue.dispatched == 0
            && queue.is_empty()
        {
            let next_start = self.softrt_next_start(qid, now);
            let queue = self.queues.get_mut(qid);
            queue.soft_rt_next_start = next_start;
            queue.flags.remove(QueueFlags::SOFTRT_UPDATE);
        }

        if self.in_service_queue == Some(qid) {
            if self.queues.get(qid).flags.contains(QueueFlags::BUDGET_NEW) {
                self.set_budget_timeout(now);
            }
            let queue = self.queues.get(qid);
            if self.must_idle(queue) {
                self.arm_idle_timer(now);
            } else if self.budget_timed_out(queue, now) {
                self.bfqq_expire(qid, now, false, ExpireReason::BudgetTimeout);
                self.unplug_pending = self.queued > 0;
            } else if queue.is_empty()
                && (queue.dispatched == 0 || !self.may_idle(queue))
            {
                self.bfqq_expire(qid, now, false, ExpireReason::NoMoreRequests);
                self.unplug_pending = self.queued > 0;
            }
        }

        self.put_queue(qid);
    }

    pub(super) fn timer_expired(&mut self, now: Ticks) {
        let Some(deadline) = self.idle_timer else {
            return;
        };
        if now.is_before(deadline) {
            // Early host timer; keep waiting.
            return;
        }
        self.idle_timer = None;

        if let Some(qid) = self.in_service_queue {
            self.queues.get_mut(qid).flags.remove(QueueFlags::WAIT_REQUEST);
            let queue = self.queues.get(qid);
            let reason = if self.budget_timed_out(queue, now) {
                Some(ExpireReason::BudgetTimeout)
            } else if queue.nr_queued() == 0 {
                Some(ExpireReason::TooIdle)
            } else {
                None
            };
            if let Some(reason) = reason {
                // The idle window itself bounds the unaccounted time:
                // measure service against the idling start, not now.
                self.bfqq_expire(qid, now, true, reason);
            }
        }
        self.unplug_pending = self.queued > 0;
    }
}
