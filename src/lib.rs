// SPDX-License-Identifier: MPL-2.0

//! A proportional-share block I/O scheduler.
//!
//! This crate implements the core of a budget-based fair-queueing elevator:
//! each request producer owns a queue with a service budget measured in
//! sectors, and an internal hierarchical scheduler (B-WF2Q+) picks the queue
//! whose virtual finish time is smallest among the eligible ones. Producers
//! therefore share device throughput in proportion to their weights, while a
//! set of latency heuristics (weight-raising, burst detection, soft
//! real-time classification, device idling) keeps interactive and
//! isochronous producers responsive.
//!
//! The crate is deliberately device-agnostic: it never talks to hardware,
//! never sleeps, and never reads a clock on its own. The host drives it
//! through an elevator-like contract:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use aster_bfq::*;
//! # fn demo(clock: Arc<dyn MonotonicClock>, unplug: Arc<dyn UnplugHandle>) {
//! let scheduler = BfqScheduler::new(
//!     DeviceInfo { rotational: true },
//!     BfqTunables::default(),
//!     clock,
//!     unplug,
//! ).unwrap();
//!
//! let producer = scheduler.register_ioc(IocParams::default()).unwrap();
//! scheduler.add_request(IoRequest {
//!     sector: 2048,
//!     nsectors: 8,
//!     flags: RqFlags::SYNC,
//!     ioc: producer,
//!     token: 1,
//! });
//! while let Some(rq) = scheduler.dispatch(false) {
//!     // hand `rq` to the device; call `scheduler.completed(&rq)` when done
//! }
//! # }
//! ```
//!
//! The scheduler may return `None` from `dispatch` while it deliberately
//! idles the device waiting for the in-service producer's next request;
//! work-conservation is traded for fairness and sequentiality on purpose.

#![no_std]
#![deny(unsafe_code)]
#![allow(dead_code)]

extern crate alloc;

mod arena;
mod entity;
mod error;
mod prelude;
mod queue;
mod rate;
mod request;
mod scheduler;
mod service_tree;
mod time;
mod tunables;
mod wf2q;

pub use self::{
    entity::GroupId,
    error::{Errno, Error},
    request::{IoClass, IoRequest, IocId, RqFlags, Sector},
    scheduler::{BfqScheduler, IocParams, UnplugHandle},
    time::{MonotonicClock, Ticks},
    tunables::{BfqTunables, DeviceInfo, DEFAULT_WEIGHT, MAX_WEIGHT},
};

/// The sector size the budgets and positions are expressed in.
pub const SECTOR_SIZE: usize = 512;
