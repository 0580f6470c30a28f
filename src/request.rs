// SPDX-License-Identifier: MPL-2.0

//! I/O requests as the scheduler sees them.
//!
//! The scheduler does not touch data buffers; a request is just a sector
//! range plus the attributes that drive scheduling: whether the producer
//! waits for it (sync), whether it carries filesystem metadata, and the
//! opaque identity of the producer that issued it.

use bitflags::bitflags;

/// A device sector index (512-byte units).
pub type Sector = u64;

/// The opaque handle identifying one request producer.
///
/// Handed out by [`BfqScheduler::register_ioc`](crate::BfqScheduler::register_ioc);
/// the host attaches it to every request the producer issues.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct IocId(pub(crate) u64);

/// The I/O priority class of a producer.
///
/// Real-time producers are always served before best-effort ones, which are
/// served before idle-class ones (with a small anti-starvation concession to
/// the idle class).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum IoClass {
    Rt = 0,
    #[default]
    Be = 1,
    Idle = 2,
}

/// The number of priority classes, and thus of service trees per scheduler.
pub(crate) const NR_IO_CLASSES: usize = 3;

impl IoClass {
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn from_index(index: usize) -> IoClass {
        match index {
            0 => IoClass::Rt,
            1 => IoClass::Be,
            2 => IoClass::Idle,
            _ => panic!("invalid I/O class index"),
        }
    }
}

bitflags! {
    /// Attributes of a single request.
    pub struct RqFlags: u32 {
        /// The producer blocks on completion: reads, and writes submitted
        /// with an explicit sync hint.
        const SYNC = 1 << 0;
        /// Filesystem metadata; preferred by the next-request chooser.
        const META = 1 << 1;
    }
}

/// One pending I/O request.
///
/// `token` is an opaque cookie for the host (typically an index into the
/// host's own request table); the scheduler stores and returns it untouched.
#[derive(Clone, Debug)]
pub struct IoRequest {
    pub sector: Sector,
    pub nsectors: u32,
    pub flags: RqFlags,
    pub ioc: IocId,
    pub token: u64,
}

impl IoRequest {
    /// The first sector past the end of this request.
    pub fn end_sector(&self) -> Sector {
        self.sector + self.nsectors as Sector
    }

    pub fn is_sync(&self) -> bool {
        self.flags.contains(RqFlags::SYNC)
    }

    pub fn is_meta(&self) -> bool {
        self.flags.contains(RqFlags::META)
    }
}
