// SPDX-License-Identifier: MPL-2.0

pub(crate) use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    vec::Vec,
};
pub(crate) use core::fmt::{self, Debug};

#[allow(unused_imports)]
pub(crate) use log::{debug, trace, warn};

pub(crate) use crate::{
    error::{Errno::*, Error},
    return_errno, return_errno_with_msg,
};

pub(crate) type Result<T> = core::result::Result<T, Error>;
