use std::{
    cmp,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;

/// A single queued message.
///
/// Items are immutable values: they are created by `add`, mutated only to
/// stamp the transaction ID at the moment they enter the open-transaction
/// table, and destroyed when committed, expired, or flushed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    /// Wall-clock time the item was added, in milliseconds since the epoch.
    pub(crate) add_time: u64,
    /// Wall-clock expiry in milliseconds since the epoch. Zero means the
    /// item never expires.
    pub(crate) expiry: u64,
    /// The payload.
    pub(crate) data: Bytes,
    /// Transaction ID stamped at tentative-remove time. Zero means the item
    /// is not part of an open transaction.
    pub(crate) xid: u32,
}

impl Item {
    pub(crate) fn new(add_time: u64, expiry: u64, data: Bytes) -> Self {
        Self {
            add_time,
            expiry,
            data,
            xid: 0,
        }
    }

    /// Gets the wall-clock time the item was added, in milliseconds since
    /// the epoch.
    pub fn add_time(&self) -> u64 {
        self.add_time
    }

    /// Gets the wall-clock expiry of the item, in milliseconds since the
    /// epoch. Zero means the item never expires.
    pub fn expiry(&self) -> u64 {
        self.expiry
    }

    /// Gets the payload of the item.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Consumes the item, returning the payload.
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Gets the transaction ID assigned to the item, or zero if the item was
    /// not dequeued transactionally.
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Gets the size of the item, in bytes.
    ///
    /// Only the payload counts towards an item's size.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Computes the effective expiry of an item added at `add_time`.
///
/// When `max_age` is nonzero, the requested expiry is clamped to
/// `add_time + max_age`; a requested expiry of zero ("never") becomes
/// `add_time + max_age`. When `max_age` is zero, the requested expiry is
/// returned unchanged.
pub fn adjust_expiry(add_time: u64, expiry: u64, max_age: u64) -> u64 {
    if max_age > 0 {
        let limit = add_time.saturating_add(max_age);
        if expiry > 0 {
            cmp::min(expiry, limit)
        } else {
            limit
        }
    } else {
        expiry
    }
}

/// Gets the current wall-clock time in milliseconds since the epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}
