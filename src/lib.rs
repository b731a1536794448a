//! # Durable queue
//!
//! A persistent, transactional FIFO queue backed by an append-only journal on
//! local disk. A process typically hosts many independent named queues; each
//! queue owns exactly one journal file, one mutex, and a bounded in-memory
//! working set.
//!
//! ## Design constraints
//!
//! These invariants are the groundwork for keeping the design simple and
//! recoverable:
//! - every state change is preceded by an appended journal record (when
//!   journaling is enabled), so replaying the journal from the start always
//!   reconstructs the logical queue;
//! - the journal is a single append-only file per queue, with length-prefixed
//!   little-endian records; a crash mid-append leaves a truncated trailing
//!   record, which replay discards;
//! - the in-memory working set is bounded: once the logical queue outgrows
//!   `max_memory_size`, the queue enters read-behind and streams items back
//!   out of the journal as memory drains;
//! - tentative (transactional) dequeues are journaled too, so unconfirmed
//!   transactions roll back to the head of the queue after a crash.
//!
//! ## Writing and reading
//!
//! Producers call [`PersistentQueue::add`], which appends an `AddX` record
//! and enqueues into the in-memory buffer (or, in read-behind, only into the
//! journal). Consumers call [`PersistentQueue::remove`], optionally opening a
//! transaction; transactional consumers later confirm (destroying the item)
//! or unremove (reinserting it at the head). Blocked consumers enrol on a
//! FIFO wait list and are woken one-per-add in enrolment order.
//!
//! ## Compaction
//!
//! The journal only ever grows under load, so the queue periodically rolls
//! it: the file is rewritten to hold just the records needed to reconstruct
//! the present state (saved transaction counter, open transactions, live
//! items), written to a sibling temp file and atomically renamed into place.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

pub mod config;
mod item;
pub mod journal;
pub mod queue;

pub use config::{OverlaySetting, QueueConfig, QueueDefaults, QueueSettings};
pub use item::Item;
pub use journal::{Journal, JournalError};
pub use queue::{PersistentQueue, QueueError, QueueLookup};
