//! The persistent queue.
//!
//! A [`PersistentQueue`] is a FIFO of byte payloads guarded by a single
//! mutex, journaled to disk, with a bounded in-memory working set. All
//! public operations acquire the mutex, perform any journal I/O while
//! holding it, and return promptly; the blocking variants wait *outside*
//! the mutex on a single-shot wakeup channel.
//!
//! Journal I/O failures are fail-stop: the first failed append or rotation
//! takes the queue out of service (adds return `false`, reads return
//! `None`) rather than letting memory and disk silently diverge. The
//! observational accessors keep answering from memory so the state can be
//! inspected.

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use snafu::{ResultExt, Snafu};
use tokio::time::{timeout_at, Instant};

use crate::{
    config::QueueSettings,
    item::{adjust_expiry, now_millis, Item},
    journal::{DecodeError, Journal, JournalError, Record},
    QueueConfig,
};

mod waiters;
use self::waiters::WaitQueue;

#[cfg(test)]
mod tests;

/// Error that occurred while opening a [`PersistentQueue`].
#[derive(Debug, Snafu)]
pub enum QueueError {
    /// The journal file could not be opened or created.
    #[snafu(display("failed to open journal for queue '{name}': {source}"))]
    OpenJournal { name: String, source: JournalError },

    /// The journal could not be replayed.
    ///
    /// Decode failures are tolerated (replay stops at the last good
    /// record); this covers I/O failures while scanning, truncating, or
    /// rolling back open transactions.
    #[snafu(display("failed to replay journal for queue '{name}': {source}"))]
    ReplayJournal { name: String, source: JournalError },
}

/// Resolves queue names to queues.
///
/// The queue registry lives outside this crate; a queue only consults it to
/// lazily resolve its `move_expired_to` target, and never owns the result.
pub trait QueueLookup: Send + Sync {
    fn queue_by_name(&self, name: &str) -> Option<Arc<PersistentQueue>>;
}

/// Which read operation a blocking get retries.
#[derive(Clone, Copy)]
enum ReadKind {
    Peek,
    Remove { transactional: bool },
}

/// Expired payloads waiting to be republished into another queue, keyed by
/// the target queue's name. Republishing happens after the queue lock is
/// released, so two queues expiring into each other cannot deadlock.
type Republish = Vec<(String, Bytes)>;

/// A persistent, transactional FIFO queue backed by an append-only journal.
pub struct PersistentQueue {
    name: String,
    settings: QueueSettings,
    lookup: RwLock<Option<Arc<dyn QueueLookup>>>,
    inner: Mutex<QueueState>,
}

struct QueueState {
    /// Items currently resident in memory, head at the front. In
    /// read-behind this is the prefix of the logical queue most recently
    /// streamed in from the journal.
    buffer: VecDeque<Item>,
    /// Total logical items: memory plus still-on-disk behind the read
    /// cursor.
    queue_length: usize,
    /// Total logical bytes, same scope as `queue_length`.
    queue_size: u64,
    /// Bytes of the items in `buffer`.
    memory_bytes: u64,
    /// Items dequeued tentatively and not yet confirmed, by transaction ID.
    /// Not counted in `queue_length`/`queue_size`.
    open_transactions: HashMap<u32, Item>,
    xid_counter: u32,
    total_items: u64,
    total_expired: u64,
    total_discarded: u64,
    current_age_ms: u64,
    closed: bool,
    paused: bool,
    /// Fail-stop latch: set on the first journal I/O failure.
    broken: bool,
    journal: Journal,
    waiters: WaitQueue,
}

impl PersistentQueue {
    /// Opens the queue named `name`, journaled at
    /// `<persistence_path>/<name>`, and replays any existing journal to
    /// reconstruct its state. Transactions left open by a crash are rolled
    /// back to the head of the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be opened or an I/O failure
    /// interrupts the replay.
    pub fn open<P: AsRef<Path>>(
        name: &str,
        persistence_path: P,
        settings: QueueSettings,
    ) -> Result<PersistentQueue, QueueError> {
        let journal_path = persistence_path.as_ref().join(name);
        let journal = Journal::open(journal_path).context(OpenJournalSnafu { name })?;

        let queue = PersistentQueue {
            name: name.to_string(),
            settings,
            lookup: RwLock::new(None),
            inner: Mutex::new(QueueState {
                buffer: VecDeque::new(),
                queue_length: 0,
                queue_size: 0,
                memory_bytes: 0,
                open_transactions: HashMap::new(),
                xid_counter: 0,
                total_items: 0,
                total_expired: 0,
                total_discarded: 0,
                current_age_ms: 0,
                closed: false,
                paused: false,
                broken: false,
                journal,
                waiters: WaitQueue::new(),
            }),
        };
        queue.setup().context(ReplayJournalSnafu { name })?;
        Ok(queue)
    }

    /// Gets the name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the live settings of the queue.
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Installs the registry used to resolve `move_expired_to` targets.
    pub fn set_queue_lookup(&self, lookup: Arc<dyn QueueLookup>) {
        *self.lookup.write() = Some(lookup);
    }

    /// Overlays a per-queue configuration snapshot; changes take effect on
    /// the next operation. Turning journaling off erases the on-disk log.
    pub fn apply_config(&self, config: &QueueConfig) {
        self.settings.apply(config);
        if !self.settings.journal.get() {
            let mut state = self.inner.lock();
            if let Err(error) = state.journal.erase() {
                error!(
                    queue = %self.name,
                    %error,
                    "Failed to erase journal; taking queue out of service."
                );
                state.broken = true;
            }
        }
    }

    /// Adds an item with the given expiry (in epoch milliseconds; zero
    /// means never). Returns `false` if the queue is closed or out of
    /// service, the payload exceeds `max_item_size`, or the queue is at
    /// capacity and `discard_old_when_full` is off.
    ///
    /// A `true` return means the journal record was appended (and fsynced,
    /// when `sync_journal` is on) before this method returned, so the item
    /// is recoverable.
    pub fn add(&self, data: Bytes, expiry: u64) -> bool {
        let mut state = self.inner.lock();
        self.add_locked(&mut state, data, expiry)
    }

    /// Returns the head item without removing it, after discarding any
    /// expired items from the head. Returns `None` if the queue is closed,
    /// paused, out of service, or empty.
    pub fn peek(&self) -> Option<Item> {
        let mut republish = Republish::new();
        let result = {
            let mut state = self.inner.lock();
            self.peek_locked(&mut state, &mut republish)
        };
        self.republish_expired(republish);
        result
    }

    /// Removes and returns the head item, after discarding any expired
    /// items from the head. Returns `None` if the queue is closed, paused,
    /// out of service, or empty.
    ///
    /// A transactional remove assigns the item a transaction ID and parks
    /// it in the open-transaction table until [`PersistentQueue::confirm_remove`]
    /// destroys it or [`PersistentQueue::unremove`] puts it back at the
    /// head.
    pub fn remove(&self, transactional: bool) -> Option<Item> {
        let mut republish = Republish::new();
        let result = {
            let mut state = self.inner.lock();
            self.remove_locked(&mut state, transactional, &mut republish)
        };
        self.republish_expired(republish);
        result
    }

    /// Rolls back the open transaction `xid`: the item is reinserted at the
    /// head of the queue, ahead of everything currently queued. Unknown
    /// transaction IDs are silently ignored. No-op once the queue is
    /// closed.
    pub fn unremove(&self, xid: u32) {
        let keep_journal = self.settings.journal.get();
        let fsync = self.settings.sync_journal.get();

        let mut state = self.inner.lock();
        if state.closed || state.broken {
            return;
        }
        // The record is appended even for an unknown xid; replay ignores it
        // the same way.
        if keep_journal && !state.journal_append(&Record::Unremove { xid }, fsync) {
            return;
        }
        if state.unremove_item(xid) {
            state.waiters.wake_one();
        }
    }

    /// Confirms the open transaction `xid`, destroying the item. Unknown
    /// transaction IDs are silently ignored. No-op once the queue is
    /// closed.
    pub fn confirm_remove(&self, xid: u32) {
        let keep_journal = self.settings.journal.get();
        let fsync = self.settings.sync_journal.get();

        let mut state = self.inner.lock();
        if state.closed || state.broken {
            return;
        }
        if keep_journal && !state.journal_append(&Record::ConfirmRemove { xid }, fsync) {
            return;
        }
        state.open_transactions.remove(&xid);
    }

    /// Discards expired items from the head of the queue, republishing them
    /// into the `move_expired_to` queue if one is configured. Returns the
    /// number of items discarded.
    pub fn discard_expired(&self) -> usize {
        let mut republish = Republish::new();
        let discarded = {
            let mut state = self.inner.lock();
            if state.closed || state.broken {
                0
            } else {
                self.discard_expired_locked(&mut state, &mut republish)
            }
        };
        self.republish_expired(republish);
        discarded
    }

    /// Removes and returns the head item, waiting until the given absolute
    /// deadline for one to arrive.
    ///
    /// Waiters are served in enrolment order, one per add. At the deadline
    /// the waiter deregisters and makes one final non-blocking attempt, so
    /// an item handed over in the instant of the timeout is not lost.
    /// Returns `None` immediately (without waiting) if the queue is closed
    /// or paused.
    pub async fn remove_receive(&self, deadline: Instant, transactional: bool) -> Option<Item> {
        self.operate_or_wait(deadline, ReadKind::Remove { transactional })
            .await
    }

    /// Returns the head item without removing it, waiting until the given
    /// absolute deadline for one to arrive. See
    /// [`PersistentQueue::remove_receive`] for the waiting contract.
    pub async fn peek_receive(&self, deadline: Instant) -> Option<Item> {
        self.operate_or_wait(deadline, ReadKind::Peek).await
    }

    /// Removes every item from the queue, non-transactionally.
    pub fn flush(&self) {
        while self.remove(false).is_some() {}
    }

    /// Closes the queue: subsequent adds return `false`, reads return
    /// `None`, and every blocked consumer is woken to observe the closure.
    /// The journal file is left on disk for the next open to replay.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.journal.close();
        state.waiters.wake_all();
    }

    /// Pauses reads: `peek`/`remove` return `None` until
    /// [`PersistentQueue::resume_reads`], and every blocked consumer is
    /// woken. Adds are unaffected.
    pub fn pause_reads(&self) {
        let mut state = self.inner.lock();
        state.paused = true;
        state.waiters.wake_all();
    }

    /// Resumes reads after [`PersistentQueue::pause_reads`].
    pub fn resume_reads(&self) {
        self.inner.lock().paused = false;
    }

    /// Erases the on-disk journal.
    pub fn destroy_journal(&self) {
        let mut state = self.inner.lock();
        if let Err(error) = state.journal.erase() {
            error!(
                queue = %self.name,
                %error,
                "Failed to erase journal; taking queue out of service."
            );
            state.broken = true;
        }
    }

    // Observational accessors. Each takes the queue lock so the values are
    // mutually consistent with in-flight operations.

    /// Total logical items queued (memory plus journal-behind).
    pub fn len(&self) -> usize {
        self.inner.lock().queue_length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total logical bytes queued.
    pub fn bytes(&self) -> u64 {
        self.inner.lock().queue_size
    }

    /// Number of successful adds over the life of the journal.
    pub fn total_items(&self) -> u64 {
        self.inner.lock().total_items
    }

    /// Number of items dropped because they expired.
    pub fn total_expired(&self) -> u64 {
        self.inner.lock().total_expired
    }

    /// Number of items dropped to make room under `discard_old_when_full`.
    pub fn total_discarded(&self) -> u64 {
        self.inner.lock().total_discarded
    }

    /// Age, in milliseconds, of the most recently removed item at the time
    /// it was removed; zero while the queue is empty.
    pub fn current_age(&self) -> u64 {
        let state = self.inner.lock();
        if state.queue_length == 0 {
            0
        } else {
            state.current_age_ms
        }
    }

    /// Number of consumers currently blocked waiting for an item.
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Number of tentatively removed items awaiting confirm or unremove.
    pub fn open_transaction_count(&self) -> usize {
        self.inner.lock().open_transactions.len()
    }

    /// Number of items resident in memory.
    pub fn memory_length(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Bytes of the items resident in memory.
    pub fn memory_bytes(&self) -> u64 {
        self.inner.lock().memory_bytes
    }

    /// Current length of the journal file, in bytes.
    pub fn journal_size(&self) -> u64 {
        self.inner.lock().journal.size()
    }

    /// `true` while the journal's read cursor trails its write end.
    pub fn in_read_behind(&self) -> bool {
        self.inner.lock().journal.in_read_behind()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// `true` once a journal I/O failure has taken the queue out of
    /// service.
    pub fn is_broken(&self) -> bool {
        self.inner.lock().broken
    }

    fn setup(&self) -> Result<(), JournalError> {
        let mut state = self.inner.lock();
        state.total_items = 0;
        state.total_expired = 0;
        state.total_discarded = 0;
        state.current_age_ms = 0;
        if self.settings.journal.get() {
            self.replay_journal(&mut state)?;
        }
        Ok(())
    }

    /// Replays the journal into fresh in-memory state, then rolls back any
    /// transactions the previous process left open.
    #[instrument(skip_all, fields(queue = %self.name), level = "debug")]
    fn replay_journal(&self, state: &mut QueueState) -> Result<(), JournalError> {
        let max_memory = self.settings.max_memory_size.get();
        let fsync = self.settings.sync_journal.get();

        state.journal.begin_replay()?;
        loop {
            match state.journal.replay_next() {
                Ok(Some(record)) => self.apply_replayed(state, record, max_memory)?,
                Ok(None) => break,
                Err(DecodeError::Io { source }) => return Err(JournalError::Io { source }),
                Err(DecodeError::Truncated) => {
                    warn!(
                        queue = %self.name,
                        "Journal ends in a partial record; discarding the torn tail."
                    );
                    break;
                }
                Err(error) => {
                    error!(
                        queue = %self.name,
                        position = state.journal.replay_position(),
                        %error,
                        "Corrupt journal record; keeping everything replayed so far."
                    );
                    break;
                }
            }
        }
        state.journal.finish_replay()?;

        // Roll back transactions that were open at the crash, oldest xid
        // first, so they land back at the head in a deterministic order.
        let mut open_xids: Vec<u32> = state.open_transactions.keys().copied().collect();
        open_xids.sort_unstable();
        for xid in open_xids {
            state.journal.append(&Record::Unremove { xid }, fsync)?;
            state.unremove_item(xid);
        }

        debug!(
            queue = %self.name,
            items = state.queue_length,
            bytes = state.queue_size,
            resident_bytes = state.memory_bytes,
            journal_size = state.journal.size(),
            read_behind = state.journal.in_read_behind(),
            "Replayed journal."
        );
        Ok(())
    }

    fn apply_replayed(
        &self,
        state: &mut QueueState,
        record: Record,
        max_memory: u64,
    ) -> Result<(), JournalError> {
        match record {
            Record::Add { data } => {
                state.add_item(Item::new(now_millis(), 0, data));
                state.maybe_start_read_behind(max_memory)?;
            }
            Record::AddX { expiry, data } => {
                state.add_item(Item::new(now_millis(), expiry, data));
                state.maybe_start_read_behind(max_memory)?;
            }
            Record::Remove => {
                if state.pop_head(max_memory).is_none() {
                    trace!(queue = %self.name, "Remove record with nothing queued; skipping.");
                }
            }
            // The legacy tentative-remove record carries no xid; synthesize
            // one so the open transaction can still be tracked.
            Record::RemoveTentative => {
                let xid = state.next_xid();
                state.tentative_remove(xid, max_memory);
            }
            Record::RemoveTentativeX { xid } => {
                state.tentative_remove(xid, max_memory);
            }
            Record::SavedXid { xid } => state.xid_counter = xid,
            Record::Unremove { xid } => {
                state.unremove_item(xid);
            }
            Record::ConfirmRemove { xid } => {
                state.open_transactions.remove(&xid);
            }
        }
        Ok(())
    }

    fn add_locked(&self, state: &mut QueueState, data: Bytes, expiry: u64) -> bool {
        if state.closed || state.broken {
            return false;
        }
        if data.len() as u64 > self.settings.max_item_size.get() {
            return false;
        }

        let keep_journal = self.settings.journal.get();
        let fsync = self.settings.sync_journal.get();
        let max_items = self.settings.max_items.get();
        let max_size = self.settings.max_size.get();
        let max_memory = self.settings.max_memory_size.get();
        let discard_old = self.settings.discard_old_when_full.get();

        while state.queue_length >= max_items || state.queue_size >= max_size {
            if !discard_old {
                return false;
            }
            if keep_journal && !state.journal_append(&Record::Remove, fsync) {
                return false;
            }
            if state.pop_head(max_memory).is_none() {
                break;
            }
            state.total_discarded += 1;
        }

        let now = now_millis();
        let item = Item::new(
            now,
            adjust_expiry(now, expiry, self.settings.max_age.get()),
            data,
        );

        if keep_journal && !state.journal.in_read_behind() {
            let journal_size = state.journal.size();
            let max_journal_size = self.settings.max_journal_size.get();
            let overflow = self.settings.max_journal_overflow.get();
            let absolute = self.settings.max_journal_size_absolute.get();
            if (journal_size > max_journal_size.saturating_mul(overflow)
                && state.queue_size < max_journal_size)
                || journal_size > absolute
            {
                state.roll_journal();
                if state.broken {
                    return false;
                }
            }
            if state.queue_size >= max_memory {
                if let Err(error) = state.journal.start_read_behind() {
                    error!(
                        queue = %self.name,
                        %error,
                        "Failed to enter read-behind; taking queue out of service."
                    );
                    state.broken = true;
                    return false;
                }
            }
        }

        if keep_journal {
            let record = Record::AddX {
                expiry: item.expiry,
                data: item.data.clone(),
            };
            if !state.journal_append(&record, fsync) {
                return false;
            }
        }
        state.add_item(item);
        state.waiters.wake_one();
        true
    }

    fn peek_locked(&self, state: &mut QueueState, republish: &mut Republish) -> Option<Item> {
        if state.closed || state.paused || state.broken || state.queue_length == 0 {
            return None;
        }
        self.discard_expired_locked(state, republish);
        state.buffer.front().cloned()
    }

    fn remove_locked(
        &self,
        state: &mut QueueState,
        transactional: bool,
        republish: &mut Republish,
    ) -> Option<Item> {
        if state.closed || state.paused || state.broken || state.queue_length == 0 {
            return None;
        }
        self.discard_expired_locked(state, republish);
        if state.broken || state.queue_length == 0 {
            return None;
        }

        let keep_journal = self.settings.journal.get();
        let fsync = self.settings.sync_journal.get();
        let max_memory = self.settings.max_memory_size.get();

        if transactional {
            let xid = state.next_xid();
            if keep_journal && !state.journal_append(&Record::RemoveTentativeX { xid }, fsync) {
                return None;
            }
            let mut item = state.pop_head(max_memory)?;
            state.current_age_ms = now_millis().saturating_sub(item.add_time);
            item.xid = xid;
            state.open_transactions.insert(xid, item.clone());
            Some(item)
        } else {
            if keep_journal && !state.journal_append(&Record::Remove, fsync) {
                return None;
            }
            let item = state.pop_head(max_memory)?;
            state.current_age_ms = now_millis().saturating_sub(item.add_time);

            // An empty queue is the cheapest possible moment to compact: the
            // rolled journal holds only the open transactions.
            if state.queue_length == 0
                && keep_journal
                && state.journal.size() >= self.settings.max_journal_size.get()
            {
                state.roll_journal();
            }
            Some(item)
        }
    }

    /// Drops expired items from the head, journaling each drop and queueing
    /// the payloads for republication if `move_expired_to` is set.
    fn discard_expired_locked(&self, state: &mut QueueState, republish: &mut Republish) -> usize {
        let keep_journal = self.settings.journal.get();
        let fsync = self.settings.sync_journal.get();
        let max_memory = self.settings.max_memory_size.get();
        let target = self.settings.move_expired_to.get();
        let now = now_millis();

        let mut discarded = 0;
        loop {
            let expired = state
                .buffer
                .front()
                .is_some_and(|head| head.expiry != 0 && head.expiry < now);
            if !expired {
                break;
            }
            if keep_journal && !state.journal_append(&Record::Remove, fsync) {
                break;
            }
            let Some(item) = state.pop_head(max_memory) else {
                break;
            };
            state.total_expired += 1;
            discarded += 1;
            if let Some(name) = &target {
                republish.push((name.clone(), item.data));
            }
        }
        discarded
    }

    /// Republishes expired payloads into their target queues, with expiry
    /// cleared. Called with no locks held; targets are resolved lazily
    /// through the registry, which may no longer know them.
    fn republish_expired(&self, republish: Republish) {
        if republish.is_empty() {
            return;
        }
        let Some(lookup) = self.lookup.read().clone() else {
            return;
        };
        for (name, data) in republish {
            if let Some(target) = lookup.queue_by_name(&name) {
                if !target.add(data, 0) {
                    trace!(
                        queue = %self.name,
                        target = %name,
                        "Expired item rejected by its destination queue; dropping it."
                    );
                }
            } else {
                trace!(
                    queue = %self.name,
                    target = %name,
                    "No queue with this name; dropping expired item."
                );
            }
        }
    }

    fn attempt(
        &self,
        state: &mut QueueState,
        kind: ReadKind,
        republish: &mut Republish,
    ) -> Option<Item> {
        match kind {
            ReadKind::Peek => self.peek_locked(state, republish),
            ReadKind::Remove { transactional } => {
                self.remove_locked(state, transactional, republish)
            }
        }
    }

    async fn operate_or_wait(&self, deadline: Instant, kind: ReadKind) -> Option<Item> {
        enum Step {
            Done(Option<Item>),
            Wait(u64, tokio::sync::oneshot::Receiver<()>),
        }

        loop {
            let mut republish = Republish::new();
            let step = {
                let mut state = self.inner.lock();
                if let Some(item) = self.attempt(&mut state, kind, &mut republish) {
                    Step::Done(Some(item))
                } else if state.closed || state.paused || state.broken {
                    Step::Done(None)
                } else if Instant::now() >= deadline {
                    Step::Done(None)
                } else {
                    let (token, wait) = state.waiters.enroll();
                    Step::Wait(token, wait)
                }
            };
            self.republish_expired(republish);

            let (token, wait) = match step {
                Step::Done(result) => return result,
                Step::Wait(token, wait) => (token, wait),
            };

            if timeout_at(deadline, wait).await.is_ok() {
                // Signalled; retry from the top.
                continue;
            }

            // Deadline reached. Deregister, then make one final attempt: a
            // producer may have dispatched a wakeup to this waiter in the
            // window between the timer firing and the lock being reacquired.
            let mut republish = Republish::new();
            let result = {
                let mut state = self.inner.lock();
                state.waiters.cancel(token);
                self.attempt(&mut state, kind, &mut republish)
            };
            self.republish_expired(republish);
            return result;
        }
    }
}

impl QueueState {
    /// Enqueues an item: always counted into the logical totals, resident
    /// in memory only when the journal is not in read-behind.
    fn add_item(&mut self, item: Item) {
        let len = item.data.len() as u64;
        self.queue_length += 1;
        self.queue_size += len;
        self.total_items += 1;
        if !self.journal.in_read_behind() {
            self.memory_bytes += len;
            self.buffer.push_back(item);
        }
    }

    /// Dequeues the head item and tops the buffer back up from the journal
    /// if read-behind is active.
    fn pop_head(&mut self, max_memory: u64) -> Option<Item> {
        let item = self.buffer.pop_front()?;
        let len = item.data.len() as u64;
        self.queue_length -= 1;
        self.queue_size -= len;
        self.memory_bytes -= len;
        self.refill_from_journal(max_memory);
        Some(item)
    }

    fn refill_from_journal(&mut self, max_memory: u64) {
        while self.journal.in_read_behind() && self.memory_bytes < max_memory {
            match self.journal.fill_read_behind() {
                Ok(Some(item)) => {
                    self.memory_bytes += item.data.len() as u64;
                    self.buffer.push_back(item);
                }
                Ok(None) => break,
                Err(error) => {
                    error!(
                        journal = %self.journal.path().display(),
                        %error,
                        "Failed to stream items back from journal; taking queue out of service."
                    );
                    self.broken = true;
                    break;
                }
            }
        }
    }

    fn maybe_start_read_behind(&mut self, max_memory: u64) -> Result<(), JournalError> {
        if !self.journal.in_read_behind() && self.queue_size >= max_memory {
            self.journal.start_read_behind()?;
        }
        Ok(())
    }

    /// Dequeues the head into the open-transaction table under `xid`.
    fn tentative_remove(&mut self, xid: u32, max_memory: u64) {
        if let Some(mut item) = self.pop_head(max_memory) {
            item.xid = xid;
            self.open_transactions.insert(xid, item);
        }
    }

    /// Moves the open transaction `xid` back to the head of the queue.
    /// Returns `false` for an unknown xid.
    fn unremove_item(&mut self, xid: u32) -> bool {
        let Some(mut item) = self.open_transactions.remove(&xid) else {
            return false;
        };
        item.xid = 0;
        let len = item.data.len() as u64;
        self.queue_length += 1;
        self.queue_size += len;
        self.memory_bytes += len;
        self.buffer.push_front(item);
        true
    }

    /// Allocates the next transaction ID: pre-increment, skipping zero (the
    /// "no transaction" sentinel) and any ID still open. The counter wraps
    /// at 32 bits; collisions are skipped, so wrapping is harmless.
    fn next_xid(&mut self) -> u32 {
        loop {
            self.xid_counter = self.xid_counter.wrapping_add(1);
            let xid = self.xid_counter;
            if xid != 0 && !self.open_transactions.contains_key(&xid) {
                return xid;
            }
        }
    }

    /// Appends a journal record, tripping the fail-stop latch on error.
    fn journal_append(&mut self, record: &Record, fsync: bool) -> bool {
        match self.journal.append(record, fsync) {
            Ok(()) => true,
            Err(error) => {
                error!(
                    journal = %self.journal.path().display(),
                    %error,
                    "Journal append failed; taking queue out of service."
                );
                self.broken = true;
                false
            }
        }
    }

    /// Rewrites the journal to reflect only current state: the transaction
    /// counter, open transactions (oldest xid first), and the live buffer.
    fn roll_journal(&mut self) {
        let mut open: Vec<&Item> = self.open_transactions.values().collect();
        open.sort_unstable_by_key(|item| item.xid);
        let live: Vec<&Item> = self.buffer.iter().collect();

        if let Err(error) = self.journal.roll(self.xid_counter, &open, &live) {
            error!(
                journal = %self.journal.path().display(),
                %error,
                "Journal rotation failed; taking queue out of service."
            );
            self.broken = true;
        }
    }
}
