use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// Journals are cheap to replay at this size, and rolling at 16MB keeps the
// worst-case startup cost low even on slow disks.
pub const DEFAULT_MAX_JOURNAL_SIZE: u64 = 16 * 1024 * 1024;

// Journal rotation is skipped while the queue is large enough that rolling
// would just rewrite most of the file; the overflow factor bounds how far
// past `max_journal_size` the journal may grow before rotation happens
// anyway.
pub const DEFAULT_MAX_JOURNAL_OVERFLOW: u64 = 10;

// The in-memory working set for a single queue. Queues that outgrow this
// enter read-behind and stream items back out of the journal on demand.
pub const DEFAULT_MAX_MEMORY_SIZE: u64 = 128 * 1024 * 1024;

/// A per-queue configuration value with a process-wide default.
///
/// Reading resolves to the per-queue override if one is set, and to the
/// shared base value otherwise. Clearing the override (setting `None`)
/// makes the base visible again. Reads always observe the most recent
/// write.
#[derive(Debug)]
pub struct OverlaySetting<T> {
    base: Arc<RwLock<T>>,
    local: RwLock<Option<T>>,
}

impl<T: Clone> OverlaySetting<T> {
    pub fn new(base: Arc<RwLock<T>>) -> Self {
        Self {
            base,
            local: RwLock::new(None),
        }
    }

    /// Resolves the setting: the local override if set, the base otherwise.
    pub fn get(&self) -> T {
        if let Some(value) = self.local.read().as_ref() {
            value.clone()
        } else {
            self.base.read().clone()
        }
    }

    /// Sets or clears the per-queue override.
    pub fn set(&self, value: Option<T>) {
        *self.local.write() = value;
    }

    /// Returns `true` if a per-queue override is in effect.
    pub fn is_overridden(&self) -> bool {
        self.local.read().is_some()
    }
}

/// Process-wide queue defaults.
///
/// One instance is shared by every queue in the process; per-queue settings
/// created from it resolve to these values wherever no override is set, so
/// updating a default is immediately visible to all queues that have not
/// overridden it.
#[derive(Clone, Debug)]
pub struct QueueDefaults {
    max_items: Arc<RwLock<usize>>,
    max_size: Arc<RwLock<u64>>,
    max_item_size: Arc<RwLock<u64>>,
    max_age: Arc<RwLock<u64>>,
    max_journal_size: Arc<RwLock<u64>>,
    max_memory_size: Arc<RwLock<u64>>,
    max_journal_overflow: Arc<RwLock<u64>>,
    max_journal_size_absolute: Arc<RwLock<u64>>,
    discard_old_when_full: Arc<RwLock<bool>>,
    journal: Arc<RwLock<bool>>,
    sync_journal: Arc<RwLock<bool>>,
    move_expired_to: Arc<RwLock<Option<String>>>,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            max_items: Arc::new(RwLock::new(usize::MAX)),
            max_size: Arc::new(RwLock::new(u64::MAX)),
            max_item_size: Arc::new(RwLock::new(u64::MAX)),
            max_age: Arc::new(RwLock::new(0)),
            max_journal_size: Arc::new(RwLock::new(DEFAULT_MAX_JOURNAL_SIZE)),
            max_memory_size: Arc::new(RwLock::new(DEFAULT_MAX_MEMORY_SIZE)),
            max_journal_overflow: Arc::new(RwLock::new(DEFAULT_MAX_JOURNAL_OVERFLOW)),
            max_journal_size_absolute: Arc::new(RwLock::new(u64::MAX)),
            discard_old_when_full: Arc::new(RwLock::new(false)),
            journal: Arc::new(RwLock::new(true)),
            sync_journal: Arc::new(RwLock::new(false)),
            move_expired_to: Arc::new(RwLock::new(None)),
        }
    }
}

impl QueueDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the process-wide defaults from a configuration snapshot.
    ///
    /// Only the options present in the snapshot are changed. Queues with a
    /// per-queue override for an option keep resolving to their override.
    pub fn apply(&self, config: &QueueConfig) {
        if let Some(value) = config.max_items {
            *self.max_items.write() = value;
        }
        if let Some(value) = config.max_size {
            *self.max_size.write() = value;
        }
        if let Some(value) = config.max_item_size {
            *self.max_item_size.write() = value;
        }
        if let Some(value) = config.max_age {
            *self.max_age.write() = value;
        }
        if let Some(value) = config.max_journal_size {
            *self.max_journal_size.write() = value;
        }
        if let Some(value) = config.max_memory_size {
            *self.max_memory_size.write() = value;
        }
        if let Some(value) = config.max_journal_overflow {
            *self.max_journal_overflow.write() = value;
        }
        if let Some(value) = config.max_journal_size_absolute {
            *self.max_journal_size_absolute.write() = value;
        }
        if let Some(value) = config.discard_old_when_full {
            *self.discard_old_when_full.write() = value;
        }
        if let Some(value) = config.journal {
            *self.journal.write() = value;
        }
        if let Some(value) = config.sync_journal {
            *self.sync_journal.write() = value;
        }
        if let Some(name) = &config.move_expired_to {
            *self.move_expired_to.write() = Some(name.clone());
        }
    }
}

/// The live settings of a single queue.
///
/// Every recognized option is an [`OverlaySetting`] over the process-wide
/// [`QueueDefaults`] the settings were created from. Operations re-read the
/// overlay on every call, so reconfiguration takes effect on the next
/// operation without restarting the queue.
#[derive(Debug)]
pub struct QueueSettings {
    /// Admission control: reject an add when the logical item count would
    /// exceed this.
    pub max_items: OverlaySetting<usize>,
    /// Admission control: reject an add when the logical byte count would
    /// exceed this.
    pub max_size: OverlaySetting<u64>,
    /// Per-item cap, in bytes; oversize items are rejected.
    pub max_item_size: OverlaySetting<u64>,
    /// Clamp every item's effective expiry to `add_time + max_age`
    /// milliseconds. Zero disables the clamp.
    pub max_age: OverlaySetting<u64>,
    /// Target journal size, in bytes; the basis for rotation decisions.
    pub max_journal_size: OverlaySetting<u64>,
    /// In-memory working-set bound, in bytes; drives read-behind.
    pub max_memory_size: OverlaySetting<u64>,
    /// Rotation multiplier: the journal rotates once it exceeds
    /// `max_journal_size * max_journal_overflow` while the queue itself is
    /// smaller than `max_journal_size`.
    pub max_journal_overflow: OverlaySetting<u64>,
    /// Hard upper bound on journal size; rotation triggers here regardless
    /// of queue size.
    pub max_journal_size_absolute: OverlaySetting<u64>,
    /// On admission failure due to capacity, drop head items to make room
    /// instead of rejecting the add.
    pub discard_old_when_full: OverlaySetting<bool>,
    /// Whether to keep a journal at all. Turning this off erases the
    /// on-disk log.
    pub journal: OverlaySetting<bool>,
    /// Whether to fsync after every journal append.
    pub sync_journal: OverlaySetting<bool>,
    /// Optional name of another queue to republish expired items into
    /// (with their expiry cleared).
    pub move_expired_to: OverlaySetting<Option<String>>,
}

impl QueueSettings {
    /// Creates per-queue settings backed by the given process-wide defaults.
    pub fn new(defaults: &QueueDefaults) -> Self {
        Self {
            max_items: OverlaySetting::new(Arc::clone(&defaults.max_items)),
            max_size: OverlaySetting::new(Arc::clone(&defaults.max_size)),
            max_item_size: OverlaySetting::new(Arc::clone(&defaults.max_item_size)),
            max_age: OverlaySetting::new(Arc::clone(&defaults.max_age)),
            max_journal_size: OverlaySetting::new(Arc::clone(&defaults.max_journal_size)),
            max_memory_size: OverlaySetting::new(Arc::clone(&defaults.max_memory_size)),
            max_journal_overflow: OverlaySetting::new(Arc::clone(&defaults.max_journal_overflow)),
            max_journal_size_absolute: OverlaySetting::new(Arc::clone(
                &defaults.max_journal_size_absolute,
            )),
            discard_old_when_full: OverlaySetting::new(Arc::clone(&defaults.discard_old_when_full)),
            journal: OverlaySetting::new(Arc::clone(&defaults.journal)),
            sync_journal: OverlaySetting::new(Arc::clone(&defaults.sync_journal)),
            move_expired_to: OverlaySetting::new(Arc::clone(&defaults.move_expired_to)),
        }
    }

    /// Overlays a per-queue configuration snapshot.
    ///
    /// Options present in the snapshot become per-queue overrides; options
    /// absent from it have their override cleared, falling back to the
    /// process-wide default.
    pub fn apply(&self, config: &QueueConfig) {
        self.max_items.set(config.max_items);
        self.max_size.set(config.max_size);
        self.max_item_size.set(config.max_item_size);
        self.max_age.set(config.max_age);
        self.max_journal_size.set(config.max_journal_size);
        self.max_memory_size.set(config.max_memory_size);
        self.max_journal_overflow.set(config.max_journal_overflow);
        self.max_journal_size_absolute
            .set(config.max_journal_size_absolute);
        self.discard_old_when_full.set(config.discard_old_when_full);
        self.journal.set(config.journal);
        self.sync_journal.set(config.sync_journal);
        self.move_expired_to
            .set(config.move_expired_to.clone().map(Some));
    }
}

/// A configuration snapshot for one queue.
///
/// Every field is optional: absent fields resolve through the process-wide
/// defaults. `max_age` is in milliseconds; sizes are in bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub max_items: Option<usize>,
    pub max_size: Option<u64>,
    pub max_item_size: Option<u64>,
    pub max_age: Option<u64>,
    pub max_journal_size: Option<u64>,
    pub max_memory_size: Option<u64>,
    pub max_journal_overflow: Option<u64>,
    pub max_journal_size_absolute: Option<u64>,
    pub discard_old_when_full: Option<bool>,
    pub journal: Option<bool>,
    pub sync_journal: Option<bool>,
    pub move_expired_to: Option<String>,
}
