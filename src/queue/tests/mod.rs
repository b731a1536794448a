use std::{future::Future, path::Path, sync::Once};

use bytes::Bytes;
use temp_dir::TempDir;

use crate::{PersistentQueue, QueueConfig, QueueDefaults, QueueSettings};

mod recovery;
mod size_limits;

macro_rules! assert_queue_size {
    ($queue:expr, $length:expr, $bytes:expr) => {{
        assert_eq!(
            $queue.len(),
            $length,
            "queue should have {} items, but had {}",
            $length,
            $queue.len()
        );
        assert_eq!(
            $queue.bytes(),
            $bytes as u64,
            "queue should have {} bytes, but had {} bytes",
            $bytes,
            $queue.bytes()
        );
    }};
}

macro_rules! assert_queue_empty {
    ($queue:expr) => {
        assert_queue_size!($queue, 0, 0)
    };
}

pub(crate) use {assert_queue_empty, assert_queue_size};

/// Run a future with a temporary directory.
///
/// # Panics
///
/// Will panic if function cannot create a temp directory.
pub(crate) async fn with_temp_dir<F, Fut, V>(f: F) -> V
where
    F: FnOnce(&Path) -> Fut,
    Fut: Future<Output = V>,
{
    install_tracing();
    let queue_dir = TempDir::with_prefix("durable-queue")
        .expect("cannot recover from failure to create temp dir");
    f(queue_dir.path()).await
}

/// Installs an RUST_LOG-controlled subscriber so failing tests can be rerun
/// with their tracing output visible.
pub(crate) fn install_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Opens a queue with all-default settings.
pub(crate) fn open_queue(dir: &Path, name: &str) -> PersistentQueue {
    open_queue_with(dir, name, &QueueConfig::default())
}

/// Opens a queue with the given configuration overlaid on the defaults.
///
/// The overlay is applied before the journal is replayed, so settings like
/// `max_memory_size` shape recovery the same way they shape live traffic.
pub(crate) fn open_queue_with(dir: &Path, name: &str, config: &QueueConfig) -> PersistentQueue {
    let settings = QueueSettings::new(&QueueDefaults::new());
    settings.apply(config);
    PersistentQueue::open(name, dir, settings).expect("opening queue should not fail")
}

pub(crate) fn payload(data: &str) -> Bytes {
    Bytes::copy_from_slice(data.as_bytes())
}

/// Removes the head non-transactionally, yielding just the payload.
pub(crate) fn remove_data(queue: &PersistentQueue) -> Option<Bytes> {
    queue.remove(false).map(crate::Item::into_data)
}
