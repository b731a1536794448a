use super::{
    assert_queue_empty, assert_queue_size, open_queue_with, payload, remove_data, with_temp_dir,
};
use crate::QueueConfig;

#[tokio::test]
async fn item_size_boundary_is_inclusive() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let config = QueueConfig {
                max_item_size: Some(4),
                ..QueueConfig::default()
            };
            let queue = open_queue_with(&dir, "work", &config);

            assert!(queue.add(payload("abcd"), 0));
            assert!(!queue.add(payload("abcde"), 0));
            assert_queue_size!(queue, 1, 4);
            assert_eq!(queue.total_items(), 1);
        }
    })
    .await;
}

#[tokio::test]
async fn full_queue_rejects_at_exactly_max_items() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let config = QueueConfig {
                max_items: Some(2),
                ..QueueConfig::default()
            };
            let queue = open_queue_with(&dir, "work", &config);

            assert!(queue.add(payload("a"), 0));
            assert!(queue.add(payload("b"), 0));
            assert!(!queue.add(payload("c"), 0));
            assert_queue_size!(queue, 2, 2);

            // Draining one makes room for exactly one more.
            assert_eq!(remove_data(&queue), Some(payload("a")));
            assert!(queue.add(payload("c"), 0));
            assert!(!queue.add(payload("d"), 0));
        }
    })
    .await;
}

#[tokio::test]
async fn full_queue_rejects_at_exactly_max_size() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let config = QueueConfig {
                max_size: Some(4),
                ..QueueConfig::default()
            };
            let queue = open_queue_with(&dir, "work", &config);

            assert!(queue.add(payload("abc"), 0));
            // Three bytes queued is still under the limit, so admission
            // passes; the byte bound is checked against the current size.
            assert!(queue.add(payload("d"), 0));
            assert!(!queue.add(payload("e"), 0));
            assert_queue_size!(queue, 2, 4);
        }
    })
    .await;
}

#[tokio::test]
async fn discard_old_drops_heads_to_make_room() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let config = QueueConfig {
                max_items: Some(2),
                discard_old_when_full: Some(true),
                ..QueueConfig::default()
            };
            let queue = open_queue_with(&dir, "work", &config);

            assert!(queue.add(payload("a"), 0));
            assert!(queue.add(payload("b"), 0));
            assert!(queue.add(payload("c"), 0));
            assert_eq!(queue.total_discarded(), 1);
            assert_queue_size!(queue, 2, 2);

            assert_eq!(remove_data(&queue), Some(payload("b")));
            assert_eq!(remove_data(&queue), Some(payload("c")));
            assert_queue_empty!(queue);
        }
    })
    .await;
}

#[tokio::test]
async fn discard_old_applies_to_the_byte_bound_too() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let config = QueueConfig {
                max_size: Some(6),
                discard_old_when_full: Some(true),
                ..QueueConfig::default()
            };
            let queue = open_queue_with(&dir, "work", &config);

            assert!(queue.add(payload("aaa"), 0));
            assert!(queue.add(payload("bbb"), 0));
            // At 6 bytes the queue is full; the head goes to make room.
            assert!(queue.add(payload("cccc"), 0));
            assert_eq!(queue.total_discarded(), 1);
            assert_queue_size!(queue, 2, 7);
            assert_eq!(remove_data(&queue), Some(payload("bbb")));
            assert_eq!(remove_data(&queue), Some(payload("cccc")));
        }
    })
    .await;
}
