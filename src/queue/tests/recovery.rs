use bytes::BytesMut;

use super::{
    assert_queue_empty, assert_queue_size, open_queue, open_queue_with, payload, remove_data,
    with_temp_dir,
};
use crate::{journal::Record, QueueConfig};

fn encode_records(records: &[Record]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for record in records {
        record.encode(&mut buf);
    }
    buf.to_vec()
}

#[tokio::test]
async fn replay_restores_state_after_a_crash() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            {
                let queue = open_queue(&dir, "work");
                assert!(queue.add(payload("a"), 0));
                assert!(queue.add(payload("b"), 0));
                let item = queue.remove(true).expect("remove should yield the head");
                assert_eq!(item.xid(), 1);
                // Crash: in-memory state is dropped without close or confirm.
            }

            let queue = open_queue(&dir, "work");
            assert_queue_size!(queue, 2, 2);
            assert_eq!(queue.total_items(), 2);
            assert_eq!(queue.open_transaction_count(), 0);

            // The unconfirmed transaction rolled back to the head.
            assert_eq!(remove_data(&queue), Some(payload("a")));
            assert_eq!(remove_data(&queue), Some(payload("b")));
            assert_eq!(remove_data(&queue), None);
        }
    })
    .await;
}

#[tokio::test]
async fn confirmed_transactions_never_reappear() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            {
                let queue = open_queue(&dir, "work");
                assert!(queue.add(payload("a"), 0));
                let item = queue.remove(true).expect("remove should yield the head");
                queue.confirm_remove(item.xid());
            }

            let queue = open_queue(&dir, "work");
            assert_queue_empty!(queue);
            assert_eq!(queue.remove(false), None);
        }
    })
    .await;
}

#[tokio::test]
async fn flushed_queue_reopens_empty() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            {
                let queue = open_queue(&dir, "work");
                for i in 0..4 {
                    assert!(queue.add(payload(&format!("item-{i}")), 0));
                }
                queue.flush();
            }

            let queue = open_queue(&dir, "work");
            assert_queue_empty!(queue);
        }
    })
    .await;
}

#[tokio::test]
async fn torn_tail_is_discarded_on_replay() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            {
                let queue = open_queue(&dir, "work");
                assert!(queue.add(payload("a"), 0));
                assert!(queue.add(payload("b"), 0));
            }
            // A crash mid-append: a tag byte and half a length prefix.
            let journal_path = dir.join("work");
            let mut raw = std::fs::read(&journal_path).expect("journal should exist");
            let intact_len = raw.len() as u64;
            raw.extend_from_slice(&[0x06, 0x03, 0x00]);
            std::fs::write(&journal_path, &raw).expect("write should not fail");

            let queue = open_queue(&dir, "work");
            assert_queue_size!(queue, 2, 2);
            // Replay truncated the torn record away.
            assert_eq!(queue.journal_size(), intact_len);
            assert_eq!(remove_data(&queue), Some(payload("a")));
            assert_eq!(remove_data(&queue), Some(payload("b")));
        }
    })
    .await;
}

#[tokio::test]
async fn corrupt_record_halts_replay_at_the_last_good_record() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let good = Record::AddX {
                expiry: 0,
                data: payload("a"),
            };
            let shadowed = Record::AddX {
                expiry: 0,
                data: payload("b"),
            };
            let mut raw = encode_records(&[good.clone()]);
            raw.push(0xff); // unknown tag
            raw.extend_from_slice(&encode_records(&[shadowed]));
            std::fs::write(dir.join("work"), &raw).expect("write should not fail");

            // Everything decoded before the corruption is authoritative;
            // everything after it is discarded, valid records included.
            let queue = open_queue(&dir, "work");
            assert_queue_size!(queue, 1, 1);
            assert_eq!(queue.journal_size(), good.encoded_len() as u64);
            assert_eq!(remove_data(&queue), Some(payload("a")));
        }
    })
    .await;
}

#[tokio::test]
async fn legacy_journals_replay_with_synthesized_xids() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            // An old-format journal: a v1 add (no expiry) and a tentative
            // remove with no transaction ID.
            let raw = encode_records(&[
                Record::Add { data: payload("a") },
                Record::RemoveTentative,
            ]);
            std::fs::write(dir.join("work"), &raw).expect("write should not fail");

            let queue = open_queue(&dir, "work");
            // The synthesized transaction was left open by the "crash", so
            // it rolled back to the head.
            assert_queue_size!(queue, 1, 1);
            assert_eq!(queue.open_transaction_count(), 0);
            assert_eq!(remove_data(&queue), Some(payload("a")));
        }
    })
    .await;
}

#[tokio::test]
async fn saved_xid_restores_the_transaction_counter() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let raw = encode_records(&[
                Record::SavedXid { xid: 41 },
                Record::AddX {
                    expiry: 0,
                    data: payload("a"),
                },
            ]);
            std::fs::write(dir.join("work"), &raw).expect("write should not fail");

            let queue = open_queue(&dir, "work");
            let item = queue.remove(true).expect("remove should yield the head");
            assert_eq!(item.xid(), 42);
        }
    })
    .await;
}

#[tokio::test]
async fn draining_the_queue_compacts_an_oversized_journal() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let config = QueueConfig {
                max_journal_size: Some(1),
                ..QueueConfig::default()
            };
            let queue = open_queue_with(&dir, "work", &config);
            assert!(queue.add(payload("a"), 0));
            let open = queue.remove(true).expect("remove should yield the head");
            assert_eq!(open.xid(), 1);
            assert!(queue.add(payload("b"), 0));
            assert_eq!(remove_data(&queue), Some(payload("b")));

            // The journal was rolled down to just the state needed to
            // reconstruct the open transaction: SavedXid, AddX, and
            // RemoveTentativeX.
            let expected: u64 = [
                Record::SavedXid { xid: 1 }.encoded_len(),
                Record::AddX {
                    expiry: 0,
                    data: payload("a"),
                }
                .encoded_len(),
                Record::RemoveTentativeX { xid: 1 }.encoded_len(),
            ]
            .iter()
            .map(|len| *len as u64)
            .sum();
            assert_eq!(queue.journal_size(), expected);
            drop(queue);

            // The rolled journal replays to the same observable state.
            let queue = open_queue(&dir, "work");
            assert_queue_size!(queue, 1, 1);
            assert_eq!(remove_data(&queue), Some(payload("a")));
        }
    })
    .await;
}

#[tokio::test]
async fn oversized_journal_rotates_on_add() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let config = QueueConfig {
                max_journal_size: Some(10),
                max_journal_overflow: Some(1),
                ..QueueConfig::default()
            };
            let queue = open_queue_with(&dir, "work", &config);
            assert!(queue.add(payload("aaaa"), 0));

            // The second add finds the journal (17 bytes) past
            // max_journal_size * max_journal_overflow with a small queue, so
            // it rolls before appending: SavedXid + AddX("aaaa") +
            // AddX("bbbb").
            assert!(queue.add(payload("bbbb"), 0));
            let expected: u64 = [
                Record::SavedXid { xid: 0 }.encoded_len(),
                Record::AddX {
                    expiry: 0,
                    data: payload("aaaa"),
                }
                .encoded_len(),
                Record::AddX {
                    expiry: 0,
                    data: payload("bbbb"),
                }
                .encoded_len(),
            ]
            .iter()
            .map(|len| *len as u64)
            .sum();
            assert_eq!(queue.journal_size(), expected);
            drop(queue);

            let queue = open_queue(&dir, "work");
            assert_queue_size!(queue, 2, 8);
            assert_eq!(remove_data(&queue), Some(payload("aaaa")));
            assert_eq!(remove_data(&queue), Some(payload("bbbb")));
        }
    })
    .await;
}

#[tokio::test]
async fn discarded_heads_stay_discarded_after_replay() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let config = QueueConfig {
                max_items: Some(2),
                discard_old_when_full: Some(true),
                ..QueueConfig::default()
            };
            {
                let queue = open_queue_with(&dir, "work", &config);
                assert!(queue.add(payload("a"), 0));
                assert!(queue.add(payload("b"), 0));
                assert!(queue.add(payload("c"), 0));
                assert_eq!(queue.total_discarded(), 1);
            }

            let queue = open_queue_with(&dir, "work", &config);
            assert_queue_size!(queue, 2, 2);
            assert_eq!(remove_data(&queue), Some(payload("b")));
            assert_eq!(remove_data(&queue), Some(payload("c")));
        }
    })
    .await;
}
