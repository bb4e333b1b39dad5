//! # WAL Durability and Recovery
//!
//! Crash-shaped tests: the engine is dropped without a close (leaving the
//! log in place), files get unconfirmed garbage appended to simulate a
//! commit that died before its confirm page, and checkpoints must collapse
//! the log back into the data region.

use std::io::{Seek, SeekFrom, Write};

use quilldb::{BsonDocument, BsonValue, Engine, EngineOptions};

const PAGE_SIZE: u64 = 8192;

fn doc(id: i32, n: &str) -> BsonDocument {
    let mut doc = BsonDocument::new();
    doc.insert("_id", id);
    doc.insert("n", n);
    doc
}

/// A syntactically valid data page carrying `transaction_id`, with the
/// confirm flag cleared: exactly what a crash between the page writes and
/// the confirm page leaves behind.
fn unconfirmed_page(page_id: u32, transaction_id: u32) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE as usize];
    page[0..4].copy_from_slice(&page_id.to_le_bytes());
    page[4] = 3; // data page
    page[19..21].copy_from_slice(&32u16.to_le_bytes()); // next_free_position
    page[21] = 0xFF; // highest_index: none
    page[22..26].copy_from_slice(&transaction_id.to_le_bytes());
    page[26] = 0; // not confirmed
    page
}

mod recovery_tests {
    use super::*;

    #[test]
    fn committed_log_replays_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.db");

        {
            let engine = Engine::open(EngineOptions::new(&path)).unwrap();
            for id in 0..20 {
                engine.insert("c", doc(id, "durable")).unwrap();
            }
            // dropped without close: the log survives, no checkpoint runs
            drop(engine);
        }

        let engine = Engine::open(EngineOptions::new(&path)).unwrap();
        assert_eq!(engine.count("c").unwrap(), 20);
        for id in 0..20 {
            assert!(engine.find_by_id("c", &BsonValue::Int32(id)).unwrap().is_some());
        }
    }

    #[test]
    fn unconfirmed_transaction_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mid_commit.db");

        {
            let engine = Engine::open(EngineOptions::new(&path)).unwrap();
            for id in 0..10 {
                engine.insert("c", doc(id, "confirmed")).unwrap();
            }
            drop(engine);
        }

        // append a transaction that never reached its confirm page
        let confirmed_len = {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .unwrap();
            let len = file.metadata().unwrap().len();
            file.seek(SeekFrom::End(0)).unwrap();
            for fake in 0..250u32 {
                file.write_all(&unconfirmed_page(1000 + fake, 0xDEAD)).unwrap();
            }
            file.sync_all().unwrap();
            len
        };

        let engine = Engine::open(EngineOptions::new(&path)).unwrap();

        // the half-written transaction is invisible and its pages are gone
        assert_eq!(engine.count("c").unwrap(), 10);
        let file_len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(file_len, confirmed_len, "log truncated at the confirmed boundary");
    }

    #[test]
    fn corrupt_log_tail_truncates_to_last_healthy_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt_tail.db");

        {
            let engine = Engine::open(EngineOptions::new(&path)).unwrap();
            for id in 0..5 {
                engine.insert("c", doc(id, "kept")).unwrap();
            }
            drop(engine);
        }

        {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .unwrap();
            file.seek(SeekFrom::End(0)).unwrap();
            // page with an impossible type byte
            let mut garbage = vec![0xEEu8; PAGE_SIZE as usize];
            garbage[4] = 0x77;
            file.write_all(&garbage).unwrap();
            file.sync_all().unwrap();
        }

        let engine = Engine::open(EngineOptions::new(&path)).unwrap();
        assert_eq!(engine.count("c").unwrap(), 5);
    }

    #[test]
    fn fresh_file_rejects_foreign_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_db.bin");
        std::fs::write(&path, vec![0u8; PAGE_SIZE as usize]).unwrap();

        let err = Engine::open(EngineOptions::new(&path)).unwrap_err();
        assert!(matches!(err, quilldb::Error::InvalidDatabase(_)));
    }

    #[test]
    fn encrypted_marker_requires_a_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encrypted.db");
        let mut bytes = vec![0u8; PAGE_SIZE as usize];
        bytes[0] = 2; // AES-XTS marker of the external cipher stream
        std::fs::write(&path, bytes).unwrap();

        let err = Engine::open(EngineOptions::new(&path)).unwrap_err();
        assert!(matches!(err, quilldb::Error::EncryptionRequired));
    }
}

mod checkpoint_tests {
    use super::*;

    #[test]
    fn checkpoint_shrinks_file_to_data_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.db");

        let engine = Engine::open(EngineOptions::new(&path)).unwrap();
        engine.set_checkpoint_size(0).unwrap();
        for id in 0..200 {
            engine.insert("c", doc(id, "to be checkpointed")).unwrap();
        }
        assert!(engine.log_pages() > 0);

        engine.checkpoint().unwrap();

        assert_eq!(engine.log_pages(), 0);
        let file_len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(file_len, (engine.last_page_id() as u64 + 1) * PAGE_SIZE);

        // every prior read returns identical documents
        assert_eq!(engine.count("c").unwrap(), 200);
        for id in (0..200).step_by(17) {
            let found = engine.find_by_id("c", &BsonValue::Int32(id)).unwrap().unwrap();
            assert_eq!(
                found.get("n"),
                Some(&BsonValue::String("to be checkpointed".into()))
            );
        }
    }

    #[test]
    fn auto_checkpoint_bounds_the_log() {
        let engine = Engine::open(EngineOptions::in_memory()).unwrap();
        engine.set_checkpoint_size(16).unwrap();

        for id in 0..500 {
            engine.insert("c", doc(id, "steady stream")).unwrap();
        }

        assert!(
            engine.log_pages() < 64,
            "log grew to {} pages despite the 16-page threshold",
            engine.log_pages()
        );
        assert_eq!(engine.count("c").unwrap(), 500);
    }

    #[test]
    fn reads_work_across_checkpoint_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle.db");

        {
            let engine = Engine::open(EngineOptions::new(&path)).unwrap();
            for id in 0..50 {
                engine.insert("c", doc(id, "cycled")).unwrap();
            }
            engine.checkpoint().unwrap();
            for id in 50..100 {
                engine.insert("c", doc(id, "cycled")).unwrap();
            }
            engine.close().unwrap();
        }

        let engine = Engine::open(EngineOptions::new(&path)).unwrap();
        assert_eq!(engine.count("c").unwrap(), 100);
        assert!(engine
            .find_by_id("c", &BsonValue::Int32(99))
            .unwrap()
            .is_some());
    }
}
