//! # Engine End-to-End Scenarios
//!
//! Black-box behavior of the full stack: open/close cycles, unique
//! constraints, page recycling and concurrent access, driven only through
//! the public `Engine` surface.

use quilldb::{BsonDocument, BsonValue, Engine, EngineOptions, Error};

const PAGE_SIZE: u64 = 8192;

fn doc(id: i32, n: &str) -> BsonDocument {
    let mut doc = BsonDocument::new();
    doc.insert("_id", id);
    doc.insert("n", n);
    doc
}

mod round_trip_tests {
    use super::*;

    #[test]
    fn document_survives_close_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.db");

        {
            let engine = Engine::open(EngineOptions::new(&path)).unwrap();
            engine.create_collection("c").unwrap();
            engine.insert("c", doc(1, "a")).unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(EngineOptions::new(&path)).unwrap();
        let found = engine
            .find_by_id("c", &BsonValue::Int32(1))
            .unwrap()
            .expect("document persisted");

        assert_eq!(found.get("_id"), Some(&BsonValue::Int32(1)));
        assert_eq!(found.get("n"), Some(&BsonValue::String("a".into())));

        // after close the file holds exactly the data region
        let file_len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(file_len % PAGE_SIZE, 0);
        assert_eq!(engine.last_page_id() as u64, file_len / PAGE_SIZE - 1);
    }

    #[test]
    fn initial_size_preallocates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preallocated.db");

        {
            let engine =
                Engine::open(EngineOptions::new(&path).initial_size(32 * PAGE_SIZE)).unwrap();
            assert_eq!(engine.last_page_id(), 31);
            assert_eq!(std::fs::metadata(&path).unwrap().len(), 32 * PAGE_SIZE);

            engine.insert("c", doc(1, "seeded")).unwrap();
            assert_eq!(
                engine.last_page_id(),
                31,
                "allocation reused the pre-allocated region"
            );
            engine.close().unwrap();
        }

        // the close checkpoint keeps the pre-allocated size
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 32 * PAGE_SIZE);

        let engine = Engine::open(EngineOptions::new(&path)).unwrap();
        assert_eq!(engine.count("c").unwrap(), 1);
        assert_eq!(engine.last_page_id(), 31);
    }

    #[test]
    fn in_memory_database_works_without_a_file() {
        let engine = Engine::open(EngineOptions::in_memory()).unwrap();
        engine.insert("mem", doc(1, "volatile")).unwrap();
        assert_eq!(engine.count("mem").unwrap(), 1);
    }

    #[test]
    fn many_collections_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi.db");

        {
            let engine = Engine::open(EngineOptions::new(&path)).unwrap();
            for c in 0..10 {
                let name = format!("col{c}");
                for id in 0..20 {
                    engine.insert(&name, doc(id, &format!("{c}/{id}"))).unwrap();
                }
            }
            engine.close().unwrap();
        }

        let engine = Engine::open(EngineOptions::new(&path)).unwrap();
        assert_eq!(engine.collections().len(), 10);
        for c in 0..10 {
            let name = format!("col{c}");
            assert_eq!(engine.count(&name).unwrap(), 20);
            let found = engine
                .find_by_id(&name, &BsonValue::Int32(7))
                .unwrap()
                .unwrap();
            assert_eq!(
                found.get("n"),
                Some(&BsonValue::String(format!("{c}/7")))
            );
        }
    }
}

mod unique_index_tests {
    use super::*;

    fn named(id: i32, name: &str) -> BsonDocument {
        let mut doc = BsonDocument::new();
        doc.insert("_id", id);
        doc.insert("name", name);
        doc
    }

    #[test]
    fn second_duplicate_key_fails_and_rolls_back() {
        let engine = Engine::open(EngineOptions::in_memory()).unwrap();
        engine
            .ensure_index("c", "byName", "$.name", true)
            .unwrap();

        engine.insert("c", named(1, "x")).unwrap();
        let err = engine.insert("c", named(2, "x")).unwrap_err();

        assert!(matches!(err, Error::IndexDuplicateKey { .. }));
        assert_eq!(engine.count("c").unwrap(), 1);
        assert!(engine.find_by_id("c", &BsonValue::Int32(2)).unwrap().is_none());

        // the engine is fully usable after the rollback
        engine.insert("c", named(3, "y")).unwrap();
        assert_eq!(engine.count("c").unwrap(), 2);
    }

    #[test]
    fn unique_violation_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unique.db");

        {
            let engine = Engine::open(EngineOptions::new(&path)).unwrap();
            engine.ensure_index("c", "byName", "$.name", true).unwrap();
            engine.insert("c", named(1, "x")).unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(EngineOptions::new(&path)).unwrap();
        let err = engine.insert("c", named(2, "x")).unwrap_err();
        assert!(matches!(err, Error::IndexDuplicateKey { .. }));
    }
}

mod free_list_tests {
    use super::*;

    #[test]
    fn deleted_pages_are_recycled() {
        let engine = Engine::open(EngineOptions::in_memory()).unwrap();

        for id in 0..1000 {
            engine.insert("c", doc(id, "some payload worth a few bytes")).unwrap();
        }
        let peak = engine.last_page_id();

        for id in 0..1000 {
            assert!(engine.delete("c", &BsonValue::Int32(id)).unwrap());
        }
        assert_eq!(engine.count("c").unwrap(), 0);

        for id in 0..1000 {
            engine.insert("c", doc(id, "some payload worth a few bytes")).unwrap();
        }

        let after = engine.last_page_id();
        assert!(
            (after as f64) <= (peak as f64) * 1.2,
            "pages were not recycled: peak {peak}, after {after}"
        );
        assert_eq!(engine.count("c").unwrap(), 1000);
    }

    #[test]
    fn dropped_collection_frees_its_pages() {
        let engine = Engine::open(EngineOptions::in_memory()).unwrap();

        for id in 0..200 {
            engine.insert("victim", doc(id, "payload")).unwrap();
        }
        let peak = engine.last_page_id();
        assert!(engine.drop_collection("victim").unwrap());

        // a new collection of the same size reuses the freed pages
        for id in 0..200 {
            engine.insert("heir", doc(id, "payload")).unwrap();
        }
        assert!(engine.last_page_id() <= peak + 2);
    }
}

mod concurrency_tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn parallel_writers_on_distinct_collections() {
        let engine = Arc::new(Engine::open(EngineOptions::in_memory()).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    let name = format!("w{worker}");
                    for id in 0..50 {
                        engine.insert(&name, doc(id, "concurrent")).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for worker in 0..4 {
            assert_eq!(engine.count(&format!("w{worker}")).unwrap(), 50);
        }
    }

    #[test]
    fn readers_run_while_a_writer_commits() {
        let engine = Arc::new(Engine::open(EngineOptions::in_memory()).unwrap());
        engine.insert("shared", doc(0, "seed")).unwrap();

        let writer = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for id in 1..100 {
                    engine.insert("shared", doc(id, "more")).unwrap();
                }
            })
        };
        let reader = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    // whatever the sampled version, the seed is visible and
                    // every observed document is complete
                    let all = engine.find_all("shared").unwrap();
                    assert!(!all.is_empty());
                    for doc in &all {
                        assert!(doc.get("n").is_some());
                    }
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(engine.count("shared").unwrap(), 100);
    }
}
