//! # quilldb - Embedded Single-File Document Database
//!
//! quilldb is the storage-engine core of an embedded document database:
//! applications link it in-process and manipulate BSON-shaped documents in
//! named collections with secondary indexes, backed by ACID transactions
//! against one data file.
//!
//! ## Quick Start
//!
//! ```ignore
//! use quilldb::{BsonDocument, BsonValue, Engine, EngineOptions};
//!
//! let engine = Engine::open(EngineOptions::new("app.db"))?;
//!
//! let mut doc = BsonDocument::new();
//! doc.insert("_id", 1i32);
//! doc.insert("name", "alice");
//! engine.insert("users", doc)?;
//!
//! let found = engine.find_by_id("users", &BsonValue::Int32(1))?;
//! engine.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Engine (collections, documents)       │
//! ├──────────────────────┬──────────────────────┤
//! │   IndexService       │     DataService      │
//! │   (skip lists)       │     (block chains)   │
//! ├──────────────────────┴──────────────────────┤
//! │   Transaction / Snapshot (MVCC, free lists)  │
//! ├─────────────────────────────────────────────┤
//! │   DiskService (cache + WAL + writer queue)   │
//! ├─────────────────────────────────────────────┤
//! │   Stream (positional I/O, fsync barrier)     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! A single file of 8KB pages: page 0 is the header (catalog, pragmas,
//! free-list head), pages `1..=last_page_id` are the data region, and the
//! tail past `(last_page_id + 1) * 8192` is the write-ahead log. Commits
//! append page copies to the log; a checkpoint folds them back into their
//! home positions and truncates the tail.
//!
//! ## Concurrency Model
//!
//! Many readers, one writer per collection. Readers sample a `read_version`
//! and observe exactly the commits published before it: writes in flight
//! are invisible until their confirm page is durable and the WAL index has
//! published the batch.
//!
//! ## Module Overview
//!
//! - [`storage`]: pages, buffers, cache, streams, WAL index, disk services
//! - [`transaction`]: snapshot/transaction state machine
//! - [`index`]: skip-list index service
//! - [`bson`]: document value model and codecs
//! - [`engine`]: the embedding facade

#[macro_use]
mod macros;

pub mod bson;
pub mod collation;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod index;
pub mod locks;
pub mod storage;
pub mod transaction;

pub use bson::{BsonDocument, BsonValue};
pub use collation::Collation;
pub use config::EngineOptions;
pub use engine::Engine;
pub use error::{Error, Result};
