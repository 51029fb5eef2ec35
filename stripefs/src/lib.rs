//! `stripefs` is a serverless-style distributed block storage plane.
//!
//! Storage nodes keep versioned fixed-size blocks in a persistent
//! key/value engine and act as two-phase-commit participants with a
//! durable pending log. Stateless workers stripe client byte ranges
//! into blocks, drive 2PC across a deterministic replica set, fan
//! replication out asynchronously, cache hot ranges, and serialize all
//! work per file. A thin router maps files to workers by consistent
//! hashing.
//!
//! ## Getting started
//!
//! ```no_run
//! use stripefs::block::{BlockStore, DEFAULT_BLOCK_SIZE};
//! use stripefs::storage::disk::DiskEngine;
//! use stripefs::error::SResult;
//!
//! #[tokio::main]
//! async fn main() -> SResult<()> {
//!     // A storage node: a block store over a disk engine, served on TCP.
//!     let engine = DiskEngine::open("/tmp/stripefs/blocks.db".into())?;
//!     let store = BlockStore::open(engine, DEFAULT_BLOCK_SIZE)?;
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:12000").await?;
//!     stripefs::node::serve(listener, store).await
//! }
//! ```

pub mod block;
pub mod client;
pub mod config;
pub mod error;
pub mod net;
pub mod node;
pub mod proxy;
pub mod router;
pub mod select;
pub mod storage;
pub mod uuid;
pub mod version;
pub mod wire;
pub mod worker;
