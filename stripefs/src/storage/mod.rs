pub mod disk;
pub mod engine;
pub mod log;
pub mod memory;

use serde_derive::{Deserialize, Serialize};

/// The in-memory key directory: maps every live key to the position and
/// length of its latest value in the log file. All live keys must fit in
/// memory. A BTreeMap keeps iteration ordered, which prefix scans and
/// compaction rely on.
pub type KeyDir = std::collections::BTreeMap<Vec<u8>, (u64, u32)>;

/// A point-in-time snapshot of an engine, logged at node startup and
/// asserted on by tests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,

    /// The number of live keys in the engine.
    pub keys: u64,

    /// The logical size of live key/value pairs.
    pub size: u64,

    /// The on-disk size of all data, live and garbage.
    pub total_disk_size: u64,

    /// The on-disk size of live data.
    pub live_disk_size: u64,

    /// The on-disk size of garbage data.
    pub garbage_disk_size: u64,
}
