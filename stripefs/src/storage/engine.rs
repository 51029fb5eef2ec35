use crate::error::SResult;
use crate::storage::Status;

/// A key/value storage engine, where both keys and values are arbitrary
/// byte strings stored in lexicographical key order. Writes are only
/// guaranteed durable after calling flush().
///
/// This is the persistence layer under a storage node's block store:
/// block payloads, replica copies, and the 2PC pending log all live in
/// one keyspace (distinguished by key suffix). All methods take a
/// mutable reference -- the node is the sole writer of its block
/// records and serializes access itself.
pub trait Engine: std::fmt::Display + Send + 'static {
    /// Deletes a key, or does nothing if it does not exist.
    fn delete(&mut self, key: &[u8]) -> SResult<()>;

    /// Flushes any buffered data to the underlying storage medium.
    fn flush(&mut self) -> SResult<()>;

    /// Gets a value for a key, if it exists.
    fn get(&mut self, key: &[u8]) -> SResult<Option<Vec<u8>>>;

    /// Sets a value for a key, replacing the existing value if any.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> SResult<()>;

    /// Returns all key/value pairs whose key starts with prefix, in key
    /// order. Scans here are small and bounded (one file's block cells),
    /// so results are materialized.
    fn scan_prefix(&mut self, prefix: &[u8]) -> SResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Returns all keys starting with prefix, without reading values.
    /// Recovery walks the whole pending-log namespace with this.
    fn scan_keys(&mut self, prefix: &[u8]) -> SResult<Vec<Vec<u8>>>;

    /// Returns engine status.
    fn status(&mut self) -> SResult<Status>;
}
