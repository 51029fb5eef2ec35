use crate::error::SResult;
use crate::storage::engine::Engine;
use crate::storage::Status;

/// An in-memory engine over a BTreeMap. Nothing is persisted; used for
/// tests and as the cheapest backing for throwaway nodes.
pub struct MemoryEngine {
    data: std::collections::BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self { data: std::collections::BTreeMap::new() }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory")
    }
}

impl Engine for MemoryEngine {
    fn delete(&mut self, key: &[u8]) -> SResult<()> {
        self.data.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> SResult<()> {
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> SResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> SResult<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn scan_prefix(&mut self, prefix: &[u8]) -> SResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn scan_keys(&mut self, prefix: &[u8]) -> SResult<Vec<Vec<u8>>> {
        Ok(self
            .data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn status(&mut self) -> SResult<Status> {
        Ok(Status {
            name: self.to_string(),
            keys: self.data.len() as u64,
            size: self.data.iter().fold(0, |size, (k, v)| size + k.len() as u64 + v.len() as u64),
            total_disk_size: 0,
            live_disk_size: 0,
            garbage_disk_size: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SResult;

    super::super::tests::test_engine!(MemoryEngine::new());
}
