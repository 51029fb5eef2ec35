use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use fs4::FileExt;

use crate::error::{Error, SResult};
use crate::storage::KeyDir;

/// An append-only log file, containing a sequence of key/value entries
/// encoded as follows:
///
/// - Key length as big-endian u32.
/// - Value length as big-endian i32, or -1 for tombstones.
/// - Key as raw bytes.
/// - Value as raw bytes.
pub struct Log {
    /// Path to the log file.
    pub(crate) path: PathBuf,
    /// The opened file containing the log.
    pub(crate) file: std::fs::File,
}

impl Log {
    /// Opens a log file, or creates one if it does not exist. Takes out
    /// an exclusive lock on the file until it is closed, or errors if
    /// the lock is already held.
    pub fn new(path: PathBuf) -> SResult<Self> {
        Self::new_with_lock(path, true)
    }

    pub fn new_with_lock(path: PathBuf, try_lock: bool) -> SResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|err| Error::Internal(format!("{}: {:?}", err, dir.to_str())))?;
        }

        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        if try_lock {
            // Two node processes must never share a block database.
            file.try_lock_exclusive()?;
        }

        Ok(Self { path, file })
    }

    /// Scans the log file and reconstructs the in-memory key directory.
    /// Called once when the node's database is opened.
    ///
    /// An incomplete entry at the end of the file is assumed to be a
    /// torn write from a crash mid-append; the file is truncated back to
    /// the last complete entry. 2PC recovery above this layer then deals
    /// with any orphaned pending cells.
    pub fn build_keydir(&mut self) -> SResult<KeyDir> {
        let mut keydir = KeyDir::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);
        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            // Read the next entry from the file, returning the key,
            // value position, and value length or None for tombstones.
            let mut result = || -> Result<(Vec<u8>, u64, Option<u32>), std::io::Error> {
                let key_len = r.read_u32::<BigEndian>()?;
                let value_len_or_tombstone = match r.read_i32::<BigEndian>()? {
                    l if l >= 0 => Some(l as u32),
                    _ => None, // -1 for tombstones
                };
                let value_pos = pos + 4 + 4 + key_len as u64;

                let mut key = vec![0; key_len as usize];
                r.read_exact(&mut key)?;

                if let Some(value_len) = value_len_or_tombstone {
                    if value_pos + value_len as u64 > file_len {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "value extends beyond end of file",
                        ));
                    }
                    r.seek_relative(value_len as i64)?; // avoids discarding buffer
                }

                Ok((key, value_pos, value_len_or_tombstone))
            };

            match result() {
                // Populate the keydir with the entry, or remove it on tombstones.
                Ok((key, value_pos, Some(value_len))) => {
                    keydir.insert(key, (value_pos, value_len));
                    pos = value_pos + value_len as u64;
                }
                Ok((key, value_pos, None)) => {
                    keydir.remove(&key);
                    pos = value_pos;
                }

                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::error!("found incomplete entry at offset {}, truncating file", pos);
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(keydir)
    }

    /// Reads back a value slot handed out by [`Log::append`].
    pub fn read_at(&mut self, value_pos: u64, value_len: u32) -> SResult<Vec<u8>> {
        let mut value = vec![0; value_len as usize];
        self.file.seek(SeekFrom::Start(value_pos))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Appends a key/value entry, with None writing a tombstone.
    /// Returns the value's slot (position and length within the file),
    /// which is exactly what the keydir stores.
    pub fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> SResult<(u64, u32)> {
        let key_len = key.len() as u32;
        let value_len = value.map_or(0, |v| v.len() as u32);
        let value_len_or_tombstone = value.map_or(-1, |v| v.len() as i32);

        let entry_pos = self.file.seek(SeekFrom::End(0))?;
        let mut w =
            BufWriter::with_capacity((8 + key_len + value_len) as usize, &mut self.file);
        w.write_u32::<BigEndian>(key_len)?;
        w.write_i32::<BigEndian>(value_len_or_tombstone)?;
        w.write_all(key)?;
        if let Some(value) = value {
            w.write_all(value)?;
        }
        w.flush()?;

        Ok((entry_pos + 8 + key_len as u64, value_len))
    }

    /// Current size of the log file in bytes.
    pub fn len(&self) -> SResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Forces everything buffered down to the storage medium.
    pub fn sync(&mut self) -> SResult<()> {
        Ok(self.file.sync_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log_builds_empty_keydir() {
        let path = tempdir::TempDir::new("stripefs").unwrap().path().join("blocks");
        let mut log = Log::new(path).unwrap();
        let keydir = log.build_keydir().unwrap();
        assert!(keydir.is_empty());
    }

    #[test]
    fn entries_round_trip_through_keydir() -> SResult<()> {
        let dir = tempdir::TempDir::new("stripefs")?;
        let path = dir.path().join("blocks");

        let mut log = Log::new(path.clone())?;
        log.append(b"k1", Some(b"v1"))?;
        log.append(b"k2", Some(b"v2"))?;
        let slot = log.append(b"k1", Some(b"v1b"))?;
        log.append(b"k2", None)?;
        drop(log);

        let mut log = Log::new_with_lock(path, false)?;
        let keydir = log.build_keydir()?;
        assert_eq!(keydir.len(), 1);
        // The rebuilt slot matches what append handed out.
        assert_eq!(keydir[b"k1".as_slice()], slot);
        let (pos, len) = slot;
        assert_eq!(log.read_at(pos, len)?, b"v1b".to_vec());
        Ok(())
    }
}
