use std::time::{SystemTime, UNIX_EPOCH};

/// A write version: a microsecond clock shifted right 6 bits, so two
/// versions drawn in quick succession by the same worker still differ
/// only every ~64µs. Versions order writes within one block and are
/// opaque to the storage node.
pub type Version = u64;

/// Draws a fresh version from the wall clock.
pub fn now() -> Version {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    micros >> 6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_nonzero_and_monotonic() {
        let a = now();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = now();
        assert!(a > 0);
        assert!(b >= a);
    }
}
