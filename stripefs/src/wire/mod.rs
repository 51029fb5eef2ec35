//! The two packet dialects of the storage plane.
//!
//! - [`client`]: client↔worker and proxy↔worker packets (registration,
//!   keepalive, triggers, responses).
//! - [`node`]: worker↔storage-node packets (2PC, replication, gets).
//!
//! Both dialects are fixed big-endian headers followed by a
//! length-prefixed body, and both round-trip bit-for-bit through their
//! codecs. Headers echo on responses, differing only in type (and, for
//! dialect B aborts, the reported committed version).

pub mod client;
pub mod node;

use rand::Rng;

/// Bytes of salt attached to every header for request/response
/// correlation.
pub const SALT_LEN: usize = 4;

/// Generates a correlation salt. Bytes are drawn from 1..=255: a zero
/// last byte is reserved to mark client packets as triggers.
pub fn gen_salt() -> [u8; SALT_LEN] {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; SALT_LEN];
    for b in salt.iter_mut() {
        *b = rng.gen_range(1..=0xFF);
    }
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salt_never_contains_zero() {
        for _ in 0..256 {
            let salt = gen_salt();
            assert!(salt.iter().all(|&b| b != 0));
        }
    }
}
