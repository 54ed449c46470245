//! Container handle and id generation

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::{Digest, Sha1};

const HANDLE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwyxz0123456789";
const HANDLE_LENGTH: usize = 11;
const ID_HASH_BYTES: usize = 9;

/// Produces random container handles from a single RNG
pub struct HandleGenerator {
    rng: Mutex<StdRng>,
}

impl HandleGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic generator, for reproducible handles
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn generate_handle(&self) -> String {
        generate_handle_with(&mut *self.rng.lock())
    }
}

impl Default for HandleGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn generate_handle_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..HANDLE_LENGTH)
        .map(|_| HANDLE_ALPHABET[rng.random_range(0..HANDLE_ALPHABET.len())] as char)
        .collect()
}

/// Derive the filesystem-safe container id from a handle.
///
/// Upper-case hex of the first nine bytes of the SHA-1 digest of the UTF-8
/// handle. Ids of containers created by earlier hosts must keep resolving.
pub fn generate_id(handle: &str) -> String {
    let digest = Sha1::digest(handle.as_bytes());
    digest[..ID_HASH_BYTES]
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect()
}
