//! Sortable, monotonic-within-millisecond subscription ID generator
//!
//! Ported from `examples/original_source/id.go`: a 48-bit millisecond
//! timestamp followed by an 80-bit entropy counter, both Crockford
//! Base32 encoded into a 26-character string. Within one millisecond,
//! concurrent calls get distinct, increasing IDs by incrementing the
//! entropy as a big-endian integer; entropy is reseeded from a CSPRNG
//! whenever the millisecond advances.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;

/// Crockford's Base32 alphabet (excludes I, L, O, U to avoid transcription
/// ambiguity), see <https://www.crockford.com/base32.html>.
const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generates a fresh, sortable subscription ID per call.
///
/// Implementations must be unique across any concurrent call sequence
/// within one process and lexicographically sortable by creation time
/// at millisecond resolution.
pub trait IdGenerator: Send + Sync {
    fn next(&self) -> String;
}

struct GeneratorState {
    last_millis: u64,
    entropy: [u8; 10],
}

impl GeneratorState {
    fn next(&mut self, now: u64) -> (u64, [u8; 10]) {
        if now > self.last_millis {
            self.last_millis = now;
            OsRng.fill_bytes(&mut self.entropy);
        } else {
            // now == last_millis, or a clock regression: pin the timestamp
            // and keep counting up so ordering within the tie still holds.
            increment_entropy_be(&mut self.entropy);
        }
        (self.last_millis, self.entropy)
    }
}

/// Default, process-wide ID generator.
///
/// Keeps a guarded `(last_millis, entropy)` pair reseeded from
/// [`rand::rngs::OsRng`] whenever the wall-clock millisecond advances.
pub struct UlidGenerator {
    state: Mutex<GeneratorState>,
}

impl UlidGenerator {
    /// Construct a new generator, seeding its entropy from a CSPRNG.
    pub fn new() -> Self {
        let mut entropy = [0u8; 10];
        OsRng.fill_bytes(&mut entropy);
        Self {
            state: Mutex::new(GeneratorState {
                last_millis: now_millis(),
                entropy,
            }),
        }
    }
}

impl Default for UlidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for UlidGenerator {
    fn next(&self) -> String {
        let now = now_millis();
        let mut state = self.state.lock();
        let (ts, entropy) = state.next(now);
        encode_ulid_like(ts, entropy)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}

/// Increments the entropy as a 10-byte big-endian integer, the same way
/// an odometer carries: the last digit rolls over into the next.
fn increment_entropy_be(entropy: &mut [u8; 10]) {
    for byte in entropy.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return;
        }
    }
}

fn encode_ulid_like(ts_millis: u64, entropy: [u8; 10]) -> String {
    let mut buf = [0u8; 26];
    write_timestamp_48_to_base32(ts_millis, &mut buf[0..10]);
    write_entropy_80_to_base32(entropy, &mut buf[10..26]);
    // All bytes come from CROCKFORD_ALPHABET, which is ASCII.
    String::from_utf8(buf.to_vec()).expect("crockford alphabet is ASCII")
}

fn write_timestamp_48_to_base32(ts: u64, out: &mut [u8]) {
    debug_assert_eq!(out.len(), 10);
    const SHIFTS: [u32; 10] = [45, 40, 35, 30, 25, 20, 15, 10, 5, 0];
    for (i, shift) in SHIFTS.iter().enumerate() {
        let idx = ((ts >> shift) & 0x1F) as usize;
        out[i] = CROCKFORD_ALPHABET[idx];
    }
}

fn write_entropy_80_to_base32(entropy: [u8; 10], out: &mut [u8]) {
    debug_assert_eq!(out.len(), 16);
    let mut acc: u64 = 0;
    let mut bits: u32 = 0;
    let mut pos = 0;

    for byte in entropy {
        acc = (acc << 8) | byte as u64;
        bits += 8;
        while bits >= 5 {
            let idx = ((acc >> (bits - 5)) & 0x1F) as usize;
            out[pos] = CROCKFORD_ALPHABET[idx];
            pos += 1;
            bits -= 5;
        }
    }
}

static DEFAULT_GENERATOR: OnceLock<UlidGenerator> = OnceLock::new();

/// Process-wide default generator, provided as a convenience — not a
/// requirement. Most callers should construct their own
/// [`UlidGenerator`] (or inject a deterministic stub in tests) via
/// [`crate::config::BusConfigBuilder::id_generator`].
pub fn default_id_generator() -> &'static UlidGenerator {
    DEFAULT_GENERATOR.get_or_init(UlidGenerator::new)
}
