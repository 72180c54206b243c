//! Time-ordered message identifiers.
//!
//! Layout of the 128 bits, most significant first:
//!
//! | bits | field                                                    |
//! |------|----------------------------------------------------------|
//! | 32   | `t1`: whole 16-second windows since the Unix epoch        |
//! | 16   | `t2`: next 16 bits of the window fraction                |
//! | 4    | version (`7`)                                            |
//! | 12   | `t3`: next 12 bits of the window fraction (~60 ns steps) |
//! | 2    | variant (`0b10`)                                         |
//! | 14   | per-process counter                                      |
//! | 48   | random tail                                              |
//!
//! Hex digits are lowercase and fixed width, so comparing two identifiers as
//! strings is the same as comparing them as integers.

use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use uuid::Uuid;

const WINDOW_NANOS: u128 = 16_000_000_000;
const VERSION: u16 = 7;
const VARIANT: u16 = 0b10;
const MAX_COUNTER: u16 = 0x3FFF;
const RANDOM_MASK: u128 = (1 << 48) - 1;

pub const NIL_ID: &str = "00000000-0000-0000-0000-000000000000";

static GENERATOR: Lazy<IdGenerator> = Lazy::new(IdGenerator::new);

/// Mint an identifier from the process-wide generator.
pub fn next_id() -> String {
    GENERATOR.next()
}

/// Wall-clock time in nanoseconds since the Unix epoch, or 0 when unavailable.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimeParts {
    t1: u32,
    t2: u16,
    t3: u16,
}

impl TimeParts {
    fn from_nanos(ns: u128) -> Self {
        let t1 = ns / WINDOW_NANOS;
        let rest1 = ns % WINDOW_NANOS;
        let t2 = (rest1 << 16) / WINDOW_NANOS;
        let rest2 = (rest1 << 16) % WINDOW_NANOS;
        let t3 = (rest2 << 12) / WINDOW_NANOS;
        Self {
            t1: t1 as u32,
            t2: t2 as u16,
            t3: t3 as u16,
        }
    }

    fn to_nanos(self) -> u128 {
        let window = self.t1 as u128 * WINDOW_NANOS;
        let fraction = ((self.t2 as u128) << 12) | self.t3 as u128;
        window + ((fraction * WINDOW_NANOS) >> 28)
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    last: TimeParts,
    counter: u16,
}

/// Generator owning the rolling `(t1, t2, t3, counter)` state.
#[derive(Debug, Default)]
pub struct IdGenerator {
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        let ns = now_nanos().max(0) as u128;
        self.next_at(ns)
    }

    /// Mint an identifier for the supplied wall-clock reading.
    pub fn next_at(&self, ns: u128) -> String {
        if ns == 0 {
            return NIL_ID.to_string();
        }

        let (parts, counter) = {
            let mut state = self.state.lock();
            let parts = TimeParts::from_nanos(ns);
            if parts > state.last {
                state.last = parts;
                state.counter = 0;
            } else if state.counter < MAX_COUNTER {
                // Same tick, or the clock moved backwards: stay on the last
                // timestamp and let the counter order the identifiers.
                state.counter += 1;
            }
            (state.last, state.counter)
        };

        let t3 = (VERSION << 12) | (parts.t3 & 0x0FFF);
        let t4 = (VARIANT << 14) | counter;
        let tail = rand::random::<u64>() as u128 & RANDOM_MASK;
        let value = ((parts.t1 as u128) << 96)
            | ((parts.t2 as u128) << 80)
            | ((t3 as u128) << 64)
            | ((t4 as u128) << 48)
            | tail;

        Uuid::from_u128(value).hyphenated().to_string()
    }
}

/// Recover the (60 ns resolution) timestamp embedded in an identifier.
pub fn timestamp_nanos(id: &str) -> Option<u128> {
    let value = Uuid::parse_str(id).ok()?.as_u128();
    let parts = TimeParts {
        t1: (value >> 96) as u32,
        t2: (value >> 80) as u16,
        t3: ((value >> 64) as u16) & 0x0FFF,
    };
    Some(parts.to_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u128 = 1_700_000_000_123_456_789;

    #[test]
    fn identifiers_have_canonical_shape() {
        let id = IdGenerator::new().next_at(BASE);
        assert_eq!(id.len(), 36);
        let groups: Vec<&str> = id.split('-').collect();
        assert_eq!(
            groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(groups[2].starts_with('7'));
        assert!(matches!(groups[3].chars().next(), Some('8'..='9' | 'a'..='b')));
        assert_eq!(id, id.to_lowercase());
    }

    #[test]
    fn zero_clock_yields_nil_identifier() {
        assert_eq!(IdGenerator::new().next_at(0), NIL_ID);
    }

    #[test]
    fn identifiers_are_strictly_increasing() {
        let generator = IdGenerator::new();
        let ids: Vec<String> = (0..10_000).map(|_| generator.next()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn same_tick_increments_counter() {
        let generator = IdGenerator::new();
        let first = generator.next_at(BASE);
        let second = generator.next_at(BASE);
        assert!(first < second);
        assert_eq!(&first[..19], &second[..19]);
        assert_eq!(&first[19..23], "8000");
        assert_eq!(&second[19..23], "8001");
    }

    #[test]
    fn clock_going_backwards_stays_monotonic() {
        let generator = IdGenerator::new();
        let later = generator.next_at(BASE + 5_000_000);
        let earlier = generator.next_at(BASE);
        assert!(later < earlier);
    }

    #[test]
    fn counter_saturates_until_next_tick() {
        let generator = IdGenerator::new();
        for _ in 0..=(MAX_COUNTER as usize + 10) {
            generator.next_at(BASE);
        }
        let saturated = generator.next_at(BASE);
        assert_eq!(&saturated[19..23], "bfff");

        let next_tick = generator.next_at(BASE + 1_000);
        assert_eq!(&next_tick[19..23], "8000");
        assert!(saturated < next_tick);
    }

    #[test]
    fn distinct_within_one_window() {
        let generator = IdGenerator::new();
        let a = generator.next_at(BASE);
        let b = generator.next_at(BASE + 15_000_000_000);
        assert_ne!(a, b);
    }

    #[test]
    fn embedded_timestamp_round_trips_within_resolution() {
        let id = IdGenerator::new().next_at(BASE);
        let recovered = timestamp_nanos(&id).unwrap();
        assert!(BASE - recovered <= 60, "drift {}", BASE - recovered);
        assert_eq!(timestamp_nanos("not-an-id"), None);
    }
}
