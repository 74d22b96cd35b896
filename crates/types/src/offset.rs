//! Offset codec.
//!
//! An offset addresses one record inside one stream instance. It is the pair
//! `(epoch, seq)` where `epoch` identifies the stream instance (bumped on every
//! recreation after expiry) and `seq` is the zero-based record index.
//!
//! Serialized form: `"{epoch}_{seq:016}"`, e.g. `0_0000000000000016`. Within
//! one epoch the fixed-width sequence makes plain string comparison agree with
//! record order. The epoch is not padded, so offsets from different epochs
//! must be compared parsed or through [`Offset::compare_encoded`].

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Width of the zero-padded sequence component.
const SEQ_WIDTH: usize = 16;

/// Longest decimal rendering of a `u64`.
const MAX_EPOCH_DIGITS: usize = 20;

/// Query value accepted in place of an offset to mean "from the beginning".
pub const START_SENTINEL: &str = "-1";

/// Returned when an offset string does not follow `"{epoch}_{seq:016}"`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed offset: {0:?}")]
pub struct MalformedOffset(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Offset {
    epoch: u64,
    seq: u64,
}

impl Offset {
    /// Start of a stream. Readers presenting it are served from the first
    /// record of whichever instance is live.
    pub const ZERO: Offset = Offset { epoch: 0, seq: 0 };

    pub const fn new(epoch: u64, seq: u64) -> Self {
        Self { epoch, seq }
    }

    /// First position of the given instance.
    pub const fn start_of(epoch: u64) -> Self {
        Self { epoch, seq: 0 }
    }

    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    pub const fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Position immediately after this one.
    pub const fn next(&self) -> Self {
        Self {
            epoch: self.epoch,
            seq: self.seq + 1,
        }
    }

    /// Position `n` records further along the same instance.
    pub const fn advance(&self, n: u64) -> Self {
        Self {
            epoch: self.epoch,
            seq: self.seq + n,
        }
    }

    /// Whether both offsets address the same stream instance.
    pub fn same_epoch(&self, other: &Offset) -> bool {
        self.epoch == other.epoch
    }

    /// Compare two serialized offsets in record order, across epochs too.
    ///
    /// Unparseable input sorts before every valid offset so the comparison
    /// stays total.
    pub fn compare_encoded(a: &str, b: &str) -> Ordering {
        match (a.parse::<Offset>(), b.parse::<Offset>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => a.cmp(b),
        }
    }
}

impl Default for Offset {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{:0width$}", self.epoch, self.seq, width = SEQ_WIDTH)
    }
}

impl FromStr for Offset {
    type Err = MalformedOffset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || MalformedOffset(s.to_string());

        let (epoch, seq) = s.split_once('_').ok_or_else(malformed)?;
        if epoch.is_empty()
            || epoch.len() > MAX_EPOCH_DIGITS
            || !epoch.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(malformed());
        }
        if seq.len() != SEQ_WIDTH || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }

        Ok(Offset {
            epoch: epoch.parse().map_err(|_| malformed())?,
            seq: seq.parse().map_err(|_| malformed())?,
        })
    }
}

impl Serialize for Offset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_offset() {
        assert_eq!(Offset::ZERO.to_string(), "0_0000000000000000");
        assert_eq!(Offset::new(0, 16).to_string(), "0_0000000000000016");
        assert_eq!(Offset::new(3, 1024).to_string(), "3_0000000000001024");
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(
            "0_0000000000000016".parse::<Offset>(),
            Ok(Offset::new(0, 16))
        );
        assert_eq!(
            "12_0000000000000001".parse::<Offset>(),
            Ok(Offset::new(12, 1))
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "invalid",
            "abc_def",
            "0_16",
            "_0000000000000016",
            "0_000000000000001x",
            "-1_0000000000000000",
            "0_00000000000000016",
            "0_0000000000000016_1",
        ] {
            assert!(bad.parse::<Offset>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_string_order_matches_record_order() {
        let offsets: Vec<Offset> = [0, 1, 9, 10, 99, 100, 12345]
            .into_iter()
            .map(|seq| Offset::new(4, seq))
            .collect();
        for pair in offsets.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].to_string() < pair[1].to_string());
        }
    }

    #[test]
    fn test_ordering_is_total_across_epochs() {
        let old = Offset::new(1, 500);
        let new = Offset::new(2, 0);
        assert!(old < new);
        assert_eq!(
            Offset::compare_encoded(&old.to_string(), &new.to_string()),
            Ordering::Less
        );
        assert_eq!(
            Offset::compare_encoded("garbage", &Offset::ZERO.to_string()),
            Ordering::Less
        );
    }

    #[test]
    fn test_epoch_digits_do_not_drive_order() {
        let ninth = Offset::new(9, 3).to_string();
        let tenth = Offset::new(10, 0).to_string();
        assert!(ninth > tenth);
        assert_eq!(Offset::compare_encoded(&ninth, &tenth), Ordering::Less);
    }

    #[test]
    fn test_next_and_advance() {
        let offset = Offset::new(2, 7);
        assert_eq!(offset.next(), Offset::new(2, 8));
        assert_eq!(offset.advance(3), Offset::new(2, 10));
        assert!(offset.same_epoch(&offset.next()));
        assert!(!offset.same_epoch(&Offset::ZERO));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&Offset::new(1, 2)).unwrap();
        assert_eq!(json, "\"1_0000000000000002\"");
        let back: Offset = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Offset::new(1, 2));
        assert!(serde_json::from_str::<Offset>("\"nope\"").is_err());
    }
}
