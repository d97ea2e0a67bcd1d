//! Binary record encoding for the durable write path.

use crate::error::{CoreError, CoreResult};
use crate::record::LogRecord;

/// Serializes a record into bytes ready for compression.
pub trait Format: Send + Sync {
    /// Replaces the contents of `dest` with the encoding of `record`.
    fn format(&self, record: &LogRecord, dest: &mut Vec<u8>) -> CoreResult<()>;
}

/// Compact `bincode` encoding of every record field.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryFormatter;

impl Format for BinaryFormatter {
    fn format(&self, record: &LogRecord, dest: &mut Vec<u8>) -> CoreResult<()> {
        dest.clear();
        bincode::serialize_into(&mut *dest, record)
            .map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// Inverse of [`BinaryFormatter`].
pub fn decode_record(bytes: &[u8]) -> CoreResult<LogRecord> {
    bincode::deserialize(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Level, Location};
    use proptest::prelude::*;

    fn level_strategy() -> impl Strategy<Value = Level> {
        prop_oneof![
            Just(Level::Trace),
            Just(Level::Debug),
            Just(Level::Info),
            Just(Level::Warn),
            Just(Level::Error),
            Just(Level::Fatal),
        ]
    }

    proptest! {
        #[test]
        fn prop_format_then_decode(
            level in level_strategy(),
            ts in any::<u64>(),
            pid in any::<u32>(),
            tid in any::<u64>(),
            file in ".{0,40}",
            line in any::<u32>(),
            function in ".{0,40}",
            message in ".{0,400}",
        ) {
            let record = LogRecord {
                level,
                timestamp_us: ts,
                pid,
                tid,
                location: Location { file, line, function },
                message,
            };
            let mut buf = Vec::new();
            BinaryFormatter.format(&record, &mut buf).unwrap();
            prop_assert_eq!(decode_record(&buf).unwrap(), record);
        }
    }

    #[test]
    fn test_format_replaces_previous_contents() {
        let record = LogRecord::new(Level::Info, Location::default(), "x");
        let mut buf = vec![0xffu8; 64];
        BinaryFormatter.format(&record, &mut buf).unwrap();
        assert_eq!(decode_record(&buf).unwrap(), record);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            decode_record(&[0xff, 0xff]),
            Err(CoreError::Serialization(_))
        ));
    }
}
