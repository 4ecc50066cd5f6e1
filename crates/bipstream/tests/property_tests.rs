//! Property-based tests for stream-level invariants.

use bipstream::Stream;
use proptest::prelude::*;

/// Deterministic fingerprint byte for record `i`.
fn pattern(i: usize) -> u8 {
    (i.wrapping_mul(131).wrapping_add(7) % 251) as u8
}

proptest! {
    /// The committed boundary never outruns the append position, and a
    /// reader that observes the committed range reconstructs the exact
    /// concatenation of everything written.
    #[test]
    fn prop_round_trip_byte_equal(
        sizes in prop::collection::vec(1usize..2000, 1..40),
    ) {
        let stream = Stream::new(256 * 1024, 2);
        stream.init(0);

        for (i, &size) in sizes.iter().enumerate() {
            stream.write(size, |_, buf| {
                buf.fill(pattern(i));
                Ok(buf.len())
            }).map_err(|e| TestCaseError::fail(format!("write: {e}")))?;

            prop_assert!(stream.last_committed_pos() <= stream.append_position());
        }

        let total: usize = sizes.iter().sum();
        prop_assert_eq!(stream.last_committed_pos(), total as u64);

        stream.read(0, total, |buf| {
            let mut at = 0;
            for (i, &size) in sizes.iter().enumerate() {
                assert!(
                    buf[at..at + size].iter().all(|&b| b == pattern(i)),
                    "record {i} corrupted"
                );
                at += size;
            }
            Ok(buf.len())
        }).map_err(|e| TestCaseError::fail(format!("read: {e}")))?;
    }

    /// Serial reads advance the cursor by exactly prefix + announced payload.
    #[test]
    fn prop_serial_cursor_advances_exactly(
        payload_sizes in prop::collection::vec(0usize..800, 1..20),
    ) {
        let stream = Stream::new(256 * 1024, 2);
        stream.init(0);

        for &payload in &payload_sizes {
            stream.write(8, |_, buf| {
                buf.copy_from_slice(&(payload as u64).to_le_bytes());
                Ok(8)
            }).map_err(|e| TestCaseError::fail(format!("header write: {e}")))?;
            if payload > 0 {
                stream.write(payload, |_, buf| {
                    buf.fill(0xEE);
                    Ok(buf.len())
                }).map_err(|e| TestCaseError::fail(format!("payload write: {e}")))?;
            }
        }

        let mut expected = 0u64;
        for &payload in &payload_sizes {
            stream.read_serial(8, |_, buf, payload_size| {
                *payload_size = u64::from_le_bytes(buf.try_into().unwrap()) as usize;
                Ok(8)
            }).map_err(|e| TestCaseError::fail(format!("serial read: {e}")))?;

            expected += 8 + payload as u64;
            prop_assert_eq!(stream.read_position(), expected);
        }
    }
}
