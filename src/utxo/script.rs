//! Lock scripts of `cltvpubkeyhash` outputs.
//!
//! Lock values at or above `LOCKTIME_THRESHOLD` are unix timestamps rather than block heights.
//! The store only evaluates locks against heights, so such scripts are rejected here and their
//! outputs are never indexed.

const OP_0: u8 = 0x00;
const OP_1NEGATE: u8 = 0x4f;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;

/// Largest script number push accepted as a lock height.
const MAX_LOCK_PUSH: usize = 5;

/// Lock values from here on are timestamps.
pub const LOCKTIME_THRESHOLD: u64 = 500_000_000;

/// Decode the lock height of a `<height> OP_CHECKLOCKTIMEVERIFY ...` script.
///
/// The height is the first element of the script, either a small-integer opcode or a minimal
/// little-endian script number push. Negative heights, timestamp locks and scripts whose second
/// opcode is not `OP_CHECKLOCKTIMEVERIFY` are rejected.
pub fn decode_lock_height(script_hex: &str) -> Option<u64> {
    let script = hex::decode(script_hex).ok()?;
    let (&first, rest) = script.split_first()?;

    let (height, rest) = match first {
        OP_0 => (0, rest),
        OP_1NEGATE => return None,
        OP_1..=OP_16 => (u64::from(first - OP_1 + 1), rest),
        len @ 1..=0x4b => {
            let len = usize::from(len);
            if len > MAX_LOCK_PUSH || rest.len() < len {
                return None;
            }
            let (number, rest) = rest.split_at(len);
            (decode_script_number(number)?, rest)
        }
        _ => return None,
    };

    match rest.first() {
        Some(&OP_CHECKLOCKTIMEVERIFY) if height < LOCKTIME_THRESHOLD => Some(height),
        _ => None,
    }
}

fn decode_script_number(bytes: &[u8]) -> Option<u64> {
    let (&last, _) = bytes.split_last()?;
    if last & 0x80 != 0 {
        return None;
    }
    Some(
        bytes
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
    )
}
