// 7-bit line encoding transform (7E1-style)
//
// Legacy payment terminal links run 7 data bits with a parity bit on the
// wire. When such a link is carried over an 8-bit transparent transport,
// the high bit of every byte holds the parity bit: inbound data is
// normalized by clearing it, outbound data optionally has it set to the
// configured parity before hitting the medium.
//
// All functions here are stateless and operate on single bytes or slices
// in place. Stripping is idempotent: re-applying it to already-stripped
// data is a no-op.

use serde::{Deserialize, Serialize};

/// Parity marker applied to outbound bytes when the 7-bit transform is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit: the high bit is simply cleared.
    None,
    /// Even parity: the high bit makes the total set-bit count even.
    Even,
    /// Odd parity: the high bit makes the total set-bit count odd.
    Odd,
}

impl Default for Parity {
    fn default() -> Self {
        Parity::None
    }
}

/// Clear the parity bit of a single inbound byte.
pub fn strip_parity(byte: u8) -> u8 {
    byte & 0x7F
}

/// Clear the parity bit of every byte in the buffer, in place.
pub fn strip_parity_in_place(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b &= 0x7F;
    }
}

/// Apply the parity marker to a single outbound byte.
///
/// The low 7 bits are kept as data; the high bit is set or cleared so the
/// byte satisfies the requested parity.
pub fn add_parity(byte: u8, parity: Parity) -> u8 {
    let data = byte & 0x7F;
    match parity {
        Parity::None => data,
        Parity::Even => {
            if data.count_ones() % 2 == 1 {
                data | 0x80
            } else {
                data
            }
        }
        Parity::Odd => {
            if data.count_ones() % 2 == 0 {
                data | 0x80
            } else {
                data
            }
        }
    }
}

/// Apply the parity marker to every byte in the buffer, in place.
pub fn add_parity_in_place(buf: &mut [u8], parity: Parity) {
    for b in buf.iter_mut() {
        *b = add_parity(*b, parity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_clears_high_bit() {
        assert_eq!(strip_parity(0xFF), 0x7F);
        assert_eq!(strip_parity(0x80), 0x00);
        assert_eq!(strip_parity(0x41), 0x41);
    }

    #[test]
    fn test_strip_is_idempotent() {
        for b in 0..=u8::MAX {
            let once = strip_parity(b);
            assert_eq!(strip_parity(once), once);
        }
    }

    #[test]
    fn test_strip_in_place() {
        let mut buf = [0x80, 0xC1, 0x32, 0xFF];
        strip_parity_in_place(&mut buf);
        assert_eq!(buf, [0x00, 0x41, 0x32, 0x7F]);
    }

    #[test]
    fn test_none_parity_just_strips() {
        assert_eq!(add_parity(0xFF, Parity::None), 0x7F);
        assert_eq!(add_parity(0x41, Parity::None), 0x41);
    }

    #[test]
    fn test_even_parity_bit_count() {
        // 0x7F carries seven set bits, so even parity sets the eighth.
        assert_eq!(add_parity(0xFF, Parity::Even), 0xFF);
        // 'A' = 0x41 carries two set bits, already even.
        assert_eq!(add_parity(0x41, Parity::Even), 0x41);
        // 0x01 carries one set bit.
        assert_eq!(add_parity(0x01, Parity::Even), 0x81);
        for b in 0..=u8::MAX {
            assert_eq!(add_parity(b, Parity::Even).count_ones() % 2, 0);
        }
    }

    #[test]
    fn test_odd_parity_bit_count() {
        assert_eq!(add_parity(0x41, Parity::Odd), 0xC1);
        assert_eq!(add_parity(0x01, Parity::Odd), 0x01);
        for b in 0..=u8::MAX {
            assert_eq!(add_parity(b, Parity::Odd).count_ones() % 2, 1);
        }
    }

    #[test]
    fn test_round_trip_preserves_7bit_data() {
        for parity in [Parity::None, Parity::Even, Parity::Odd] {
            for b in 0..=0x7Fu8 {
                assert_eq!(strip_parity(add_parity(b, parity)), b);
            }
        }
    }
}
