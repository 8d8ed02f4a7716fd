//! Minimal byte-level mutator feeding mutated inputs from the corpus into a
//! worker's next case.

use xorshift::Xorshift64;

/// A single mutation strategy applied by [`mutate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Flips a single random bit.
    BitFlip,
    /// Replaces a single random byte with a fresh random byte.
    ByteSubstitute,
    /// Splices a random contiguous slice of `donor` into `buf` at a random
    /// offset, truncating to `buf`'s original length.
    Splice,
}

impl Strategy {
    const ALL: [Strategy; 3] = [Strategy::BitFlip, Strategy::ByteSubstitute, Strategy::Splice];

    fn pick(rng: &mut Xorshift64) -> Strategy {
        Strategy::ALL[rng.next_below(Strategy::ALL.len())]
    }
}

/// Mutates `buf` in place, picking a random strategy and mutation site.
/// `donor` supplies bytes for `Splice`; if empty, falls back to
/// `ByteSubstitute`. No-op on an empty `buf`.
pub fn mutate(buf: &mut [u8], donor: &[u8], rng: &mut Xorshift64) {
    if buf.is_empty() {
        return;
    }

    let strategy = match Strategy::pick(rng) {
        Strategy::Splice if donor.is_empty() => Strategy::ByteSubstitute,
        other => other,
    };

    match strategy {
        Strategy::BitFlip => {
            let idx = rng.next_below(buf.len());
            let bit = rng.next_below(8);
            buf[idx] ^= 1 << bit;
        }
        Strategy::ByteSubstitute => {
            let idx = rng.next_below(buf.len());
            let mut byte = [0u8; 1];
            rng.fill_bytes(&mut byte);
            buf[idx] = byte[0];
        }
        Strategy::Splice => {
            let donor_start = rng.next_below(donor.len());
            let max_len = (donor.len() - donor_start).min(buf.len());
            let splice_len = rng.next_below(max_len) + 1;
            let dst_start = rng.next_below(buf.len() - splice_len + 1);
            buf[dst_start..dst_start + splice_len]
                .copy_from_slice(&donor[donor_start..donor_start + splice_len]);
        }
    }
}
