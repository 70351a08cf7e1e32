//! Bit-span operations on `u64` words.
//!
//! A span starting at bit `start` of `words[0]` is decomposed into up to
//! three parts: the high bits of the first word, a run of whole words, and
//! the low bits of a final word. `start` must be below 64; the span may run
//! to the end of the slice.

/// Bits per bitmap word.
pub const BITS_PER_WORD: u64 = u64::BITS as u64;

/// Low-order mask of `n` bits, `n` in `1..=63`.
const fn mask(n: u64) -> u64 {
    (1u64 << n) - 1
}

/// Split a span into (leading bits, whole words, trailing bits).
const fn split_span(start: u64, count: u64) -> (u64, usize, u64) {
    if start + count >= BITS_PER_WORD {
        let leading = (BITS_PER_WORD - start) % BITS_PER_WORD;
        let trailing = (start + count) % BITS_PER_WORD;
        let whole = ((count - leading) / BITS_PER_WORD) as usize;
        (leading, whole, trailing)
    } else {
        (count, 0, 0)
    }
}

/// Set `count` bits starting at bit `start` of `words[0]`.
pub fn set_bits(words: &mut [u64], start: u64, count: u64) {
    debug_assert!(start < BITS_PER_WORD);
    if count == 0 {
        return;
    }
    let (leading, whole, trailing) = split_span(start, count);
    let mut index = 0;
    if leading > 0 {
        words[index] |= mask(leading) << start;
        index += 1;
    }
    for word in &mut words[index..index + whole] {
        *word = u64::MAX;
    }
    index += whole;
    if trailing > 0 {
        words[index] |= mask(trailing);
    }
}

/// Clear `count` bits starting at bit `start` of `words[0]`.
pub fn clear_bits(words: &mut [u64], start: u64, count: u64) {
    debug_assert!(start < BITS_PER_WORD);
    if count == 0 {
        return;
    }
    let (leading, whole, trailing) = split_span(start, count);
    let mut index = 0;
    if leading > 0 {
        words[index] &= !(mask(leading) << start);
        index += 1;
    }
    for word in &mut words[index..index + whole] {
        *word = 0;
    }
    index += whole;
    if trailing > 0 {
        words[index] &= !mask(trailing);
    }
}

/// Read `count` bits (at most 64) starting at bit `start` of `words[0]`,
/// returned right-aligned in a `u64`.
pub fn get_bits(words: &[u64], start: u64, count: u64) -> u64 {
    debug_assert!(start < BITS_PER_WORD && count <= BITS_PER_WORD);
    if count == 0 {
        return 0;
    }
    if start == 0 && count == BITS_PER_WORD {
        return words[0];
    }
    let (leading, trailing) = if start + count > BITS_PER_WORD {
        (BITS_PER_WORD - start, (start + count) % BITS_PER_WORD)
    } else {
        (count, 0)
    };
    let mut result = (words[0] >> start) & mask(leading);
    if trailing > 0 {
        result |= (words[1] & mask(trailing)) << leading;
    }
    result
}
