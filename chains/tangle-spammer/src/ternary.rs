//! Balanced ternary helpers.
//!
//! A trit is one of `-1, 0, 1`; a tryte is three trits written as one
//! character of [`TRYTE_ALPHABET`]. Trits are little-endian everywhere.

use rand::Rng;

pub const TRYTE_ALPHABET: &str = "9ABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const TRITS_PER_TRYTE: usize = 3;
pub const TAG_TRYTES: usize = 27;

const ALPHABET: &[u8; 27] = b"9ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Numeric value of a tryte character: `9` is 0, `A..=M` are 1..=13 and
/// `N..=Z` are -13..=-1.
pub fn tryte_value(c: char) -> Option<i8> {
    match c {
        '9' => Some(0),
        'A'..='M' => Some(c as i8 - b'A' as i8 + 1),
        'N'..='Z' => Some(c as i8 - b'Z' as i8 - 1),
        _ => None,
    }
}

fn tryte_char(value: i8) -> char {
    let index = if value < 0 { value + 27 } else { value };
    ALPHABET[index as usize] as char
}

pub fn is_trytes(s: &str) -> bool {
    s.chars().all(|c| tryte_value(c).is_some())
}

pub fn trytes_to_trits(trytes: &str) -> Option<Vec<i8>> {
    let mut trits = Vec::with_capacity(trytes.len() * TRITS_PER_TRYTE);
    for c in trytes.chars() {
        let value = tryte_value(c)?;
        trits.extend(int_to_trits(value as i64, TRITS_PER_TRYTE));
    }
    Some(trits)
}

/// Encodes trits as trytes. A trailing partial tryte is zero-extended.
pub fn trits_to_trytes(trits: &[i8]) -> String {
    trits
        .chunks(TRITS_PER_TRYTE)
        .map(|chunk| tryte_char(chunk.iter().rev().fold(0i8, |acc, &trit| acc * 3 + trit)))
        .collect()
}

/// Balanced ternary encoding of `value` in exactly `len` trits. Digits beyond
/// `len` are dropped.
pub fn int_to_trits(value: i64, len: usize) -> Vec<i8> {
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut trits = vec![0i8; len];

    for trit in trits.iter_mut() {
        if abs == 0 {
            break;
        }
        let mut rem = (abs % 3) as i8;
        abs /= 3;
        if rem == 2 {
            rem = -1;
            abs += 1;
        }
        *trit = if negative { -rem } else { rem };
    }
    trits
}

/// `None` when the value does not fit an `i64`.
pub fn trits_to_int(trits: &[i8]) -> Option<i64> {
    trits.iter().rev().try_fold(0i64, |acc, &trit| {
        acc.checked_mul(3)?.checked_add(trit as i64)
    })
}

pub fn int_to_trytes(value: i64, len: usize) -> String {
    trits_to_trytes(&int_to_trits(value, len * TRITS_PER_TRYTE))
}

pub fn trytes_to_int(trytes: &str) -> Option<i64> {
    trytes_to_trits(trytes).and_then(|trits| trits_to_int(&trits))
}

/// Two trytes per byte: the low tryte is `b % 27`, the high one `b / 27`.
pub fn bytes_to_trytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        let first = b % 27;
        let second = (b - first) / 27;
        out.push(ALPHABET[first as usize] as char);
        out.push(ALPHABET[second as usize] as char);
    }
    out
}

/// Inverse of [`bytes_to_trytes`]. Trailing `9` padding pairs are skipped;
/// `None` when the input is not an encoding of bytes.
pub fn trytes_to_bytes(trytes: &str) -> Option<Vec<u8>> {
    let raw = trytes.as_bytes();
    if raw.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks(2) {
        if pair == b"99" {
            continue;
        }
        let first = ALPHABET.iter().position(|&c| c == pair[0])?;
        let second = ALPHABET.iter().position(|&c| c == pair[1])?;
        let value = first + second * 27;
        bytes.push(u8::try_from(value).ok()?);
    }
    Some(bytes)
}

/// Right-pads with `9` and truncates to exactly `len` trytes.
pub fn pad_trytes(trytes: &str, len: usize) -> String {
    let mut out: String = trytes.chars().take(len).collect();
    while out.len() < len {
        out.push('9');
    }
    out
}

/// The 27-tryte form of a tag as it appears inside a transaction.
pub fn pad_tag(tag: &str) -> String {
    pad_trytes(tag, TAG_TRYTES)
}

pub fn random_trytes(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
