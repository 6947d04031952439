//! Run-length coding of zero bytes: every run of 1 to 255 zero bytes is written as `0x00` followed
//!  by the run length, all other bytes are copied verbatim. Longer runs become several pairs.

use anyhow::bail;
use bytes::BufMut;

/// Appends the zero-coded form of `src` to `dst`
pub fn encode(src: &[u8], dst: &mut impl BufMut) {
    let mut zero_run: u8 = 0;
    for &b in src {
        if b == 0 {
            if zero_run == u8::MAX {
                dst.put_u8(0);
                dst.put_u8(zero_run);
                zero_run = 0;
            }
            zero_run += 1;
        }
        else {
            if zero_run > 0 {
                dst.put_u8(0);
                dst.put_u8(zero_run);
                zero_run = 0;
            }
            dst.put_u8(b);
        }
    }
    if zero_run > 0 {
        dst.put_u8(0);
        dst.put_u8(zero_run);
    }
}

/// the length `encode` would produce, without producing it
pub fn encoded_len(src: &[u8]) -> usize {
    let mut len = 0;
    let mut zero_run: usize = 0;
    for &b in src {
        if b == 0 {
            zero_run += 1;
        }
        else {
            len += 2 * zero_run.div_ceil(u8::MAX as usize) + 1;
            zero_run = 0;
        }
    }
    len + 2 * zero_run.div_ceil(u8::MAX as usize)
}

/// Appends the decoded form of `src` to `dst`. A zero byte without a following count, a zero
///  count, or decoded output exceeding `max_len` bytes are rejected.
pub fn decode(src: &[u8], max_len: usize, dst: &mut Vec<u8>) -> anyhow::Result<()> {
    let limit = dst.len() + max_len;
    let mut iter = src.iter();
    while let Some(&b) = iter.next() {
        if b == 0 {
            let count = match iter.next() {
                Some(&0) => bail!("zero-coded run with count 0"),
                Some(&count) => count as usize,
                None => bail!("zero-coded data ends in the middle of a run"),
            };
            if dst.len() + count > limit {
                bail!("zero-coded data expands beyond {} bytes", max_len);
            }
            dst.resize(dst.len() + count, 0);
        }
        else {
            if dst.len() >= limit {
                bail!("zero-coded data expands beyond {} bytes", max_len);
            }
            dst.push(b);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::no_zeros(vec![1, 2, 3], vec![1, 2, 3])]
    #[case::single_zero(vec![1, 0, 3], vec![1, 0, 1, 3])]
    #[case::run(vec![0, 0, 0, 0, 7], vec![0, 4, 7])]
    #[case::trailing_run(vec![7, 0, 0], vec![7, 0, 2])]
    #[case::run_255(vec![0; 255], vec![0, 255])]
    #[case::run_256(vec![0; 256], vec![0, 255, 0, 1])]
    #[case::run_600(vec![0; 600], vec![0, 255, 0, 255, 0, 90])]
    fn test_encode(#[case] raw: Vec<u8>, #[case] expected: Vec<u8>) {
        let mut encoded = Vec::new();
        encode(&raw, &mut encoded);
        assert_eq!(encoded, expected);
        assert_eq!(encoded_len(&raw), expected.len());

        let mut decoded = Vec::new();
        decode(&encoded, raw.len(), &mut decoded).unwrap();
        assert_eq!(decoded, raw);
    }

    #[rstest]
    #[case::zero_count(vec![1, 0, 0, 2])]
    #[case::dangling_zero(vec![1, 2, 0])]
    #[case::too_long(vec![0, 200])]
    #[case::too_long_literal(vec![0, 100, 1])]
    fn test_decode_malformed(#[case] encoded: Vec<u8>) {
        let mut decoded = Vec::new();
        assert!(decode(&encoded, 100, &mut decoded).is_err());
    }

    #[test]
    fn test_decode_appends() {
        let mut decoded = vec![9, 9];
        decode(&[0, 2, 5], 3, &mut decoded).unwrap();
        assert_eq!(decoded, vec![9, 9, 0, 0, 5]);
    }

    #[test]
    fn test_round_trip_mixed() {
        let raw: Vec<u8> = (0..2000u32).map(|i| if i % 7 < 4 { 0 } else { (i % 251) as u8 }).collect();
        let mut encoded = Vec::new();
        encode(&raw, &mut encoded);
        assert!(encoded.len() < raw.len());

        let mut decoded = Vec::new();
        decode(&encoded, raw.len(), &mut decoded).unwrap();
        assert_eq!(decoded, raw);
    }

    /// xorshift, so that the generated buffers are the same on every run
    fn next_random(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    #[rstest]
    #[case::no_zeros(0)]
    #[case::sparse(10)]
    #[case::half_zeros(50)]
    #[case::mostly_zeros(90)]
    #[case::all_zeros(100)]
    fn test_round_trip_generated(#[case] zero_percent: u64) {
        let mut state = 0x9e37_79b9_7f4a_7c15 ^ zero_percent;
        for len in (0..700).step_by(7).chain([255, 256, 257, 511, 1200, 4000]) {
            let raw: Vec<u8> = (0..len)
                .map(|_| {
                    let r = next_random(&mut state);
                    if r % 100 < zero_percent { 0 } else { (r >> 8) as u8 | 1 }
                })
                .collect();

            let mut encoded = Vec::new();
            encode(&raw, &mut encoded);
            assert_eq!(encoded.len(), encoded_len(&raw), "length {}", len);

            let mut decoded = Vec::new();
            decode(&encoded, raw.len(), &mut decoded).unwrap();
            assert_eq!(decoded, raw, "length {}", len);
        }
    }
}
