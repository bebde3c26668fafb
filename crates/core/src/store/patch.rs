use std::ops::Range;

use crate::tick::Tick;

use super::rle;

/// XOR diff that turns the current image back into the image of `tick`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPatch {
    tick: Tick,
    bytes: Vec<u8>,
}

impl DeltaPatch {
    pub fn new(tick: Tick, bytes: Vec<u8>) -> Self {
        Self { tick, bytes }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Byte at `index`; bytes past the end are zero.
    pub fn byte(&self, index: usize) -> u8 {
        self.bytes.get(index).copied().unwrap_or(0)
    }

    pub fn is_zero(&self, range: Range<usize>) -> bool {
        let end = range.end.min(self.bytes.len());
        range.start >= end || self.bytes[range.start..end].iter().all(|&b| b == 0)
    }

    pub fn apply(&self, current: &[u8]) -> Vec<u8> {
        let mut out = current.to_vec();
        xor_into(&mut out, &self.bytes);
        out
    }

    pub fn compressed_len(&self) -> usize {
        rle::encoded_len(&self.bytes)
    }

    pub(crate) fn fold(&mut self, diff: &[u8]) {
        xor_into(&mut self.bytes, diff);
    }
}

/// `dst ^= src`, growing `dst` with zeros when `src` is longer.
pub fn xor_into(dst: &mut Vec<u8>, src: &[u8]) {
    if dst.len() < src.len() {
        dst.resize(src.len(), 0);
    }
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

pub fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = a.to_vec();
    xor_into(&mut out, b);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_grows_shorter_side() {
        assert_eq!(xor(&[1, 2], &[1, 2, 3]), vec![0, 0, 3]);
        assert_eq!(xor(&[1, 2, 3], &[1]), vec![0, 2, 3]);
    }

    #[test]
    fn test_is_zero_past_end() {
        let patch = DeltaPatch::new(4, vec![0, 0, 9]);
        assert!(patch.is_zero(0..2));
        assert!(!patch.is_zero(1..3));
        assert!(patch.is_zero(3..10));
        assert_eq!(patch.byte(50), 0);
    }
}
