//! Zero-run-length codec for XOR patches and update bodies.
//!
//! The stream is a sequence of tokens. A control byte with the high bit set
//! encodes a run of `(c & 0x7F) + 1` zero bytes; otherwise it is followed by
//! `c + 1` literal bytes.

use crate::error::MalformedUpdate;

const ZERO_RUN: u8 = 0x80;
const MAX_RUN: usize = 128;

pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() / 4 + 2);
    let mut literal_start: Option<usize> = None;
    let mut i = 0;

    while i < input.len() {
        let run = input[i..].iter().take_while(|&&b| b == 0).count();
        if run >= 2 {
            flush_literal(&mut out, input, &mut literal_start, i);
            let mut remaining = run;
            while remaining > 0 {
                let n = remaining.min(MAX_RUN);
                out.push(ZERO_RUN | (n - 1) as u8);
                remaining -= n;
            }
            i += run;
        } else {
            literal_start.get_or_insert(i);
            i += 1;
        }
    }
    flush_literal(&mut out, input, &mut literal_start, input.len());
    out
}

fn flush_literal(out: &mut Vec<u8>, input: &[u8], start: &mut Option<usize>, end: usize) {
    if let Some(start) = start.take() {
        for chunk in input[start..end].chunks(MAX_RUN) {
            out.push((chunk.len() - 1) as u8);
            out.extend_from_slice(chunk);
        }
    }
}

pub fn encoded_len(input: &[u8]) -> usize {
    encode(input).len()
}

/// Decodes `input`, refusing to expand past `max_len` bytes.
pub fn decode(input: &[u8], max_len: usize) -> Result<Vec<u8>, MalformedUpdate> {
    let mut out = Vec::with_capacity(input.len().saturating_mul(2).min(max_len));
    let mut i = 0;

    while i < input.len() {
        let control = input[i];
        i += 1;
        let n = (control & !ZERO_RUN) as usize + 1;
        if out.len() + n > max_len {
            return Err(MalformedUpdate::CorruptRle);
        }
        if control & ZERO_RUN != 0 {
            out.resize(out.len() + n, 0);
        } else {
            let literal = input.get(i..i + n).ok_or(MalformedUpdate::CorruptRle)?;
            out.extend_from_slice(literal);
            i += n;
        }
    }
    Ok(out)
}
