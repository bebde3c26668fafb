//! Splitting of oversized update bodies into at most [`MAX_FRAGMENTS`]
//! packets, and their reassembly on the client.

use std::collections::BTreeMap;

use crate::error::FragmentError;
use crate::tick::{Tick, tick_greater_than};

use super::protocol::{MAX_FRAGMENT_BODY, MAX_FRAGMENTS, UpdateFragment};

/// Partial updates kept while waiting for their missing pieces.
const MAX_PARTIAL_UPDATES: usize = 8;

/// A partial this far behind the newest completed update has a piece the
/// sender already gave up on as lost.
const PARTIAL_TIMEOUT_TICKS: u32 = super::tracking::ACK_WINDOW;

pub fn split(update_seq: u32, tick: Tick, body: &[u8]) -> Result<Vec<UpdateFragment>, FragmentError> {
    let max = MAX_FRAGMENT_BODY * MAX_FRAGMENTS;
    if body.len() > max {
        return Err(FragmentError::TooLarge { len: body.len(), max });
    }

    let count = body.len().div_ceil(MAX_FRAGMENT_BODY).max(1);
    Ok((0..count)
        .map(|index| {
            let start = index * MAX_FRAGMENT_BODY;
            let end = (start + MAX_FRAGMENT_BODY).min(body.len());
            UpdateFragment {
                update_seq,
                tick,
                index: index as u8,
                count: count as u8,
                body: body[start..end].to_vec(),
            }
        })
        .collect())
}

#[derive(Debug)]
struct Partial {
    tick: Tick,
    pieces: Vec<Option<Vec<u8>>>,
}

/// Collects fragments per update sequence and yields whole bodies.
///
/// Updates overtaken by a newer one are still reassembled and returned; the
/// sender counts their pieces as delivered once acked. Partials far behind
/// the newest completed update are dropped, as are the oldest ones once
/// more than a handful are pending.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    partials: BTreeMap<u32, Partial>,
    newest_complete: Option<Tick>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    /// Returns the reassembled `(tick, body)` once the last piece arrives.
    pub fn insert(&mut self, fragment: UpdateFragment) -> Result<Option<(Tick, Vec<u8>)>, FragmentError> {
        let count = fragment.count as usize;
        let index = fragment.index as usize;
        if count == 0 || count > MAX_FRAGMENTS || index >= count {
            return Err(FragmentError::OutOfBounds {
                index: fragment.index,
                count: fragment.count,
            });
        }
        if count == 1 {
            self.complete(fragment.tick);
            return Ok(Some((fragment.tick, fragment.body)));
        }

        let partial = self.partials.entry(fragment.update_seq).or_insert_with(|| Partial {
            tick: fragment.tick,
            pieces: vec![None; count],
        });
        if partial.pieces.len() != count {
            return Err(FragmentError::CountMismatch {
                expected: partial.pieces.len() as u8,
                found: fragment.count,
            });
        }
        partial.pieces[index] = Some(fragment.body);

        if partial.pieces.iter().all(Option::is_some) {
            let done = self.partials.remove(&fragment.update_seq);
            let Some(done) = done else {
                return Ok(None);
            };
            let body = done.pieces.into_iter().flatten().flatten().collect();
            self.complete(done.tick);
            return Ok(Some((done.tick, body)));
        }

        while self.partials.len() > MAX_PARTIAL_UPDATES {
            self.partials.pop_first();
        }
        Ok(None)
    }

    fn complete(&mut self, tick: Tick) {
        let newest = match self.newest_complete {
            Some(newest) if !tick_greater_than(tick, newest) => newest,
            _ => tick,
        };
        self.newest_complete = Some(newest);
        self.partials.retain(|_, partial| {
            tick_greater_than(partial.tick, newest)
                || newest.wrapping_sub(partial.tick) <= PARTIAL_TIMEOUT_TICKS
        });
    }

    pub fn reset(&mut self) {
        self.partials.clear();
        self.newest_complete = None;
    }
}
