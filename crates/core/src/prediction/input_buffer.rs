use std::collections::VecDeque;

use log::warn;

use crate::tick::{Tick, tick_at_least, tick_greater_than};

/// Locally issued inputs the server has not acknowledged yet, oldest first.
#[derive(Debug, Clone)]
pub struct InputBuffer<I> {
    inputs: VecDeque<(Tick, I)>,
    capacity: usize,
}

impl<I> InputBuffer<I> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inputs: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends the input for `tick`. Ticks must strictly increase; a full
    /// buffer drops its oldest input.
    pub fn push(&mut self, tick: Tick, input: I) -> bool {
        if self
            .inputs
            .back()
            .is_some_and(|(last, _)| !tick_greater_than(tick, *last))
        {
            return false;
        }
        if self.inputs.len() >= self.capacity {
            if let Some((dropped, _)) = self.inputs.pop_front() {
                warn!("input buffer full, dropping unacknowledged input for tick {dropped}");
            }
        }
        self.inputs.push_back((tick, input));
        true
    }

    /// Drops every input at or before `tick`.
    pub fn acknowledge(&mut self, tick: Tick) {
        while self
            .inputs
            .front()
            .is_some_and(|(t, _)| tick_at_least(tick, *t))
        {
            self.inputs.pop_front();
        }
    }

    pub fn get(&self, tick: Tick) -> Option<&I> {
        self.inputs.iter().find(|(t, _)| *t == tick).map(|(_, i)| i)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (Tick, &I)> {
        self.inputs.iter().map(|(t, i)| (*t, i))
    }

    pub fn oldest_tick(&self) -> Option<Tick> {
        self.inputs.front().map(|(t, _)| *t)
    }

    pub fn latest_tick(&self) -> Option<Tick> {
        self.inputs.back().map(|(t, _)| *t)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn clear(&mut self) {
        self.inputs.clear();
    }
}
