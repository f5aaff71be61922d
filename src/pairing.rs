//! Pairing of photons that share an excitation pulse.
//!
//! T3 photons are queued until a photon of a later pulse shows up, which
//! closes the group of the earlier pulse. The closed group is then drained
//! into every unordered pair of its photons. Each pair is written as a
//! synthetic T3 record whose channel enumerates the pair slots of the group.
//! A group of `k` photons has `C(k,2)` pairs and uses the slots
//! `C(k,3) .. C(k+1,3)`, so every group size owns its own block of channels:
//! pairs get 0, triples 1..=3, groups of four 4..=9 and so on.

use crate::photon::T3;
use crate::ring_buffer::RingBuffer;
use crate::QueueError;

/// Progress through the closed group at the front of the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Draining {
    /// Photons of the group still queued
    remaining: usize,
    /// Offset of the next partner of the front photon
    partner: usize,
}

#[derive(Debug)]
pub struct PulseWindowPairer {
    queue: RingBuffer<T3>,
    successive: bool,
    flushing: bool,
    draining: Option<Draining>,
    current_channel: u32,
}

impl PulseWindowPairer {
    /// `queue_size` is only the initial capacity, the queue grows as
    /// needed. With `successive` the pairs report the delay between the two
    /// photons instead of the arrival time of the later one.
    pub fn new(queue_size: usize, successive: bool) -> Result<Self, QueueError> {
        Ok(PulseWindowPairer {
            queue: RingBuffer::with_capacity(queue_size)?,
            successive,
            flushing: false,
            draining: None,
            current_channel: 0,
        })
    }

    /// Queues a photon. A second photon on the same channel within one pulse
    /// is dropped.
    pub fn push(&mut self, photon: T3) -> Result<(), QueueError> {
        let duplicate = self
            .queue
            .iter()
            .any(|queued| queued.pulse == photon.pulse && queued.channel == photon.channel);
        if duplicate {
            debug!("Dropping repeated photon {}", photon);
            return Ok(());
        }
        self.queue.push(photon)
    }

    /// Marks the end of the input: the last group counts as closed.
    pub fn flush(&mut self) {
        self.flushing = true;
    }

    /// Number of photons waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue.size()
    }

    /// Returns the next pair of a closed group, or `None` once no closed
    /// group is left.
    pub fn next(&mut self) -> Result<Option<T3>, QueueError> {
        loop {
            let mut state = match self.draining {
                Some(state) => state,
                None => match self.close_group()? {
                    Some(state) => state,
                    None => return Ok(None),
                },
            };

            if state.partner < state.remaining {
                let first = *self.queue.front()?;
                let second = *self.queue.index(state.partner)?;
                let time = if self.successive {
                    second.time - first.time
                } else {
                    second.time
                };
                let pair = T3::new(self.current_channel, first.pulse, time);
                self.current_channel += 1;
                state.partner += 1;
                self.draining = Some(state);
                return Ok(Some(pair));
            }

            // The front photon has met all of its partners
            self.queue.pop()?;
            state.remaining -= 1;
            state.partner = 1;
            self.draining = if state.remaining > 0 { Some(state) } else { None };
        }
    }

    /// Finds the closed group at the front of the queue, if there is one,
    /// and seeds the pair slots for it.
    fn close_group(&mut self) -> Result<Option<Draining>, QueueError> {
        if self.queue.is_empty() {
            return Ok(None);
        }
        let pulse = self.queue.front()?.pulse;
        if !self.flushing && self.queue.back()?.pulse == pulse {
            return Ok(None);
        }

        let size = self.queue.size()
            - self
                .queue
                .iter()
                .rev()
                .take_while(|photon| photon.pulse != pulse)
                .count();
        self.current_channel = first_slot(size)?;
        trace!("Pulse {} closed with {} photons", pulse, size);

        let state = Draining {
            remaining: size,
            partner: 1,
        };
        self.draining = Some(state);
        Ok(Some(state))
    }
}

/// First pair slot of a group of `size` photons, `C(size, 3)`. Fails when
/// the last slot of the group does not fit a channel number.
fn first_slot(size: usize) -> Result<u32, QueueError> {
    let k = size as u64;
    let binomial3 = |n: u64| -> Option<u64> {
        if n < 3 {
            Some(0)
        } else {
            n.checked_mul(n - 1)?.checked_mul(n - 2).map(|p| p / 6)
        }
    };
    let end = k.checked_add(1).and_then(binomial3);
    match (binomial3(k), end) {
        (Some(first), Some(end)) if u32::try_from(end).is_ok() => {
            u32::try_from(first).map_err(|_| QueueError::SlotsExhausted { size })
        }
        _ => Err(QueueError::SlotsExhausted { size }),
    }
}
