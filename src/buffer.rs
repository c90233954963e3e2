use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};

use crate::error::BufferError;
use crate::settings::{CardSettings, CHANNELS, GROUPS};

/// Per-event metadata copied out of the event header and group word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMeta {
    pub start_index: u16,
    pub pattern: u16,
    pub trigger_count: u32,
    pub trigger_time: u32,
}

/// Fixed-capacity storage for one DRS4 group.
///
/// Samples are laid out `(slot, channel, sample)`; the TR channel and the
/// metadata arrays run parallel to the slot axis.
#[derive(Debug, Clone)]
pub struct GroupBuffer {
    samples: Array3<u16>,
    tr_samples: Option<Array2<u16>>,
    start_index: Array1<u16>,
    patterns: Array1<u16>,
    trigger_count: Array1<u32>,
    trigger_time: Array1<u32>,
    filled: usize,
}

/// A copy of the oldest events of one group, detached from the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupBatch {
    pub samples: Array3<u16>,
    pub tr_samples: Option<Array2<u16>>,
    pub start_index: Array1<u16>,
    pub patterns: Array1<u16>,
    pub trigger_count: Array1<u32>,
    pub trigger_time: Array1<u32>,
}

impl GroupBatch {
    pub fn len(&self) -> usize {
        self.start_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GroupBuffer {
    fn new(capacity: usize, num_samples: usize, tr_readout: bool) -> Self {
        Self {
            samples: Array3::zeros((capacity, CHANNELS, num_samples)),
            tr_samples: tr_readout.then(|| Array2::zeros((capacity, num_samples))),
            start_index: Array1::zeros(capacity),
            patterns: Array1::zeros(capacity),
            trigger_count: Array1::zeros(capacity),
            trigger_time: Array1::zeros(capacity),
            filled: 0,
        }
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn capacity(&self) -> usize {
        self.start_index.len()
    }

    pub fn has_tr(&self) -> bool {
        self.tr_samples.is_some()
    }

    /// Raw samples of one channel for one event.
    pub fn waveform(&self, ch: usize, ev: usize) -> ArrayView1<'_, u16> {
        self.samples.slice(s![ev, ch, ..])
    }

    pub fn tr_waveform(&self, ev: usize) -> Option<ArrayView1<'_, u16>> {
        self.tr_samples.as_ref().map(|tr| tr.row(ev))
    }

    /// All regular channels of one event, `(channel, sample)`.
    pub fn event_samples(&self, ev: usize) -> ArrayView2<'_, u16> {
        self.samples.index_axis(Axis(0), ev)
    }

    pub fn meta(&self, ev: usize) -> EventMeta {
        EventMeta {
            start_index: self.start_index[ev],
            pattern: self.patterns[ev],
            trigger_count: self.trigger_count[ev],
            trigger_time: self.trigger_time[ev],
        }
    }

    /// Index of the slot the next event will occupy, or `None` when full.
    pub(crate) fn next_slot(&self) -> Option<usize> {
        (self.filled < self.capacity()).then_some(self.filled)
    }

    /// Mutable views of an uncommitted slot: regular samples and TR samples.
    pub(crate) fn slot_mut(
        &mut self,
        ev: usize,
    ) -> (ArrayViewMut2<'_, u16>, Option<ArrayViewMut1<'_, u16>>) {
        (
            self.samples.index_axis_mut(Axis(0), ev),
            self.tr_samples.as_mut().map(|tr| tr.row_mut(ev)),
        )
    }

    pub(crate) fn set_meta(&mut self, ev: usize, meta: EventMeta) {
        self.start_index[ev] = meta.start_index;
        self.patterns[ev] = meta.pattern;
        self.trigger_count[ev] = meta.trigger_count;
        self.trigger_time[ev] = meta.trigger_time;
    }

    /// Count the slot returned by [`GroupBuffer::next_slot`] as filled.
    pub(crate) fn commit(&mut self) {
        self.filled += 1;
    }

    /// Copy out the oldest `n` events.
    pub fn batch(&self, n: usize) -> GroupBatch {
        GroupBatch {
            samples: self.samples.slice(s![..n, .., ..]).to_owned(),
            tr_samples: self
                .tr_samples
                .as_ref()
                .map(|tr| tr.slice(s![..n, ..]).to_owned()),
            start_index: self.start_index.slice(s![..n]).to_owned(),
            patterns: self.patterns.slice(s![..n]).to_owned(),
            trigger_count: self.trigger_count.slice(s![..n]).to_owned(),
            trigger_time: self.trigger_time.slice(s![..n]).to_owned(),
        }
    }

    /// Drop the oldest `n` events, moving the rest to the front.
    fn evict(&mut self, n: usize) {
        let filled = self.filled;
        let kept = filled - n;

        let tail = self.samples.slice(s![n..filled, .., ..]).to_owned();
        self.samples.slice_mut(s![..kept, .., ..]).assign(&tail);
        if let Some(tr) = self.tr_samples.as_mut() {
            let tail = tr.slice(s![n..filled, ..]).to_owned();
            tr.slice_mut(s![..kept, ..]).assign(&tail);
        }
        shift_front(&mut self.start_index, n, filled);
        shift_front(&mut self.patterns, n, filled);
        shift_front(&mut self.trigger_count, n, filled);
        shift_front(&mut self.trigger_time, n, filled);

        self.filled = kept;
    }
}

fn shift_front<T: Copy>(arr: &mut Array1<T>, n: usize, filled: usize) {
    let tail = arr.slice(s![n..filled]).to_owned();
    arr.slice_mut(s![..filled - n]).assign(&tail);
}

/// Bounded event storage shared by the decoder, the stream dispatcher and the
/// archive writer.
///
/// Only groups enabled in the card settings get storage. The dispatch cursor
/// lives here so that eviction can rebase it.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    capacity: usize,
    num_samples: usize,
    groups: [Option<GroupBuffer>; GROUPS],
    dispatch_index: usize,
}

impl EventBuffer {
    pub fn new(settings: &CardSettings, capacity: usize) -> Self {
        let num_samples = settings.num_samples();
        let groups = std::array::from_fn(|gr| {
            settings
                .group_enabled(gr)
                .then(|| GroupBuffer::new(capacity, num_samples, settings.tr_readout(gr)))
        });
        Self {
            capacity,
            num_samples,
            groups,
            dispatch_index: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn group(&self, gr: usize) -> Option<&GroupBuffer> {
        self.groups.get(gr)?.as_ref()
    }

    pub(crate) fn group_mut(&mut self, gr: usize) -> Option<&mut GroupBuffer> {
        self.groups.get_mut(gr)?.as_mut()
    }

    /// Filled slots of a group; zero for inactive groups.
    pub fn filled(&self, gr: usize) -> usize {
        self.group(gr).map_or(0, GroupBuffer::filled)
    }

    /// Events present in every active group.
    pub fn events_ready(&self) -> usize {
        self.groups
            .iter()
            .flatten()
            .map(GroupBuffer::filled)
            .min()
            .unwrap_or(0)
    }

    /// Events that can still be added without any group overflowing.
    pub fn free_slots(&self) -> usize {
        let fullest = self
            .groups
            .iter()
            .flatten()
            .map(GroupBuffer::filled)
            .max()
            .unwrap_or(0);
        self.capacity - fullest
    }

    pub fn dispatch_index(&self) -> usize {
        self.dispatch_index
    }

    pub(crate) fn set_dispatch_index(&mut self, index: usize) {
        self.dispatch_index = index;
    }

    /// Remove the oldest `n` events from every active group.
    ///
    /// The dispatch cursor moves back with the data so already dispatched
    /// events are neither re-sent nor skipped.
    pub fn evict(&mut self, n: usize) -> Result<(), BufferError> {
        let ready = self.events_ready();
        if n > ready {
            return Err(BufferError::EvictionTooLarge {
                requested: n,
                ready,
            });
        }
        if n == 0 {
            return Ok(());
        }
        for group in self.groups.iter_mut().flatten() {
            group.evict(n);
        }
        self.dispatch_index = self.dispatch_index.saturating_sub(n);
        Ok(())
    }
}
