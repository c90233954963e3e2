use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::{EventBuffer, EventMeta};
use crate::error::DecodeError;
use crate::settings::{CardSettings, CHANNELS, GROUPS};
use crate::wire::{
    unpack_triplet, WordReader, EVENT_TAG, HEADER_WORDS, PAD_WORD, SIZE_MASK, TAG_MASK,
    TRIGGER_COUNT_MASK, TRIPLET_WORDS, WORD_BYTES,
};

const TRIPLET_BYTES: usize = TRIPLET_WORDS * WORD_BYTES;

/// How a trigger counter relates to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Normal,
    Duplicate,
    /// Lower than the last accepted counter.
    Orphaned,
    /// This many triggers were skipped.
    Missed(u32),
}

/// Tracks the 22-bit trigger counter across events.
///
/// Counter wraparound is not special-cased: the first event after a wrap is
/// reported as orphaned and the stored counter stays at the pre-wrap value.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u32>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last counter accepted as in sequence.
    pub fn last(&self) -> Option<u32> {
        self.last
    }

    pub fn observe(&mut self, count: u32) -> SequenceStatus {
        let Some(last) = self.last else {
            self.last = Some(count);
            return SequenceStatus::Normal;
        };
        if count == last {
            SequenceStatus::Duplicate
        } else if count < last {
            SequenceStatus::Orphaned
        } else if count != last + 1 {
            self.last = Some(count);
            SequenceStatus::Missed(count - last - 1)
        } else {
            self.last = Some(count);
            SequenceStatus::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceAnomaly {
    pub trigger_count: u32,
    pub status: SequenceStatus,
}

/// Outcome of one [`Decoder::decode`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeReport {
    /// Bytes covered by complete events. Anything after is an incomplete
    /// event and should be offered again with more data.
    pub bytes_consumed: usize,
    pub events: usize,
    pub group_events: [usize; GROUPS],
    pub anomalies: Vec<SequenceAnomaly>,
}

/// Decodes V1742 event streams into an [`EventBuffer`].
#[derive(Debug)]
pub struct Decoder {
    settings: Arc<CardSettings>,
    buffer: EventBuffer,
    sequence: SequenceTracker,
    event_counter: u64,
    group_counter: u64,
    decode_counter: u64,
    last_decode_time: Instant,
}

impl Decoder {
    /// Create a decoder buffering up to `event_buffer` events per group.
    pub fn new(settings: Arc<CardSettings>, event_buffer: usize) -> Self {
        let buffer = EventBuffer::new(&settings, event_buffer);
        Self {
            settings,
            buffer,
            sequence: SequenceTracker::new(),
            event_counter: 0,
            group_counter: 0,
            decode_counter: 0,
            last_decode_time: Instant::now(),
        }
    }

    pub fn settings(&self) -> &CardSettings {
        &self.settings
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut EventBuffer {
        &mut self.buffer
    }

    pub fn sequence(&self) -> &SequenceTracker {
        &self.sequence
    }

    /// Events decoded since construction.
    pub fn event_counter(&self) -> u64 {
        self.event_counter
    }

    /// Group sub-records decoded since construction.
    pub fn group_counter(&self) -> u64 {
        self.group_counter
    }

    /// Completed calls to [`Decoder::decode`].
    pub fn decode_counter(&self) -> u64 {
        self.decode_counter
    }

    pub fn events_ready(&self) -> usize {
        self.buffer.events_ready()
    }

    /// Decode every complete event in `data` into the buffer.
    ///
    /// Any error aborts the pass: structural errors mean alignment is lost and
    /// the stream must be restarted, overflow means the buffer is not being
    /// drained.
    pub fn decode(&mut self, data: &[u8]) -> Result<DecodeReport, DecodeError> {
        self.decode_limited(data, usize::MAX)
    }

    /// Like [`Decoder::decode`] but stops after `max_events` events, leaving
    /// the rest of `data` unconsumed.
    ///
    /// Keeping `max_events` within [`EventBuffer::free_slots`] means the pass
    /// can not overflow.
    pub fn decode_limited(
        &mut self,
        data: &[u8],
        max_events: usize,
    ) -> Result<DecodeReport, DecodeError> {
        let mut report = DecodeReport::default();
        let mut reader = WordReader::new(data);

        while report.events < max_events {
            let mut probe = reader.clone();
            if probe.peek() == Some(PAD_WORD) {
                probe.next_word();
            }
            let Some(header) = probe.peek() else {
                break;
            };
            if header & TAG_MASK != EVENT_TAG {
                return Err(DecodeError::MissingTag(header));
            }
            let size = header & SIZE_MASK;
            if (size as usize) < HEADER_WORDS {
                return Err(DecodeError::BadRecordSize(size));
            }
            let Some(event) = probe.take(size as usize) else {
                // incomplete, wait for more data
                break;
            };
            self.decode_event(event, &mut report)?;
            reader = probe;
            report.bytes_consumed = reader.position() * WORD_BYTES;
        }

        self.decode_counter += 1;
        self.log_rates(data.len(), &report);
        Ok(report)
    }

    fn log_rates(&mut self, bytes: usize, report: &DecodeReport) {
        let now = Instant::now();
        let time_int = now
            .duration_since(self.last_decode_time)
            .as_secs_f64()
            .max(1e-9);
        self.last_decode_time = now;

        info!("{} decoded {} bytes.", self.settings.index(), bytes);
        for gr in self.settings.active_groups() {
            info!(
                "\tgr{}\tev: {} / {:.1} Hz / {} buffered",
                gr,
                report.group_events[gr],
                report.group_events[gr] as f64 / time_int,
                self.buffer.filled(gr)
            );
        }
    }

    fn decode_event(&mut self, event: &[u8], report: &mut DecodeReport) -> Result<(), DecodeError> {
        let mut reader = WordReader::new(event);
        let mut header = [0u32; HEADER_WORDS];
        for word in header.iter_mut() {
            *word = reader
                .next_word()
                .ok_or(DecodeError::BadRecordSize(event.len() as u32))?;
        }

        // header[1] bits 27-31 carry the board id, unused here
        let pattern = ((header[1] >> 8) & 0x7FFF) as u16;
        let mask = header[1] & 0xF;
        let trigger_count = header[2] & TRIGGER_COUNT_MASK;
        let trigger_time = header[3];

        debug!("\t(LVDS & 0xFF): {}", pattern & 0xFF);

        let status = self.sequence.observe(trigger_count);
        match status {
            SequenceStatus::Normal => (),
            SequenceStatus::Duplicate => {
                warn!("{} duplicate trigger {}", self.settings.index(), trigger_count)
            }
            SequenceStatus::Orphaned => {
                warn!("{} orphaned trigger {}", self.settings.index(), trigger_count)
            }
            SequenceStatus::Missed(n) => {
                warn!("{} missed {} triggers", self.settings.index(), n)
            }
        }
        if status != SequenceStatus::Normal {
            report.anomalies.push(SequenceAnomaly {
                trigger_count,
                status,
            });
        }
        self.event_counter += 1;

        for gr in 0..GROUPS {
            if mask & (1 << gr) == 0 {
                continue;
            }
            let meta = EventMeta {
                start_index: 0,
                pattern,
                trigger_count,
                trigger_time,
            };
            self.decode_group(&mut reader, gr, meta)?;
            report.group_events[gr] += 1;
        }
        report.events += 1;

        Ok(())
    }

    fn decode_group(
        &mut self,
        reader: &mut WordReader,
        gr: usize,
        mut meta: EventMeta,
    ) -> Result<(), DecodeError> {
        let word = reader
            .next_word()
            .ok_or(DecodeError::GroupOverrun { group: gr, words: 1 })?;

        if !self.settings.group_enabled(gr) {
            return Err(DecodeError::InactiveGroup(gr));
        }

        meta.start_index = ((word >> 20) & 0x3FF) as u16;
        let tr = (word >> 12) & 0x1 == 1;
        let size = (word & 0xFFF) as usize;
        let num_samples = self.settings.num_samples();

        if size / TRIPLET_WORDS != num_samples {
            return Err(DecodeError::SampleLengthMismatch {
                group: gr,
                found: size / TRIPLET_WORDS,
                expected: num_samples,
            });
        }
        if tr && !self.settings.tr_readout(gr) {
            return Err(DecodeError::UnexpectedAuxiliary { group: gr });
        }

        let tr_words = if tr { size / 8 } else { 0 };
        // payload, TR payload and the group trigger time tag
        let body_words = size + tr_words + 1;
        if reader.remaining() < body_words {
            return Err(DecodeError::GroupOverrun {
                group: gr,
                words: body_words - reader.remaining(),
            });
        }

        let capacity = self.buffer.capacity();
        let group = self
            .buffer
            .group_mut(gr)
            .ok_or(DecodeError::InactiveGroup(gr))?;
        let ev = group
            .next_slot()
            .ok_or_else(|| DecodeError::BufferOverflow {
                card: self.settings.index().to_string(),
                group: gr,
                capacity,
            })?;

        let overrun = DecodeError::GroupOverrun {
            group: gr,
            words: body_words,
        };
        let payload = reader.take(size).ok_or_else(|| overrun.clone())?;
        let tr_payload = reader.take(tr_words).ok_or_else(|| overrun.clone())?;
        reader.skip(1).ok_or(overrun)?;

        let (mut samples, tr_slot) = group.slot_mut(ev);
        for (s, triplet) in payload.chunks_exact(TRIPLET_BYTES).enumerate() {
            let column = read_triplet(triplet);
            for ch in 0..CHANNELS {
                samples[[ch, s]] = column[ch];
            }
        }

        if let Some(mut tr_samples) = tr_slot {
            tr_samples.fill(0);
            let mut s = 0;
            for triplet in tr_payload.chunks_exact(TRIPLET_BYTES) {
                for value in read_triplet(triplet) {
                    if s == num_samples {
                        break;
                    }
                    tr_samples[s] = value;
                    s += 1;
                }
            }
        }

        group.set_meta(ev, meta);
        group.commit();
        self.group_counter += 1;

        Ok(())
    }
}

fn read_triplet(bytes: &[u8]) -> [u16; CHANNELS] {
    unpack_triplet(
        LittleEndian::read_u32(&bytes[0..4]),
        LittleEndian::read_u32(&bytes[4..8]),
        LittleEndian::read_u32(&bytes[8..12]),
    )
}
