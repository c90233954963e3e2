//! Bit layout of the V1742 event stream.
//!
//! Events are a sequence of little-endian 32-bit words. Each event opens with
//! a four word header followed by one sub-record per group set in the header
//! mask:
//!
//! ```text
//! header 0   [31:28] 0xA tag        [27:0] event size in words
//! header 1   [22:8]  LVDS pattern   [3:0]  group mask
//! header 2   [21:0]  trigger counter
//! header 3   trigger time tag
//! group 0    [29:20] start cell  [12] TR present  [11:0] payload words
//! payload    8 x 12 bit samples packed into every 3 words
//! TR payload payload words / 8, consecutive TR samples packed the same way
//! trailer    group trigger time tag
//! ```
use byteorder::{ByteOrder, LittleEndian};

use crate::settings::CHANNELS;

pub const WORD_BYTES: usize = 4;
pub const HEADER_WORDS: usize = 4;
pub const PAD_WORD: u32 = 0xFFFF_FFFF;
pub const EVENT_TAG: u32 = 0xA000_0000;
pub const TAG_MASK: u32 = 0xF000_0000;
pub const SIZE_MASK: u32 = 0x0FFF_FFFF;
pub const TRIGGER_COUNT_MASK: u32 = 0x3F_FFFF;
pub const SAMPLE_MASK: u16 = 0xFFF;
/// Words holding one sample of each of the 8 channels.
pub const TRIPLET_WORDS: usize = 3;

/// Bounds-checked cursor over a byte slice, handing out 32-bit words.
///
/// `None` always means the slice ran out; structural problems are the
/// caller's to report.
#[derive(Debug, Clone)]
pub struct WordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WordReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Words left to read. A trailing partial word does not count.
    pub fn remaining(&self) -> usize {
        self.data.len() / WORD_BYTES - self.pos
    }

    /// Word offset from the start of the slice.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn peek(&self) -> Option<u32> {
        self.word_at(self.pos)
    }

    /// Word `offset` words ahead of the cursor, without moving.
    pub fn peek_at(&self, offset: usize) -> Option<u32> {
        self.word_at(self.pos + offset)
    }

    pub fn next_word(&mut self) -> Option<u32> {
        let word = self.word_at(self.pos)?;
        self.pos += 1;
        Some(word)
    }

    /// Borrow the next `n` words as raw bytes and move past them.
    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.remaining() {
            return None;
        }
        let start = self.pos * WORD_BYTES;
        self.pos += n;
        Some(&self.data[start..start + n * WORD_BYTES])
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn word_at(&self, idx: usize) -> Option<u32> {
        let start = idx.checked_mul(WORD_BYTES)?;
        let bytes = self.data.get(start..start + WORD_BYTES)?;
        Some(LittleEndian::read_u32(bytes))
    }
}

/// Unpack one word triplet into 8 samples.
pub fn unpack_triplet(w0: u32, w1: u32, w2: u32) -> [u16; CHANNELS] {
    [
        (w0 & 0xFFF) as u16,
        ((w0 >> 12) & 0xFFF) as u16,
        (((w1 & 0xF) << 8) | ((w0 >> 24) & 0xFF)) as u16,
        ((w1 >> 4) & 0xFFF) as u16,
        ((w1 >> 16) & 0xFFF) as u16,
        (((w2 & 0xFF) << 4) | ((w1 >> 28) & 0xF)) as u16,
        ((w2 >> 8) & 0xFFF) as u16,
        ((w2 >> 20) & 0xFFF) as u16,
    ]
}

/// Inverse of [`unpack_triplet`]; samples are truncated to 12 bits.
pub fn pack_triplet(s: &[u16; CHANNELS]) -> [u32; TRIPLET_WORDS] {
    let s = s.map(|v| (v & SAMPLE_MASK) as u32);
    [
        s[0] | (s[1] << 12) | ((s[2] & 0xFF) << 24),
        (s[2] >> 8) | (s[3] << 4) | (s[4] << 16) | ((s[5] & 0xF) << 28),
        (s[5] >> 4) | (s[6] << 8) | (s[7] << 20),
    ]
}

/// One group's worth of data for [`EventEncoder`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupData {
    pub start_cell: u16,
    /// One waveform per regular channel.
    pub samples: [Vec<u16>; CHANNELS],
    pub tr: Option<Vec<u16>>,
}

/// Builds raw event records in the card's format.
///
/// Used by the capture simulator and by tests to produce streams the decoder
/// must accept.
#[derive(Debug, Default, Clone)]
pub struct EventEncoder {
    words: Vec<u32>,
}

impl EventEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pad(&mut self) -> &mut Self {
        self.words.push(PAD_WORD);
        self
    }

    /// Append one event. `groups[gr]` is encoded when present and its bit set in the mask.
    pub fn event(
        &mut self,
        pattern: u16,
        trigger_count: u32,
        trigger_time: u32,
        groups: &[Option<GroupData>],
    ) -> &mut Self {
        let start = self.words.len();
        let mut mask = 0u32;
        for (gr, group) in groups.iter().enumerate() {
            if group.is_some() {
                mask |= 1 << gr;
            }
        }
        self.words.push(EVENT_TAG);
        self.words.push((((pattern as u32) & 0x7FFF) << 8) | mask);
        self.words.push(trigger_count & TRIGGER_COUNT_MASK);
        self.words.push(trigger_time);
        for group in groups.iter().flatten() {
            self.group(group);
        }
        let size = (self.words.len() - start) as u32;
        self.words[start] = EVENT_TAG | (size & SIZE_MASK);
        self
    }

    fn group(&mut self, group: &GroupData) {
        let n_samples = group.samples[0].len();
        let size = (n_samples * TRIPLET_WORDS) as u32;
        let tr_flag = if group.tr.is_some() { 1 << 12 } else { 0 };
        self.words
            .push((((group.start_cell as u32) & 0x3FF) << 20) | tr_flag | (size & 0xFFF));
        for s in 0..n_samples {
            let column: [u16; CHANNELS] = std::array::from_fn(|ch| group.samples[ch][s]);
            self.words.extend(pack_triplet(&column));
        }
        if let Some(tr) = &group.tr {
            let tr_words = size as usize / 8;
            let mut written = 0;
            for chunk in tr.chunks(CHANNELS) {
                if written + TRIPLET_WORDS > tr_words {
                    break;
                }
                let mut block = [0u16; CHANNELS];
                block[..chunk.len()].copy_from_slice(chunk);
                self.words.extend(pack_triplet(&block));
                written += TRIPLET_WORDS;
            }
            self.words.extend(std::iter::repeat(0).take(tr_words - written));
        }
        // group trigger time tag
        self.words.push(0);
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.words.len() * WORD_BYTES];
        LittleEndian::write_u32_into(&self.words, &mut bytes);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_triplet_bit_positions() {
        // one distinct nibble pattern per channel
        let samples = [0x123, 0x456, 0x789, 0xABC, 0xDEF, 0x0F1, 0x234, 0x567];
        let words = pack_triplet(&samples);
        assert_eq!(words[0] & 0xFFF, 0x123);
        assert_eq!((words[0] >> 12) & 0xFFF, 0x456);
        // ch2 low byte sits in the top of w0, high nibble in the bottom of w1
        assert_eq!(words[0] >> 24, 0x89);
        assert_eq!(words[1] & 0xF, 0x7);
        assert_eq!((words[1] >> 28) & 0xF, 0x1);
        assert_eq!(words[2] & 0xFF, 0x0F);
        assert_eq!(words[2] >> 20, 0x567);
        assert_eq!(unpack_triplet(words[0], words[1], words[2]), samples);
    }

    #[test]
    fn test_unpack_all_ones() {
        assert_eq!(
            unpack_triplet(u32::MAX, u32::MAX, u32::MAX),
            [0xFFF; CHANNELS]
        );
    }

    #[test]
    fn test_word_reader_bounds() {
        let bytes = [1u8, 0, 0, 0, 2, 0, 0, 0, 3, 0];
        let mut reader = WordReader::new(&bytes);
        assert_eq!(reader.remaining(), 2);
        assert_eq!(reader.peek_at(1), Some(2));
        assert_eq!(reader.next_word(), Some(1));
        assert!(reader.take(2).is_none());
        assert_eq!(reader.position(), 1);
        assert_eq!(reader.next_word(), Some(2));
        assert_eq!(reader.next_word(), None);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_encoder_sizes() {
        let group = GroupData {
            start_cell: 1023,
            samples: std::array::from_fn(|_| vec![0; 16]),
            tr: Some(vec![0; 16]),
        };
        let mut enc = EventEncoder::new();
        enc.pad().event(0, 1, 2, &[None, Some(group)]);
        let words = enc.words();
        assert_eq!(words[0], PAD_WORD);
        // header + group word + 48 payload + 6 TR + trailer
        assert_eq!(words[1], EVENT_TAG | (4 + 1 + 48 + 6 + 1));
        assert_eq!(words[2] & 0xF, 0b0010);
        assert_eq!(words[5] >> 20, 1023);
        assert_eq!(words[5] & 0xFFF, 48);
        assert_ne!(words[5] & (1 << 12), 0);
    }
}
