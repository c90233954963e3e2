use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use ndarray::{ArrayView1, ArrayViewMut1, ArrayViewMut2, Axis};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer::GroupBatch;
use crate::error::CalibrationError;
use crate::settings::{CardSettings, SampleFreq, CELLS, CHANNELS, GROUPS};

/// Correction slots per group: 8 channels plus TR.
pub const CORRECTION_CHANNELS: usize = CHANNELS + 1;
pub const TR_SLOT: usize = CHANNELS;

const ADC_MAX: u16 = 4095;
const UNDERFLOW: u16 = 0xF000;
const UPPER_RAIL: u16 = 0x0FFF;

// DRS4 readout glitch: a two-sample dip seen on most channels at once
const GLITCH_STEP: i32 = 30;
const GLITCH_MIN_CHANNELS: usize = 4;
const GLITCH_CORRECTION: u16 = 53;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCorrection {
    /// Indexed by physical cell.
    pub cell_offset: Box<[i16; CELLS]>,
    /// Indexed by position within the waveform.
    pub seq_offset: Box<[i8; CELLS]>,
}

impl Default for ChannelCorrection {
    fn default() -> Self {
        Self {
            cell_offset: Box::new([0; CELLS]),
            seq_offset: Box::new([0; CELLS]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupCorrection {
    pub cell_delay: Box<[f32; CELLS]>,
    pub chans: [ChannelCorrection; CORRECTION_CHANNELS],
}

impl Default for GroupCorrection {
    fn default() -> Self {
        Self {
            cell_delay: Box::new([0.0; CELLS]),
            chans: std::array::from_fn(|_| ChannelCorrection::default()),
        }
    }
}

/// DRS4 correction tables for all four groups of a card.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationTable {
    pub groups: [GroupCorrection; GROUPS],
}

impl CalibrationTable {
    /// Read a table stored little-endian, group by group: time corrections as
    /// f32, then cell offsets as i16 and sequence offsets as i8 for each of
    /// the nine channels.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, CalibrationError> {
        let mut table = Self::default();
        for group in table.groups.iter_mut() {
            reader.read_f32_into::<LittleEndian>(group.cell_delay.as_mut_slice())?;
            for chan in group.chans.iter_mut() {
                reader.read_i16_into::<LittleEndian>(chan.cell_offset.as_mut_slice())?;
            }
            for chan in group.chans.iter_mut() {
                reader.read_i8_into(chan.seq_offset.as_mut_slice())?;
            }
        }
        Ok(table)
    }

    /// Inverse of [`CalibrationTable::read_from`].
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CalibrationError> {
        for group in self.groups.iter() {
            for &delay in group.cell_delay.iter() {
                writer.write_f32::<LittleEndian>(delay)?;
            }
            for chan in group.chans.iter() {
                for &offset in chan.cell_offset.iter() {
                    writer.write_i16::<LittleEndian>(offset)?;
                }
            }
            for chan in group.chans.iter() {
                for &offset in chan.seq_offset.iter() {
                    writer.write_i8(offset)?;
                }
            }
        }
        Ok(())
    }
}

/// Somewhere correction tables for a sampling frequency can be fetched from.
pub trait CorrectionSource {
    fn correction_tables(&self, freq: SampleFreq) -> Result<CalibrationTable, CalibrationError>;
}

/// Correction tables previously dumped to a file, one file per sampling frequency.
#[derive(Debug, Clone)]
pub struct TableFile {
    path: PathBuf,
}

impl TableFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl CorrectionSource for TableFile {
    fn correction_tables(&self, freq: SampleFreq) -> Result<CalibrationTable, CalibrationError> {
        if !self.path.exists() {
            return Err(CalibrationError::BadFilePath(self.path.clone()));
        }
        info!(
            "Loading {:?} correction tables from {}",
            freq,
            self.path.to_string_lossy()
        );
        let mut reader = BufReader::new(File::open(&self.path)?);
        CalibrationTable::read_from(&mut reader)
    }
}

/// Applies DRS4 offset corrections and glitch removal to buffered events.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    settings: Arc<CardSettings>,
    table: CalibrationTable,
}

impl CalibrationEngine {
    pub fn new(settings: Arc<CardSettings>, table: CalibrationTable) -> Self {
        Self { settings, table }
    }

    pub fn from_source(
        settings: Arc<CardSettings>,
        source: &dyn CorrectionSource,
    ) -> Result<Self, CalibrationError> {
        let table = source.correction_tables(settings.sample_freq())?;
        Ok(Self::new(settings, table))
    }

    pub fn table(&self) -> &CalibrationTable {
        &self.table
    }

    /// Correct every event of a batch taken from group `gr`, in place.
    pub fn calibrate(&self, gr: usize, batch: &mut GroupBatch) {
        if !self.settings.group_enabled(gr) {
            return;
        }
        let corrections = &self.table.groups[gr];
        for ev in 0..batch.len() {
            let cell = batch.start_index[ev] as usize;
            let mut samples = batch.samples.index_axis_mut(Axis(0), ev);
            let mut tr = batch.tr_samples.as_mut().map(|tr| tr.row_mut(ev));

            for (ch, waveform) in samples.rows_mut().into_iter().enumerate() {
                apply_offsets(waveform, &corrections.chans[ch], cell);
            }
            if let Some(tr) = tr.as_mut() {
                apply_offsets(tr.view_mut(), &corrections.chans[TR_SLOT], cell);
            }

            remove_glitches(&mut samples, tr.as_ref().map(|tr| tr.view()));
        }
    }
}

fn apply_offsets(mut waveform: ArrayViewMut1<u16>, correction: &ChannelCorrection, cell: usize) {
    for (i, sample) in waveform.iter_mut().enumerate() {
        if *sample == 0 || *sample == ADC_MAX {
            continue; // don't correct rails
        }
        let corrected = *sample as i32
            - correction.seq_offset[i % CELLS] as i32
            - correction.cell_offset[(cell + i) % CELLS] as i32;
        let corrected = corrected as u16;
        *sample = if corrected >= UNDERFLOW {
            0
        } else if corrected >= UPPER_RAIL {
            UPPER_RAIL
        } else {
            corrected
        };
    }
}

fn dip_at(waveform: ArrayView1<u16>, i: usize) -> bool {
    let n = waveform.len();
    let at = |k: usize| waveform[(i + k) % n] as i32;
    at(0) - at(1) > GLITCH_STEP && at(3) - at(2) > GLITCH_STEP
}

/// TR takes part in spotting the glitch but is never corrected.
fn remove_glitches(samples: &mut ArrayViewMut2<u16>, tr: Option<ArrayView1<u16>>) {
    let n = samples.ncols();
    for i in 0..n {
        let mut identified = samples
            .rows()
            .into_iter()
            .filter(|w| dip_at(w.view(), i))
            .count();
        if tr.as_ref().is_some_and(|tr| dip_at(tr.view(), i)) {
            identified += 1;
        }
        if identified > GLITCH_MIN_CHANNELS {
            for ch in 0..CHANNELS {
                for k in [1, 2] {
                    let sample = &mut samples[[ch, (i + k) % n]];
                    *sample = sample.wrapping_add(GLITCH_CORRECTION);
                }
            }
        }
    }
}
