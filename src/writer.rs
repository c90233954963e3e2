use hdf5::types::VarLenUnicode;
use hdf5::{File, Group, H5Type};
use log::{debug, info, warn};
use ndarray::{Array, Axis, Dimension};
use std::ffi::OsString;
use std::fs::DirEntry;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::buffer::{EventBuffer, GroupBatch};
use crate::calib::CalibrationEngine;
use crate::error::ArchiveError;
use crate::settings::{CardSettings, ADC_BITS, CHANNELS};

pub const FORMAT_VERSION: &str = "1.0";

/// Events per HDF5 chunk along the event axis.
const CHUNK_EVENTS: usize = 256;
const BLOSC_LEVEL: u8 = 5;

/// Moves batches of buffered events into HDF5 files, calibrating them on the way.
pub struct ArchiveWriter {
    settings: Arc<CardSettings>,
    engine: Option<CalibrationEngine>,
}

impl ArchiveWriter {
    pub fn new(settings: Arc<CardSettings>, engine: Option<CalibrationEngine>) -> Self {
        Self { settings, engine }
    }

    pub fn is_calibrating(&self) -> bool {
        self.engine.is_some()
    }

    /// Write the oldest `n` events of every active group into `file`, then
    /// evict them from the buffer.
    ///
    /// The buffer is left untouched unless the whole batch was written. A
    /// failed write can leave a partial `/<card>` group behind, so a retry
    /// needs a fresh file; [`ArchiveWriter::write_file`] takes care of that.
    pub fn write_out(
        &self,
        file: &File,
        buffer: &mut EventBuffer,
        n: usize,
    ) -> Result<(), ArchiveError> {
        if n == 0 {
            return Ok(());
        }
        self.write_batch(file, buffer, n)?;
        buffer.evict(n)?;
        debug!("Archived {} events from {}", n, self.settings.index());
        Ok(())
    }

    /// Write the oldest `n` events to a new file at `path`, then evict them.
    ///
    /// The file is built under `<path>.part` and only renamed to `path` once
    /// complete, so `path` never holds a partial archive and a failed write
    /// can be retried with the same path.
    pub fn write_file(
        &self,
        path: &Path,
        buffer: &mut EventBuffer,
        n: usize,
    ) -> Result<(), ArchiveError> {
        if n == 0 {
            return Ok(());
        }
        let part = part_path(path);
        let written = File::create(&part)
            .map_err(ArchiveError::from)
            .and_then(|file| {
                self.write_batch(&file, buffer, n)?;
                file.close()?;
                Ok(())
            });
        if let Err(e) = written {
            if part.exists() {
                if let Err(rm) = std::fs::remove_file(&part) {
                    warn!("Could not remove {}: {}", part.to_string_lossy(), rm);
                }
            }
            return Err(e);
        }
        std::fs::rename(&part, path).map_err(|source| ArchiveError::Finish {
            path: path.to_path_buf(),
            source,
        })?;
        buffer.evict(n)?;
        debug!(
            "Archived {} events from {} to {}",
            n,
            self.settings.index(),
            path.to_string_lossy()
        );
        Ok(())
    }

    fn write_batch(&self, file: &File, buffer: &EventBuffer, n: usize) -> Result<(), ArchiveError> {
        let ready = buffer.events_ready();
        if n > ready {
            return Err(ArchiveError::BatchTooLarge {
                requested: n,
                ready,
            });
        }

        let card = file.create_group(self.settings.index())?;
        card.new_attr::<u32>()
            .create("bits")?
            .write_scalar(&ADC_BITS)?;
        card.new_attr::<f64>()
            .create("ns_sample")?
            .write_scalar(&self.settings.ns_per_sample())?;
        card.new_attr::<u32>()
            .create("samples")?
            .write_scalar(&(self.settings.num_samples() as u32))?;
        let version = format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION);
        card.new_attr::<VarLenUnicode>()
            .create("version")?
            .write_scalar(&VarLenUnicode::from_str(&version)?)?;

        for gr in self.settings.active_groups() {
            let Some(group) = buffer.group(gr) else {
                continue;
            };
            let mut batch = group.batch(n);
            if let Some(engine) = &self.engine {
                engine.calibrate(gr, &mut batch);
            }
            self.write_group(&card, gr, &batch)?;
        }
        Ok(())
    }

    fn write_group(&self, card: &Group, gr: usize, batch: &GroupBatch) -> Result<(), ArchiveError> {
        let group = card.create_group(&format!("gr{}", gr))?;

        for ch in (0..CHANNELS).filter(|&ch| self.settings.channel_enabled(gr, ch)) {
            let channel = group.create_group(&format!("ch{}", ch))?;
            channel
                .new_attr::<u32>()
                .create("offset")?
                .write_scalar(&(self.settings.dc_offset(gr, ch) as u32))?;
            let samples = batch.samples.index_axis(Axis(1), ch).to_owned();
            write_dataset(&channel, "samples", &samples)?;
        }

        if let Some(tr) = &batch.tr_samples {
            let channel = group.create_group("tr")?;
            channel
                .new_attr::<u32>()
                .create("offset")?
                .write_scalar(&(self.settings.tr_dc_offset(gr) as u32))?;
            write_dataset(&channel, "samples", tr)?;
        }

        write_dataset(&group, "start_index", &batch.start_index)?;
        write_dataset(&group, "patterns", &batch.patterns)?;
        write_dataset(&group, "trigger_time", &batch.trigger_time)?;
        write_dataset(&group, "trigger_count", &batch.trigger_count)?;
        Ok(())
    }
}

/// Chunked along the event axis and blosc/zstd compressed.
fn write_dataset<T: H5Type, D: Dimension>(
    group: &Group,
    name: &str,
    data: &Array<T, D>,
) -> Result<(), ArchiveError> {
    let mut chunk = data.shape().to_vec();
    if let Some(events) = chunk.first_mut() {
        *events = (*events).clamp(1, CHUNK_EVENTS);
    }
    group
        .new_dataset_builder()
        .chunk(chunk)
        .blosc_zstd(BLOSC_LEVEL, true)
        .with_data(data)
        .create(name)?;
    Ok(())
}

fn part_path(path: &Path) -> PathBuf {
    let mut part = OsString::from(path.as_os_str());
    part.push(".part");
    PathBuf::from(part)
}

/// Names archive files `<output_dir>/camp<N>/run<M>_<part>.h5`.
///
/// The run number is one past the highest run already in the campaign
/// directory, so restarting never overwrites an earlier run.
#[derive(Debug, Clone)]
pub struct RunFiles {
    camp_dir: PathBuf,
    run_num: usize,
    part: usize,
}

impl RunFiles {
    pub fn new(output_dir: &Path, campaign_num: usize) -> std::io::Result<Self> {
        let camp_dir = output_dir.join(format!("camp{}", campaign_num));
        if !camp_dir.exists() {
            std::fs::create_dir_all(&camp_dir)?;
            info!("Created campaign directory {}", camp_dir.to_string_lossy());
        }
        let max_run = std::fs::read_dir(&camp_dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e: DirEntry| {
                let name = e.file_name();
                let stripped = name.to_str()?.strip_prefix("run")?.to_string();
                stripped.split('_').next()?.parse::<usize>().ok()
            })
            .max();
        Ok(Self {
            camp_dir,
            run_num: max_run.map_or(0, |max| max + 1),
            part: 0,
        })
    }

    pub fn run_num(&self) -> usize {
        self.run_num
    }

    /// Path of the next file part; each call moves on to a new part.
    pub fn next_file(&mut self) -> PathBuf {
        let path = self
            .camp_dir
            .join(format!("run{}_{}.h5", self.run_num, self.part));
        self.part += 1;
        path
    }
}
