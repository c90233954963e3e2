use std::path::PathBuf;
use thiserror::Error;

use crate::settings::GROUPS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Event structure missing tag: header word {0:#010x}")]
    MissingTag(u32),
    #[error("Event record declares {0} words, shorter than its own header")]
    BadRecordSize(u32),
    #[error("Received sample length {found} does not match expected {expected} (group {group})")]
    SampleLengthMismatch {
        group: usize,
        found: usize,
        expected: usize,
    },
    #[error("Received TR{pair} data when not marked for readout (group {group})", pair = .group / 2)]
    UnexpectedAuxiliary { group: usize },
    #[error("Received group data for inactive group ({0})")]
    InactiveGroup(usize),
    #[error("Group {group} data runs {words} words past the end of its event record")]
    GroupOverrun { group: usize, words: usize },
    #[error("Decoder buffer for {card} group {group} overflowed its {capacity} slots")]
    BufferOverflow {
        card: String,
        group: usize,
        capacity: usize,
    },
}

impl DecodeError {
    /// Structural errors mean byte alignment is lost; overflow means a consumer fell behind.
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::BufferOverflow { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("Cannot evict {requested} events, only {ready} are ready in every active group")]
    EvictionTooLarge { requested: usize, ready: usize },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Waveform of {0} samples does not fit a stream record")]
    TooManySamples(usize),
    #[error("Channel name {0} does not fit a stream record")]
    NameTooLong(String),
    #[error("Stream record of {0} bytes exceeds the 16-bit length field")]
    RecordTooLarge(usize),
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("ArchiveWriter failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("ArchiveWriter could not encode version string: {0}")]
    VersionError(#[from] hdf5::types::StringError),
    #[error("ArchiveWriter asked for {requested} events but only {ready} are ready")]
    BatchTooLarge { requested: usize, ready: usize },
    #[error("ArchiveWriter failed to compact the event buffer: {0}")]
    BufferError(#[from] BufferError),
    #[error("ArchiveWriter could not move the finished archive to {path:?}: {source}")]
    Finish {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("num_samples must be < 4, got {0}")]
    BadCustomSize(u32),
    #[error("sample_freq must be < 3, got {0}")]
    BadSampleFreq(u32),
    #[error("Configuration lists {0} groups, the card has {max}", max = GROUPS)]
    TooManyGroups(usize),
    #[error("Group {group} {field} expected to be length 8, got {len}")]
    BadGroupLength {
        group: usize,
        field: &'static str,
        len: usize,
    },
    #[error("Card index must not be empty")]
    EmptyIndex,
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Calibration table file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Calibration table could not be read: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed to load: {0}")]
    LoadError(#[from] confique::Error),
    #[error("Config describes an invalid card: {0}")]
    SettingsError(#[from] SettingsError),
}
