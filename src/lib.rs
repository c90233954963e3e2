//! Acquisition pipeline for CAEN V1742 (DRS4) digitizer data.
//!
//! A raw byte stream from the card is decoded into a bounded per-group
//! [`EventBuffer`]. From there events are streamed raw to network sinks by the
//! [`Dispatcher`] and archived to HDF5, optionally DRS4-calibrated, by the
//! [`ArchiveWriter`].

pub mod buffer;
pub mod calib;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod settings;
pub mod utils;
pub mod wire;
pub mod writer;

pub use buffer::{EventBuffer, EventMeta, GroupBatch, GroupBuffer};
pub use calib::{CalibrationEngine, CalibrationTable, CorrectionSource, TableFile};
pub use config::{CardConf, Conf, GroupConf, RunSettings};
pub use decoder::{DecodeReport, Decoder, SequenceAnomaly, SequenceStatus, SequenceTracker};
pub use dispatch::{DispatchReport, Dispatcher};
pub use error::{
    ArchiveError, BufferError, CalibrationError, ConfigError, DecodeError, DispatchError,
    SettingsError,
};
pub use settings::{CardSettings, SampleFreq};
pub use utils::Counter;
pub use wire::{EventEncoder, GroupData};
pub use writer::{ArchiveWriter, RunFiles};
