use confique::Config;
use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub card: CardConf,
}

impl Conf {
    /// Read the run configuration from a TOML file
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }
        Ok(Conf::builder().file(config_path).load()?)
    }
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    pub output_dir: String,
    #[config(default = 0)]
    pub campaign_num: usize,
    /// Slots per group in the decoder's event buffer
    #[config(default = 1000)]
    pub event_buffer: usize,
    /// Events per archived file
    #[config(default = 500)]
    pub batch_size: usize,
    /// Bytes per read from a capture file
    #[config(default = 1048576)]
    pub chunk_bytes: usize,
    /// Threads blosc may use when compressing archives
    #[config(default = 1)]
    pub blosc_threads: u8,
    #[config(default = [])]
    pub sinks: Vec<String>,
    pub calibration_file: Option<String>,
}

#[derive(Config, Debug, Clone)]
pub struct CardConf {
    pub index: String,
    /// 0..=3 for 1024, 520, 256, 136 samples
    #[config(default = 0)]
    pub num_samples: u32,
    /// 0..=2 for 5, 2.5, 1 GHz
    #[config(default = 0)]
    pub sample_freq: u32,
    #[config(default = [])]
    pub tr_readout: Vec<bool>,
    #[config(default = [])]
    pub tr_dc_offset: Vec<u16>,
    #[config(default = [])]
    pub groups: Vec<GroupConf>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct GroupConf {
    #[serde(default)]
    pub enabled: bool,
    /// Volts, -1..1
    pub dc_offsets: Vec<f64>,
    pub channel_mask: Vec<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
[run_settings]
output_dir = "data"
batch_size = 20
sinks = ["127.0.0.1:9000"]

[card]
index = "V1742_0"
num_samples = 2
tr_readout = [true, false]

[[card.groups]]
enabled = true
dc_offsets = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
channel_mask = [true, true, true, true, true, true, true, true]
"#;

    #[test]
    fn test_read_config_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let conf = Conf::read_config_file(file.path()).unwrap();
        assert_eq!(conf.run_settings.output_dir, "data");
        assert_eq!(conf.run_settings.batch_size, 20);
        assert_eq!(conf.run_settings.event_buffer, 1000);
        assert_eq!(conf.run_settings.blosc_threads, 1);
        assert_eq!(conf.run_settings.sinks, vec!["127.0.0.1:9000".to_string()]);
        assert!(conf.run_settings.calibration_file.is_none());
        assert_eq!(conf.card.num_samples, 2);
        assert_eq!(conf.card.groups.len(), 1);
        assert!(conf.card.groups[0].enabled);
    }

    #[test]
    fn test_missing_config_file() {
        let res = Conf::read_config_file(Path::new("/definitely/not/here.toml"));
        assert!(matches!(res, Err(ConfigError::BadFilePath(_))));
    }
}
