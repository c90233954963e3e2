use crate::config::CardConf;
use crate::error::SettingsError;

pub const GROUPS: usize = 4;
pub const CHANNELS: usize = 8;
pub const CELLS: usize = 1024;
/// Auxiliary (TR) inputs, each shared by a pair of groups.
pub const TR_INPUTS: usize = GROUPS / 2;
pub const ADC_BITS: u32 = 12;

const CUSTOM_SIZES: [usize; 4] = [1024, 520, 256, 136];
const DEFAULT_DC_OFFSET: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFreq {
    GHz5,
    GHz2_5,
    GHz1,
}

impl SampleFreq {
    pub fn from_code(code: u32) -> Result<Self, SettingsError> {
        match code {
            0 => Ok(Self::GHz5),
            1 => Ok(Self::GHz2_5),
            2 => Ok(Self::GHz1),
            _ => Err(SettingsError::BadSampleFreq(code)),
        }
    }

    pub fn ns_per_sample(self) -> f64 {
        match self {
            Self::GHz5 => 0.2,
            Self::GHz2_5 => 0.4,
            Self::GHz1 => 1.0,
        }
    }
}

/// Immutable description of one V1742 card for the lifetime of a run.
///
/// Everything downstream (decoder, buffer, calibration, writers) sizes itself
/// from this snapshot once and never re-reads the configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct CardSettings {
    index: String,
    num_samples: usize,
    sample_freq: SampleFreq,
    group_enable: [bool; GROUPS],
    channel_mask: [[bool; CHANNELS]; GROUPS],
    dc_offset: [u16; GROUPS * CHANNELS],
    tr_readout: [bool; TR_INPUTS],
    tr_dc_offset: [u16; TR_INPUTS],
}

impl CardSettings {
    /// A card with every group disabled. Enable groups with [`CardSettings::with_group`].
    pub fn new(index: &str, num_samples: usize) -> Self {
        Self {
            index: index.to_string(),
            num_samples,
            sample_freq: SampleFreq::GHz5,
            group_enable: [false; GROUPS],
            channel_mask: [[false; CHANNELS]; GROUPS],
            dc_offset: [DEFAULT_DC_OFFSET; GROUPS * CHANNELS],
            tr_readout: [false; TR_INPUTS],
            tr_dc_offset: [DEFAULT_DC_OFFSET; TR_INPUTS],
        }
    }

    pub fn with_group(mut self, gr: usize, channel_mask: [bool; CHANNELS]) -> Self {
        self.group_enable[gr] = true;
        self.channel_mask[gr] = channel_mask;
        self
    }

    pub fn with_tr_readout(mut self, pair: usize, dc_offset: u16) -> Self {
        self.tr_readout[pair] = true;
        self.tr_dc_offset[pair] = dc_offset;
        self
    }

    pub fn with_sample_freq(mut self, freq: SampleFreq) -> Self {
        self.sample_freq = freq;
        self
    }

    pub fn with_dc_offset(mut self, gr: usize, ch: usize, offset: u16) -> Self {
        self.dc_offset[gr * CHANNELS + ch] = offset;
        self
    }

    /// Validate a configuration file section and convert it into card settings.
    pub fn from_conf(conf: &CardConf) -> Result<Self, SettingsError> {
        if conf.index.is_empty() {
            return Err(SettingsError::EmptyIndex);
        }
        let num_samples = *CUSTOM_SIZES
            .get(conf.num_samples as usize)
            .ok_or(SettingsError::BadCustomSize(conf.num_samples))?;
        let mut settings = Self::new(&conf.index, num_samples)
            .with_sample_freq(SampleFreq::from_code(conf.sample_freq)?);

        if conf.groups.len() > GROUPS {
            return Err(SettingsError::TooManyGroups(conf.groups.len()));
        }
        for (gr, group) in conf.groups.iter().enumerate() {
            if group.dc_offsets.len() != CHANNELS {
                return Err(SettingsError::BadGroupLength {
                    group: gr,
                    field: "dc_offsets",
                    len: group.dc_offsets.len(),
                });
            }
            if group.channel_mask.len() != CHANNELS {
                return Err(SettingsError::BadGroupLength {
                    group: gr,
                    field: "channel_mask",
                    len: group.channel_mask.len(),
                });
            }
            settings.group_enable[gr] = group.enabled;
            for ch in 0..CHANNELS {
                settings.channel_mask[gr][ch] = group.channel_mask[ch];
                settings.dc_offset[gr * CHANNELS + ch] = volts_to_dac(group.dc_offsets[ch]);
            }
        }

        for pair in 0..TR_INPUTS {
            settings.tr_readout[pair] = conf.tr_readout.get(pair).copied().unwrap_or(false);
            settings.tr_dc_offset[pair] = conf
                .tr_dc_offset
                .get(pair)
                .copied()
                .unwrap_or(DEFAULT_DC_OFFSET);
        }

        Ok(settings)
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn sample_freq(&self) -> SampleFreq {
        self.sample_freq
    }

    pub fn ns_per_sample(&self) -> f64 {
        self.sample_freq.ns_per_sample()
    }

    pub fn group_enabled(&self, gr: usize) -> bool {
        self.group_enable[gr]
    }

    pub fn channel_enabled(&self, gr: usize, ch: usize) -> bool {
        self.group_enable[gr] && self.channel_mask[gr][ch]
    }

    pub fn active_groups(&self) -> impl Iterator<Item = usize> + '_ {
        (0..GROUPS).filter(|&gr| self.group_enable[gr])
    }

    pub fn dc_offset(&self, gr: usize, ch: usize) -> u16 {
        self.dc_offset[gr * CHANNELS + ch]
    }

    /// Whether the TR input shared by `gr` and its pair is read out.
    pub fn tr_readout(&self, gr: usize) -> bool {
        self.tr_readout[gr / 2]
    }

    pub fn tr_dc_offset(&self, gr: usize) -> u16 {
        self.tr_dc_offset[gr / 2]
    }
}

/// Convert a DC offset in volts (-1..1) to the 16-bit DAC code.
fn volts_to_dac(volts: f64) -> u16 {
    ((-volts + 1.0) / 2.0 * 65536.0).round().clamp(0.0, u16::MAX as f64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConf;

    fn card_conf() -> CardConf {
        CardConf {
            index: "V1742_0".to_string(),
            num_samples: 1,
            sample_freq: 1,
            tr_readout: vec![true],
            tr_dc_offset: vec![1000, 2000],
            groups: vec![
                GroupConf {
                    enabled: true,
                    dc_offsets: vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.0, 0.0, 0.0],
                    channel_mask: vec![true, false, true, true, true, true, true, true],
                },
                GroupConf {
                    enabled: false,
                    dc_offsets: vec![0.0; 8],
                    channel_mask: vec![true; 8],
                },
            ],
        }
    }

    #[test]
    fn test_from_conf() {
        let settings = CardSettings::from_conf(&card_conf()).unwrap();
        assert_eq!(settings.index(), "V1742_0");
        assert_eq!(settings.num_samples(), 520);
        assert_eq!(settings.ns_per_sample(), 0.4);
        assert!(settings.group_enabled(0));
        assert!(!settings.group_enabled(1));
        assert!(!settings.group_enabled(3));
        assert!(settings.channel_enabled(0, 0));
        assert!(!settings.channel_enabled(0, 1));
        // disabled group masks its channels
        assert!(!settings.channel_enabled(1, 0));
        assert_eq!(settings.active_groups().collect::<Vec<_>>(), vec![0]);
        assert!(settings.tr_readout(0));
        assert!(settings.tr_readout(1));
        assert!(!settings.tr_readout(2));
        assert_eq!(settings.tr_dc_offset(3), 2000);
    }

    #[test]
    fn test_dc_offset_conversion() {
        let settings = CardSettings::from_conf(&card_conf()).unwrap();
        assert_eq!(settings.dc_offset(0, 0), 0x8000);
        assert_eq!(settings.dc_offset(0, 1), 0x4000);
        assert_eq!(settings.dc_offset(0, 2), 0xC000);
        assert_eq!(settings.dc_offset(0, 3), 0);
        assert_eq!(settings.dc_offset(0, 4), 0xFFFF);
        // groups missing from the file keep the mid-scale default
        assert_eq!(settings.dc_offset(2, 5), 0x8000);
    }

    #[test]
    fn test_from_conf_rejects_bad_codes() {
        let mut conf = card_conf();
        conf.num_samples = 4;
        assert!(matches!(
            CardSettings::from_conf(&conf),
            Err(SettingsError::BadCustomSize(4))
        ));

        let mut conf = card_conf();
        conf.sample_freq = 3;
        assert!(matches!(
            CardSettings::from_conf(&conf),
            Err(SettingsError::BadSampleFreq(3))
        ));

        let mut conf = card_conf();
        conf.groups[1].channel_mask.pop();
        assert!(matches!(
            CardSettings::from_conf(&conf),
            Err(SettingsError::BadGroupLength { group: 1, .. })
        ));
    }
}
