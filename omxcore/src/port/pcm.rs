//! PCM audio port model.

use tracing::debug;

use omxil::{
    downcast, downcast_mut, AudioEncoding, AudioPortFormat, IlError, IlResult, IlStruct, Index,
    PcmModeType,
};

use super::model::PortModel;

/// Audio port carrying raw PCM: manages `ParamAudioPcm` and
/// `ParamAudioPortFormat`, and slaves its PCM mode to a paired port.
pub struct PcmPortModel {
    pcm: PcmModeType,
    encodings: Vec<AudioEncoding>,
}

impl PcmPortModel {
    pub fn new(pcm: PcmModeType) -> Self {
        Self {
            pcm,
            encodings: vec![AudioEncoding::Pcm],
        }
    }

    pub fn pcm_mode(&self) -> &PcmModeType {
        &self.pcm
    }

    fn validate(pcm: &PcmModeType) -> IlResult<()> {
        if pcm.channels == 0 || pcm.sampling_rate == 0 {
            return Err(IlError::BadParameter);
        }
        match pcm.bit_per_sample {
            8 | 16 | 24 | 32 => Ok(()),
            _ => Err(IlError::UnsupportedSetting),
        }
    }
}

impl PortModel for PcmPortModel {
    fn find_index(&self, index: Index) -> bool {
        matches!(index, Index::ParamAudioPcm | Index::ParamAudioPortFormat)
    }

    fn get_parameter(&self, value: &mut dyn IlStruct) -> IlResult<()> {
        match value.index() {
            Index::ParamAudioPcm => {
                let out = downcast_mut::<PcmModeType>(value)?;
                let port_index = out.port_index;
                *out = self.pcm.clone();
                out.port_index = port_index;
                Ok(())
            }
            Index::ParamAudioPortFormat => {
                let out = downcast_mut::<AudioPortFormat>(value)?;
                let pos = out.format_index as usize;
                let encoding = *self.encodings.get(pos).ok_or(IlError::NoMore)?;
                out.encoding = encoding;
                Ok(())
            }
            _ => Err(IlError::UnsupportedIndex),
        }
    }

    fn set_parameter(&mut self, value: &dyn IlStruct) -> IlResult<()> {
        match value.index() {
            Index::ParamAudioPcm => {
                let pcm = downcast::<PcmModeType>(value)?;
                Self::validate(pcm)?;
                self.pcm = pcm.clone();
                Ok(())
            }
            Index::ParamAudioPortFormat => {
                let fmt = downcast::<AudioPortFormat>(value)?;
                if !self.encodings.contains(&fmt.encoding) {
                    return Err(IlError::UnsupportedSetting);
                }
                Ok(())
            }
            _ => Err(IlError::UnsupportedIndex),
        }
    }

    fn apply_slaving(&mut self, triggering: Index, value: &dyn IlStruct) -> IlResult<Vec<Index>> {
        if triggering != Index::ParamAudioPcm {
            return Ok(Vec::new());
        }
        let master = downcast::<PcmModeType>(value)?;
        if master.sampling_rate == self.pcm.sampling_rate && master.channels == self.pcm.channels {
            return Ok(Vec::new());
        }
        debug!(
            rate = master.sampling_rate,
            channels = master.channels,
            "pcm port slaved to new mode"
        );
        self.pcm.sampling_rate = master.sampling_rate;
        self.pcm.channels = master.channels;
        Ok(vec![Index::ParamAudioPcm])
    }
}
