//! Parameter and configuration structures.
//!
//! Only the structures the kernel and the bundled port models need are
//! defined here; component-specific port models define their own types and
//! implement [`crate::IlStruct`] for them with the `il_struct!` macro.

use bitflags::bitflags;

use crate::il_struct;
use crate::types::{Dir, Domain};
use crate::Index;

/// Full definition of one port, as exchanged via `ParamPortDefinition`.
#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub port_index: u32,
    pub dir: Dir,
    pub buffer_count_actual: u32,
    pub buffer_count_min: u32,
    pub buffer_size: usize,
    pub enabled: bool,
    pub populated: bool,
    pub buffers_contiguous: bool,
    pub buffer_alignment: u32,
    pub format: PortFormat,
}

il_struct!(PortDefinition, Index::ParamPortDefinition, port);

impl PortDefinition {
    pub fn domain(&self) -> Domain {
        self.format.domain()
    }

    /// A blank definition used to query a port; every field is overwritten
    /// by `GetParameter`.
    pub fn query(port_index: u32) -> Self {
        Self {
            port_index,
            dir: Dir::Input,
            buffer_count_actual: 0,
            buffer_count_min: 0,
            buffer_size: 0,
            enabled: false,
            populated: false,
            buffers_contiguous: false,
            buffer_alignment: 0,
            format: PortFormat::Other(OtherPortDefinition { format: 0 }),
        }
    }
}

/// Domain-specific half of a port definition.
#[derive(Debug, Clone)]
pub enum PortFormat {
    Audio(AudioPortDefinition),
    Video(VideoPortDefinition),
    Image(ImagePortDefinition),
    Other(OtherPortDefinition),
}

impl PortFormat {
    pub fn domain(&self) -> Domain {
        match self {
            PortFormat::Audio(_) => Domain::Audio,
            PortFormat::Video(_) => Domain::Video,
            PortFormat::Image(_) => Domain::Image,
            PortFormat::Other(_) => Domain::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioPortDefinition {
    pub mime_type: String,
    pub encoding: AudioEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    Unused,
    AutoDetect,
    Pcm,
    Mp3,
    Aac,
    Vorbis,
    Flac,
    Opus,
}

#[derive(Debug, Clone)]
pub struct VideoPortDefinition {
    pub mime_type: String,
    pub frame_width: u32,
    pub frame_height: u32,
}

#[derive(Debug, Clone)]
pub struct ImagePortDefinition {
    pub mime_type: String,
    pub frame_width: u32,
    pub frame_height: u32,
}

#[derive(Debug, Clone)]
pub struct OtherPortDefinition {
    pub format: u32,
}

/// Read-only aggregate answered for the `Param{Audio,Video,Image,Other}Init`
/// indices: how many ports of a domain exist and where their numbering
/// starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortParam {
    pub ports: u32,
    pub start_port_number: u32,
}

/// `Param{Audio,Video,Image,Other}Init` request, routed by domain. The
/// aggregates are maintained by the kernel at port registration and are
/// read only.
#[derive(Debug, Clone, Copy)]
pub struct PortCountParam {
    pub domain: Domain,
    pub param: PortParam,
}

impl PortCountParam {
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            param: PortParam::default(),
        }
    }
}

impl crate::IlStruct for PortCountParam {
    fn index(&self) -> Index {
        match self.domain {
            Domain::Audio => Index::ParamAudioInit,
            Domain::Video => Index::ParamVideoInit,
            Domain::Image => Index::ParamImageInit,
            Domain::Other => Index::ParamOtherInit,
        }
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Supported audio encodings a port advertises, one entry at a time.
#[derive(Debug, Clone)]
pub struct AudioPortFormat {
    pub port_index: u32,
    pub format_index: u32,
    pub encoding: AudioEncoding,
}

il_struct!(AudioPortFormat, Index::ParamAudioPortFormat, port);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// PCM mode of an audio port (`ParamAudioPcm`).
#[derive(Debug, Clone)]
pub struct PcmModeType {
    pub port_index: u32,
    pub channels: u32,
    pub signed_samples: bool,
    pub interleaved: bool,
    pub bit_per_sample: u32,
    pub sampling_rate: u32,
    pub endianness: Endianness,
}

il_struct!(PcmModeType, Index::ParamAudioPcm, port);

impl PcmModeType {
    /// The 16-bit little-endian stereo mode most renderers default to.
    pub fn stereo_48k(port_index: u32) -> Self {
        Self {
            port_index,
            channels: 2,
            signed_samples: true,
            interleaved: true,
            bit_per_sample: 16,
            sampling_rate: 48_000,
            endianness: Endianness::Little,
        }
    }
}

/// Which side of a tunnel allocates the buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferSupplier {
    #[default]
    Unspecified,
    Input,
    Output,
}

/// `ParamCompBufferSupplier`: negotiated supplier of a tunneled port pair.
#[derive(Debug, Clone, Copy)]
pub struct CompBufferSupplier {
    pub port_index: u32,
    pub supplier: BufferSupplier,
}

il_struct!(CompBufferSupplier, Index::ParamCompBufferSupplier, port);

bitflags! {
    /// Flags carried by [`TunnelSetup`] during tunnel negotiation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TunnelFlags: u32 {
        /// The output port will only read from the buffers; the input side
        /// should become the supplier.
        const READ_ONLY = 0x0000_0001;
    }
}

/// Negotiation scratchpad passed between the two ends of
/// `ComponentTunnelRequest`. The output side fills it in, the input side
/// decides.
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelSetup {
    pub flags: TunnelFlags,
    pub supplier: BufferSupplier,
}

bitflags! {
    /// Readiness bits a tunneled port advertises to its peer through
    /// `ConfigTunneledPortStatus`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TunneledPortStatus: u32 {
        /// The port accepts `UseBuffer` calls from the peer.
        const ACCEPT_USE_BUFFER = 0x0000_0001;
        /// The port accepts buffer exchange (`EmptyThisBuffer` /
        /// `FillThisBuffer`) from the peer.
        const ACCEPT_BUFFER_EXCHANGE = 0x0000_0002;
        /// The port is waiting for its buffers back before it may complete
        /// an Executing-to-Idle transition.
        const AWAIT_BUFFERS_RETURN = 0x0000_0004;
    }
}

/// `ConfigTunneledPortStatus` payload.
#[derive(Debug, Clone, Copy)]
pub struct TunneledPortStatusConfig {
    pub port_index: u32,
    pub status: TunneledPortStatus,
}

il_struct!(
    TunneledPortStatusConfig,
    Index::ConfigTunneledPortStatus,
    port
);

/// Standard role of the component (`ParamStandardComponentRole`), stored on
/// the config port.
#[derive(Debug, Clone)]
pub struct StandardComponentRole {
    pub role: String,
}

il_struct!(StandardComponentRole, Index::ParamStandardComponentRole);
