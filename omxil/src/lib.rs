//! OpenMAX IL data model.
//!
//! This crate holds the language-level rendition of the IL types shared by
//! every component: states, commands, events, error codes, buffer headers,
//! port definitions and the parameter/config index space. It contains no
//! runtime code; the component runtime lives in `omxcore`.
//!
//! The C structs of the IL specification describe themselves through
//! `nSize`/`nVersion` fields. Here the same job is done by the type system:
//! every parameter/config structure implements [`IlStruct`], which binds it
//! to its [`Index`] and (when applicable) to a port, and the
//! [`downcast`]/[`downcast_mut`] helpers replace the unchecked pointer casts
//! of the original API.

pub mod buffer;
pub mod error;
pub mod index;
pub mod params;
pub mod types;
pub mod version;

pub use buffer::{new_header, BufferData, BufferFlags, BufferHeader, EglImage, HeaderRef, Mark};
pub use error::{IlError, IlResult};
pub use index::{downcast, downcast_mut, Index, IlStruct};
pub use params::{
    AudioEncoding, AudioPortDefinition, AudioPortFormat, BufferSupplier, CompBufferSupplier,
    Endianness, ImagePortDefinition, OtherPortDefinition, PcmModeType, PortCountParam,
    PortDefinition, PortFormat, PortParam, StandardComponentRole, TunnelFlags, TunnelSetup,
    TunneledPortStatus, TunneledPortStatusConfig, VideoPortDefinition,
};
pub use types::{Command, ComponentId, Dir, Domain, EventKind, PortSelector, State};
pub use version::{ComponentUuid, ComponentVersion, SpecVersion, SPEC_VERSION};
