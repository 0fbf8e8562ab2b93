//! Parameter and configuration index space.

use std::any::Any;
use std::fmt;

use crate::error::{IlError, IlResult};

/// Identifies a parameter or configuration structure.
///
/// The `Extension` range is handed out by `GetExtensionIndex`; the values
/// are allocated per component and have no meaning outside of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Index {
    ParamPortDefinition,
    ParamCompBufferSupplier,
    ParamAudioInit,
    ParamVideoInit,
    ParamImageInit,
    ParamOtherInit,
    ParamAudioPortFormat,
    ParamAudioPcm,
    ParamStandardComponentRole,
    ConfigTunneledPortStatus,
    Extension(u32),
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Index::ParamPortDefinition => f.write_str("ParamPortDefinition"),
            Index::ParamCompBufferSupplier => f.write_str("ParamCompBufferSupplier"),
            Index::ParamAudioInit => f.write_str("ParamAudioInit"),
            Index::ParamVideoInit => f.write_str("ParamVideoInit"),
            Index::ParamImageInit => f.write_str("ParamImageInit"),
            Index::ParamOtherInit => f.write_str("ParamOtherInit"),
            Index::ParamAudioPortFormat => f.write_str("ParamAudioPortFormat"),
            Index::ParamAudioPcm => f.write_str("ParamAudioPcm"),
            Index::ParamStandardComponentRole => f.write_str("ParamStandardComponentRole"),
            Index::ConfigTunneledPortStatus => f.write_str("ConfigTunneledPortStatus"),
            Index::Extension(n) => write!(f, "Extension({:#x})", n),
        }
    }
}

/// A parameter or configuration structure exchanged through
/// `GetParameter`/`SetParameter`/`GetConfig`/`SetConfig`.
///
/// Stands in for the self-describing `nSize`/`nVersion` C structs: the
/// index binds the value to its slot, `port_index` (when present) routes it
/// to the managing port, and the `Any` accessors allow the managing port to
/// recover the concrete type.
pub trait IlStruct: Any + Send + Sync + fmt::Debug {
    fn index(&self) -> Index;

    /// The port this structure addresses; `None` for component-global
    /// structures handled by the config port.
    fn port_index(&self) -> Option<u32> {
        None
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Recovers the concrete type of an [`IlStruct`], or `BadParameter` when
/// the caller passed a structure that does not match the index.
pub fn downcast<T: IlStruct>(value: &dyn IlStruct) -> IlResult<&T> {
    value.as_any().downcast_ref::<T>().ok_or(IlError::BadParameter)
}

pub fn downcast_mut<T: IlStruct>(value: &mut dyn IlStruct) -> IlResult<&mut T> {
    value
        .as_any_mut()
        .downcast_mut::<T>()
        .ok_or(IlError::BadParameter)
}

/// Implements [`IlStruct`] for a parameter/config structure.
///
/// Two forms: `il_struct!(Type, Index::..)` for component-global structures
/// and `il_struct!(Type, Index::.., port)` for structures carrying a
/// `port_index` field.
#[macro_export]
macro_rules! il_struct {
    ($ty:ty, $index:expr) => {
        impl $crate::IlStruct for $ty {
            fn index(&self) -> $crate::Index {
                $index
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
        }
    };
    ($ty:ty, $index:expr, port) => {
        impl $crate::IlStruct for $ty {
            fn index(&self) -> $crate::Index {
                $index
            }
            fn port_index(&self) -> Option<u32> {
                Some(self.port_index)
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
        }
    };
}
