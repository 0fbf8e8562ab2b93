//! Domain-specific behaviour plugged into a port.

use omxil::{IlError, IlResult, IlStruct, Index};

/// Parameter blocks and slaving behaviour of one port domain.
///
/// A port handles `ParamPortDefinition` and `ParamCompBufferSupplier`
/// itself and delegates every other index here. Component kinds provide
/// their own models for domains this crate does not ship.
pub trait PortModel: Send {
    /// Whether this model manages `index`.
    fn find_index(&self, index: Index) -> bool;

    fn get_parameter(&self, value: &mut dyn IlStruct) -> IlResult<()>;

    fn set_parameter(&mut self, value: &dyn IlStruct) -> IlResult<()>;

    fn get_config(&self, _value: &mut dyn IlStruct) -> IlResult<()> {
        Err(IlError::UnsupportedIndex)
    }

    fn set_config(&mut self, _value: &dyn IlStruct) -> IlResult<()> {
        Err(IlError::UnsupportedIndex)
    }

    /// Resolves a vendor extension string to an index.
    fn extension_index(&self, _name: &str) -> Option<Index> {
        None
    }

    /// Reacts to a parameter change on the paired master/slave port.
    /// Returns the indices that changed on this side; the kernel raises one
    /// `PortSettingsChanged` per entry.
    fn apply_slaving(
        &mut self,
        _triggering: Index,
        _value: &dyn IlStruct,
    ) -> IlResult<Vec<Index>> {
        Ok(Vec::new())
    }
}

/// Model with no domain parameters at all.
pub struct BasePortModel;

impl PortModel for BasePortModel {
    fn find_index(&self, _index: Index) -> bool {
        false
    }

    fn get_parameter(&self, _value: &mut dyn IlStruct) -> IlResult<()> {
        Err(IlError::UnsupportedIndex)
    }

    fn set_parameter(&mut self, _value: &dyn IlStruct) -> IlResult<()> {
        Err(IlError::UnsupportedIndex)
    }
}
