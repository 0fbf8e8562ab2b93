//! The config port: component-global parameters.

use omxil::{
    downcast, downcast_mut, ComponentVersion, IlError, IlResult, IlStruct, Index,
    StandardComponentRole,
};

/// Handles the component-wide parameter space the regular ports do not
/// manage: component name/version and the standard role, plus the vendor
/// extension string table.
pub struct ConfigPort {
    version: ComponentVersion,
    role: String,
    extensions: Vec<(String, Index)>,
}

impl ConfigPort {
    pub fn new(version: ComponentVersion, role: impl Into<String>) -> Self {
        Self {
            version,
            role: role.into(),
            extensions: Vec::new(),
        }
    }

    pub fn component_version(&self) -> &ComponentVersion {
        &self.version
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn register_extension(&mut self, name: impl Into<String>, index: Index) {
        self.extensions.push((name.into(), index));
    }

    pub fn find_index(&self, index: Index) -> bool {
        index == Index::ParamStandardComponentRole
            || self.extensions.iter().any(|(_, i)| *i == index)
    }

    pub fn get_parameter(&self, value: &mut dyn IlStruct) -> IlResult<()> {
        match value.index() {
            Index::ParamStandardComponentRole => {
                downcast_mut::<StandardComponentRole>(value)?.role = self.role.clone();
                Ok(())
            }
            _ => Err(IlError::UnsupportedIndex),
        }
    }

    pub fn set_parameter(&mut self, value: &dyn IlStruct) -> IlResult<()> {
        match value.index() {
            Index::ParamStandardComponentRole => {
                self.role = downcast::<StandardComponentRole>(value)?.role.clone();
                Ok(())
            }
            _ => Err(IlError::UnsupportedIndex),
        }
    }

    pub fn extension_index(&self, name: &str) -> Option<Index> {
        self.extensions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, i)| *i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omxil::SPEC_VERSION;

    fn config_port() -> ConfigPort {
        ConfigPort::new(
            ComponentVersion {
                name: "audio_renderer.test".into(),
                component_version: SPEC_VERSION,
                spec_version: SPEC_VERSION,
                uuid: [0; 16],
            },
            "audio_renderer.pcm",
        )
    }

    #[test]
    fn test_role_roundtrip() {
        let mut cport = config_port();
        let mut role = StandardComponentRole {
            role: String::new(),
        };
        cport.get_parameter(&mut role).unwrap();
        assert_eq!(role.role, "audio_renderer.pcm");

        role.role = "audio_decoder.mp3".into();
        cport.set_parameter(&role).unwrap();
        assert_eq!(cport.role(), "audio_decoder.mp3");
    }

    #[test]
    fn test_extension_lookup() {
        let mut cport = config_port();
        assert_eq!(cport.extension_index("com.example.volume"), None);
        cport.register_extension("com.example.volume", Index::Extension(0x7f00_0001));
        assert_eq!(
            cport.extension_index("com.example.volume"),
            Some(Index::Extension(0x7f00_0001))
        );
        assert!(cport.find_index(Index::Extension(0x7f00_0001)));
    }
}
