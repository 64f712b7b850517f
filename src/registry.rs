use std::collections::BTreeMap;
use tracing::debug;

use crate::{
    adapter::{
        DaumClassicDevice, DaumPremiumDevice, Device, DeviceFamily, KettlerDevice, UserProfile,
    },
    error::{LinkError, Result},
    link::DeviceLink,
    transport::Transport,
};

/// Builds a device around a ready link
pub type DeviceFactory = fn(DeviceLink, UserProfile) -> Box<dyn Device>;

fn daum_classic(link: DeviceLink, profile: UserProfile) -> Box<dyn Device> {
    let name = format!("Daum Classic ({})", link.name());
    Box::new(DaumClassicDevice::new(name, link, 0, profile))
}

fn daum_premium(link: DeviceLink, profile: UserProfile) -> Box<dyn Device> {
    let name = format!("Daum Premium ({})", link.name());
    Box::new(DaumPremiumDevice::new(name, link, profile))
}

fn kettler(link: DeviceLink, profile: UserProfile) -> Box<dyn Device> {
    let name = format!("Kettler ({})", link.name());
    Box::new(KettlerDevice::new(name, link, profile))
}

/// Device families known to an application
///
/// The application constructs the registry and hands it to whatever code
/// discovers devices; nothing registers itself implicitly.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    factories: BTreeMap<DeviceFamily, DeviceFactory>,
}

impl DeviceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Daum Classic, Daum Premium and Kettler families
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DeviceFamily::DaumClassic, daum_classic);
        registry.register(DeviceFamily::DaumPremium, daum_premium);
        registry.register(DeviceFamily::Kettler, kettler);
        registry
    }

    /// Register `factory` for `family`, returning the factory it replaces
    pub fn register(&mut self, family: DeviceFamily, factory: DeviceFactory) -> Option<DeviceFactory> {
        debug!("registering {}", family);
        self.factories.insert(family, factory)
    }

    /// Factory for `family`
    #[must_use]
    pub fn get(&self, family: DeviceFamily) -> Option<DeviceFactory> {
        self.factories.get(&family).copied()
    }

    /// Registered families
    #[must_use]
    pub fn families(&self) -> Vec<DeviceFamily> {
        self.factories.keys().copied().collect()
    }

    /// Build a device of `family` over `transport`, using the family's codec
    /// and link timeouts
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidParameters`] if `family` is not registered.
    pub fn build(
        &self,
        family: DeviceFamily,
        transport: Box<dyn Transport>,
        profile: UserProfile,
    ) -> Result<Box<dyn Device>> {
        let factory = self.get(family).ok_or_else(|| {
            LinkError::InvalidParameters(format!("{family} is not registered"))
        })?;
        let name = transport.name().to_string();
        let link = DeviceLink::from_boxed(
            name,
            transport,
            family.codec_kind().build(),
            family.link_config(),
        );
        Ok(factory(link, profile))
    }
}
