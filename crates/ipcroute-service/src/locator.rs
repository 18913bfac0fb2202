use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ipcroute_channel::sync::{read, write};
use ipcroute_channel::ChannelFactory;
use tracing::debug;

use crate::error::{Result, ServiceError};
use crate::service_interface::ServiceInterface;

/// Resolves service names to addresses.
pub trait ServiceLocator: Send + Sync {
    fn url(&self, service: &str) -> Option<String>;
}

/// In-memory service registry.
#[derive(Default)]
pub struct StaticLocator {
    services: RwLock<HashMap<String, String>>,
}

impl StaticLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` at `url`, replacing any earlier address.
    pub fn register(&self, service: impl Into<String>, url: impl Into<String>) {
        write(&self.services).insert(service.into(), url.into());
    }
}

impl ServiceLocator for StaticLocator {
    fn url(&self, service: &str) -> Option<String> {
        read(&self.services).get(service).cloned()
    }
}

/// Builds [`ServiceInterface`]s for named services.
pub struct ServiceInterfaceFactory {
    locator: Arc<dyn ServiceLocator>,
    channels: Arc<dyn ChannelFactory>,
}

impl ServiceInterfaceFactory {
    pub fn new(locator: Arc<dyn ServiceLocator>, channels: Arc<dyn ChannelFactory>) -> Self {
        Self { locator, channels }
    }

    /// Locate `service` and wrap the channel for its address.
    pub fn create(&self, service: &str) -> Result<Arc<ServiceInterface>> {
        let url = self
            .locator
            .url(service)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ServiceError::UnknownService(service.to_string()))?;
        debug!(service, url = %url, "creating service interface");
        let channel = self.channels.channel_for(&url)?;
        Ok(ServiceInterface::new(channel, service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use ipcroute_channel::{ChannelPair, SharedChannel};

    #[test]
    fn create_locates_and_connects() {
        let locator = Arc::new(StaticLocator::new());
        locator.register("Clock", "ipc://clock-host/Clock");

        let pair = Arc::new(ChannelPair::new());
        let asked = Arc::new(Mutex::new(Vec::new()));
        let (p, a) = (Arc::clone(&pair), Arc::clone(&asked));
        let channels = move |address: &str| -> ipcroute_channel::Result<SharedChannel> {
            a.lock().expect("lock").push(address.to_string());
            Ok(Arc::clone(&p.left) as SharedChannel)
        };

        let factory = ServiceInterfaceFactory::new(locator, Arc::new(channels));
        let interface = factory.create("Clock").expect("interface");

        assert_eq!(interface.service_name(), "Clock");
        assert_eq!(*asked.lock().expect("lock"), vec!["ipc://clock-host/Clock"]);
    }

    #[test]
    fn unknown_service_is_an_error() {
        let locator = Arc::new(StaticLocator::new());
        locator.register("Blank", "");
        let channels = |_: &str| -> ipcroute_channel::Result<SharedChannel> {
            panic!("no channel should be requested")
        };
        let factory = ServiceInterfaceFactory::new(locator, Arc::new(channels));

        assert!(matches!(
            factory.create("Missing"),
            Err(ServiceError::UnknownService(name)) if name == "Missing"
        ));
        assert!(matches!(
            factory.create("Blank"),
            Err(ServiceError::UnknownService(_))
        ));
    }
}
