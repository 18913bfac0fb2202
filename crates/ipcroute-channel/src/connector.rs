use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ipcroute_transport::Transport;
use tracing::debug;
use url::Url;

use crate::channel::{Channel, SharedChannel};
use crate::duplex::{ChannelConfig, DuplexChannel};
use crate::error::{ChannelError, Result};
use crate::sync::lock;

/// Produces channels for service addresses.
pub trait ChannelFactory: Send + Sync {
    /// Channel for `address`, created on first use and reused afterwards.
    fn channel_for(&self, address: &str) -> Result<SharedChannel>;
}

impl<F> ChannelFactory for F
where
    F: Fn(&str) -> Result<SharedChannel> + Send + Sync,
{
    fn channel_for(&self, address: &str) -> Result<SharedChannel> {
        self(address)
    }
}

/// Opens outbound [`DuplexChannel`]s over a transport.
pub struct Connector {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    channels: Mutex<HashMap<String, Arc<DuplexChannel>>>,
}

impl Connector {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: ChannelConfig::default(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Override the configuration of created channels.
    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Open a new channel to the listener on `name`.
    pub fn connect(&self, name: &str) -> Result<Arc<DuplexChannel>> {
        DuplexChannel::connect(Arc::clone(&self.transport), name, self.config.clone())
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Dispose every channel created through [`ChannelFactory::channel_for`].
    pub fn dispose(&self) {
        let channels: Vec<_> = lock(&self.channels).drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.dispose();
        }
    }
}

impl ChannelFactory for Connector {
    fn channel_for(&self, address: &str) -> Result<SharedChannel> {
        let host = host_of(address)?;
        if let Some(channel) = lock(&self.channels).get(&host) {
            return Ok(Arc::clone(channel) as SharedChannel);
        }

        let channel = self.connect(&host)?;
        let mut channels = lock(&self.channels);
        if let Some(existing) = channels.get(&host) {
            // Lost a race with another caller for the same host.
            channel.dispose();
            return Ok(Arc::clone(existing) as SharedChannel);
        }
        debug!(host = %host, channel = %channel.id(), "memoized channel");
        channels.insert(host, Arc::clone(&channel));
        Ok(channel as SharedChannel)
    }
}

/// Channel name for a service address.
///
/// `scheme://host/...` addresses resolve to their host; anything without a
/// scheme is used as-is.
pub fn host_of(address: &str) -> Result<String> {
    let invalid = |reason: String| ChannelError::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    if !address.contains("://") {
        if address.is_empty() {
            return Err(invalid("address is empty".to_string()));
        }
        return Ok(address.to_string());
    }
    let url = Url::parse(address).map_err(|err| invalid(err.to_string()))?;
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(host.to_string()),
        _ => Err(invalid("address has no host".to_string())),
    }
}
