/// Radio abstraction over the BlueZ stack
use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures_util::{Stream, StreamExt};
use log::{debug, info, trace, warn};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;

use crate::error::ScanError;
use crate::models::{Advertisement, ManufacturerData};

/// Scan primitives the advertisement source needs from a radio
#[async_trait]
pub trait Radio: Send + 'static {
    /// Power the radio up, dropping any scan left over from a previous run
    async fn enable(&mut self) -> Result<(), ScanError>;

    /// Wait for the next advertisement carrying manufacturer data, from any device
    async fn scan(&mut self) -> Result<Advertisement, ScanError>;

    async fn stop_scan(&mut self) -> Result<(), ScanError>;
}

type DiscoveryStream = Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

/// Separates live advertisements from what BlueZ replays out of its device cache
///
/// A new discovery session first reports every device BlueZ already knows,
/// carrying the manufacturer data of its last advertisement. That first event
/// per cached device is dropped, and so is data identical to what was already
/// reported for the same address.
#[derive(Debug, Default)]
pub(crate) struct CacheFilter {
    cached: HashSet<Address>,
    last_reported: HashMap<Address, ManufacturerData>,
}

impl CacheFilter {
    /// Begin a discovery session with the addresses BlueZ had cached before it
    pub(crate) fn restart(&mut self, cached: impl IntoIterator<Item = Address>) {
        self.cached = cached.into_iter().collect();
    }

    pub(crate) fn is_live(&mut self, addr: Address, data: &ManufacturerData) -> bool {
        if self.cached.remove(&addr) {
            return false;
        }
        if self.last_reported.get(&addr) == Some(data) {
            return false;
        }
        self.last_reported.insert(addr, data.clone());
        true
    }
}

/// BlueZ radio using the default adapter
#[derive(Default)]
pub struct BluerRadio {
    session: Option<Session>,
    adapter: Option<Adapter>,
    discovery: Option<DiscoveryStream>,
    cache: CacheFilter,
}

impl BluerRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default adapter, powered on; opens the session on first use
    async fn adapter(&mut self) -> Result<Adapter, ScanError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        let session = match &self.session {
            Some(session) => session.clone(),
            None => {
                let session = Session::new().await?;
                self.session = Some(session.clone());
                session
            }
        };

        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!("Bluetooth adapter {} powered on", adapter.name());

        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }
}

async fn start_discovery(adapter: &Adapter) -> Result<DiscoveryStream, ScanError> {
    // Duplicate data is needed, every advertisement carries a new nonce
    let filter = DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..Default::default()
    };

    // Apply the discovery filter (warn if it fails, but continue)
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("Failed to set discovery filter: {}", e);
    }

    let stream = adapter.discover_devices_with_changes().await?;
    Ok(Box::pin(stream))
}

#[async_trait]
impl Radio for BluerRadio {
    async fn enable(&mut self) -> Result<(), ScanError> {
        self.discovery = None;
        self.adapter = None;
        self.adapter().await.map(|_| ())
    }

    async fn scan(&mut self) -> Result<Advertisement, ScanError> {
        let adapter = self.adapter().await?;
        let mut discovery = match self.discovery.take() {
            Some(discovery) => discovery,
            None => {
                self.cache.restart(adapter.device_addresses().await?);
                start_discovery(&adapter).await?
            }
        };

        while let Some(event) = discovery.next().await {
            trace!("scanning...");
            let AdapterEvent::DeviceAdded(addr) = event else {
                continue;
            };

            let device = match adapter.device(addr) {
                Ok(device) => device,
                Err(_) => continue,
            };

            match device.manufacturer_data().await {
                Ok(Some(manufacturer_data)) => {
                    if !self.cache.is_live(addr, &manufacturer_data) {
                        trace!("Skipping cached advertisement from {}", addr);
                        continue;
                    }
                    self.discovery = Some(discovery);
                    return Ok(Advertisement {
                        address: addr.to_string().to_uppercase(),
                        manufacturer_data,
                    });
                }
                Ok(None) => trace!("No manufacturer data for {}", addr),
                Err(e) => debug!("Failed to get manufacturer data for {}: {}", addr, e),
            }
        }

        Err(ScanError::DiscoveryEnded)
    }

    async fn stop_scan(&mut self) -> Result<(), ScanError> {
        // Dropping the stream ends the discovery session
        self.discovery = None;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted radio: hands out queued advertisements, then fails
    #[derive(Default)]
    pub struct FakeRadio {
        pub script: VecDeque<Result<Advertisement, ScanError>>,
        pub enables: Arc<AtomicUsize>,
        pub stops: Arc<AtomicUsize>,
    }

    impl FakeRadio {
        pub fn with_script(script: Vec<Result<Advertisement, ScanError>>) -> Self {
            Self {
                script: script.into(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Radio for FakeRadio {
        async fn enable(&mut self) -> Result<(), ScanError> {
            self.enables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn scan(&mut self) -> Result<Advertisement, ScanError> {
            self.script
                .pop_front()
                .unwrap_or(Err(ScanError::DiscoveryEnded))
        }

        async fn stop_scan(&mut self) -> Result<(), ScanError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
