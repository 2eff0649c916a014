/// Bluetooth Low Energy advertisement source for a single Victron device
use log::{debug, info, trace};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::bluetooth::radio::Radio;
use crate::error::ScanError;
use crate::models::ManufacturerData;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(1); // Pause between matches

enum ScanState {
    Idle,
    Scanning,
    Matched(ManufacturerData),
    Cooldown,
}

/// Watches the radio for one device and feeds its manufacturer data to a channel
///
/// After each match the scan is stopped and resumed once the cooldown has
/// passed, which rate-limits everything downstream.
pub struct AdvertisementSource<R: Radio> {
    radio: Arc<Mutex<R>>,
    address: String,
    cooldown: Duration,
}

/// A running scan. Dropping it stops the background task.
pub struct ScanHandle {
    channel: mpsc::Receiver<ManufacturerData>,
    task: Option<JoinHandle<Result<(), ScanError>>>,
}

impl<R: Radio> AdvertisementSource<R> {
    pub fn new(radio: R, address: &str, cooldown: Duration) -> Self {
        Self {
            radio: Arc::new(Mutex::new(radio)),
            address: address.to_uppercase(),
            cooldown,
        }
    }

    /// Spawn the scan loop and return the handle owning its output channel
    pub fn start_scanning(&self) -> ScanHandle {
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(scan_loop(
            self.radio.clone(),
            self.address.clone(),
            self.cooldown,
            tx,
        ));

        ScanHandle {
            channel: rx,
            task: Some(task),
        }
    }
}

async fn scan_loop<R: Radio>(
    radio: Arc<Mutex<R>>,
    address: String,
    cooldown: Duration,
    tx: mpsc::Sender<ManufacturerData>,
) -> Result<(), ScanError> {
    // A previous run's task may still hold the radio until its abort lands
    let mut radio = radio.lock().await;
    let mut state = ScanState::Idle;

    loop {
        state = match state {
            ScanState::Idle => {
                radio.enable().await?;
                info!("Scanning for advertisements from {}", address);
                ScanState::Scanning
            }
            ScanState::Scanning => {
                let advertisement = radio.scan().await?;
                if advertisement.address.eq_ignore_ascii_case(&address) {
                    debug!("found advertisement from victron: {}", advertisement.address);
                    ScanState::Matched(advertisement.manufacturer_data)
                } else {
                    trace!("ignoring advertisement from {}", advertisement.address);
                    ScanState::Scanning
                }
            }
            ScanState::Matched(data) => {
                radio.stop_scan().await?;
                if tx.send(data).await.is_err() {
                    debug!("advertisement consumer went away, stopping scan");
                    return Ok(());
                }
                ScanState::Cooldown
            }
            ScanState::Cooldown => {
                sleep(cooldown).await;
                ScanState::Scanning
            }
        };
    }
}

impl ScanHandle {
    pub fn channel(&mut self) -> &mut mpsc::Receiver<ManufacturerData> {
        &mut self.channel
    }

    /// Next matched advertisement, in arrival order
    ///
    /// Once the scan loop has stopped this returns the error it stopped with.
    pub async fn next_frame(&mut self) -> Result<ManufacturerData, ScanError> {
        match self.channel().recv().await {
            Some(data) => Ok(data),
            None => Err(self.finish().await),
        }
    }

    async fn finish(&mut self) -> ScanError {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(Ok(())) => ScanError::ChannelClosed,
                Ok(Err(e)) => e,
                Err(e) => ScanError::Task(e),
            },
            None => ScanError::ChannelClosed,
        }
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
