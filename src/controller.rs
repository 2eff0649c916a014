/// Battery voltage safety controller and its supervisory retry loop
use log::{debug, error, info, warn};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::time::{sleep, Duration};

use crate::bluetooth::{AdvertisementSource, Radio};
use crate::collaborators::{Inverter, Relay};
use crate::error::{ControllerError, DecodeError};
use crate::models::{InverterInfo, ManufacturerData, ReadableTelemetry};
use crate::utils::format_datetime;
use crate::victron::crypto::decode_key;
use crate::victron::{decode_frame, decode_telemetry, decrypt, victron_payload};

const SOLAR_CHARGER_RECORD: u8 = 0x01;
const SHUTDOWN_POWER_LIMIT_WATTS: u32 = 0;
// Stay off across inverter restarts until someone intervenes
const PERSISTENT_SHUTDOWN: bool = true;
const PLAUSIBILITY_BAND: f32 = 0.2; // Measured voltage must be within ±20% of the shutoff voltage
pub const RELAY_SETTLE_DELAY: Duration = Duration::from_secs(5);
pub const RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Check the shutoff voltage against what the inverter's DC inputs measure
///
/// Catches thresholds meant for a different system voltage, e.g. a 12 V
/// threshold on a 48 V battery bank.
pub fn validate_shutoff_voltage(
    info: &InverterInfo,
    shutoff_voltage: f32,
) -> Result<(), ControllerError> {
    let min = shutoff_voltage * (1.0 - PLAUSIBILITY_BAND);
    let max = shutoff_voltage * (1.0 + PLAUSIBILITY_BAND);

    let voltages = info.dc_channel_voltages();
    if voltages.is_empty() {
        warn!(
            "Inverter {} reports no DC input voltage, cannot check shutoff voltage {:.2} V",
            info.name, shutoff_voltage
        );
        return Ok(());
    }

    for measured in voltages {
        if measured < min || measured > max {
            return Err(ControllerError::ImplausibleShutoffVoltage {
                shutoff: shutoff_voltage,
                measured,
                min,
                max,
            });
        }
    }
    Ok(())
}

/// Watches the charge controller and cuts the load when the battery runs low
///
/// Once tripped there is no way back: recovery of the battery voltage does not
/// restore inverter power.
pub struct SafetyController<R: Radio> {
    shutoff_voltage: f32,
    key: String,
    key_check_byte: Option<u8>,
    source: AdvertisementSource<R>,
    inverter: Arc<dyn Inverter>,
    relay: Option<Arc<dyn Relay>>,
}

impl<R: Radio> SafetyController<R> {
    pub fn new(
        info: &InverterInfo,
        shutoff_voltage: f32,
        key: &str,
        source: AdvertisementSource<R>,
        inverter: Arc<dyn Inverter>,
        relay: Option<Arc<dyn Relay>>,
    ) -> Result<Self, ControllerError> {
        validate_shutoff_voltage(info, shutoff_voltage)?;

        info!(
            "Shutoff voltage {:.2} V accepted for inverter {} ({}, enabled: {}, power limit: {})",
            shutoff_voltage, info.name, info.serial, info.enabled, info.power_limit_read
        );
        if relay.is_none() {
            info!("No relay configured, only the inverter will be shut down");
        }

        Ok(Self {
            shutoff_voltage,
            key: key.to_string(),
            key_check_byte: decode_key(key).ok().map(|k| k[0]),
            source,
            inverter,
            relay,
        })
    }

    /// Decode every advertisement and act on it until one of them fails
    ///
    /// Decode and radio errors end the run. Failed commands do not, the next
    /// low sample sends them again.
    pub async fn run(&self) -> Result<(), ControllerError> {
        let mut scan = self.source.start_scanning();

        loop {
            let manufacturer_data = scan.next_frame().await?;
            let telemetry = self.decode(&manufacturer_data)?;
            self.evaluate(&telemetry).await;
        }
    }

    /// Keep the monitor running forever, pausing `backoff` after each failure
    pub async fn run_forever(&self, backoff: Duration) {
        info!("Starting battery voltage monitoring");

        loop {
            if let Err(e) = self.run().await {
                error!(
                    "Monitoring stopped: {}. Waiting {} seconds and trying again",
                    e,
                    backoff.as_secs()
                );
                sleep(backoff).await;
            }
        }
    }

    fn decode(
        &self,
        manufacturer_data: &ManufacturerData,
    ) -> Result<ReadableTelemetry, DecodeError> {
        let record = decode_frame(victron_payload(manufacturer_data)?)?;
        if record.record_type != SOLAR_CHARGER_RECORD {
            debug!(
                "Unexpected record type {:#04x}, decoding as solar charger",
                record.record_type
            );
        }

        if let Some(expected) = self.key_check_byte {
            if record.key_check_byte != expected {
                warn!(
                    "Key check byte {:#04x} does not match configured key ({:#04x})",
                    record.key_check_byte, expected
                );
            }
        }

        let plaintext = decrypt(&record, &self.key)?;
        let telemetry = decode_telemetry(&plaintext)?;

        debug!(
            "Received data: battery={:.2} V, current={:.1} A, yield={:.2} kWh, pv={} W",
            telemetry.battery_voltage,
            telemetry.battery_current,
            telemetry.yield_today,
            telemetry.pv_power
        );
        debug!(
            "Charger state={}, error={}, load~{:.1} A",
            telemetry.device_state,
            telemetry.charger_error,
            telemetry.load_current
        );
        Ok(telemetry)
    }

    /// Act on one sample; returns whether a shutdown was attempted
    pub async fn evaluate(&self, telemetry: &ReadableTelemetry) -> bool {
        if telemetry.battery_voltage >= self.shutoff_voltage {
            return false;
        }

        warn!(
            "Battery voltage {:.2} V below shutoff voltage {:.2} V at {}, shutting inverter down",
            telemetry.battery_voltage,
            self.shutoff_voltage,
            format_datetime(&OffsetDateTime::now_utc())
        );

        match self
            .inverter
            .set_inverter_power(SHUTDOWN_POWER_LIMIT_WATTS, PERSISTENT_SHUTDOWN)
            .await
        {
            Ok(()) => info!("Inverter power limit set to {} W", SHUTDOWN_POWER_LIMIT_WATTS),
            Err(e) => error!("CRITICAL: failed to shut inverter down: {}", e),
        }

        if let Some(relay) = &self.relay {
            // Give the inverter time to ramp down before its supply is cut
            sleep(RELAY_SETTLE_DELAY).await;
            match relay.disable().await {
                Ok(()) => info!("Relay switched off"),
                Err(e) => error!("CRITICAL: failed to switch relay off: {}", e),
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::radio::fake::FakeRadio;
    use crate::bluetooth::DEFAULT_COOLDOWN;
    use crate::error::{InverterError, RelayError, ScanError};
    use crate::models::Advertisement;
    use crate::victron::frame::VICTRON_MANUFACTURER_ID;
    use aes::cipher::{KeyIvInit, StreamCipher};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    const TARGET: &str = "C4:9F:2A:11:22:33";
    const KEY: &str = "0df4d0395b7d1a876c0c33ecb9e70dcd";

    #[derive(Default)]
    struct FakeInverter {
        commands: Mutex<Vec<(u32, bool)>>,
        failures_left: AtomicUsize,
    }

    impl FakeInverter {
        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                ..Default::default()
            }
        }

        fn commands(&self) -> Vec<(u32, bool)> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Inverter for FakeInverter {
        async fn inverter_info(&self) -> Result<InverterInfo, InverterError> {
            Ok(info_with_dc_voltage(26.0))
        }

        async fn set_inverter_power(
            &self,
            limit_watts: u32,
            persistent: bool,
        ) -> Result<(), InverterError> {
            self.commands.lock().unwrap().push((limit_watts, persistent));
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(InverterError::CommandRejected {
                    id: 0,
                    message: "inverter not available".to_string(),
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRelay {
        disabled_at: Mutex<Vec<Instant>>,
        failures_left: AtomicUsize,
    }

    impl FakeRelay {
        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Relay for FakeRelay {
        async fn disable(&self) -> Result<(), RelayError> {
            self.disabled_at.lock().unwrap().push(Instant::now());
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(RelayError::UnexpectedStatus(503));
            }
            Ok(())
        }
    }

    fn info_with_dc_voltage(voltage: f32) -> InverterInfo {
        InverterInfo {
            name: "HM-600".to_string(),
            enabled: true,
            ch: vec![vec![230.1, 0.3, 70.0], vec![voltage, 1.5, 39.0]],
            ..Default::default()
        }
    }

    fn sample(battery_voltage: f32) -> ReadableTelemetry {
        ReadableTelemetry {
            device_state: 3,
            charger_error: 0,
            battery_voltage,
            battery_current: 1.2,
            yield_today: 0.5,
            pv_power: 30,
            load_current: 0.0,
        }
    }

    fn encrypted_advertisement(voltage_raw: u16, counter: u16) -> Result<Advertisement, ScanError> {
        let mut plaintext = vec![0x03, 0x00];
        plaintext.extend_from_slice(&voltage_raw.to_le_bytes());
        plaintext.extend_from_slice(&[0x0C, 0x00, 0x05, 0x00, 0x1E, 0x00, 0x00, 0x00]);

        let mut iv = [0u8; 16];
        iv[..2].copy_from_slice(&counter.to_le_bytes());
        let key = hex::decode(KEY).unwrap();
        let mut cipher = ctr::Ctr128BE::<aes::Aes128>::new_from_slices(&key, &iv).unwrap();
        cipher.apply_keystream(&mut plaintext);

        let counter = counter.to_le_bytes();
        let mut payload = vec![0x10, 0x02, 0xA0, 0xA0, 0x01, counter[0], counter[1], key[0]];
        payload.extend(plaintext);

        let mut manufacturer_data = ManufacturerData::new();
        manufacturer_data.insert(VICTRON_MANUFACTURER_ID, payload);
        Ok(Advertisement {
            address: TARGET.to_string(),
            manufacturer_data,
        })
    }

    fn controller(
        script: Vec<Result<Advertisement, ScanError>>,
        inverter: Arc<FakeInverter>,
        relay: Option<Arc<FakeRelay>>,
    ) -> SafetyController<FakeRadio> {
        let radio = FakeRadio::with_script(script);
        let source = AdvertisementSource::new(radio, TARGET, DEFAULT_COOLDOWN);
        SafetyController::new(
            &info_with_dc_voltage(26.0),
            25.6,
            KEY,
            source,
            inverter,
            relay.map(|r| r as Arc<dyn Relay>),
        )
        .unwrap()
    }

    #[test]
    fn accepts_shutoff_voltage_within_band() {
        assert!(validate_shutoff_voltage(&info_with_dc_voltage(26.0), 25.6).is_ok());
        assert!(validate_shutoff_voltage(&info_with_dc_voltage(20.5), 25.6).is_ok());
        assert!(validate_shutoff_voltage(&info_with_dc_voltage(30.7), 25.6).is_ok());
    }

    #[test]
    fn rejects_shutoff_voltage_for_other_system_voltage() {
        match validate_shutoff_voltage(&info_with_dc_voltage(15.0), 25.6) {
            Err(ControllerError::ImplausibleShutoffVoltage { measured, .. }) => {
                assert_eq!(measured, 15.0)
            }
            other => panic!("expected ImplausibleShutoffVoltage, got {:?}", other),
        }
        assert!(validate_shutoff_voltage(&info_with_dc_voltage(51.2), 12.0).is_err());
    }

    #[test]
    fn every_populated_channel_must_be_plausible() {
        let info = InverterInfo {
            ch: vec![vec![230.0], vec![26.0], vec![0.0], vec![13.1]],
            ..Default::default()
        };
        assert!(validate_shutoff_voltage(&info, 25.6).is_err());
    }

    #[test]
    fn validation_passes_without_dc_readings() {
        let info = InverterInfo {
            ch: vec![vec![230.0, 0.0]],
            ..Default::default()
        };
        assert!(validate_shutoff_voltage(&info, 25.6).is_ok());
    }

    #[test]
    fn construction_fails_on_implausible_threshold() {
        let source = AdvertisementSource::new(FakeRadio::default(), TARGET, DEFAULT_COOLDOWN);
        let result = SafetyController::new(
            &info_with_dc_voltage(15.0),
            25.6,
            KEY,
            source,
            Arc::new(FakeInverter::default()),
            None,
        );
        assert!(matches!(
            result,
            Err(ControllerError::ImplausibleShutoffVoltage { .. })
        ));
    }

    #[tokio::test]
    async fn only_samples_below_threshold_trigger_shutdown() {
        let inverter = Arc::new(FakeInverter::default());
        let controller = controller(vec![], inverter.clone(), None);

        assert!(!controller.evaluate(&sample(26.0)).await);
        assert!(!controller.evaluate(&sample(25.6)).await);
        assert!(inverter.commands().is_empty());

        assert!(controller.evaluate(&sample(24.0)).await);
        assert_eq!(inverter.commands(), vec![(0, true)]);
    }

    #[tokio::test]
    async fn failed_shutdown_is_retried_on_next_low_sample() {
        let inverter = Arc::new(FakeInverter::failing(1));
        let controller = controller(vec![], inverter.clone(), None);

        assert!(controller.evaluate(&sample(24.0)).await);
        assert!(controller.evaluate(&sample(23.9)).await);
        assert_eq!(inverter.commands(), vec![(0, true), (0, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_is_cut_after_settle_delay() {
        let inverter = Arc::new(FakeInverter::default());
        let relay = Arc::new(FakeRelay::default());
        let controller = controller(vec![], inverter.clone(), Some(relay.clone()));

        let start = Instant::now();
        controller.evaluate(&sample(24.0)).await;

        let disabled_at = relay.disabled_at.lock().unwrap().clone();
        assert_eq!(disabled_at.len(), 1);
        assert!(disabled_at[0] - start >= RELAY_SETTLE_DELAY);
        assert_eq!(inverter.commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_is_cut_even_if_inverter_command_fails() {
        let inverter = Arc::new(FakeInverter::failing(1));
        let relay = Arc::new(FakeRelay::default());
        let controller = controller(vec![], inverter, Some(relay.clone()));

        controller.evaluate(&sample(11.0)).await;
        assert_eq!(relay.disabled_at.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_decodes_advertisements_and_shuts_down_on_low_voltage() {
        let inverter = Arc::new(FakeInverter::default());
        let script = vec![
            encrypted_advertisement(2600, 1),
            encrypted_advertisement(2560, 2),
            encrypted_advertisement(2400, 3),
        ];
        let controller = controller(script, inverter.clone(), None);

        let result = controller.run().await;
        assert!(matches!(
            result,
            Err(ControllerError::Scan(ScanError::DiscoveryEnded))
        ));
        assert_eq!(inverter.commands(), vec![(0, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_failure_does_not_stop_monitoring() {
        let inverter = Arc::new(FakeInverter::default());
        let relay = Arc::new(FakeRelay::failing(1));
        let script = vec![
            encrypted_advertisement(2400, 5),
            encrypted_advertisement(2390, 6),
        ];
        let controller = controller(script, inverter.clone(), Some(relay.clone()));

        let result = controller.run().await;
        assert!(matches!(
            result,
            Err(ControllerError::Scan(ScanError::DiscoveryEnded))
        ));
        assert_eq!(inverter.commands(), vec![(0, true), (0, true)]);
        assert_eq!(relay.disabled_at.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_aborts_on_malformed_advertisement() {
        let inverter = Arc::new(FakeInverter::default());
        let mut short = ManufacturerData::new();
        short.insert(VICTRON_MANUFACTURER_ID, vec![0x10, 0x02, 0xA0]);
        let script = vec![
            Ok(Advertisement {
                address: TARGET.to_string(),
                manufacturer_data: short,
            }),
            encrypted_advertisement(1100, 4),
        ];
        let controller = controller(script, inverter.clone(), None);

        let result = controller.run().await;
        assert!(matches!(
            result,
            Err(ControllerError::Decode(DecodeError::FrameTooShort { actual: 3, .. }))
        ));
        assert!(inverter.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_restarts_monitoring_after_backoff() {
        let radio = FakeRadio::default();
        let enables = radio.enables.clone();
        let source = AdvertisementSource::new(radio, TARGET, DEFAULT_COOLDOWN);
        let controller = SafetyController::new(
            &info_with_dc_voltage(26.0),
            25.6,
            KEY,
            source,
            Arc::new(FakeInverter::default()),
            None,
        )
        .unwrap();

        let supervised = controller.run_forever(RETRY_BACKOFF);
        let result = tokio::time::timeout(Duration::from_secs(150), supervised).await;
        assert!(result.is_err());
        assert_eq!(enables.load(Ordering::SeqCst), 3);
    }
}
