//! Cooperative scheduler tying every stage to the register map.
//!
//! One [`Node::run_cycle`] runs each stage once, in fixed order:
//!
//! ```text
//! dispatcher -> command apply -> identify -> sensors
//! ```
//!
//! Stages never block; the host loop calls `run_cycle` as often as it can
//! (every few hundred microseconds keeps frame delimiting accurate at
//! 115200 baud).

use crate::bus::Bus;
use crate::command::{CommandApplier, Health, ImuHealth, LineSettings};
use crate::config::NodeConfig;
use crate::dispatcher::Dispatcher;
use crate::identify::Identify;
use crate::registers::{holding, RegisterMap};
use crate::sensor::{SensorKind, SensorManager, SensorSet};
use crate::store::{ByteStore, PersistentStore, StoreError, FALLBACK_ALIAS};
use embedded_hal::digital::OutputPin;

pub struct Node<'a, B, S, L> {
    config: NodeConfig,
    regs: RegisterMap,
    dispatcher: Dispatcher,
    commands: CommandApplier,
    identify: Identify,
    sensors: SensorManager<'a>,
    bus: B,
    store: PersistentStore<S>,
    led: L,
}

impl<'a, B, S, L> Node<'a, B, S, L>
where
    B: Bus,
    S: ByteStore,
    L: OutputPin,
{
    pub fn new(config: NodeConfig, bus: B, store: S, led: L, sensors: SensorSet<'a>) -> Self {
        let line = LineSettings {
            unit_id: config.default_unit_id,
            baud: config.baud_code(),
        };
        Self {
            dispatcher: Dispatcher::new(
                &config.serial,
                config.identification.describe(0, FALLBACK_ALIAS),
                config.identify_secs,
            ),
            commands: CommandApplier::new(line),
            config,
            regs: RegisterMap::new(),
            identify: Identify::new(),
            sensors: SensorManager::new(sensors),
            bus,
            store: PersistentStore::new(store),
            led,
        }
    }

    /// Load the identity record, pick the boot address, seed the registers
    /// and start the sensors.
    pub fn begin(&mut self, now_us: u64) {
        let store_ok = match self.store.begin() {
            Ok(status) => {
                info!("identity record: {:?}", status);
                true
            }
            Err(StoreError::TooSmall) => {
                error!("identity store smaller than record");
                false
            }
            Err(StoreError::Io(_)) => {
                error!("identity store read failed");
                false
            }
        };
        let stored = if store_ok {
            self.store.unit_id().ok()
        } else {
            None
        };
        self.load_identity(store_ok);

        let line = LineSettings {
            unit_id: self.config.boot_unit_id(stored),
            baud: self.config.baud_code(),
        };
        self.commands = CommandApplier::new(line);
        self.commands.start(
            &mut self.regs,
            &self.config,
            self.sensors.capabilities(),
            store_ok,
        );
        self.apply_line(line);
        self.sensors.begin(&mut self.regs, now_us / 1000);
        info!(
            "node up: unit {} at {} baud, {} sensors",
            line.unit_id,
            line.baud.baud_rate(),
            self.sensors.len()
        );
    }

    /// Run every stage once.
    pub fn run_cycle(&mut self, now_us: u64) {
        let now_ms = now_us / 1000;
        self.dispatcher.poll(&mut self.bus, &mut self.regs, now_us);

        let health = self.health();
        if let Some(line) = self
            .commands
            .update(&mut self.regs, &mut self.store, health, now_ms)
        {
            self.apply_line(line);
        }

        self.identify.update(&mut self.regs, now_ms, &mut self.led);
        self.sensors.poll(&mut self.regs, now_ms);
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub fn active_line(&self) -> LineSettings {
        self.commands.active()
    }

    #[must_use]
    pub fn registers(&self) -> &RegisterMap {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut RegisterMap {
        &mut self.regs
    }

    #[must_use]
    pub fn identify(&self) -> &Identify {
        &self.identify
    }

    #[must_use]
    pub fn sensors(&self) -> &SensorManager<'a> {
        &self.sensors
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn store_mut(&mut self) -> &mut PersistentStore<S> {
        &mut self.store
    }

    pub fn led(&self) -> &L {
        &self.led
    }

    pub fn into_parts(self) -> (B, S, L) {
        (self.bus, self.store.into_inner(), self.led)
    }

    /// Report the stored serial and alias through the identification
    /// functions. Unreadable fields fall back to serial 0 and the default
    /// alias.
    fn load_identity(&mut self, store_ok: bool) {
        let (serial, alias) = if store_ok {
            (self.store.serial().ok(), self.store.alias().ok())
        } else {
            (None, None)
        };
        let serial = serial.unwrap_or(0);
        let identity = match alias {
            Some(alias) => self.config.identification.describe(serial, &alias),
            None => self.config.identification.describe(serial, FALLBACK_ALIAS),
        };
        self.dispatcher.set_identity(identity);
    }

    fn apply_line(&mut self, line: LineSettings) {
        let serial = self.config.serial.with_baud_rate(line.baud.baud_rate());
        self.bus.set_baud_rate(serial.baud_rate);
        self.dispatcher.set_serial_config(&serial);
    }

    fn health(&self) -> Health {
        let imu = if self.sensors.capabilities() & holding::CAP_IMU == 0 {
            ImuHealth::NotFitted
        } else if self.sensors.is_available(SensorKind::Imu) {
            ImuHealth::Ready
        } else {
            ImuHealth::Failed
        };
        Health {
            imu,
            out_of_range: self.sensors.out_of_range(),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::bus::BusError;
    use crate::config::DEFAULT_CONFIG;
    use crate::registers::{input, Bank};
    use crate::sensor::mock::{MockAnemometer, MockImu};
    use crate::store::RamStore;
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType;
    use rtu_proto::calculate_crc16;
    use std::collections::VecDeque;
    use std::vec::Vec;

    #[derive(Default)]
    struct MockBus {
        rx: VecDeque<u8>,
        tx: Vec<Vec<u8>>,
        baud_rate: u32,
    }

    impl Bus for MockBus {
        fn read_byte(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }

        fn transmit(&mut self, frame: &[u8]) -> Result<(), BusError> {
            self.tx.push(frame.to_vec());
            Ok(())
        }

        fn set_baud_rate(&mut self, baud_rate: u32) {
            self.baud_rate = baud_rate;
        }
    }

    #[derive(Default)]
    struct Led {
        on: bool,
        pulses: u32,
    }

    impl ErrorType for Led {
        type Error = Infallible;
    }

    impl OutputPin for Led {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.on = false;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            if !self.on {
                self.pulses += 1;
            }
            self.on = true;
            Ok(())
        }
    }

    type TestNode<'a> = Node<'a, MockBus, RamStore<128>, Led>;

    fn store_with_unit(unit: u16) -> RamStore<128> {
        let mut store = PersistentStore::new(RamStore::new());
        store.begin().unwrap();
        store.set_unit_id(unit).unwrap();
        store.into_inner()
    }

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&calculate_crc16(body).to_le_bytes());
        frame
    }

    /// Deliver a request, let the line go quiet for a cycle, collect replies.
    fn exchange(node: &mut TestNode<'_>, now_us: &mut u64, request: &[u8]) -> Vec<Vec<u8>> {
        node.bus_mut().rx.extend(request.iter().copied());
        node.run_cycle(*now_us);
        *now_us += 10_000;
        node.run_cycle(*now_us);
        *now_us += 10_000;
        core::mem::take(&mut node.bus_mut().tx)
    }

    #[test]
    fn test_boot_address_from_store() {
        let mut node = Node::new(
            DEFAULT_CONFIG,
            MockBus::default(),
            store_with_unit(16),
            Led::default(),
            SensorSet::default(),
        );
        node.begin(0);
        assert_eq!(node.active_line().unit_id, 16);
        assert_eq!(node.registers().get(Bank::Holding, holding::UNIT_ID), 16);
        assert_eq!(node.bus().baud_rate, 115_200);
    }

    #[test]
    fn test_blank_store_boots_on_default_address() {
        let mut node = Node::new(
            DEFAULT_CONFIG,
            MockBus::default(),
            RamStore::<128>::new(),
            Led::default(),
            SensorSet::default(),
        );
        node.begin(0);
        assert_eq!(node.active_line().unit_id, 1);
        assert_eq!(node.store_mut().unit_id(), Ok(0));
        assert_eq!(node.registers().get(Bank::Holding, holding::ERRORS), 0);
    }

    #[test]
    fn test_undersized_store_raises_store_error() {
        let mut node = Node::new(
            DEFAULT_CONFIG,
            MockBus::default(),
            RamStore::<16>::new(),
            Led::default(),
            SensorSet::default(),
        );
        node.begin(0);
        assert_eq!(node.active_line().unit_id, 1);
        assert_eq!(
            node.registers().get(Bank::Holding, holding::ERRORS),
            holding::ERROR_STORE
        );
    }

    #[test]
    fn test_read_input_end_to_end() {
        let mut node = Node::new(
            DEFAULT_CONFIG,
            MockBus::default(),
            store_with_unit(16),
            Led::default(),
            SensorSet::default(),
        );
        node.begin(0);
        let regs = node.registers_mut();
        regs.set_u32(Bank::Input, input::SAMPLE_COUNTER_LO, 45_678);
        regs.set(Bank::Input, input::WIND_SPEED, 1250);
        regs.set(Bank::Input, input::WIND_DIRECTION, 270);
        regs.set(Bank::Input, input::WIND_SPEED_STATS, 1120);
        regs.set(Bank::Input, input::WIND_SPEED_STATS + 1, 1480);
        regs.set(Bank::Input, input::WIND_SPEED_STATS + 2, 1295);

        let mut now = 1_000;
        let tx = exchange(
            &mut node,
            &mut now,
            &[0x10, 0x04, 0x00, 0x09, 0x00, 0x09, 0xE3, 0x4F],
        );
        let expected = [
            0x10, 0x04, 0x12, 0xB2, 0x6E, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0xE2, 0x01,
            0x0E, 0x04, 0x60, 0x05, 0xC8, 0x05, 0x0F, 0x72, 0xC0,
        ];
        assert_eq!(tx, [expected.to_vec()]);
        assert_eq!(node.registers().get(Bank::Holding, holding::DIAG_RX_FRAMES), 1);
        assert_eq!(node.registers().get(Bank::Holding, holding::DIAG_TX_FRAMES), 1);
    }

    #[test]
    fn test_broadcast_write_is_applied_silently() {
        let mut node = Node::new(
            DEFAULT_CONFIG,
            MockBus::default(),
            RamStore::<128>::new(),
            Led::default(),
            SensorSet::default(),
        );
        node.begin(0);
        let mut now = 1_000;
        let tx = exchange(&mut node, &mut now, &with_crc(&[0x00, 0x06, 0x00, 0x11, 0x00, 0x19]));
        assert!(tx.is_empty());
        assert_eq!(node.registers().get(Bank::Holding, holding::IMU_FILTER_HZ), 25);
    }

    #[test]
    fn test_save_switches_address_after_reply() {
        let mut node = Node::new(
            DEFAULT_CONFIG,
            MockBus::default(),
            store_with_unit(16),
            Led::default(),
            SensorSet::default(),
        );
        node.begin(0);
        let mut now = 1_000;

        let stage = with_crc(&[0x10, 0x06, 0x00, 0x14, 0x00, 0x20]);
        assert_eq!(exchange(&mut node, &mut now, &stage), [stage.clone()]);
        let status = node.registers().get(Bank::Holding, holding::STATUS);
        assert_ne!(status & holding::STATUS_CFG_DIRTY, 0);

        let save = with_crc(&[0x10, 0x06, 0x00, 0x12, 0xA5, 0x5A]);
        assert_eq!(exchange(&mut node, &mut now, &save), [save.clone()]);
        assert_eq!(node.active_line().unit_id, 32);
        assert_eq!(node.store_mut().unit_id(), Ok(32));

        let old = with_crc(&[0x10, 0x03, 0x00, 0x04, 0x00, 0x01]);
        assert!(exchange(&mut node, &mut now, &old).is_empty());
        let new = with_crc(&[0x20, 0x03, 0x00, 0x04, 0x00, 0x01]);
        assert_eq!(
            exchange(&mut node, &mut now, &new),
            [with_crc(&[0x20, 0x03, 0x02, 0x00, 0x20])]
        );
        let status = node.registers().get(Bank::Holding, holding::STATUS);
        assert_eq!(status & holding::STATUS_CFG_DIRTY, 0);

        // survives a restart
        let (_, store, _) = node.into_parts();
        let mut rebooted = Node::new(
            DEFAULT_CONFIG,
            MockBus::default(),
            store,
            Led::default(),
            SensorSet::default(),
        );
        rebooted.begin(0);
        assert_eq!(rebooted.active_line().unit_id, 32);
    }

    #[test]
    fn test_apply_changes_line_rate() {
        let mut node = Node::new(
            DEFAULT_CONFIG,
            MockBus::default(),
            RamStore::<128>::new(),
            Led::default(),
            SensorSet::default(),
        );
        node.begin(0);
        let mut now = 1_000;
        // baud_code = 0, then apply, in one write-multiple
        let request = with_crc(&[
            0x01, 0x10, 0x00, 0x10, 0x00, 0x03, 0x06, 0x00, 0x00, 0x00, 0x2A, 0xB0, 0x07,
        ]);
        let tx = exchange(&mut node, &mut now, &request);
        assert_eq!(tx, [with_crc(&[0x01, 0x10, 0x00, 0x10, 0x00, 0x03])]);
        assert_eq!(node.bus().baud_rate, 9600);
        assert_eq!(node.active_line().baud, rtu_proto::BaudCode::B9600);
        // address unchanged, nothing persisted
        assert_eq!(node.active_line().unit_id, 1);
        assert_eq!(node.store_mut().unit_id(), Ok(0));

        let read = with_crc(&[0x01, 0x03, 0x00, 0x10, 0x00, 0x01]);
        assert_eq!(
            exchange(&mut node, &mut now, &read),
            [with_crc(&[0x01, 0x03, 0x02, 0x00, 0x00])]
        );
    }

    #[test]
    fn test_identify_function_blinks_led() {
        let mut node = Node::new(
            DEFAULT_CONFIG,
            MockBus::default(),
            store_with_unit(16),
            Led::default(),
            SensorSet::default(),
        );
        node.begin(0);
        let mut now = 1_000;
        let tx = exchange(&mut node, &mut now, &[0x10, 0x41, 0xCC, 0x40]);
        assert_eq!(tx.len(), 1);
        assert!(node.identify().is_active());
        assert_eq!(node.registers().get(Bank::Holding, holding::IDENTIFY_ACTIVE), 1);

        let stop = now + 6_000_000;
        while now < stop {
            node.run_cycle(now);
            now += 10_000;
        }
        assert!(!node.identify().is_active());
        assert!(!node.led().on);
        assert_eq!(node.led().pulses, 10);
        assert_eq!(node.registers().get(Bank::Holding, holding::IDENTIFY_ACTIVE), 0);
    }

    #[test]
    fn test_identification_reports_stored_serial_and_alias() {
        let mut store = PersistentStore::new(store_with_unit(16));
        store.set_serial(20_251_024).unwrap();
        store.set_alias(b"mast-3").unwrap();
        let mut node = Node::new(
            DEFAULT_CONFIG,
            MockBus::default(),
            store.into_inner(),
            Led::default(),
            SensorSet::default(),
        );
        node.begin(0);
        let mut now = 1_000;
        let tx = exchange(&mut node, &mut now, &with_crc(&[0x10, 0x11]));
        assert_eq!(tx.len(), 1);
        let response = &tx[0];
        assert_eq!(&response[..5], &[0x10, 0x11, 64, 0x10, 0xFF]);
        assert_eq!(
            &response[5..response.len() - 2],
            b"VENDOR=TF;MODEL=M0-NODE;FW=1.0;HW=1.0;SN=20251024;ALIAS=mast-3"
        );
    }

    #[test]
    fn test_identification_defaults_on_blank_store() {
        let mut node = Node::new(
            DEFAULT_CONFIG,
            MockBus::default(),
            RamStore::<128>::new(),
            Led::default(),
            SensorSet::default(),
        );
        node.begin(0);
        let mut now = 1_000;
        let tx = exchange(&mut node, &mut now, &with_crc(&[0x01, 0x11]));
        let response = &tx[0];
        assert_eq!(
            &response[5..response.len() - 2],
            b"VENDOR=TF;MODEL=M0-NODE;FW=1.0;HW=1.0;SN=0;ALIAS=sensor-node"
        );
    }

    #[test]
    fn test_sensors_feed_input_bank() {
        let mut imu = MockImu::absent();
        let mut wind = MockAnemometer::synthetic();
        let mut node = Node::new(
            DEFAULT_CONFIG,
            MockBus::default(),
            RamStore::<128>::new(),
            Led::default(),
            SensorSet {
                imu: Some(&mut imu),
                anemometer: Some(&mut wind),
                ..SensorSet::default()
            },
        );
        node.begin(0);
        let caps = node.registers().get(Bank::Holding, holding::CAPABILITIES);
        assert_eq!(
            caps,
            holding::CAP_RS485 | holding::CAP_IDENTIFY | holding::CAP_IMU | holding::CAP_ANEMOMETER
        );

        let mut now = 0;
        while now <= 2_000_000 {
            node.run_cycle(now);
            now += 10_000;
        }
        let regs = node.registers();
        // samples at 0, 1 and 2 s
        assert_eq!(regs.get_u32(Bank::Input, input::SAMPLE_COUNTER_LO), 3);
        assert_eq!(regs.get(Bank::Input, input::FLAGS), input::FLAG_IMU_STALE);
        assert_eq!(regs.get(Bank::Input, input::WIND_DIRECTION), 30);
        assert_eq!(regs.get(Bank::Holding, holding::ERRORS), holding::ERROR_IMU_COMM);
        assert_eq!(regs.get(Bank::Holding, holding::STATUS) & holding::STATUS_IMU_READY, 0);
        assert_eq!(regs.get_u32(Bank::Holding, holding::UPTIME_LO), 2);
    }
}
