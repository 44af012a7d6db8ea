//! Save/apply command handling and node housekeeping registers.
//!
//! Owns `unit_id`, `uptime`, `status`, `errors` and the identification
//! registers. The bus stages a new address in `cfg_unit_id` and a line rate
//! in `baud_code`; nothing changes until `save_apply` is written:
//!
//! - `0xB007` applies the staged settings.
//! - `0xA55A` persists the staged address, then applies. If the store write
//!   fails the active settings are kept and `errors.store` is raised.
//!
//! The response to the command itself still goes out on the old address and
//! line rate, since the dispatcher answers before this stage runs.

use crate::config::NodeConfig;
use crate::registers::{holding, Bank, RegisterMap};
use crate::store::{ByteStore, PersistentStore};
use rtu_proto::BaudCode;

/// Settings the node is running with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineSettings {
    pub unit_id: u8,
    pub baud: BaudCode,
}

/// IMU state as reported in `status` and `errors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImuHealth {
    NotFitted,
    Ready,
    Failed,
}

/// Sensor health fed into the status registers each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Health {
    pub imu: ImuHealth,
    /// A reading had to be clamped into its register.
    pub out_of_range: bool,
}

impl Health {
    pub const NOMINAL: Self = Self {
        imu: ImuHealth::NotFitted,
        out_of_range: false,
    };
}

pub struct CommandApplier {
    active: LineSettings,
    seen_seq: u16,
}

impl CommandApplier {
    #[must_use]
    pub fn new(active: LineSettings) -> Self {
        Self {
            active,
            seen_seq: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn active(&self) -> LineSettings {
        self.active
    }

    /// Seed the registers this stage owns.
    pub fn start(
        &mut self,
        regs: &mut RegisterMap,
        config: &NodeConfig,
        capabilities: u16,
        store_ok: bool,
    ) {
        let ident = &config.identification;
        regs.set(Bank::Holding, holding::VENDOR_ID, ident.vendor_id);
        regs.set(Bank::Holding, holding::PRODUCT_ID, ident.product_id);
        regs.set(Bank::Holding, holding::HW_REVISION, ident.hw_revision);
        regs.set(Bank::Holding, holding::FW_REVISION, ident.fw_revision);
        regs.set(Bank::Holding, holding::CAPABILITIES, capabilities);

        let unit = u16::from(self.active.unit_id);
        regs.set(Bank::Holding, holding::UNIT_ID, unit);
        regs.set(Bank::Holding, holding::CFG_UNIT_ID, unit);
        regs.set(Bank::Holding, holding::BAUD_CODE, self.active.baud.code());

        regs.set(Bank::Holding, holding::STATUS, holding::STATUS_OK);
        regs.set(Bank::Holding, holding::ERRORS, 0);
        regs.update_bits(Bank::Holding, holding::ERRORS, holding::ERROR_STORE, !store_ok);
        self.seen_seq = regs.write_sequence(holding::SAVE_APPLY);
    }

    /// Run one cycle. Returns the new settings when a command changed them.
    pub fn update<S: ByteStore>(
        &mut self,
        regs: &mut RegisterMap,
        store: &mut PersistentStore<S>,
        health: Health,
        now_ms: u64,
    ) -> Option<LineSettings> {
        let mut changed = None;
        let seq = regs.write_sequence(holding::SAVE_APPLY);
        if seq != self.seen_seq {
            self.seen_seq = seq;
            match regs.get(Bank::Holding, holding::SAVE_APPLY) {
                holding::CMD_SAVE => {
                    let unit = regs.get(Bank::Holding, holding::CFG_UNIT_ID);
                    match store.set_unit_id(unit) {
                        Ok(()) => {
                            info!("saved unit id {}", unit);
                            regs.update_bits(Bank::Holding, holding::ERRORS, holding::ERROR_STORE, false);
                            changed = self.apply(regs);
                        }
                        Err(_) => {
                            error!("saving unit id {} failed", unit);
                            regs.update_bits(Bank::Holding, holding::ERRORS, holding::ERROR_STORE, true);
                        }
                    }
                }
                holding::CMD_APPLY => changed = self.apply(regs),
                _ => {}
            }
        }

        // seconds since boot, wraps after ~136 years
        regs.set_u32(Bank::Holding, holding::UPTIME_LO, (now_ms / 1000) as u32);
        self.update_status(regs, health);
        changed
    }

    /// Activate the staged address and line rate.
    fn apply(&mut self, regs: &mut RegisterMap) -> Option<LineSettings> {
        let staged = self.staged(regs);
        regs.set(Bank::Holding, holding::UNIT_ID, u16::from(staged.unit_id));
        if staged == self.active {
            return None;
        }
        info!(
            "applying unit id {} at {} baud",
            staged.unit_id,
            staged.baud.baud_rate()
        );
        self.active = staged;
        Some(staged)
    }

    /// Staged settings; out-of-range register contents keep the active value.
    fn staged(&self, regs: &RegisterMap) -> LineSettings {
        let unit = regs.get(Bank::Holding, holding::CFG_UNIT_ID);
        let unit_id = u8::try_from(unit)
            .ok()
            .filter(|u| (1..=rtu_proto::MAX_UNIT_ID).contains(u))
            .unwrap_or(self.active.unit_id);
        let baud = BaudCode::from_code(regs.get(Bank::Holding, holding::BAUD_CODE))
            .unwrap_or(self.active.baud);
        LineSettings { unit_id, baud }
    }

    fn update_status(&self, regs: &mut RegisterMap, health: Health) {
        let dirty = self.staged(regs) != self.active;
        regs.update_bits(Bank::Holding, holding::STATUS, holding::STATUS_CFG_DIRTY, dirty);
        regs.update_bits(
            Bank::Holding,
            holding::STATUS,
            holding::STATUS_IMU_READY,
            health.imu == ImuHealth::Ready,
        );
        regs.update_bits(
            Bank::Holding,
            holding::ERRORS,
            holding::ERROR_IMU_COMM,
            health.imu == ImuHealth::Failed,
        );
        regs.update_bits(
            Bank::Holding,
            holding::ERRORS,
            holding::ERROR_RANGE,
            health.out_of_range,
        );
    }
}
