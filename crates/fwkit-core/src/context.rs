//! Shared system state.
//!
//! The context is constructed once per process and handed to the engine,
//! the plugins and the devices. It owns the quirk database, the hardware
//! identity registry, the device tree, the backend list and the ESP
//! discovery cache. Mutation is expected to happen from a single control
//! thread; none of this is internally synchronized.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::bios::{BiosSetting, BiosSettings};
use crate::config::Config;
use crate::device::DeviceRegistry;
use crate::efivars::{EfivarStore, HardDriveDevicePath, LoadOption, store_from_env};
use crate::error::{Error, Result};
use crate::events::{ContextEvent, ContextObserver};
use crate::fdt::Fdt;
use crate::hwids::{self, HwidSetupFunc, HwidStore};
use crate::pefile::PeFile;
use crate::progress::Progress;
use crate::quirks::{QuirkSource, QuirkStore};
use crate::smbios::{ChassisKind, Smbios, SmbiosStructure};
use crate::storage::{MountGuard, PartitionKind, StorageProvider, SystemStorage, Volume};

/// Battery percentage sentinel meaning "unknown".
pub const BATTERY_LEVEL_INVALID: u32 = 101;

/// Quirk key carrying comma-separated custom flags for a system GUID.
pub const QUIRK_KEY_FLAGS: &str = "Flags";

const ESP_PATH_ENV: &str = "FWKIT_UEFI_ESP_PATH";

bitflags! {
    /// Behavior and capability toggles on the context.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        /// The hardware identity pipeline has run; HWID and SMBIOS
        /// accessors are safe to call.
        const LOADED_HWINFO = 1 << 0;
        /// Skip the efivar free-space check.
        const IGNORE_EFIVARS_FREE_SPACE = 1 << 1;
        /// Never mount volumes, e.g. inside a locked-down sandbox.
        const INHIBIT_VOLUME_MOUNT = 1 << 2;
        /// A BitLocker-encrypted data partition was detected.
        const FDE_BITLOCKER = 1 << 3;
        /// A snapd-style encrypted data partition was detected.
        const FDE_SNAPD = 1 << 4;
    }
}

bitflags! {
    /// Which identity probes `load_hwinfo` should run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HwidLoadFlags: u32 {
        const CONFIG = 1 << 0;
        const SMBIOS = 1 << 1;
        const FDT = 1 << 2;
        const KENV = 1 << 3;
        const DMI = 1 << 4;
        const DARWIN = 1 << 5;
    }
}

bitflags! {
    /// Which boot assets `esp_files` should collect.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EspFileFlags: u32 {
        const FIRST_STAGE = 1 << 0;
        const SECOND_STAGE = 1 << 1;
        const REVOCATIONS = 1 << 2;
    }
}

/// System power source state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    #[default]
    Unknown,
    Ac,
    AcCharging,
    AcFullyCharged,
    Battery,
    BatteryDischarging,
}

impl PowerState {
    pub fn on_battery(&self) -> bool {
        matches!(self, PowerState::Battery | PowerState::BatteryDischarging)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Unknown => write!(f, "unknown"),
            PowerState::Ac => write!(f, "ac"),
            PowerState::AcCharging => write!(f, "ac-charging"),
            PowerState::AcFullyCharged => write!(f, "ac-fully-charged"),
            PowerState::Battery => write!(f, "battery"),
            PowerState::BatteryDischarging => write!(f, "battery-discharging"),
        }
    }
}

/// Laptop lid state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LidState {
    #[default]
    Unknown,
    Open,
    Closed,
}

impl fmt::Display for LidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LidState::Unknown => write!(f, "unknown"),
            LidState::Open => write!(f, "open"),
            LidState::Closed => write!(f, "closed"),
        }
    }
}

/// External display connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayState {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

impl fmt::Display for DisplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayState::Unknown => write!(f, "unknown"),
            DisplayState::Connected => write!(f, "connected"),
            DisplayState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A registered firmware-format validator, keyed by type id.
pub type FirmwareParseFn = fn(&[u8]) -> Result<()>;

/// The architecture-suffixed UEFI application basename, e.g.
/// `shim` becomes `shimx64.efi` on x86_64.
pub fn uefi_basename_for_arch(app_name: &str) -> Option<String> {
    let suffix = if cfg!(target_arch = "x86_64") {
        "x64"
    } else if cfg!(target_arch = "aarch64") {
        "aa64"
    } else if cfg!(target_arch = "x86") {
        "ia32"
    } else if cfg!(target_arch = "arm") {
        "arm"
    } else if cfg!(target_arch = "riscv64") {
        "riscv64"
    } else if cfg!(target_arch = "loongarch64") {
        "loongarch64"
    } else {
        return None;
    };
    Some(format!("{app_name}{suffix}.efi"))
}

pub struct Context {
    flags: ContextFlags,
    config: Config,
    config_path: Option<PathBuf>,
    quirks: QuirkStore,
    quirk_dirs: Vec<(PathBuf, QuirkSource)>,
    hwids: HwidStore,
    hwid_flags: Vec<String>,
    smbios: Option<Smbios>,
    smbios_table_dir: PathBuf,
    dmi_class_dir: PathBuf,
    chassis_kind: ChassisKind,
    power_state: PowerState,
    lid_state: LidState,
    display_state: DisplayState,
    battery_level: u32,
    battery_threshold: u32,
    runtime_versions: BTreeMap<String, String>,
    compile_versions: BTreeMap<String, String>,
    udev_subsystems: Vec<(String, Vec<String>)>,
    firmware_types: BTreeMap<String, FirmwareParseFn>,
    esp_volumes: Vec<Volume>,
    esp_location: Option<String>,
    esp_override: Option<PathBuf>,
    backends: Vec<Box<dyn Backend>>,
    fdt: Option<Fdt>,
    fdt_paths: Vec<PathBuf>,
    efivars: Box<dyn EfivarStore>,
    storage: Arc<dyn StorageProvider>,
    observers: Vec<Arc<dyn ContextObserver>>,
    bios_settings: BiosSettings,
    devices: DeviceRegistry,
}

impl Context {
    /// Create a context with the system providers.
    pub fn new() -> Self {
        Self::with_providers(Arc::new(SystemStorage::new()), store_from_env())
    }

    /// Create a context with explicit storage and EFI variable providers.
    pub fn with_providers(
        storage: Arc<dyn StorageProvider>,
        efivars: Box<dyn EfivarStore>,
    ) -> Self {
        let mut quirks = QuirkStore::new();
        for key in [QUIRK_KEY_FLAGS, "Name", "Summary", "Vendor"] {
            quirks.add_possible_key(key);
        }
        let mut firmware_types: BTreeMap<String, FirmwareParseFn> = BTreeMap::new();
        firmware_types.insert("pefile".to_string(), |data| {
            PeFile::parse(data).map(|_| ())
        });
        firmware_types.insert("fdt".to_string(), |data| Fdt::parse(data).map(|_| ()));

        Self {
            flags: ContextFlags::empty(),
            config: Config::default(),
            config_path: Some(PathBuf::from("/etc/fwkit/fwkit.toml")),
            quirks,
            quirk_dirs: vec![
                (
                    PathBuf::from("/usr/share/fwkit/quirks.d"),
                    QuirkSource::Builtin,
                ),
                (PathBuf::from("/etc/fwkit/quirks.d"), QuirkSource::User),
            ],
            hwids: HwidStore::new(),
            hwid_flags: Vec::new(),
            smbios: None,
            smbios_table_dir: PathBuf::from("/sys/firmware/dmi/tables"),
            dmi_class_dir: PathBuf::from("/sys/class/dmi/id"),
            chassis_kind: ChassisKind::Unknown,
            power_state: PowerState::Unknown,
            lid_state: LidState::Unknown,
            display_state: DisplayState::Unknown,
            battery_level: BATTERY_LEVEL_INVALID,
            battery_threshold: BATTERY_LEVEL_INVALID,
            runtime_versions: BTreeMap::new(),
            compile_versions: BTreeMap::new(),
            udev_subsystems: Vec::new(),
            firmware_types,
            esp_volumes: Vec::new(),
            esp_location: None,
            esp_override: std::env::var_os(ESP_PATH_ENV).map(PathBuf::from),
            backends: Vec::new(),
            fdt: None,
            fdt_paths: vec![
                PathBuf::from("/var/lib/fwkit/system.dtb"),
                PathBuf::from("/sys/firmware/fdt"),
            ],
            efivars,
            storage,
            observers: Vec::new(),
            bios_settings: BiosSettings::new(),
            devices: DeviceRegistry::new(),
        }
    }

    // ---- flags ----

    pub fn add_flag(&mut self, flag: ContextFlags) {
        self.flags.insert(flag);
    }

    pub fn remove_flag(&mut self, flag: ContextFlags) {
        self.flags.remove(flag);
    }

    pub fn has_flag(&self, flag: ContextFlags) -> bool {
        self.flags.contains(flag)
    }

    // ---- observers / notifications ----

    pub fn add_observer(&mut self, observer: Arc<dyn ContextObserver>) {
        self.observers.push(observer);
    }

    fn emit(&self, event: ContextEvent) {
        // snapshot so an observer registering observers cannot invalidate
        // the iteration
        let observers = self.observers.clone();
        for observer in observers {
            observer.on_event(event);
        }
    }

    /// Tell subscribers that the security state may have changed.
    pub fn security_changed(&self) {
        self.emit(ContextEvent::SecurityChanged);
    }

    /// Tell subscribers to perform idle housekeeping now.
    pub fn housekeeping(&self) {
        self.emit(ContextEvent::Housekeeping);
    }

    // ---- global machine state ----

    pub fn power_state(&self) -> PowerState {
        self.power_state
    }

    /// Returns whether the value actually changed.
    pub fn set_power_state(&mut self, power_state: PowerState) -> bool {
        if self.power_state == power_state {
            return false;
        }
        self.power_state = power_state;
        info!(state = %power_state, "power state changed");
        true
    }

    pub fn lid_state(&self) -> LidState {
        self.lid_state
    }

    pub fn set_lid_state(&mut self, lid_state: LidState) -> bool {
        if self.lid_state == lid_state {
            return false;
        }
        self.lid_state = lid_state;
        info!(state = %lid_state, "lid state changed");
        true
    }

    pub fn display_state(&self) -> DisplayState {
        self.display_state
    }

    pub fn set_display_state(&mut self, display_state: DisplayState) -> bool {
        if self.display_state == display_state {
            return false;
        }
        self.display_state = display_state;
        info!(state = %display_state, "display state changed");
        true
    }

    pub fn battery_level(&self) -> u32 {
        self.battery_level
    }

    /// Set the battery percentage. Values above the sentinel are a
    /// programming error and are ignored in release builds. Returns
    /// whether the value actually changed.
    pub fn set_battery_level(&mut self, level: u32) -> bool {
        debug_assert!(
            level <= BATTERY_LEVEL_INVALID,
            "battery level {level} out of range"
        );
        if level > BATTERY_LEVEL_INVALID || self.battery_level == level {
            return false;
        }
        self.battery_level = level;
        info!(level, "battery level changed");
        true
    }

    pub fn battery_threshold(&self) -> u32 {
        self.battery_threshold
    }

    pub fn set_battery_threshold(&mut self, threshold: u32) -> bool {
        debug_assert!(
            threshold <= BATTERY_LEVEL_INVALID,
            "battery threshold {threshold} out of range"
        );
        if threshold > BATTERY_LEVEL_INVALID || self.battery_threshold == threshold {
            return false;
        }
        self.battery_threshold = threshold;
        info!(threshold, "battery threshold changed");
        true
    }

    pub fn chassis_kind(&self) -> ChassisKind {
        self.chassis_kind
    }

    pub fn set_chassis_kind(&mut self, chassis_kind: ChassisKind) {
        self.chassis_kind = chassis_kind;
    }

    // ---- component versions ----

    pub fn add_runtime_version(&mut self, component_id: &str, version: &str) {
        self.runtime_versions
            .insert(component_id.to_string(), version.to_string());
    }

    pub fn runtime_version(&self, component_id: &str) -> Option<&str> {
        self.runtime_versions.get(component_id).map(String::as_str)
    }

    pub fn runtime_versions(&self) -> &BTreeMap<String, String> {
        &self.runtime_versions
    }

    pub fn add_compile_version(&mut self, component_id: &str, version: &str) {
        self.compile_versions
            .insert(component_id.to_string(), version.to_string());
    }

    pub fn compile_versions(&self) -> &BTreeMap<String, String> {
        &self.compile_versions
    }

    // ---- udev subsystem registration ----

    /// Register interest in a udev subsystem, optionally for a named
    /// plugin. A `subsystem:devtype` form also registers the bare
    /// subsystem.
    pub fn add_udev_subsystem(&mut self, subsystem: &str, plugin_name: Option<&str>) {
        if let Some((base, _devtype)) = subsystem.split_once(':') {
            let base = base.to_string();
            self.add_udev_subsystem(&base, None);
        }
        if let Some(index) = self
            .udev_subsystems
            .iter()
            .position(|(name, _)| name == subsystem)
        {
            if let Some(plugin_name) = plugin_name {
                let plugin_names = &mut self.udev_subsystems[index].1;
                if !plugin_names.iter().any(|p| p == plugin_name) {
                    // kept unsorted; the accessor sorts on read
                    plugin_names.push(plugin_name.to_string());
                }
            }
            return;
        }
        let plugin_names = plugin_name.map(str::to_string).into_iter().collect();
        self.udev_subsystems
            .push((subsystem.to_string(), plugin_names));
        match plugin_name {
            Some(plugin_name) => {
                info!(subsystem, plugin = plugin_name, "added udev subsystem watch")
            }
            None => info!(subsystem, "added udev subsystem watch"),
        }
    }

    /// Plugins registered for a subsystem, sorted by name. For a
    /// `subsystem:devtype` query the bare-subsystem registrations are
    /// included.
    pub fn plugin_names_for_udev_subsystem(&self, subsystem: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if let Some((base, _devtype)) = subsystem.split_once(':') {
            if let Some((_, plugin_names)) =
                self.udev_subsystems.iter().find(|(name, _)| name == base)
            {
                names.extend(plugin_names.iter().cloned());
            }
        }
        if let Some((_, plugin_names)) = self
            .udev_subsystems
            .iter()
            .find(|(name, _)| name == subsystem)
        {
            names.extend(plugin_names.iter().cloned());
        }
        if names.is_empty() {
            return Err(Error::NotFound(format!(
                "no plugins registered for {subsystem}"
            )));
        }
        names.sort();
        Ok(names)
    }

    /// All watched subsystems, in registration order.
    pub fn udev_subsystems(&self) -> Vec<String> {
        self.udev_subsystems
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    // ---- firmware type registry ----

    /// Register a firmware-format validator under a type id, e.g. `ihex`.
    pub fn add_firmware_type(&mut self, id: &str, parse: FirmwareParseFn) {
        self.firmware_types.insert(id.to_string(), parse);
    }

    pub fn firmware_type(&self, id: &str) -> Option<FirmwareParseFn> {
        self.firmware_types.get(id).copied()
    }

    /// Registered type ids, sorted.
    pub fn firmware_type_ids(&self) -> Vec<&str> {
        self.firmware_types.keys().map(String::as_str).collect()
    }

    // ---- quirks ----

    pub fn add_quirk_key(&mut self, key: &str) {
        self.quirks.add_possible_key(key);
    }

    pub fn lookup_quirk_by_id(&self, guid: &str, key: &str) -> Option<&str> {
        self.quirks.lookup_by_id(guid, key)
    }

    pub fn lookup_quirk_by_id_iter<F>(&self, guid: &str, key: Option<&str>, callback: F) -> bool
    where
        F: FnMut(&str, &str, QuirkSource),
    {
        self.quirks.lookup_by_id_iter(guid, key, callback)
    }

    /// Rebuild the quirk database from the layered directories. Failure
    /// degrades capability detection but never fails the caller.
    pub fn load_quirks(&mut self) -> Result<()> {
        let layers = self.quirk_dirs.clone();
        if let Err(e) = self.quirks.load(&layers) {
            warn!(error = %e, "failed to load quirks");
        }
        Ok(())
    }

    pub fn set_quirk_dirs(&mut self, layers: Vec<(PathBuf, QuirkSource)>) {
        self.quirk_dirs = layers;
    }

    /// Whether a custom flag exists for this machine, typically added
    /// from a quirk on one of the system GUIDs.
    pub fn has_hwid_flag(&self, flag: &str) -> bool {
        self.hwid_flags.iter().any(|f| f == flag)
    }

    // ---- hardware identity ----

    fn hwinfo_loaded(&self, what: &str) -> bool {
        let loaded = self.flags.contains(ContextFlags::LOADED_HWINFO);
        debug_assert!(loaded, "cannot use {what} before load_hwinfo");
        loaded
    }

    pub fn has_hwid_guid(&self, guid: &str) -> bool {
        if !self.hwinfo_loaded("HWIDs") {
            return false;
        }
        self.hwids.has_guid(guid)
    }

    /// All hardware GUIDs for this machine, most specific first.
    pub fn hwid_guids(&self) -> &[String] {
        if !self.hwinfo_loaded("HWIDs") {
            return &[];
        }
        self.hwids.guids()
    }

    pub fn hwid_value(&self, key: &str) -> Option<&str> {
        if !self.hwinfo_loaded("HWIDs") {
            return None;
        }
        self.hwids.value(key)
    }

    /// The joined replacement value for a key list such as
    /// `Manufacturer&ProductName` or a `HardwareID-N` alias.
    pub fn hwid_replace_value(&self, keys: &str) -> Result<String> {
        if !self.hwinfo_loaded("HWIDs") {
            return Err(Error::Internal("hardware info not loaded".to_string()));
        }
        self.hwids.replace_values(keys)
    }

    pub fn smbios_string(&self, kind: u8, offset: usize) -> Option<&str> {
        if !self.hwinfo_loaded("SMBIOS") {
            return None;
        }
        self.smbios.as_ref().and_then(|s| s.string(kind, offset))
    }

    pub fn smbios_structures(&self, kind: u8) -> Result<Vec<&SmbiosStructure>> {
        if !self.hwinfo_loaded("SMBIOS") {
            return Err(Error::Internal("hardware info not loaded".to_string()));
        }
        let Some(smbios) = self.smbios.as_ref() else {
            return Err(Error::NotFound("no SMBIOS data".to_string()));
        };
        Ok(smbios.structures(kind))
    }

    pub(crate) fn set_smbios(&mut self, smbios: Smbios) {
        self.smbios = Some(smbios);
    }

    pub fn smbios_table_dir(&self) -> &Path {
        &self.smbios_table_dir
    }

    pub fn set_smbios_table_dir(&mut self, dir: PathBuf) {
        self.smbios_table_dir = dir;
    }

    pub fn dmi_class_dir(&self) -> &Path {
        &self.dmi_class_dir
    }

    pub fn set_dmi_class_dir(&mut self, dir: PathBuf) {
        self.dmi_class_dir = dir;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_config_path(&mut self, path: Option<PathBuf>) {
        self.config_path = path;
    }

    /// Load all hardware information parts of the context.
    ///
    /// Individual identity probes are allowed to fail; requiring every
    /// probe to succeed would make the daemon unusable on exactly the
    /// unusual hardware it exists for.
    pub fn load_hwinfo(&mut self, progress: &mut Progress, flags: HwidLoadFlags) -> Result<()> {
        const SETUP_MAP: &[(&str, HwidLoadFlags, HwidSetupFunc)] = &[
            ("config", HwidLoadFlags::CONFIG, hwids::config_setup),
            ("smbios", HwidLoadFlags::SMBIOS, hwids::smbios_setup),
            ("fdt", HwidLoadFlags::FDT, hwids::fdt_setup),
            ("kenv", HwidLoadFlags::KENV, hwids::kenv_setup),
            ("dmi", HwidLoadFlags::DMI, hwids::dmi_setup),
            ("darwin", HwidLoadFlags::DARWIN, hwids::darwin_setup),
        ];

        progress.add_step(1, "hwids-setup-funcs");
        progress.add_step(1, "hwids-setup");
        progress.add_step(3, "set-flags");
        progress.add_step(1, "detect-fde");
        progress.add_step(94, "reload-bios-settings");

        // required always
        self.config = Config::load(self.config_path.as_deref())?;
        if let Some(location) = self.config.esp_location.clone() {
            self.esp_location = Some(location);
        }
        if let Some(threshold) = self.config.battery_threshold {
            self.set_battery_threshold(threshold);
        }
        if self.config.ignore_efivars_free_space {
            self.add_flag(ContextFlags::IGNORE_EFIVARS_FREE_SPACE);
        }

        let mut hwids = std::mem::take(&mut self.hwids);
        for (name, flag, func) in SETUP_MAP {
            if flags.contains(*flag) {
                if let Err(e) = func(self, &mut hwids) {
                    info!(probe = name, error = %e, "identity probe failed");
                }
            }
        }
        self.hwids = hwids;
        self.add_flag(ContextFlags::LOADED_HWINFO);
        progress.step_done();

        if let Err(e) = self.hwids.setup() {
            warn!(error = %e, "failed to derive hardware ids");
        }
        progress.step_done();

        // collect custom flags quirked onto the system GUIDs
        let guids: Vec<String> = self.hwids.guids().to_vec();
        for guid in &guids {
            let mut found = Vec::new();
            self.quirks
                .lookup_by_id_iter(guid, Some(QUIRK_KEY_FLAGS), |_key, value, _source| {
                    found.extend(value.split(',').map(str::trim).map(String::from));
                });
            for flag in found {
                if !flag.is_empty() && !self.hwid_flags.contains(&flag) {
                    self.hwid_flags.push(flag);
                }
            }
        }
        progress.step_done();

        self.detect_full_disk_encryption();
        progress.step_done();

        self.add_udev_subsystem("firmware-attributes", None);
        if let Err(e) = self.reload_bios_settings() {
            debug!(error = %e, "cannot reload BIOS settings");
        }
        progress.step_done();

        // always
        Ok(())
    }

    fn detect_full_disk_encryption(&mut self) {
        let devices = match self.storage.block_devices() {
            Ok(devices) => devices,
            Err(e) => {
                info!(error = %e, "failed to get block devices");
                return;
            }
        };
        for device in devices {
            if device.id_type.as_deref() == Some("BitLocker") {
                self.flags.insert(ContextFlags::FDE_BITLOCKER);
            }
            if device.id_type.as_deref() == Some("crypto_LUKS")
                && device.label.as_deref() == Some("ubuntu-data-enc")
            {
                self.flags.insert(ContextFlags::FDE_SNAPD);
            }
        }
    }

    // ---- EFI variables ----

    pub fn efivars(&self) -> &dyn EfivarStore {
        self.efivars.as_ref()
    }

    /// Check there is room for `count` more bytes of EFI variables.
    pub fn efivars_check_free_space(&self, count: u64) -> Result<()> {
        // escape hatch
        if self.flags.contains(ContextFlags::IGNORE_EFIVARS_FREE_SPACE) {
            return Ok(());
        }
        let total = self.efivars.space_free()?;
        if total < count {
            return Err(Error::BrokenSystem(format!(
                "not enough efivarfs space, requested {count} bytes and got {total} bytes"
            )));
        }
        Ok(())
    }

    // ---- FDT ----

    /// The parsed system device tree, cached after the first call.
    pub fn fdt(&mut self) -> Result<&Fdt> {
        if self.fdt.is_none() {
            let path = self
                .fdt_paths
                .iter()
                .find(|p| p.exists())
                .ok_or_else(|| {
                    Error::NotSupported(format!(
                        "cannot find a device tree blob in {:?}",
                        self.fdt_paths
                    ))
                })?;
            let fdt = Fdt::load(path)
                .map_err(|e| Error::InvalidFile(format!("failed to parse FDT: {e}")))?;
            self.fdt = Some(fdt);
        }
        Ok(self.fdt.as_ref().unwrap())
    }

    pub fn set_fdt_paths(&mut self, paths: Vec<PathBuf>) {
        self.fdt_paths = paths;
    }

    // ---- ESP discovery ----

    /// Record an ESP candidate, ignoring duplicates by volume id.
    pub fn add_esp_volume(&mut self, volume: Volume) {
        if self.esp_volumes.iter().any(|v| v.id() == volume.id()) {
            debug!(volume = %volume.id(), "not adding duplicate volume");
            return;
        }
        self.esp_volumes.push(volume);
    }

    /// The user's preferred ESP mount path.
    pub fn esp_location(&self) -> Option<&str> {
        self.esp_location.as_deref()
    }

    pub fn set_esp_location(&mut self, location: impl Into<String>) {
        self.esp_location = Some(location.into());
    }

    #[cfg(test)]
    pub(crate) fn set_esp_override(&mut self, path: Option<PathBuf>) {
        self.esp_override = path;
    }

    /// All volumes that could be an ESP.
    ///
    /// The first non-empty result is cached for the lifetime of the
    /// context; a process restart is required to re-probe.
    pub fn esp_volumes(&mut self) -> Result<Vec<Volume>> {
        // cached result
        if !self.esp_volumes.is_empty() {
            return Ok(self.esp_volumes.clone());
        }

        // the test harness points this at a local directory
        if let Some(path) = self.esp_override.clone() {
            let mut volume = Volume::new_from_mount_path(&path);
            volume.set_partition_kind(PartitionKind::Esp);
            volume.set_partition_uuid("00000000-0000-0000-0000-000000000000");
            self.add_esp_volume(volume);
            return Ok(self.esp_volumes.clone());
        }

        match self.storage.volumes_by_kind(&PartitionKind::Esp) {
            Err(e) => debug!(error = %e, "cannot enumerate ESP volumes"),
            Ok(volumes) => {
                for volume in volumes {
                    if volume.fs_type() != Some("vfat") {
                        continue;
                    }
                    self.add_esp_volume(volume);
                }
            }
        }

        match self.storage.volumes_by_kind(&PartitionKind::Bdp) {
            Err(e) => debug!(error = %e, "cannot enumerate BDP volumes"),
            Ok(volumes) => {
                for volume in volumes {
                    if volume.fs_type() != Some("vfat") {
                        continue;
                    }
                    if !volume.is_internal() {
                        continue;
                    }
                    self.add_esp_volume(volume);
                }
            }
        }

        if self.esp_volumes.is_empty() {
            // tell "no storage subsystem" apart from "no ESP exists"
            self.storage.block_devices()?;
            return Err(Error::NotFound("no ESP or BDP found".to_string()));
        }
        Ok(self.esp_volumes.clone())
    }

    /// The volume plugins should nominally use for storing boot data.
    ///
    /// With several candidates the best is picked by score: partition
    /// size in MiB, plus a large bonus for a real ESP partition kind,
    /// plus a smaller bonus when the volume looks like a Linux ESP.
    pub fn default_esp(&mut self) -> Result<Volume> {
        let user_esp_location = self.esp_location.clone();
        let volumes = self.esp_volumes()?;

        // no mounting
        if self.flags.contains(ContextFlags::INHIBIT_VOLUME_MOUNT) {
            return Err(Error::NotSupported(
                "cannot mount volume by policy".to_string(),
            ));
        }

        if volumes.len() == 1 {
            let esp = &volumes[0];
            let guard = MountGuard::acquire(self.storage.as_ref(), esp)?;
            if let Some(user) = &user_esp_location {
                if guard.mount_point() != Path::new(user) {
                    return Err(Error::NotSupported(format!(
                        "user specified ESP {user} not found"
                    )));
                }
            }
            return Ok(esp.clone());
        }

        let mut scored: Vec<(u64, Volume)> = Vec::new();
        for esp in &volumes {
            let guard = match MountGuard::acquire(self.storage.as_ref(), esp) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(volume = %esp.id(), error = %e, "failed to mount ESP");
                    continue;
                }
            };

            // if user specified, make sure that it matches
            if let Some(user) = &user_esp_location {
                if guard.mount_point() != Path::new(user) {
                    debug!(volume = %esp.id(), "not the user specified ESP");
                    continue;
                }
            }

            if !has_esp_layout(guard.mount_point()) {
                debug!(volume = %esp.id(), "not an ESP");
                continue;
            }

            // big partitions are better than small partitions
            let mut score = esp.size() / (1024 * 1024);

            // prefer a real ESP over a basic data partition
            if esp.partition_kind() == &PartitionKind::Esp {
                score += 0x20000;
            }

            // prefer the ESP a Linux bootloader lives on
            match looks_like_linux_esp(guard.mount_point()) {
                Ok(true) => score += 0x10000,
                Ok(false) => debug!(volume = %esp.id(), "not a Linux ESP"),
                Err(e) => debug!(volume = %esp.id(), error = %e, "cannot inspect ESP"),
            }

            scored.push((score, esp.clone()));
        }

        if scored.is_empty() {
            return Err(Error::NotSupported(
                "no EFI system partition found".to_string(),
            ));
        }
        // stable: ties keep encounter order
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        for (score, esp) in &scored {
            debug!(score = format!("{score:#x}"), volume = %esp.id(), "ESP candidate");
        }
        Ok(scored.remove(0).1)
    }

    /// The cached ESP volume matching an EFI hard-drive device path.
    pub fn esp_volume_by_hard_drive_device_path(
        &mut self,
        dp: &HardDriveDevicePath,
    ) -> Result<Volume> {
        let Some(dp_uuid) = dp.partition_uuid() else {
            return Err(Error::NotSupported(
                "device path has no GPT signature".to_string(),
            ));
        };
        let volumes = self.esp_volumes()?;
        for volume in volumes {
            let Some(uuid) = volume.partition_uuid() else {
                continue;
            };
            if uuid.eq_ignore_ascii_case(&dp_uuid) {
                return Ok(volume);
            }
        }
        Err(Error::NotFound(
            "could not find volume for EFI device path".to_string(),
        ))
    }

    /// The PE files referenced by the `BootOrder` load options.
    ///
    /// Entries whose assets are missing or not valid PE images are
    /// skipped; mount and I/O failures abort the whole collection.
    pub fn esp_files(&mut self, flags: EspFileFlags) -> Result<Vec<PeFile>> {
        let entries = self.efivars.boot_entries()?;
        let mut files = Vec::new();
        for entry in entries {
            if let Err(e) = self.esp_files_for_entry(&entry, &mut files, flags) {
                if e.is_absence() {
                    debug!(entry = %entry.description, error = %e, "ignoring boot entry");
                    continue;
                }
                return Err(e);
            }
        }
        Ok(files)
    }

    fn esp_files_for_entry(
        &mut self,
        entry: &LoadOption,
        files: &mut Vec<PeFile>,
        flags: EspFileFlags,
    ) -> Result<()> {
        // only entries with a hard-drive + file-path pair are interesting
        let Some(dp_hdd) = entry.hard_drive() else {
            return Ok(());
        };
        let Some(dp_file) = entry.file_path() else {
            return Ok(());
        };

        let volume = self.esp_volume_by_hard_drive_device_path(dp_hdd)?;
        if self.flags.contains(ContextFlags::INHIBIT_VOLUME_MOUNT) {
            return Err(Error::NotSupported(
                "cannot mount volume by policy".to_string(),
            ));
        }
        let guard = MountGuard::acquire(self.storage.as_ref(), &volume)?;
        let filename = guard.mount_point().join(&dp_file);

        // the file itself
        if flags.contains(EspFileFlags::FIRST_STAGE) {
            debug!(file = %filename.display(), "check for 1st stage bootloader");
            match PeFile::load(&filename) {
                Ok(pe) => files.push(pe),
                Err(e) if e.is_absence() => debug!(error = %e, "ignoring"),
                Err(e) => return Err(e),
            }
        }

        let Some(shim_name) = uefi_basename_for_arch("shim") else {
            return Ok(());
        };
        let is_shim = filename
            .file_name()
            .is_some_and(|name| name.to_string_lossy() == shim_name);
        if !is_shim {
            return Ok(());
        }
        let parent = filename.parent().unwrap_or_else(|| Path::new("/"));

        // the 2nd stage bootloader, typically grub
        if flags.contains(EspFileFlags::SECOND_STAGE) {
            let second_name = entry
                .metadata_path()
                .or_else(|| uefi_basename_for_arch("grub"));
            if let Some(second_name) = second_name {
                let filename2 = parent.join(second_name);
                debug!(file = %filename2.display(), "check for 2nd stage bootloader");
                match PeFile::load(&filename2) {
                    Ok(pe) => files.push(pe),
                    Err(e) if e.is_absence() => debug!(error = %e, "ignoring"),
                    Err(e) => return Err(e),
                }
            }
        }

        // revocations, typically for SBAT
        if flags.contains(EspFileFlags::REVOCATIONS) {
            let filename2 = parent.join("revocations.efi");
            debug!(file = %filename2.display(), "check for revocation");
            match PeFile::load(&filename2) {
                Ok(pe) => files.push(pe),
                Err(e) if e.is_absence() => debug!(error = %e, "ignoring"),
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    // ---- backends ----

    /// Register a backend. Duplicate names are tolerated; name lookup
    /// returns the first registrant.
    pub fn add_backend(&mut self, backend: Box<dyn Backend>) {
        self.backends.push(backend);
    }

    pub fn backend_by_name(&self, name: &str) -> Result<&dyn Backend> {
        self.backends
            .iter()
            .find(|b| b.name() == name)
            .map(|b| b.as_ref())
            .ok_or_else(|| Error::NotFound(format!("no backend with name {name}")))
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.backends.iter().any(|b| b.name() == name)
    }

    pub fn backends(&self) -> &[Box<dyn Backend>] {
        &self.backends
    }

    pub fn backends_mut(&mut self) -> &mut [Box<dyn Backend>] {
        &mut self.backends
    }

    // ---- BIOS settings ----

    /// Refresh the snapshot of platform firmware attributes.
    pub fn reload_bios_settings(&mut self) -> Result<()> {
        self.bios_settings.setup()
    }

    pub fn bios_settings(&self) -> &BiosSettings {
        &self.bios_settings
    }

    pub fn bios_setting(&self, name: &str) -> Option<&BiosSetting> {
        self.bios_settings.get(name)
    }

    pub fn bios_setting_pending_reboot(&self) -> bool {
        self.bios_settings.pending_reboot()
    }

    pub fn set_bios_settings(&mut self, bios_settings: BiosSettings) {
        self.bios_settings = bios_settings;
    }

    // ---- device tree ----

    pub fn device_registry(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn device_registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.devices
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn has_esp_layout(mount_point: &Path) -> bool {
    mount_point.join("EFI").is_dir() || mount_point.join("efi").is_dir()
}

/// Whether any top-level file looks like a Linux bootloader binary.
fn looks_like_linux_esp(mount_point: &Path) -> Result<bool> {
    const PREFIXES: [&str; 4] = ["grub", "shim", "systemd-boot", "zfsbootmenu"];
    for entry in std::fs::read_dir(mount_point)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if !name.ends_with(".efi") {
            continue;
        }
        if PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            info!(file = %name, "found Linux ESP marker");
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::NamedBackend;
    use crate::efivars::testsupport::{encode_load_option, sample_hdd};
    use crate::efivars::{DummyEfivars, EFI_GLOBAL_GUID};
    use crate::pefile::testsupport::minimal_pe;
    use crate::storage::MockStorage;
    use std::sync::Mutex;

    fn test_context() -> Context {
        Context::with_providers(Arc::new(MockStorage::new()), Box::new(DummyEfivars::new()))
    }

    fn context_with_storage(storage: MockStorage) -> Context {
        let mut ctx = Context::with_providers(Arc::new(storage), Box::new(DummyEfivars::new()));
        ctx.set_esp_override(None);
        ctx
    }

    fn esp_volume(id: &str, size_mib: u64, kind: PartitionKind) -> Volume {
        let mut volume = Volume::new(id);
        volume.set_partition_kind(kind);
        volume.set_fs_type("vfat");
        volume.set_size(size_mib * 1024 * 1024);
        volume
    }

    fn make_esp_dir(dir: &Path, with_shim: bool) {
        std::fs::create_dir_all(dir.join("EFI")).unwrap();
        if with_shim {
            std::fs::write(dir.join("shimx64.efi"), minimal_pe()).unwrap();
        }
    }

    #[test]
    fn test_flags() {
        let mut ctx = test_context();
        assert!(!ctx.has_flag(ContextFlags::INHIBIT_VOLUME_MOUNT));
        ctx.add_flag(ContextFlags::INHIBIT_VOLUME_MOUNT);
        assert!(ctx.has_flag(ContextFlags::INHIBIT_VOLUME_MOUNT));
        ctx.remove_flag(ContextFlags::INHIBIT_VOLUME_MOUNT);
        assert!(!ctx.has_flag(ContextFlags::INHIBIT_VOLUME_MOUNT));
    }

    #[test]
    fn test_battery_setters_idempotent() {
        let mut ctx = test_context();
        assert_eq!(ctx.battery_level(), BATTERY_LEVEL_INVALID);
        assert!(ctx.set_battery_level(50));
        // same value: no change notification
        assert!(!ctx.set_battery_level(50));
        assert!(ctx.set_battery_threshold(30));
        assert!(!ctx.set_battery_threshold(30));
        assert_eq!(ctx.battery_level(), 50);
        assert_eq!(ctx.battery_threshold(), 30);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_battery_level_out_of_range() {
        let mut ctx = test_context();
        ctx.set_battery_level(BATTERY_LEVEL_INVALID + 1);
    }

    #[test]
    fn test_state_setters_idempotent() {
        let mut ctx = test_context();
        assert!(ctx.set_power_state(PowerState::BatteryDischarging));
        assert!(!ctx.set_power_state(PowerState::BatteryDischarging));
        assert!(ctx.power_state().on_battery());
        assert!(ctx.set_lid_state(LidState::Closed));
        assert!(!ctx.set_lid_state(LidState::Closed));
        assert!(ctx.set_display_state(DisplayState::Connected));
        assert!(!ctx.set_display_state(DisplayState::Connected));
    }

    #[test]
    #[should_panic(expected = "before load_hwinfo")]
    fn test_hwid_access_before_load_panics() {
        let ctx = test_context();
        let _ = ctx.has_hwid_guid("059eb22d-6dc7-59af-abd3-94bbe017f67c");
    }

    #[test]
    fn test_load_hwinfo_probe_failure_nonfatal() {
        let dmi = tempfile::tempdir().unwrap();
        std::fs::write(dmi.path().join("sys_vendor"), "ExampleCorp\n").unwrap();
        std::fs::write(dmi.path().join("product_name"), "Widget Pro\n").unwrap();

        let storage = MockStorage::new();
        let mut ctx = context_with_storage(storage);
        ctx.set_config_path(None);
        ctx.set_dmi_class_dir(dmi.path().to_path_buf());
        // the smbios probe will fail: the table dir does not exist
        ctx.set_smbios_table_dir(PathBuf::from("/nonexistent/dmi/tables"));

        let mut progress = Progress::new();
        ctx.load_hwinfo(
            &mut progress,
            HwidLoadFlags::SMBIOS | HwidLoadFlags::DMI,
        )
        .unwrap();

        assert!(ctx.has_flag(ContextFlags::LOADED_HWINFO));
        assert_eq!(progress.fraction(), 1.0);
        assert_eq!(ctx.hwid_value(hwids::KEY_MANUFACTURER), Some("ExampleCorp"));
        assert!(!ctx.hwid_guids().is_empty());
        let joined = ctx.hwid_replace_value("Manufacturer&ProductName").unwrap();
        assert_eq!(joined, "ExampleCorp&Widget Pro");
    }

    #[test]
    fn test_load_hwinfo_collects_quirk_flags() {
        let dmi = tempfile::tempdir().unwrap();
        std::fs::write(dmi.path().join("sys_vendor"), "ExampleCorp\n").unwrap();

        let quirk_dir = tempfile::tempdir().unwrap();
        let guid = crate::guid::from_string("ExampleCorp");
        std::fs::write(
            quirk_dir.path().join("vendor.quirk"),
            format!("[\"{guid}\"]\nFlags = \"use-legacy-bootmgr-desc,no-esrt\"\n"),
        )
        .unwrap();

        let mut ctx = context_with_storage(MockStorage::new());
        ctx.set_config_path(None);
        ctx.set_dmi_class_dir(dmi.path().to_path_buf());
        ctx.set_quirk_dirs(vec![(quirk_dir.path().to_path_buf(), QuirkSource::Builtin)]);
        ctx.load_quirks().unwrap();

        let mut progress = Progress::new();
        ctx.load_hwinfo(&mut progress, HwidLoadFlags::DMI).unwrap();
        assert!(ctx.has_hwid_flag("use-legacy-bootmgr-desc"));
        assert!(ctx.has_hwid_flag("no-esrt"));
        assert!(!ctx.has_hwid_flag("other"));
    }

    #[test]
    fn test_udev_subsystem_sort_on_read() {
        let mut ctx = test_context();
        ctx.add_udev_subsystem("hidraw", Some("zz-plugin"));
        ctx.add_udev_subsystem("hidraw", Some("aa-plugin"));
        ctx.add_udev_subsystem("hidraw", Some("aa-plugin")); // dupe ignored
        let names = ctx.plugin_names_for_udev_subsystem("hidraw").unwrap();
        assert_eq!(names, ["aa-plugin", "zz-plugin"]);
    }

    #[test]
    fn test_udev_subsystem_devtype_registers_base() {
        let mut ctx = test_context();
        ctx.add_udev_subsystem("block:partition", Some("uefi"));
        assert_eq!(ctx.udev_subsystems(), ["block", "block:partition"]);
        // a devtype query also picks up bare-subsystem registrations
        ctx.add_udev_subsystem("block", Some("iommu"));
        let names = ctx
            .plugin_names_for_udev_subsystem("block:partition")
            .unwrap();
        assert_eq!(names, ["iommu", "uefi"]);
        assert!(ctx.plugin_names_for_udev_subsystem("nvme").is_err());
    }

    #[test]
    fn test_firmware_type_registry() {
        let mut ctx = test_context();
        assert_eq!(ctx.firmware_type_ids(), ["fdt", "pefile"]);
        let parse = ctx.firmware_type("pefile").unwrap();
        assert!(parse(&minimal_pe()).is_ok());
        assert!(parse(b"junk").is_err());
        assert!(ctx.firmware_type("ihex").is_none());

        ctx.add_firmware_type("null", |_| Ok(()));
        assert_eq!(ctx.firmware_type_ids(), ["fdt", "null", "pefile"]);
    }

    #[test]
    fn test_backend_lookup_first_wins() {
        let mut ctx = test_context();
        ctx.add_backend(Box::new(NamedBackend::new("usb")));
        ctx.add_backend(Box::new(NamedBackend::new("udev")));
        ctx.add_backend(Box::new(NamedBackend::new("usb")));
        assert!(ctx.has_backend("usb"));
        assert!(!ctx.has_backend("bluez"));
        assert_eq!(ctx.backends().len(), 3);
        assert_eq!(ctx.backend_by_name("udev").unwrap().name(), "udev");
        // insertion order is preserved, so lookup hits the first "usb"
        assert_eq!(ctx.backends()[0].name(), "usb");
        assert!(ctx.backend_by_name("bluez").is_err());
    }

    #[test]
    fn test_observers_fire_and_forget() {
        struct Recorder(Mutex<Vec<ContextEvent>>);
        impl ContextObserver for Recorder {
            fn on_event(&self, event: ContextEvent) {
                self.0.lock().unwrap().push(event);
            }
        }
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut ctx = test_context();
        ctx.add_observer(recorder.clone());
        ctx.security_changed();
        ctx.housekeeping();
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![ContextEvent::SecurityChanged, ContextEvent::Housekeeping]
        );
    }

    #[test]
    fn test_efivars_free_space_check() {
        let efivars = DummyEfivars::new();
        efivars.set_space_free(100);
        let mut ctx = Context::with_providers(Arc::new(MockStorage::new()), Box::new(efivars));
        assert!(ctx.efivars_check_free_space(50).is_ok());
        assert!(matches!(
            ctx.efivars_check_free_space(200),
            Err(Error::BrokenSystem(_))
        ));
        // escape hatch
        ctx.add_flag(ContextFlags::IGNORE_EFIVARS_FREE_SPACE);
        assert!(ctx.efivars_check_free_space(200).is_ok());
    }

    #[test]
    fn test_esp_volumes_filters_and_dedup() {
        let storage = MockStorage::new();
        storage.add_volume(esp_volume("/dev/sda1", 512, PartitionKind::Esp), None);
        // not vfat: filtered
        let mut ext4 = esp_volume("/dev/sda2", 512, PartitionKind::Esp);
        ext4.set_fs_type("ext4");
        storage.add_volume(ext4, None);
        // removable BDP: filtered
        let mut removable = esp_volume("/dev/sdb1", 512, PartitionKind::Bdp);
        removable.set_removable(true);
        storage.add_volume(removable, None);
        // internal vfat BDP: kept
        storage.add_volume(esp_volume("/dev/sda3", 256, PartitionKind::Bdp), None);

        let mut ctx = context_with_storage(storage);
        let volumes = ctx.esp_volumes().unwrap();
        let ids: Vec<&str> = volumes.iter().map(|v| v.id()).collect();
        assert_eq!(ids, ["/dev/sda1", "/dev/sda3"]);
    }

    #[test]
    fn test_esp_volumes_cached_ignores_mutation() {
        let storage = Arc::new(MockStorage::new());
        storage.add_volume(esp_volume("/dev/sda1", 512, PartitionKind::Esp), None);
        let mut ctx =
            Context::with_providers(storage.clone(), Box::new(DummyEfivars::new()));
        ctx.set_esp_override(None);

        let first = ctx.esp_volumes().unwrap();
        assert_eq!(first.len(), 1);

        // mutate the underlying volume set: the cached result must not
        // notice, only a process restart re-probes
        storage.clear_volumes();
        storage.add_volume(esp_volume("/dev/sdb1", 64, PartitionKind::Esp), None);

        let second = ctx.esp_volumes().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id(), "/dev/sda1");
    }

    #[test]
    fn test_esp_volumes_diagnostic_probe() {
        // no volumes, block devices available: "no ESP or BDP"
        let storage = MockStorage::new();
        let mut ctx = context_with_storage(storage);
        assert!(matches!(ctx.esp_volumes(), Err(Error::NotFound(_))));

        // no volumes and the probe itself fails: that error surfaces
        let storage = MockStorage::new();
        storage.fail_block_devices("udisks not running");
        let mut ctx = context_with_storage(storage);
        assert!(matches!(ctx.esp_volumes(), Err(Error::Storage(_))));
    }

    #[test]
    fn test_esp_override_participates_in_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context_with_storage(MockStorage::new());
        ctx.set_esp_override(Some(dir.path().to_path_buf()));
        let volumes = ctx.esp_volumes().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].partition_kind(), &PartitionKind::Esp);
        assert_eq!(volumes[0].mount_point(), Some(dir.path()));
        // cached now: clearing the override changes nothing
        ctx.set_esp_override(None);
        assert_eq!(ctx.esp_volumes().unwrap().len(), 1);
    }

    #[test]
    fn test_default_esp_scoring_prefers_linux_esp() {
        // 10/20/15 MiB, all kind ESP; only the 15MiB one carries a shim,
        // so its heuristic bonus must outrank the 20MiB candidate
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let dir_c = tempfile::tempdir().unwrap();
        make_esp_dir(dir_a.path(), false);
        make_esp_dir(dir_b.path(), false);
        make_esp_dir(dir_c.path(), true);

        let storage = MockStorage::new();
        storage.add_volume(
            esp_volume("/dev/sda1", 10, PartitionKind::Esp),
            Some(dir_a.path().to_path_buf()),
        );
        storage.add_volume(
            esp_volume("/dev/sda2", 20, PartitionKind::Esp),
            Some(dir_b.path().to_path_buf()),
        );
        storage.add_volume(
            esp_volume("/dev/sda3", 15, PartitionKind::Esp),
            Some(dir_c.path().to_path_buf()),
        );

        let mut ctx = context_with_storage(storage);
        let best = ctx.default_esp().unwrap();
        assert_eq!(best.id(), "/dev/sda3");
    }

    #[test]
    fn test_default_esp_excludes_unmountable_and_non_esp() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        make_esp_dir(dir_a.path(), false);
        // dir_b has no EFI directory at all

        let storage = MockStorage::new();
        storage.add_volume(
            esp_volume("/dev/sda1", 10, PartitionKind::Esp),
            Some(dir_a.path().to_path_buf()),
        );
        storage.add_volume(
            esp_volume("/dev/sda2", 500, PartitionKind::Esp),
            Some(dir_b.path().to_path_buf()),
        );
        let mut big = esp_volume("/dev/sda4", 900, PartitionKind::Esp);
        big.set_fs_type("vfat");
        storage.add_volume(big, None); // no backing: mount fails
        storage.set_unmountable("/dev/sda4");

        let mut ctx = context_with_storage(storage);
        // the 500MiB one lacks EFI/, the 900MiB one cannot mount; only
        // the small valid candidate remains
        let best = ctx.default_esp().unwrap();
        assert_eq!(best.id(), "/dev/sda1");
    }

    #[test]
    fn test_default_esp_single_candidate_user_path_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        make_esp_dir(dir.path(), false);
        let storage = MockStorage::new();
        storage.add_volume(
            esp_volume("/dev/sda1", 100, PartitionKind::Esp),
            Some(dir.path().to_path_buf()),
        );
        let mut ctx = context_with_storage(storage);
        ctx.set_esp_location("/boot/efi-elsewhere");
        assert!(matches!(
            ctx.default_esp(),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_default_esp_inhibited_by_policy() {
        let storage = MockStorage::new();
        storage.add_volume(esp_volume("/dev/sda1", 100, PartitionKind::Esp), None);
        let mut ctx = context_with_storage(storage);
        ctx.add_flag(ContextFlags::INHIBIT_VOLUME_MOUNT);
        assert!(matches!(ctx.default_esp(), Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_default_esp_unmounts_candidates() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        make_esp_dir(dir_a.path(), false);
        make_esp_dir(dir_b.path(), false);
        let storage = MockStorage::new();
        storage.add_volume(
            esp_volume("/dev/sda1", 10, PartitionKind::Esp),
            Some(dir_a.path().to_path_buf()),
        );
        storage.add_volume(
            esp_volume("/dev/sda2", 20, PartitionKind::Esp),
            Some(dir_b.path().to_path_buf()),
        );
        let mut ctx = context_with_storage(storage);
        ctx.default_esp().unwrap();
        let storage = &ctx.storage;
        // every inspection mount was released
        let mounted: Vec<Volume> = ctx.esp_volumes.clone();
        for volume in mounted {
            assert!(storage.mount_point(&volume).is_none());
        }
    }

    #[test]
    fn test_esp_files_collection() {
        let dir = tempfile::tempdir().unwrap();
        let boot_dir = dir.path().join("EFI/fedora");
        std::fs::create_dir_all(&boot_dir).unwrap();
        let shim_name = uefi_basename_for_arch("shim").unwrap();
        let grub_name = uefi_basename_for_arch("grub").unwrap();
        std::fs::write(boot_dir.join(&shim_name), minimal_pe()).unwrap();
        std::fs::write(boot_dir.join(&grub_name), minimal_pe()).unwrap();
        // revocations.efi exists but is garbage: silently skipped
        std::fs::write(boot_dir.join("revocations.efi"), b"garbage").unwrap();

        let hdd = sample_hdd();
        let mut volume = esp_volume("/dev/sda1", 512, PartitionKind::Esp);
        volume.set_partition_uuid(hdd.partition_uuid().unwrap());
        let storage = MockStorage::new();
        storage.add_volume(volume, Some(dir.path().to_path_buf()));

        let efivars = DummyEfivars::new();
        efivars
            .set_data(EFI_GLOBAL_GUID, "BootOrder", &[0x01, 0x00])
            .unwrap();
        efivars
            .set_data(
                EFI_GLOBAL_GUID,
                "Boot0001",
                &encode_load_option(
                    "Fedora",
                    Some(&hdd),
                    Some(&format!("\\EFI\\fedora\\{shim_name}")),
                    b"",
                ),
            )
            .unwrap();

        let mut ctx = Context::with_providers(Arc::new(storage), Box::new(efivars));
        ctx.set_esp_override(None);
        let files = ctx
            .esp_files(
                EspFileFlags::FIRST_STAGE | EspFileFlags::SECOND_STAGE | EspFileFlags::REVOCATIONS,
            )
            .unwrap();
        // shim + grub collected, broken revocations skipped
        assert_eq!(files.len(), 2);
        assert!(files[0].filename.as_deref().unwrap().ends_with(&shim_name));
        assert!(files[1].filename.as_deref().unwrap().ends_with(&grub_name));
    }

    #[test]
    fn test_esp_files_entry_without_volume_skipped() {
        let efivars = DummyEfivars::new();
        efivars
            .set_data(EFI_GLOBAL_GUID, "BootOrder", &[0x01, 0x00])
            .unwrap();
        efivars
            .set_data(
                EFI_GLOBAL_GUID,
                "Boot0001",
                &encode_load_option(
                    "Orphan",
                    Some(&sample_hdd()),
                    Some("\\EFI\\BOOT\\BOOTX64.EFI"),
                    b"",
                ),
            )
            .unwrap();
        let storage = MockStorage::new();
        storage.add_volume(esp_volume("/dev/sda1", 64, PartitionKind::Esp), None);
        let mut ctx = Context::with_providers(Arc::new(storage), Box::new(efivars));
        ctx.set_esp_override(None);
        // the entry's partition GUID matches nothing: skipped, not fatal
        let files = ctx.esp_files(EspFileFlags::FIRST_STAGE).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_load_hwinfo_detects_fde() {
        use crate::storage::BlockDevice;
        let storage = MockStorage::new();
        storage.set_block_devices(vec![
            BlockDevice {
                name: "sda3".to_string(),
                id_type: Some("BitLocker".to_string()),
                label: None,
            },
            BlockDevice {
                name: "sda4".to_string(),
                id_type: Some("crypto_LUKS".to_string()),
                label: Some("ubuntu-data-enc".to_string()),
            },
        ]);
        let mut ctx = context_with_storage(storage);
        ctx.set_config_path(None);
        let mut progress = Progress::new();
        ctx.load_hwinfo(&mut progress, HwidLoadFlags::empty()).unwrap();
        assert!(ctx.has_flag(ContextFlags::FDE_BITLOCKER));
        assert!(ctx.has_flag(ContextFlags::FDE_SNAPD));
    }

    #[test]
    fn test_load_hwinfo_smbios_probe_sets_chassis() {
        // type-1 System + type-3 Chassis structures
        let mut blob = Vec::new();
        blob.extend_from_slice(&[1u8, 8, 0x00, 0x01]);
        blob.extend_from_slice(&[1, 2, 0, 0]);
        blob.extend_from_slice(b"ExampleCorp\0Widget Pro\0\0");
        blob.extend_from_slice(&[3u8, 6, 0x00, 0x03]);
        blob.extend_from_slice(&[0, 0x09]);
        blob.extend_from_slice(b"\0\0");

        let tables = tempfile::tempdir().unwrap();
        std::fs::write(tables.path().join("DMI"), &blob).unwrap();

        let mut ctx = context_with_storage(MockStorage::new());
        ctx.set_config_path(None);
        ctx.set_smbios_table_dir(tables.path().to_path_buf());
        let mut progress = Progress::new();
        ctx.load_hwinfo(&mut progress, HwidLoadFlags::SMBIOS).unwrap();

        assert_eq!(ctx.chassis_kind(), crate::smbios::ChassisKind::Laptop);
        assert_eq!(ctx.hwid_value(hwids::KEY_MANUFACTURER), Some("ExampleCorp"));
        assert_eq!(ctx.smbios_string(crate::smbios::TYPE_SYSTEM, 5), Some("Widget Pro"));
    }

    #[test]
    fn test_runtime_and_compile_versions() {
        let mut ctx = test_context();
        ctx.add_runtime_version("org.example.widgetd", "1.2.3");
        ctx.add_compile_version("org.example.widgetd", "1.2.0");
        assert_eq!(ctx.runtime_version("org.example.widgetd"), Some("1.2.3"));
        assert_eq!(ctx.runtime_version("org.example.other"), None);
        assert_eq!(ctx.compile_versions().len(), 1);
    }
}
