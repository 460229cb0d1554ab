//! Hardware ID registry.
//!
//! Aggregates platform identity probes into key/value identity strings and
//! a canonical set of chained hardware GUIDs. Probes are independently
//! failable: partial identity data is expected on unusual hardware, and
//! the pipeline carries on with whatever loaded.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use tracing::{debug, trace};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::guid;
use crate::smbios::{self, ChassisKind, Smbios};

pub const KEY_MANUFACTURER: &str = "Manufacturer";
pub const KEY_FAMILY: &str = "Family";
pub const KEY_PRODUCT_NAME: &str = "ProductName";
pub const KEY_PRODUCT_SKU: &str = "ProductSku";
pub const KEY_BIOS_VENDOR: &str = "BiosVendor";
pub const KEY_BIOS_VERSION: &str = "BiosVersion";
pub const KEY_BIOS_MAJOR_RELEASE: &str = "BiosMajorRelease";
pub const KEY_BIOS_MINOR_RELEASE: &str = "BiosMinorRelease";
pub const KEY_ENCLOSURE_KIND: &str = "EnclosureKind";
pub const KEY_BASEBOARD_MANUFACTURER: &str = "BaseboardManufacturer";
pub const KEY_BASEBOARD_PRODUCT: &str = "BaseboardProduct";

/// Key combinations for the chained HardwareID GUIDs, most specific
/// first. `HardwareID-N` in a replace request refers to the Nth entry.
const CHAINS: &[&[&str]] = &[
    &[
        KEY_MANUFACTURER,
        KEY_FAMILY,
        KEY_PRODUCT_NAME,
        KEY_PRODUCT_SKU,
        KEY_BIOS_VENDOR,
        KEY_BIOS_VERSION,
        KEY_BIOS_MAJOR_RELEASE,
        KEY_BIOS_MINOR_RELEASE,
    ],
    &[
        KEY_MANUFACTURER,
        KEY_FAMILY,
        KEY_PRODUCT_NAME,
        KEY_BIOS_VENDOR,
        KEY_BIOS_VERSION,
        KEY_BIOS_MAJOR_RELEASE,
        KEY_BIOS_MINOR_RELEASE,
    ],
    &[
        KEY_MANUFACTURER,
        KEY_PRODUCT_NAME,
        KEY_BIOS_VENDOR,
        KEY_BIOS_VERSION,
        KEY_BIOS_MAJOR_RELEASE,
        KEY_BIOS_MINOR_RELEASE,
    ],
    &[
        KEY_MANUFACTURER,
        KEY_FAMILY,
        KEY_PRODUCT_NAME,
        KEY_PRODUCT_SKU,
        KEY_BASEBOARD_MANUFACTURER,
        KEY_BASEBOARD_PRODUCT,
    ],
    &[
        KEY_MANUFACTURER,
        KEY_FAMILY,
        KEY_PRODUCT_NAME,
        KEY_PRODUCT_SKU,
    ],
    &[KEY_MANUFACTURER, KEY_FAMILY, KEY_PRODUCT_NAME],
    &[
        KEY_MANUFACTURER,
        KEY_PRODUCT_SKU,
        KEY_BASEBOARD_MANUFACTURER,
        KEY_BASEBOARD_PRODUCT,
    ],
    &[KEY_MANUFACTURER, KEY_PRODUCT_SKU],
    &[
        KEY_MANUFACTURER,
        KEY_PRODUCT_NAME,
        KEY_BASEBOARD_MANUFACTURER,
        KEY_BASEBOARD_PRODUCT,
    ],
    &[KEY_MANUFACTURER, KEY_PRODUCT_NAME],
    &[
        KEY_MANUFACTURER,
        KEY_FAMILY,
        KEY_BASEBOARD_MANUFACTURER,
        KEY_BASEBOARD_PRODUCT,
    ],
    &[KEY_MANUFACTURER, KEY_FAMILY],
    &[KEY_MANUFACTURER, KEY_ENCLOSURE_KIND],
    &[
        KEY_MANUFACTURER,
        KEY_BASEBOARD_MANUFACTURER,
        KEY_BASEBOARD_PRODUCT,
    ],
    &[KEY_MANUFACTURER],
];

/// The hardware identity store.
#[derive(Debug, Default)]
pub struct HwidStore {
    values: BTreeMap<String, String>,
    guids: Vec<String>,
}

impl HwidStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an identity value. The first writer for a key wins, which
    /// lets the configuration overlay (probed first) pin values that the
    /// platform probes would otherwise report.
    pub fn add_value(&mut self, key: &str, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        if self.values.contains_key(key) {
            trace!(key = %key, "identity value already set");
            return;
        }
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn has_guid(&self, guid: &str) -> bool {
        self.guids.iter().any(|g| g == guid)
    }

    /// All derived GUIDs, most specific chain first.
    pub fn guids(&self) -> &[String] {
        &self.guids
    }

    pub fn add_guid(&mut self, guid: &str) {
        if !self.has_guid(guid) {
            self.guids.push(guid.to_string());
        }
    }

    /// Expand a `HardwareID-N` alias to its key chain; any other request
    /// is returned as-is.
    pub fn replace_keys(&self, keys: &str) -> String {
        if let Some(n) = keys.strip_prefix("HardwareID-") {
            if let Ok(index) = n.parse::<usize>() {
                if let Some(chain) = CHAINS.get(index) {
                    return chain.join("&");
                }
            }
        }
        keys.to_string()
    }

    /// Join the actual values for an `&`-separated key list.
    ///
    /// Unlike a probe failure, a missing key here is a malformed request
    /// and is reported as an error.
    pub fn replace_values(&self, keys: &str) -> Result<String> {
        let keys = self.replace_keys(keys);
        let mut values = Vec::new();
        for key in keys.split('&') {
            let value = self
                .value(key)
                .ok_or_else(|| Error::NotFound(format!("no value for key {key}")))?;
            values.push(value);
        }
        Ok(values.join("&"))
    }

    /// The GUID a key list would produce on this machine.
    pub fn guid_for_keys(&self, keys: &str) -> Result<String> {
        Ok(guid::from_string(&self.replace_values(keys)?))
    }

    /// Derive the chained GUIDs from whatever values the probes loaded.
    pub fn setup(&mut self) -> Result<()> {
        if self.values.is_empty() {
            return Err(Error::NotFound(
                "no hardware identity values loaded".to_string(),
            ));
        }
        for chain in CHAINS {
            let keys = chain.join("&");
            match self.guid_for_keys(&keys) {
                Ok(guid) => self.add_guid(&guid),
                Err(e) => debug!(keys = %keys, error = %e, "chain incomplete"),
            }
        }
        Ok(())
    }
}

/// Probe function signature; see the setup table in the context.
pub type HwidSetupFunc = fn(&mut Context, &mut HwidStore) -> Result<()>;

/// Seed values from the configuration overlay.
pub fn config_setup(ctx: &mut Context, store: &mut HwidStore) -> Result<()> {
    for (key, value) in &ctx.config().hwid_overrides {
        store.add_value(key, value);
    }
    Ok(())
}

fn apply_smbios(smbios: &Smbios, store: &mut HwidStore) {
    let map: &[(&str, u8, usize)] = &[
        (KEY_BIOS_VENDOR, smbios::TYPE_BIOS, 0x04),
        (KEY_BIOS_VERSION, smbios::TYPE_BIOS, 0x05),
        (KEY_MANUFACTURER, smbios::TYPE_SYSTEM, 0x04),
        (KEY_PRODUCT_NAME, smbios::TYPE_SYSTEM, 0x05),
        (KEY_PRODUCT_SKU, smbios::TYPE_SYSTEM, 0x19),
        (KEY_FAMILY, smbios::TYPE_SYSTEM, 0x1a),
        (KEY_BASEBOARD_MANUFACTURER, smbios::TYPE_BASEBOARD, 0x04),
        (KEY_BASEBOARD_PRODUCT, smbios::TYPE_BASEBOARD, 0x05),
    ];
    for (key, kind, offset) in map {
        if let Some(value) = smbios.string(*kind, *offset) {
            store.add_value(key, value);
        }
    }
    for (key, kind, offset) in [
        (KEY_BIOS_MAJOR_RELEASE, smbios::TYPE_BIOS, 0x14usize),
        (KEY_BIOS_MINOR_RELEASE, smbios::TYPE_BIOS, 0x15),
        (KEY_ENCLOSURE_KIND, smbios::TYPE_CHASSIS, 0x05),
    ] {
        if let Some(value) = smbios.integer(kind, offset) {
            store.add_value(key, &format!("{value:02}"));
        }
    }
}

/// Parse the kernel-exported SMBIOS table.
pub fn smbios_setup(ctx: &mut Context, store: &mut HwidStore) -> Result<()> {
    let smbios = Smbios::load_from_dir(ctx.smbios_table_dir())?;
    apply_smbios(&smbios, store);
    if let Some(value) = smbios.integer(smbios::TYPE_CHASSIS, 0x05) {
        ctx.set_chassis_kind(ChassisKind::from_raw(value));
    }
    ctx.set_smbios(smbios);
    Ok(())
}

/// Identity from the flat device tree, for boards without SMBIOS.
pub fn fdt_setup(ctx: &mut Context, store: &mut HwidStore) -> Result<()> {
    let fdt = ctx.fdt()?.clone();
    if let Some(model) = fdt.root_prop_str("model") {
        store.add_value(KEY_PRODUCT_NAME, &model);
    }
    if let Some(compatible) = fdt.root_prop_str("compatible") {
        // "vendor,board"
        match compatible.split_once(',') {
            Some((vendor, board)) => {
                store.add_value(KEY_MANUFACTURER, vendor);
                store.add_value(KEY_FAMILY, board);
            }
            None => store.add_value(KEY_MANUFACTURER, &compatible),
        }
    }
    Ok(())
}

pub(crate) fn apply_kenv(text: &str, store: &mut HwidStore) {
    let map: &[(&str, &str)] = &[
        ("smbios.bios.vendor", KEY_BIOS_VENDOR),
        ("smbios.bios.version", KEY_BIOS_VERSION),
        ("smbios.system.maker", KEY_MANUFACTURER),
        ("smbios.system.product", KEY_PRODUCT_NAME),
        ("smbios.system.sku", KEY_PRODUCT_SKU),
        ("smbios.system.family", KEY_FAMILY),
        ("smbios.planar.maker", KEY_BASEBOARD_MANUFACTURER),
        ("smbios.planar.product", KEY_BASEBOARD_PRODUCT),
    ];
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        if let Some((_, target)) = map.iter().find(|(k, _)| *k == key) {
            store.add_value(target, value);
        }
    }
}

/// Identity from the BSD kernel environment.
pub fn kenv_setup(_ctx: &mut Context, store: &mut HwidStore) -> Result<()> {
    let output = Command::new("kenv")
        .output()
        .map_err(|e| Error::NotSupported(format!("cannot run kenv: {e}")))?;
    if !output.status.success() {
        return Err(Error::NotSupported("kenv failed".to_string()));
    }
    apply_kenv(&String::from_utf8_lossy(&output.stdout), store);
    Ok(())
}

pub(crate) fn apply_dmi_dir(dir: &Path, store: &mut HwidStore) -> Result<()> {
    if !dir.is_dir() {
        return Err(Error::NotFound(format!("{}", dir.display())));
    }
    let map: &[(&str, &str)] = &[
        ("sys_vendor", KEY_MANUFACTURER),
        ("product_family", KEY_FAMILY),
        ("product_name", KEY_PRODUCT_NAME),
        ("product_sku", KEY_PRODUCT_SKU),
        ("bios_vendor", KEY_BIOS_VENDOR),
        ("bios_version", KEY_BIOS_VERSION),
        ("board_vendor", KEY_BASEBOARD_MANUFACTURER),
        ("board_name", KEY_BASEBOARD_PRODUCT),
        ("chassis_type", KEY_ENCLOSURE_KIND),
    ];
    for (file, key) in map {
        if let Ok(value) = std::fs::read_to_string(dir.join(file)) {
            store.add_value(key, value.trim());
        }
    }
    if let Ok(release) = std::fs::read_to_string(dir.join("bios_release")) {
        if let Some((major, minor)) = release.trim().split_once('.') {
            store.add_value(KEY_BIOS_MAJOR_RELEASE, major);
            store.add_value(KEY_BIOS_MINOR_RELEASE, minor);
        }
    }
    Ok(())
}

/// Identity from the kernel DMI class directory.
pub fn dmi_setup(ctx: &mut Context, store: &mut HwidStore) -> Result<()> {
    apply_dmi_dir(&ctx.dmi_class_dir().to_path_buf(), store)
}

/// Identity on Darwin, via sysctl.
pub fn darwin_setup(_ctx: &mut Context, store: &mut HwidStore) -> Result<()> {
    let output = Command::new("sysctl")
        .args(["-n", "hw.model"])
        .output()
        .map_err(|e| Error::NotSupported(format!("cannot run sysctl: {e}")))?;
    if !output.status.success() {
        return Err(Error::NotSupported("sysctl failed".to_string()));
    }
    let model = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if model.is_empty() {
        return Err(Error::NotFound("no hw.model".to_string()));
    }
    store.add_value(KEY_MANUFACTURER, "Apple Inc.");
    store.add_value(KEY_PRODUCT_NAME, &model);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> HwidStore {
        let mut store = HwidStore::new();
        store.add_value(KEY_MANUFACTURER, "ExampleCorp");
        store.add_value(KEY_FAMILY, "Widget");
        store.add_value(KEY_PRODUCT_NAME, "Widget Pro");
        store
    }

    #[test]
    fn test_first_writer_wins() {
        let mut store = HwidStore::new();
        store.add_value(KEY_MANUFACTURER, "FromConfig");
        store.add_value(KEY_MANUFACTURER, "FromSmbios");
        assert_eq!(store.value(KEY_MANUFACTURER), Some("FromConfig"));
    }

    #[test]
    fn test_replace_values() {
        let store = sample_store();
        assert_eq!(
            store
                .replace_values("Manufacturer&ProductName")
                .unwrap(),
            "ExampleCorp&Widget Pro"
        );
        assert!(matches!(
            store.replace_values("Manufacturer&ProductSku"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_hardware_id_alias() {
        let store = sample_store();
        assert_eq!(
            store.replace_keys("HardwareID-5"),
            "Manufacturer&Family&ProductName"
        );
        assert_eq!(store.replace_keys("HardwareID-14"), "Manufacturer");
        // unknown alias passes through untouched
        assert_eq!(store.replace_keys("HardwareID-99"), "HardwareID-99");
    }

    #[test]
    fn test_setup_derives_complete_chains() {
        let mut store = sample_store();
        store.setup().unwrap();
        // the 8-key chain is incomplete, the 3-key one is derivable
        let guid = store.guid_for_keys("HardwareID-5").unwrap();
        assert!(store.has_guid(&guid));
        assert!(!store.guids().is_empty());
        // most specific complete chain comes first
        assert_eq!(store.guids()[0], guid);
    }

    #[test]
    fn test_setup_without_values_fails() {
        let mut store = HwidStore::new();
        assert!(store.setup().is_err());
    }

    #[test]
    fn test_kenv_parse() {
        let mut store = HwidStore::new();
        apply_kenv(
            "smbios.system.maker=\"ExampleCorp\"\nsmbios.system.product=\"Widget\"\nunrelated=1\n",
            &mut store,
        );
        assert_eq!(store.value(KEY_MANUFACTURER), Some("ExampleCorp"));
        assert_eq!(store.value(KEY_PRODUCT_NAME), Some("Widget"));
    }

    #[test]
    fn test_dmi_dir_probe() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sys_vendor"), "ExampleCorp\n").unwrap();
        std::fs::write(dir.path().join("product_name"), "Widget Pro\n").unwrap();
        std::fs::write(dir.path().join("bios_release"), "1.7\n").unwrap();
        let mut store = HwidStore::new();
        apply_dmi_dir(dir.path(), &mut store).unwrap();
        assert_eq!(store.value(KEY_MANUFACTURER), Some("ExampleCorp"));
        assert_eq!(store.value(KEY_BIOS_MAJOR_RELEASE), Some("1"));
        assert_eq!(store.value(KEY_BIOS_MINOR_RELEASE), Some("7"));
    }

    #[test]
    fn test_guid_stability() {
        let store = sample_store();
        let a = store.guid_for_keys("Manufacturer").unwrap();
        let b = store.guid_for_keys("Manufacturer").unwrap();
        assert_eq!(a, b);
        assert!(crate::guid::is_guid(&a));
    }
}
