//! Device model and the device tree registry.
//!
//! Devices form a forest. The registry is the single owner; parent links
//! are ids, never a second strong reference, so removal and re-parenting
//! cannot leak cycles. Sibling iteration order during update planning is
//! controlled purely by the explicit order value.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::guid;

/// Kind of user-visible request a device can raise during an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestKind {
    /// Must be acted on now, e.g. "press the unlock button".
    Immediate,
    /// Shown after the update completes, e.g. "replug the dock".
    Post,
}

/// An opaque record of something the device did, kept for deterministic
/// replay. Order of insertion is the only guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    id: String,
    data: BTreeMap<String, String>,
}

impl DeviceEvent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_data(&mut self, key: &str, value: &str) {
        self.data.insert(key.to_string(), value.to_string());
    }

    pub fn data(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

/// A catalog component: metadata about a logical piece of updatable
/// hardware, as published in a remote metadata feed.
#[derive(Debug, Clone, Default)]
pub struct Component {
    pub id: String,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub vendor: Option<String>,
    pub guids: Vec<String>,
    pub releases: Vec<Release>,
}

/// One published firmware release of a component.
#[derive(Debug, Clone, Default)]
pub struct Release {
    pub version: String,
    pub summary: Option<String>,
}

/// A node in the device forest.
#[derive(Debug, Clone, Default)]
pub struct Device {
    id: String,
    name: Option<String>,
    summary: Option<String>,
    vendor: Option<String>,
    version: Option<String>,
    guids: Vec<String>,
    parent_guids: Vec<String>,
    parent_physical_ids: Vec<String>,
    parent_backend_ids: Vec<String>,
    parent_id: Option<String>,
    children: Vec<String>,
    order: i64,
    events: Vec<DeviceEvent>,
    requests: BTreeMap<RequestKind, u32>,
    target_id: Option<String>,
}

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary = Some(summary.into());
    }

    pub fn vendor(&self) -> Option<&str> {
        self.vendor.as_deref()
    }

    pub fn set_vendor(&mut self, vendor: impl Into<String>) {
        self.vendor = Some(vendor.into());
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.version = Some(version.into());
    }

    /// Add an identity string: either a canonical GUID or a raw instance
    /// id awaiting conversion.
    pub fn add_guid(&mut self, value: &str) {
        let value = value.to_string();
        if !self.guids.contains(&value) {
            self.guids.push(value);
        }
    }

    pub fn guids(&self) -> &[String] {
        &self.guids
    }

    pub fn has_guid(&self, value: &str) -> bool {
        self.guids.iter().any(|g| g == value)
    }

    /// Convert any raw instance ids in the identity set to canonical
    /// GUIDs. Already-converted entries are left untouched, so calling
    /// this twice is a no-op.
    pub fn convert_instance_ids(&mut self) {
        let mut converted = Vec::with_capacity(self.guids.len());
        for value in self.guids.drain(..) {
            let value = if guid::is_guid(&value) {
                value
            } else {
                guid::from_string(&value)
            };
            if !converted.contains(&value) {
                converted.push(value);
            }
        }
        self.guids = converted;
    }

    pub fn add_parent_guid(&mut self, value: &str) {
        let value = if guid::is_guid(value) {
            value.to_string()
        } else {
            guid::from_string(value)
        };
        if !self.parent_guids.contains(&value) {
            self.parent_guids.push(value);
        }
    }

    /// Whether the device declared `value` as a compatible parent
    /// identity. This is about declared identity sets, not about the
    /// actual attached parent object.
    pub fn has_parent_guid(&self, value: &str) -> bool {
        self.parent_guids.iter().any(|g| g == value)
    }

    pub fn parent_guids(&self) -> &[String] {
        &self.parent_guids
    }

    pub fn add_parent_physical_id(&mut self, value: &str) {
        if !self.parent_physical_ids.iter().any(|v| v == value) {
            self.parent_physical_ids.push(value.to_string());
        }
    }

    pub fn has_parent_physical_id(&self, value: &str) -> bool {
        self.parent_physical_ids.iter().any(|v| v == value)
    }

    pub fn parent_physical_ids(&self) -> &[String] {
        &self.parent_physical_ids
    }

    pub fn add_parent_backend_id(&mut self, value: &str) {
        if !self.parent_backend_ids.iter().any(|v| v == value) {
            self.parent_backend_ids.push(value.to_string());
        }
    }

    pub fn has_parent_backend_id(&self, value: &str) -> bool {
        self.parent_backend_ids.iter().any(|v| v == value)
    }

    pub fn parent_backend_ids(&self) -> &[String] {
        &self.parent_backend_ids
    }

    /// Id of the owning parent in the registry, if attached.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }

    /// Explicit ordering among siblings during update sequencing.
    pub fn order(&self) -> i64 {
        self.order
    }

    pub fn set_order(&mut self, order: i64) {
        self.order = order;
    }

    pub fn add_event(&mut self, event: DeviceEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[DeviceEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn add_request(&mut self, kind: RequestKind) {
        *self.requests.entry(kind).or_insert(0) += 1;
    }

    pub fn request_count(&self, kind: RequestKind) -> u32 {
        self.requests.get(&kind).copied().unwrap_or(0)
    }

    /// Device used for proxying operations, if any.
    pub fn target_id(&self) -> Option<&str> {
        self.target_id.as_deref()
    }

    pub fn set_target_id(&mut self, id: Option<String>) {
        self.target_id = id;
    }

    /// Merge state from a donor discovered through another enumeration
    /// path. Identity sets union, events append, descriptive fields fill
    /// gaps only.
    pub fn replace(&mut self, donor: &Device) {
        for value in &donor.guids {
            self.add_guid(value);
        }
        for value in &donor.parent_guids {
            if !self.parent_guids.contains(value) {
                self.parent_guids.push(value.clone());
            }
        }
        for value in &donor.parent_physical_ids {
            self.add_parent_physical_id(value);
        }
        for value in &donor.parent_backend_ids {
            self.add_parent_backend_id(value);
        }
        self.events.extend(donor.events.iter().cloned());
        for (kind, count) in &donor.requests {
            *self.requests.entry(*kind).or_insert(0) += count;
        }
        if self.name.is_none() {
            self.name = donor.name.clone();
        }
        if self.summary.is_none() {
            self.summary = donor.summary.clone();
        }
        if self.vendor.is_none() {
            self.vendor = donor.vendor.clone();
        }
        if self.version.is_none() {
            self.version = donor.version.clone();
        }
    }

    /// Fill descriptive gaps from catalog metadata; explicit state is
    /// never overwritten.
    pub fn ensure_from_component(&mut self, component: &Component) {
        self.incorporate_from_component(component, false);
    }

    /// Apply catalog metadata; with `force` explicit state is replaced.
    pub fn incorporate_from_component(&mut self, component: &Component, force: bool) {
        if force || self.name.is_none() {
            self.name = component.name.clone().or_else(|| self.name.clone());
        }
        if force || self.summary.is_none() {
            self.summary = component.summary.clone().or_else(|| self.summary.clone());
        }
        if force || self.vendor.is_none() {
            self.vendor = component.vendor.clone().or_else(|| self.vendor.clone());
        }
    }

    /// Fill the version gap from a specific release.
    pub fn ensure_from_release(&mut self, release: &Release) {
        if self.version.is_none() {
            self.version = Some(release.version.clone());
        }
        if self.summary.is_none() {
            self.summary = release.summary.clone();
        }
    }
}

/// The device forest. Owns every device; all structural mutation goes
/// through here.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device. If a device with the same id already exists the
    /// existing one absorbs the newcomer's state.
    pub fn add(&mut self, device: Device) {
        if let Some(existing) = self.devices.get_mut(device.id()) {
            debug!(id = %device.id(), "merging duplicate device");
            existing.replace(&device);
            return;
        }
        self.devices.insert(device.id().to_string(), device);
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Ids of all devices. Callers mutating during iteration must iterate
    /// this snapshot, not the registry.
    pub fn ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Reassign ownership. `None` detaches the device, making it a root.
    pub fn set_parent(&mut self, id: &str, parent_id: Option<&str>) -> Result<()> {
        if !self.devices.contains_key(id) {
            return Err(Error::NotFound(format!("no device {id}")));
        }
        if let Some(parent_id) = parent_id {
            if parent_id == id {
                return Err(Error::Internal(format!(
                    "cannot parent {id} to itself"
                )));
            }
            if !self.devices.contains_key(parent_id) {
                return Err(Error::NotFound(format!("no device {parent_id}")));
            }
        }

        // detach from the previous parent
        let old_parent = self.devices.get(id).and_then(|d| d.parent_id.clone());
        if let Some(old_parent) = old_parent {
            if let Some(parent) = self.devices.get_mut(&old_parent) {
                parent.children.retain(|c| c != id);
            }
        }

        if let Some(parent_id) = parent_id {
            let parent = self.devices.get_mut(parent_id).unwrap();
            if !parent.children.iter().any(|c| c == id) {
                parent.children.push(id.to_string());
            }
        }
        self.devices.get_mut(id).unwrap().parent_id = parent_id.map(str::to_string);
        Ok(())
    }

    /// Children of a device, sorted by (order, id) for deterministic
    /// update sequencing.
    pub fn children_of(&self, id: &str) -> Vec<&Device> {
        let Some(device) = self.devices.get(id) else {
            return Vec::new();
        };
        let mut children: Vec<&Device> = device
            .children
            .iter()
            .filter_map(|c| self.devices.get(c))
            .collect();
        children.sort_by(|a, b| a.order().cmp(&b.order()).then(a.id().cmp(b.id())));
        children
    }

    /// Root devices, sorted by (order, id).
    pub fn roots(&self) -> Vec<&Device> {
        let mut roots: Vec<&Device> = self
            .devices
            .values()
            .filter(|d| d.parent_id.is_none())
            .collect();
        roots.sort_by(|a, b| a.order().cmp(&b.order()).then(a.id().cmp(b.id())));
        roots
    }

    /// Remove a device and its whole subtree. Returns the removed ids.
    pub fn remove(&mut self, id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        let mut queue = vec![id.to_string()];
        while let Some(current) = queue.pop() {
            if let Some(device) = self.devices.remove(&current) {
                queue.extend(device.children.iter().cloned());
                removed.push(current);
            }
        }
        // drop the back-reference from the parent, if any survived
        if let Some(first) = removed.first() {
            for device in self.devices.values_mut() {
                device.children.retain(|c| c != first);
            }
        }
        removed
    }
}
