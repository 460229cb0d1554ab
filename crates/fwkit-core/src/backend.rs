//! Device backend abstraction.
//!
//! A backend enumerates hardware from one discovery mechanism (usb, udev,
//! bluez, ...). The context only cares about identity-by-name; backend
//! internals are the backend's business.

use crate::device::Device;
use crate::error::Result;

pub trait Backend: Send + Sync {
    /// Stable backend name, e.g. `usb` or `udev`.
    fn name(&self) -> &str;

    /// One-time initialization.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Enumerate the devices currently visible to this backend.
    fn coldplug(&mut self) -> Result<Vec<Device>> {
        Ok(Vec::new())
    }
}
