//! fwkit-core: shared state for a firmware-update platform.
//!
//! This crate provides the runtime registry an update engine and its
//! device plugins share: hardware identity, quirk overlays, the device
//! tree, backend registration and EFI System Partition discovery.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Quirks**: GUID-keyed configuration overlay database
//! - **Hwids**: hardware identity values, probes and chained GUIDs
//! - **Storage**: volume model, providers (lsblk, mock), scoped mounts
//! - **Efivars**: EFI variable store and boot-manager load options
//! - **Device**: the device forest and identity propagation
//! - **Context**: the aggregator everything else hangs off
//!
//! # Example
//!
//! ```no_run
//! use fwkit_core::context::{Context, HwidLoadFlags};
//! use fwkit_core::progress::Progress;
//!
//! let mut ctx = Context::new();
//! ctx.load_quirks().expect("quirk load never hard-fails");
//! let mut progress = Progress::new();
//! ctx.load_hwinfo(&mut progress, HwidLoadFlags::SMBIOS | HwidLoadFlags::DMI)
//!     .expect("hwinfo");
//! for guid in ctx.hwid_guids() {
//!     println!("{guid}");
//! }
//! ```

pub mod backend;
pub mod bios;
pub mod config;
pub mod context;
pub mod device;
pub mod efivars;
pub mod error;
pub mod events;
pub mod fdt;
pub mod guid;
pub mod hwids;
pub mod pefile;
pub mod progress;
pub mod quirks;
pub mod smbios;
pub mod storage;

// Re-exports for convenience
pub use backend::Backend;
pub use context::{
    BATTERY_LEVEL_INVALID, Context, ContextFlags, DisplayState, EspFileFlags, HwidLoadFlags,
    LidState, PowerState,
};
pub use device::{Device, DeviceEvent, DeviceRegistry};
pub use error::{Error, Result};
pub use events::{ContextEvent, ContextObserver, NullObserver, TracingObserver};
pub use hwids::HwidStore;
pub use progress::Progress;
pub use quirks::{QuirkSource, QuirkStore};
pub use storage::{MountGuard, PartitionKind, StorageProvider, Volume};
