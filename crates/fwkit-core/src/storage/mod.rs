//! Storage layer - volume model and block-device providers.
//!
//! The provider trait allows different implementations (lsblk, mock),
//! keeping the volume-scoring logic testable without real hardware.

pub mod lsblk;
pub mod mock;
pub mod traits;
pub mod volume;

pub use lsblk::SystemStorage;
pub use mock::MockStorage;
pub use traits::{BlockDevice, MountGuard, StorageError, StorageProvider};
pub use volume::{PartitionKind, Volume};
