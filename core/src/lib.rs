pub mod backup;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod index;
pub mod operations;
pub mod progress;
pub mod restore;
pub mod set;
pub mod store;
pub mod types;

pub use backup::{BackupEngine, BackupOptions, BackupReport};
pub use crypto::KeyMaterial;
pub use error::{Error, Result};
pub use index::{Index, IndexEntry};
pub use operations::{BackupSummary, RestoreSummary, SetFailure};
pub use progress::{CancelFlag, FileOutcome, NoopObserver, RunContext, RunObserver};
pub use restore::{RestoreEngine, RestoreOptions, RestoreReport};
pub use set::{BackupSet, BackupSetConfig};
pub use store::IndexStore;
pub use types::*;
