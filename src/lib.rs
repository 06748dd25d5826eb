// Library interface for chainmirror
// The node binary and the integration tests both go through these modules.

pub mod chain;
pub mod config;
pub mod crypto;
pub mod explorer;
pub mod finalize;
pub mod ledger;
pub mod mapping;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod program;
pub mod protocol;
pub mod storage;

pub use explorer::{ChainHandle, Explorer, ExplorerMessage};
pub use finalize::{Finalizer, FinalizeError};
pub use mapping::{MappingStore, MappingTxn};
pub use peer::{PeerConnection, PeerSession};
pub use storage::Store;
