pub mod backend;
pub mod cache;
pub mod records;
pub mod remote;
pub mod sync;

pub use backend::StoreBackend;
pub use cache::{CacheScope, ReadCache};
pub use records::RecordStore;
pub use remote::{HttpReplica, RemoteChange, RemoteReplica};
pub use sync::{
    ConflictWinner, CycleReport, SyncCursor, SyncEvent, SyncHealth, SyncPhase, SyncService,
};
