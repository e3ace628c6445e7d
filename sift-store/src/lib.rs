// Reference-counted storage and the process-wide file cache.
//
// Every large in-memory array in the engine is backed by a Storage: one
// contiguous byte region that is either a heap buffer, a read-only file
// mapping, or a borrowed region the storage never frees. Storages are
// shared through Arc; a storage with outstanding references (anything
// beyond the manager's own table entry) is pinned and cannot be evicted
// or mutated.
//
// The FileManager keys storages by absolute path in two tables (mapped
// and incore), tracks the byte total of everything it has handed out
// through a shared ledger, and evicts the least valuable zero-reference
// entries when a new acquisition would exceed the byte budget.
//
// Array<T> is the typed view layer: either a private Vec<T> or a shallow
// (storage, offset, length) view decoding little-endian elements in
// place. Mutation of a shared view first un-shares by copying.


mod array;
mod manager;
mod storage;

pub use array::Array;
pub use manager::{AccessPreference, Cleaner, FileManager, FileManagerConfig};
pub use storage::{MemLedger, Storage};
