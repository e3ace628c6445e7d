// Umbrella crate: the public surface of the engine in one place. The
// member crates remain usable directly; this exists so a caller can
// depend on one name.

pub use sift_base::{err, Elem, ElemTy, Error, ErrorKind, Result};
pub use sift_index::{
    column_values, locate, range_join, rescan_bin, scan_column, scan_column_where, sidecar_path,
    BinIndex, BinSpan, BinSpec, Column, Edge, IndexSet, JoinResult, PairBitmap, RangePred,
    RunBitmap, Scale, SimpleColumn, DEFAULT_NBINS,
};
pub use sift_store::{
    AccessPreference, Array, Cleaner, FileManager, FileManagerConfig, MemLedger, Storage,
};
