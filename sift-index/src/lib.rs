// The equality-encoded binned bitmap index.
//
// A numeric column's value range is cut into bins; each bin holds a
// compressed bitmap of the rows whose value fell in its interval, plus
// the observed min and max of those values. A range predicate then
// reduces to OR-ing a contiguous run of bitmaps, with at most one bin
// per predicate edge rescanned against raw values to separate hits from
// near-misses. The bin-ordered sidecar (`<datafile>.bin`) makes those
// rescans touch only the candidate bin's values.
//
// Layering:
//
//   bitmap  - the bitvector collaborator: run-list bitmaps with union /
//             intersect / subtract / flip, serialization, and index-set
//             iteration
//   pred    - range and value-list predicates
//   column  - the column collaborator interface and raw-data scans
//   spec    - index-spec parsing and bin-boundary derivation
//   binned  - the index itself: build, persist, load, evaluate, append
//   rescan  - candidate-bin resolution against the bin-ordered sidecar
//   join    - bin-level range joins between two indexes

#[cfg(test)]
mod test;

mod binned;
mod bitmap;
mod column;
mod join;
mod pred;
mod rescan;
mod spec;

pub use binned::{BinIndex, BinSpan};
pub use bitmap::{IndexSet, RunBitmap};
pub use column::{column_values, scan_column, scan_column_where, Column, SimpleColumn};
pub use join::{range_join, JoinResult, PairBitmap};
pub use pred::{Edge, RangePred};
pub use rescan::{rescan_bin, sidecar_path};
pub use spec::{locate, BinSpec, Scale, DEFAULT_NBINS};
