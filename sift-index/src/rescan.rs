use crate::bitmap::{IndexSet, RunBitmap};
use crate::column::Column;
use crate::pred::RangePred;
use sift_base::{err, with_elem_ty, Elem, ErrorKind, Result};
use sift_store::{Array, FileManager};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

// Edge-bin rescans against the bin-ordered sidecar. When an index is
// built with `reorder`, the column's values are rewritten grouped by
// bin into `<datafile>.bin`, so resolving a candidate bin touches only
// that bin's slice of the file instead of the whole column. The slice
// holds the bin's values in the row order of its bitmap, and the two
// are walked in lockstep.
//
// Sidecar layout: nobs as u32, then nobs+1 i32 absolute offsets, then
// the packed values; bin k's values occupy [offsets[k], offsets[k+1]).

/// `<datafile>.bin`.
pub fn sidecar_path(data: &Path) -> PathBuf {
    let mut os = data.as_os_str().to_os_string();
    os.push(".bin");
    PathBuf::from(os)
}

pub(crate) fn write_sidecar<T: Elem>(path: &Path, bins: &[Vec<T>]) -> Result<()> {
    let nobs = bins.len();
    let header = 4 + 4 * (nobs as u64 + 1);
    let mut buf = Vec::new();
    buf.extend_from_slice(&(nobs as u32).to_le_bytes());
    let mut off = header;
    buf.extend_from_slice(&(off as i32).to_le_bytes());
    for b in bins {
        off += (b.len() * T::SIZE) as u64;
        if off > i32::MAX as u64 {
            return Err(err(ErrorKind::SizeMismatch, "bin-ordered sidecar exceeds 2 GiB"));
        }
        buf.extend_from_slice(&(off as i32).to_le_bytes());
    }
    for b in bins {
        for &v in b {
            v.write_le(&mut buf);
        }
    }
    let mut file = File::create(path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    debug!(target: "sift", path = %path.display(), bytes = buf.len(), "sidecar written");
    Ok(())
}

/// Resolve one candidate bin: of the rows in the mask (the bin's
/// bitmap, or any bitmap with one bit per sidecar value), keep those
/// whose value satisfies the predicate. Errors mean the sidecar is
/// missing or does not line up; the caller falls back to the raw
/// column.
pub fn rescan_bin(
    col: &dyn Column,
    mgr: &FileManager,
    k: usize,
    mask: &RunBitmap,
    pred: &RangePred,
) -> Result<RunBitmap> {
    with_elem_ty!(col.elem_ty(), T, rescan_typed::<T>(col, mgr, k, mask, pred))
}

fn rescan_typed<T: Elem>(
    col: &dyn Column,
    mgr: &FileManager,
    k: usize,
    mask: &RunBitmap,
    pred: &RangePred,
) -> Result<RunBitmap> {
    let data = col
        .data_path()
        .ok_or_else(|| err(ErrorKind::NotFound, "column has no data file"))?;
    let side = sidecar_path(data);

    let head = mgr.get_file_segment(&side, None, 0, 4)?;
    if head.len() != 4 {
        return Err(err(ErrorKind::BadHeader, "sidecar shorter than its bin count"));
    }
    let nobs = u32::from_le_bytes(head.bytes().try_into().unwrap()) as usize;
    if k >= nobs {
        return Err(err(ErrorKind::BadOffsets, format!("bin {} of {} in sidecar", k, nobs)));
    }

    let at = 4 + 4 * k as u64;
    let offs = mgr.get_file_segment(&side, None, at, at + 8)?;
    if offs.len() != 8 {
        return Err(err(ErrorKind::BadOffsets, "sidecar truncated in its offsets"));
    }
    let b = i32::from_le_bytes(offs.bytes()[0..4].try_into().unwrap());
    let e = i32::from_le_bytes(offs.bytes()[4..8].try_into().unwrap());
    if b < 0 || e < b || (e - b) as usize % T::SIZE != 0 {
        return Err(err(ErrorKind::BadOffsets, format!("sidecar bin {} spans [{}, {})", k, b, e)));
    }

    let nvals = (e - b) as usize / T::SIZE;
    if nvals as u32 != mask.count() {
        return Err(err(
            ErrorKind::SizeMismatch,
            format!("sidecar bin {} holds {} values, mask has {} rows", k, nvals, mask.count()),
        ));
    }
    if nvals == 0 {
        return Ok(RunBitmap::with_size(col.rows()));
    }

    let seg = mgr.get_file_segment(&side, None, b as u64, e as u64)?;
    if seg.len() != (e - b) as usize {
        return Err(err(ErrorKind::IoShort, "sidecar values cut short"));
    }
    let vals: Array<T> = Array::shared(Arc::new(seg), 0, (e - b) as usize)?;

    // Walk the mask's index sets and the value slice in lockstep.
    let mut out = RunBitmap::with_size(col.rows());
    let mut vi = 0;
    for span in mask.index_sets() {
        match span {
            IndexSet::Single(r) => {
                if pred.contains(vals.get(vi).to_f64()) {
                    out.set(r);
                }
                vi += 1;
            }
            IndexSet::Range(rb, re) => {
                for r in rb..re {
                    if pred.contains(vals.get(vi).to_f64()) {
                        out.set(r);
                    }
                    vi += 1;
                }
            }
        }
    }
    out.adjust_size(col.rows());
    debug!(target: "sift", bin = k, %pred, hits = out.count(), "sidecar rescan");
    Ok(out)
}
