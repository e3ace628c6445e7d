use crate::bitmap::RunBitmap;
use crate::pred::RangePred;
use sift_base::{err, with_elem_ty, Elem, ElemTy, ErrorKind, Result};
use sift_store::{AccessPreference, Array, FileManager};
use std::path::{Path, PathBuf};
use tracing::debug;

// The column/partition collaborator. The engine consumes a column as an
// element type, a row count, a mask of non-null rows, and the location
// of the packed data file; everything else about partitions lives
// elsewhere.

pub trait Column: Send + Sync {
    fn elem_ty(&self) -> ElemTy;
    fn rows(&self) -> u32;
    /// Mask of rows holding a value (the complement of the null mask).
    fn live_rows(&self) -> &RunBitmap;
    /// Location of the packed data file, when the column has one.
    fn data_path(&self) -> Option<&Path>;
}

/// Fetch the column's values as a typed view through the file cache.
pub fn column_values<T: Elem>(col: &dyn Column, mgr: &FileManager) -> Result<Array<T>> {
    if T::TY != col.elem_ty() {
        return Err(err(
            ErrorKind::UnsupportedType,
            format!("column holds {}, asked for {}", col.elem_ty(), T::TY),
        ));
    }
    let path = col
        .data_path()
        .ok_or_else(|| err(ErrorKind::NotFound, "column has no data file"))?;
    let st = mgr.get_file(path, AccessPreference::MmapLargeFiles)?;
    let need = col.rows() as usize * T::SIZE;
    if st.len() < need {
        return Err(err(
            ErrorKind::SizeMismatch,
            format!("{} rows need {} bytes, file has {}", col.rows(), need, st.len()),
        ));
    }
    Array::shared(st, 0, need)
}

/// Direct scan of the raw column data: the subset of masked rows whose
/// value satisfies the predicate. The fallback when the index cannot
/// answer.
pub fn scan_column(
    col: &dyn Column,
    mgr: &FileManager,
    pred: &RangePred,
    mask: &RunBitmap,
) -> Result<RunBitmap> {
    let hits = scan_column_where(col, mgr, mask, |v| pred.contains(v))?;
    debug!(target: "sift", %pred, considered = mask.count(), hits = hits.count(), "column scan");
    Ok(hits)
}

/// As scan_column, for an arbitrary value test.
pub fn scan_column_where(
    col: &dyn Column,
    mgr: &FileManager,
    mask: &RunBitmap,
    test: impl Fn(f64) -> bool,
) -> Result<RunBitmap> {
    with_elem_ty!(col.elem_ty(), T, scan_typed::<T>(col, mgr, mask, &test))
}

fn scan_typed<T: Elem>(
    col: &dyn Column,
    mgr: &FileManager,
    mask: &RunBitmap,
    test: &impl Fn(f64) -> bool,
) -> Result<RunBitmap> {
    let vals = column_values::<T>(col, mgr)?;
    let mut out = RunBitmap::with_size(col.rows());
    for row in mask.ones() {
        if test(vals.get(row as usize).to_f64()) {
            out.set(row);
        }
    }
    out.adjust_size(col.rows());
    Ok(out)
}

/// A minimal file-backed column: enough of the collaborator for the
/// engine and its tests.
pub struct SimpleColumn {
    ty: ElemTy,
    rows: u32,
    live: RunBitmap,
    path: PathBuf,
}

impl SimpleColumn {
    /// A column with no nulls over an existing packed data file.
    pub fn new(ty: ElemTy, rows: u32, path: PathBuf) -> SimpleColumn {
        SimpleColumn { ty, rows, live: RunBitmap::all_ones(rows), path }
    }

    /// As new, with an explicit mask of non-null rows.
    pub fn with_live_rows(ty: ElemTy, rows: u32, live: RunBitmap, path: PathBuf) -> SimpleColumn {
        SimpleColumn { ty, rows, live, path }
    }

    /// Write the values as a packed file and wrap it as a column.
    pub fn from_values<T: Elem>(path: PathBuf, values: &[T]) -> Result<SimpleColumn> {
        let arr = Array::from_vec(values.to_vec());
        arr.write(&path)?;
        Ok(SimpleColumn::new(T::TY, values.len() as u32, path))
    }
}

impl Column for SimpleColumn {
    fn elem_ty(&self) -> ElemTy {
        self.ty
    }

    fn rows(&self) -> u32 {
        self.rows
    }

    fn live_rows(&self) -> &RunBitmap {
        &self.live
    }

    fn data_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
