use crate::bitmap::RunBitmap;
use crate::column::{column_values, scan_column_where, Column};
use crate::pred::{Edge, RangePred};
use crate::rescan;
use crate::spec::{locate, BinSpec};
use ordered_float::OrderedFloat;
use sift_base::{err, with_elem_ty, Elem, ElemTy, ErrorKind, Result};
use sift_store::{AccessPreference, FileManager, Storage};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

// The equality-encoded binned index. The value range is cut into bins;
// bin i owns the half-open interval [bounds[i-1], bounds[i]) and a
// bitmap of the rows whose value landed there. minval/maxval record the
// observed extremes inside each bin, which are often much tighter than
// the nominal interval and let predicate evaluation skip edge rescans.
//
// The last bound is always the +inf sentinel, so locate() never falls
// off the end. Bins that receive no rows are coalesced out after
// construction. A loaded index keeps the whole file storage and
// materializes individual bitmaps on first use.

const MAGIC: &[u8; 6] = b"#IBIS\0";
const KIND_BINNING: u8 = 1;
const HEADER_LEN: u64 = 16;

#[derive(Debug)]
pub struct BinIndex {
    ty: ElemTy,
    nrows: u32,
    /// Right edge of each bin; strictly ascending, last is +inf.
    bounds: Vec<f64>,
    minval: Vec<f64>,
    maxval: Vec<f64>,
    /// Lazily materialized per-bin bitmaps.
    bits: Vec<Option<RunBitmap>>,
    /// Absolute file position of each serialized bitmap, plus the end.
    offsets: Vec<u64>,
    /// Backing index file, present after read(); pins the bytes the
    /// lazy bitmaps decode from.
    file: Option<Arc<Storage>>,
}

/// The four bin indices a range predicate decomposes into: bins
/// [hit0, hit1) are entirely inside, bins [cand0, hit0) and
/// [hit1, cand1) straddle an edge and need a rescan.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BinSpan {
    pub cand0: usize,
    pub hit0: usize,
    pub hit1: usize,
    pub cand1: usize,
}

impl BinIndex {
    // ------------------------------------------------------------------
    // construction

    /// Build from raw column data, deriving boundaries from the spec.
    pub fn build(
        col: &dyn Column,
        spec: &BinSpec,
        mgr: &FileManager,
    ) -> Result<BinIndex> {
        with_elem_ty!(col.elem_ty(), T, Self::build_typed::<T>(col, spec, mgr))
    }

    fn build_typed<T: Elem>(
        col: &dyn Column,
        spec: &BinSpec,
        mgr: &FileManager,
    ) -> Result<BinIndex> {
        let nrows = col.rows();
        let live = col.live_rows();
        if live.count() == 0 {
            return Ok(BinIndex::empty(col.elem_ty(), nrows));
        }
        let vals = column_values::<T>(col, mgr)?;

        // First pass: extremes, and the distinct-value histogram when
        // the spec needs one.
        let mut vmin = f64::INFINITY;
        let mut vmax = f64::NEG_INFINITY;
        let mut hist: Option<BTreeMap<OrderedFloat<f64>, u32>> =
            spec.needs_histogram().then(BTreeMap::new);
        for row in live.ones() {
            let v = vals.get(row as usize).to_f64();
            if v.is_nan() {
                continue;
            }
            vmin = vmin.min(v);
            vmax = vmax.max(v);
            if let Some(h) = &mut hist {
                *h.entry(OrderedFloat(v)).or_insert(0) += 1;
            }
        }
        let hist_vec: Option<Vec<(f64, u32)>> =
            hist.map(|h| h.into_iter().map(|(v, c)| (v.0, c)).collect());
        let bounds = spec.bounds(col.elem_ty(), vmin, vmax, hist_vec.as_deref())?;

        Self::build_with_bounds_typed::<T>(col, mgr, bounds, spec.reorder, true)
    }

    /// Build over caller-supplied boundaries. Used by append, which
    /// must reproduce an existing bin structure exactly, so empty bins
    /// are kept.
    pub fn build_with_bounds(
        col: &dyn Column,
        bounds: &[f64],
        mgr: &FileManager,
    ) -> Result<BinIndex> {
        with_elem_ty!(
            col.elem_ty(),
            T,
            Self::build_with_bounds_typed::<T>(col, mgr, bounds.to_vec(), false, false)
        )
    }

    fn build_with_bounds_typed<T: Elem>(
        col: &dyn Column,
        mgr: &FileManager,
        bounds: Vec<f64>,
        reorder: bool,
        coalesce: bool,
    ) -> Result<BinIndex> {
        let nrows = col.rows();
        let live = col.live_rows();
        let vals = column_values::<T>(col, mgr)?;
        let nobs = bounds.len();
        let mut bits: Vec<RunBitmap> = vec![RunBitmap::new(); nobs];
        let mut minval = vec![f64::INFINITY; nobs];
        let mut maxval = vec![f64::NEG_INFINITY; nobs];
        let mut scratch: Option<Vec<Vec<T>>> = reorder.then(|| vec![Vec::new(); nobs]);

        for row in live.ones() {
            let v = vals.get(row as usize);
            let vf = v.to_f64();
            let k = locate(&bounds, vf);
            if k >= nobs {
                continue;
            }
            bits[k].set(row);
            if !vf.is_nan() {
                minval[k] = minval[k].min(vf);
                maxval[k] = maxval[k].max(vf);
            }
            if let Some(s) = &mut scratch {
                s[k].push(v);
            }
        }

        let mut idx = BinIndex {
            ty: col.elem_ty(),
            nrows,
            bounds,
            minval,
            maxval,
            bits: Vec::new(),
            offsets: Vec::new(),
            file: None,
        };

        // Floating-point boundaries tighten to the gap actually
        // observed between adjacent bins. Only on fresh builds: a
        // rebuild over caller-supplied boundaries must reproduce them
        // bit for bit.
        if !idx.ty.is_integer() && coalesce {
            idx.retighten();
        }

        for b in &mut bits {
            b.adjust_size(nrows);
        }
        idx.bits = bits.into_iter().map(Some).collect();

        if coalesce {
            // The sidecar's bin slices must track the surviving bins.
            if let Some(keep) = idx.coalesce() {
                if let Some(s) = &mut scratch {
                    *s = keep.iter().map(|&i| std::mem::take(&mut s[i])).collect();
                }
            }
        }
        idx.compute_offsets();

        if let Some(s) = scratch {
            let data = col.data_path().ok_or_else(|| {
                err(ErrorKind::NotFound, "reorder needs a column data file to sit beside")
            })?;
            rescan::write_sidecar::<T>(&rescan::sidecar_path(data), &s)?;
        }
        debug!(target: "sift", nrows, nobs = idx.nobs(), ty = %idx.ty, "index built");
        Ok(idx)
    }

    fn empty(ty: ElemTy, nrows: u32) -> BinIndex {
        BinIndex {
            ty,
            nrows,
            bounds: Vec::new(),
            minval: Vec::new(),
            maxval: Vec::new(),
            bits: Vec::new(),
            offsets: vec![0],
            file: None,
        }
    }

    /// Replace each interior boundary with the most compact value that
    /// still separates the observed maximum below it from the observed
    /// minimum above it. A tightened edge never crosses the previous
    /// one; when it would, the original boundary stays.
    fn retighten(&mut self) {
        for i in 0..self.bounds.len().saturating_sub(1) {
            let lo = self.maxval[i];
            let hi = self.minval[i + 1];
            if !lo.is_finite() || !hi.is_finite() || lo >= hi {
                continue;
            }
            let c = compact_value(lo, hi);
            let floor = if i == 0 { f64::NEG_INFINITY } else { self.bounds[i - 1] };
            if c > floor && c > lo && c <= hi {
                self.bounds[i] = c;
            }
        }
    }

    /// Drop bins whose bitmap is empty, shifting bounds, minval, maxval
    /// and bits down in lock-step. The surviving last bound becomes the
    /// +inf sentinel. Returns the kept indices when anything moved.
    fn coalesce(&mut self) -> Option<Vec<usize>> {
        let keep: Vec<usize> = (0..self.bounds.len())
            .filter(|&i| self.bits[i].as_ref().is_some_and(|b| !b.is_empty()))
            .collect();
        if keep.len() == self.bounds.len() {
            // The sentinel still has to be restored when the last bound
            // was a finite user-supplied edge.
            if let Some(last) = self.bounds.last_mut() {
                *last = f64::INFINITY;
            }
            return None;
        }
        let mut bounds = Vec::with_capacity(keep.len());
        let mut minval = Vec::with_capacity(keep.len());
        let mut maxval = Vec::with_capacity(keep.len());
        let mut bits = Vec::with_capacity(keep.len());
        for &i in &keep {
            bounds.push(self.bounds[i]);
            minval.push(self.minval[i]);
            maxval.push(self.maxval[i]);
            bits.push(self.bits[i].take());
        }
        if let Some(last) = bounds.last_mut() {
            *last = f64::INFINITY;
        }
        self.bounds = bounds;
        self.minval = minval;
        self.maxval = maxval;
        self.bits = bits;
        Some(keep)
    }

    fn compute_offsets(&mut self) {
        let lens: Vec<u64> = self
            .bits
            .iter()
            .map(|b| b.as_ref().map(|b| b.serialized_len() as u64).unwrap_or(0))
            .collect();
        let (_, base) = Self::layout(self.nobs(), lens.iter().sum());
        let mut offsets = Vec::with_capacity(self.nobs() + 1);
        let mut at = base;
        offsets.push(at);
        for len in lens {
            at += len;
            offsets.push(at);
        }
        self.offsets = offsets;
    }

    /// Offset width and first-bitmap position for a given bin count and
    /// total bitmap length. Four-byte offsets unless the file would
    /// reach 2 GiB.
    fn layout(nobs: usize, body: u64) -> (u8, u64) {
        let pad8 = |x: u64| (x + 7) & !7;
        let arrays = 24 * nobs as u64;
        let base4 = pad8(HEADER_LEN + 4 * (nobs as u64 + 1)) + arrays;
        if base4 + body < (1 << 31) {
            (4, base4)
        } else {
            (8, pad8(HEADER_LEN + 8 * (nobs as u64 + 1)) + arrays)
        }
    }

    // ------------------------------------------------------------------
    // accessors

    pub fn elem_ty(&self) -> ElemTy {
        self.ty
    }

    pub fn nrows(&self) -> u32 {
        self.nrows
    }

    pub fn nobs(&self) -> usize {
        self.bounds.len()
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    pub fn min_seen(&self) -> &[f64] {
        &self.minval
    }

    pub fn max_seen(&self) -> &[f64] {
        &self.maxval
    }

    pub(crate) fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Popcount of one bin, materializing it if needed.
    pub fn bin_count(&mut self, i: usize) -> Result<u32> {
        Ok(self.activate(i)?.count())
    }

    /// The rows of one bin, materializing its bitmap if needed.
    pub fn bin_rows(&mut self, i: usize) -> Result<RunBitmap> {
        Ok(self.activate(i)?.clone())
    }

    /// Per-bin populations.
    pub fn bin_weights(&mut self) -> Result<Vec<u32>> {
        (0..self.nobs()).map(|i| self.bin_count(i)).collect()
    }

    /// Running totals of the per-bin populations: an approximate
    /// cumulative distribution over the bin boundaries.
    pub fn cumulative_weights(&mut self) -> Result<Vec<u32>> {
        let mut acc = 0;
        self.bin_weights()?
            .into_iter()
            .map(|w| {
                acc += w;
                Ok(acc)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // activation

    pub(crate) fn activate(&mut self, i: usize) -> Result<&RunBitmap> {
        if self.bits[i].is_none() {
            let file = self.file.as_ref().ok_or_else(|| {
                err(ErrorKind::InternalInvariant, "inactive bitmap with no backing file")
            })?;
            let span = self.offsets[i] as usize..self.offsets[i + 1] as usize;
            let bm = RunBitmap::deserialize(&file.bytes()[span])?;
            if bm.size() != self.nrows {
                return Err(err(
                    ErrorKind::SizeMismatch,
                    format!("bitmap {} spans {} rows, index has {}", i, bm.size(), self.nrows),
                ));
            }
            self.bits[i] = Some(bm);
        }
        Ok(self.bits[i].as_ref().expect("activated above"))
    }

    pub fn activate_all(&mut self) -> Result<()> {
        for i in 0..self.nobs() {
            self.activate(i)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // persistence

    /// Write the index file. All bitmaps are materialized first.
    pub fn write(&mut self, path: &Path) -> Result<()> {
        self.activate_all()?;
        self.compute_offsets();
        let nobs = self.nobs();
        let body: u64 = self.offsets[nobs] - self.offsets[0];
        let (offsize, base) = Self::layout(nobs, body);

        let mut buf: Vec<u8> = Vec::with_capacity((base + body) as usize);
        buf.extend_from_slice(MAGIC);
        buf.push(KIND_BINNING);
        buf.push(offsize);
        buf.extend_from_slice(&self.nrows.to_le_bytes());
        buf.extend_from_slice(&(nobs as u32).to_le_bytes());
        if nobs > 0 {
            for &off in &self.offsets {
                if offsize == 4 {
                    buf.extend_from_slice(&(off as u32).to_le_bytes());
                } else {
                    buf.extend_from_slice(&off.to_le_bytes());
                }
            }
            while buf.len() % 8 != 0 {
                buf.push(0);
            }
            for v in &self.bounds {
                buf.extend_from_slice(&v.to_le_bytes());
            }
            for v in &self.maxval {
                buf.extend_from_slice(&v.to_le_bytes());
            }
            for v in &self.minval {
                buf.extend_from_slice(&v.to_le_bytes());
            }
            debug_assert_eq!(buf.len() as u64, self.offsets[0]);
            for b in &self.bits {
                b.as_ref().expect("activated above").serialize(&mut buf);
            }
        }
        let mut file = File::create(path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        debug!(target: "sift", path = %path.display(), bytes = buf.len(), "index written");
        Ok(())
    }

    /// Load an index file through the file cache. Bitmaps stay on disk
    /// until a bin is touched.
    pub fn read(path: &Path, ty: ElemTy, mgr: &FileManager) -> Result<BinIndex> {
        let st = mgr.get_file(path, AccessPreference::MmapLargeFiles)?;
        let bytes = st.bytes();
        if bytes.len() < HEADER_LEN as usize {
            return Err(err(ErrorKind::BadHeader, "index file shorter than its header"));
        }
        if &bytes[0..6] != MAGIC {
            return Err(err(ErrorKind::BadHeader, "bad magic number"));
        }
        if bytes[6] != KIND_BINNING {
            return Err(err(ErrorKind::BadHeader, format!("unsupported index kind {}", bytes[6])));
        }
        let offsize = bytes[7];
        if offsize != 4 && offsize != 8 {
            return Err(err(ErrorKind::BadHeader, format!("offset width {} is not 4 or 8", offsize)));
        }
        let le32 = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        let nrows = le32(8);
        let nobs = le32(12) as usize;
        if nobs == 0 {
            return Ok(BinIndex::empty(ty, nrows));
        }

        let pad8 = |x: usize| (x + 7) & !7;
        let off_end = HEADER_LEN as usize + offsize as usize * (nobs + 1);
        let arrays_at = pad8(off_end);
        let arrays_end = arrays_at + 24 * nobs;
        if bytes.len() < arrays_end {
            return Err(err(ErrorKind::BadHeader, "index file truncated in its arrays"));
        }

        let mut offsets = Vec::with_capacity(nobs + 1);
        for i in 0..=nobs {
            let at = HEADER_LEN as usize + offsize as usize * i;
            let off = if offsize == 4 {
                le32(at) as u64
            } else {
                u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
            };
            offsets.push(off);
        }
        if offsets[0] != arrays_end as u64
            || offsets.windows(2).any(|w| w[0] > w[1])
            || offsets[nobs] != bytes.len() as u64
        {
            return Err(err(
                ErrorKind::BadOffsets,
                format!("bitmap offsets disagree with a file of {} bytes", bytes.len()),
            ));
        }

        let le64f = |at: usize| f64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
        let mut bounds = Vec::with_capacity(nobs);
        let mut maxval = Vec::with_capacity(nobs);
        let mut minval = Vec::with_capacity(nobs);
        for i in 0..nobs {
            bounds.push(le64f(arrays_at + 8 * i));
        }
        for i in 0..nobs {
            maxval.push(le64f(arrays_at + 8 * (nobs + i)));
        }
        for i in 0..nobs {
            minval.push(le64f(arrays_at + 8 * (2 * nobs + i)));
        }
        if bounds.windows(2).any(|w| w[0] >= w[1]) || *bounds.last().unwrap() != f64::INFINITY {
            return Err(err(ErrorKind::BadHeader, "bin boundaries out of order"));
        }

        Ok(BinIndex {
            ty,
            nrows,
            bounds,
            minval,
            maxval,
            bits: vec![None; nobs],
            offsets,
            file: Some(st),
        })
    }

    // ------------------------------------------------------------------
    // evaluation

    /// Decompose a range predicate into candidate and hit bin spans
    /// using the observed per-bin extremes. Bins holding no finite
    /// value (a bin of NaNs) satisfy no predicate and fall outside the
    /// span.
    pub fn locate_range(&self, pred: &RangePred) -> BinSpan {
        let nobs = self.nobs();
        if pred.is_empty() || nobs == 0 {
            return BinSpan { cand0: 0, hit0: 0, hit1: 0, cand1: 0 };
        }
        let finite = |i: usize| self.minval[i] <= self.maxval[i];
        let lo_sat = |v: f64| match pred.lo {
            Edge::Unbounded => true,
            Edge::Open(l) => v > l,
            Edge::Closed(l) => v >= l,
        };
        let hi_sat = |v: f64| match pred.hi {
            Edge::Unbounded => true,
            Edge::Open(h) => v < h,
            Edge::Closed(h) => v <= h,
        };

        let cand0 = (0..nobs)
            .position(|i| finite(i) && lo_sat(self.maxval[i]))
            .unwrap_or(nobs);
        let hit0 = (cand0..nobs)
            .find(|&i| finite(i) && lo_sat(self.minval[i]))
            .unwrap_or(nobs);
        let cand1 = (0..nobs)
            .rposition(|i| finite(i) && hi_sat(self.minval[i]))
            .map(|i| i + 1)
            .unwrap_or(0);
        let hit1 = (0..cand1)
            .rev()
            .find(|&i| finite(i) && hi_sat(self.maxval[i]))
            .map(|i| i + 1)
            .unwrap_or(0);

        let cand0 = cand0.min(cand1);
        let mut hit0 = hit0.max(cand0).min(cand1);
        let mut hit1 = hit1.max(cand0).min(cand1);
        if hit1 < hit0 {
            // No bin is entirely inside; everything between the edges
            // is a candidate.
            hit0 = cand0;
            hit1 = cand0;
        }
        BinSpan { cand0, hit0, hit1, cand1 }
    }

    /// Serialized bytes the span would touch, used both for the
    /// complement decision and the give-up rule.
    fn span_cost(&self, a: usize, b: usize) -> u64 {
        if a >= b {
            0
        } else {
            self.offsets[b] - self.offsets[a]
        }
    }

    /// Union of bins [a, b), via the complement when that reads fewer
    /// bytes. The complement route flips within the row space and masks
    /// back to the column's live rows.
    fn or_range(&mut self, col: &dyn Column, a: usize, b: usize) -> Result<RunBitmap> {
        let nobs = self.nobs();
        let direct = self.span_cost(a, b);
        let outside = self.span_cost(0, a) + self.span_cost(b, nobs);
        let mut out = RunBitmap::with_size(self.nrows);
        if outside < direct {
            for i in (0..a).chain(b..nobs) {
                out.union(self.activate(i)?);
            }
            out.adjust_size(self.nrows);
            out.flip();
            out.intersect(col.live_rows());
        } else {
            for i in a..b {
                out.union(self.activate(i)?);
            }
            out.adjust_size(self.nrows);
        }
        Ok(out)
    }

    /// Certain hits and an upper bound, without touching the raw data.
    /// When the predicate would cost more than three quarters of a
    /// column scan the index gives up: lower empty, upper full.
    pub fn estimate(&mut self, col: &dyn Column, pred: &RangePred) -> Result<(RunBitmap, RunBitmap)> {
        let span = self.locate_range(pred);
        if self.gives_up(&span) {
            return Ok((RunBitmap::with_size(self.nrows), RunBitmap::all_ones(self.nrows)));
        }
        let lower = self.or_range(col, span.hit0, span.hit1)?;
        let mut upper = lower.clone();
        for i in (span.cand0..span.hit0).chain(span.hit1..span.cand1) {
            upper.union(self.activate(i)?);
        }
        Ok((lower, upper))
    }

    /// Rows the index alone cannot decide: the candidate bins minus the
    /// sure hits.
    pub fn undecidable(&mut self, col: &dyn Column, pred: &RangePred) -> Result<RunBitmap> {
        let (lower, mut upper) = self.estimate(col, pred)?;
        upper.subtract(&lower);
        Ok(upper)
    }

    fn gives_up(&self, span: &BinSpan) -> bool {
        let touched = self.span_cost(span.cand0, span.cand1);
        let total = self.span_cost(0, self.nobs());
        let work = touched.min(total - touched);
        work > 3 * (self.nrows as u64 * self.ty.size_of() as u64) / 4
    }

    /// Full evaluation: OR the hit bins, rescan the edge bins against
    /// the raw values, and never return a wrong answer: any failure
    /// falls back to scanning the column under the live-row mask.
    pub fn evaluate(
        &mut self,
        col: &dyn Column,
        mgr: &FileManager,
        pred: &RangePred,
    ) -> Result<RunBitmap> {
        if pred.is_empty() {
            return Ok(RunBitmap::with_size(self.nrows));
        }
        let span = self.locate_range(pred);
        if self.gives_up(&span) {
            debug!(target: "sift", %pred, "predicate too wide for the index, scanning");
            return scan_column_where(col, mgr, col.live_rows(), |v| pred.contains(v));
        }
        let mut lower = self.or_range(col, span.hit0, span.hit1)?;
        let edges: Vec<usize> = (span.cand0..span.hit0).chain(span.hit1..span.cand1).collect();
        for k in edges {
            let mask = self.activate(k)?.clone();
            match rescan::rescan_bin(col, mgr, k, &mask, pred) {
                Ok(extra) => lower.union(&extra),
                Err(e) => {
                    warn!(target: "sift", bin = k, kind = ?e.kind(),
                          "edge rescan failed, scanning the bin");
                    let extra = scan_column_where(col, mgr, &mask, |v| pred.contains(v))?;
                    lower.union(&extra);
                }
            }
        }
        lower.adjust_size(self.nrows);
        Ok(lower)
    }

    /// Discrete IN-list evaluation: locate each value, a singleton bin
    /// whose one value matches is a sure hit, every other bin touched
    /// is rescanned per value.
    pub fn evaluate_in(
        &mut self,
        col: &dyn Column,
        mgr: &FileManager,
        values: &[f64],
    ) -> Result<RunBitmap> {
        let mut by_bin: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
        for &v in values {
            if v.is_nan() {
                continue;
            }
            let k = locate(&self.bounds, v);
            if k < self.nobs() {
                by_bin.entry(k).or_default().push(v);
            }
        }
        let touched: u64 = by_bin.keys().map(|&k| self.span_cost(k, k + 1)).sum();
        if touched > 3 * (self.nrows as u64 * self.ty.size_of() as u64) / 4 {
            return scan_column_where(col, mgr, col.live_rows(), |v| {
                values.iter().any(|&w| v == w)
            });
        }
        let mut out = RunBitmap::with_size(self.nrows);
        for (k, vs) in by_bin {
            if self.minval[k] == self.maxval[k] {
                // Singleton bin: either its one value is in the list
                // and the whole bin is a hit, or nothing in it is.
                if vs.iter().any(|&v| v == self.minval[k]) {
                    out.union(self.activate(k)?);
                }
                continue;
            }
            let mask = self.activate(k)?.clone();
            for v in vs {
                let pred = RangePred::eq(v);
                match rescan::rescan_bin(col, mgr, k, &mask, &pred) {
                    Ok(extra) => out.union(&extra),
                    Err(_) => {
                        let extra = scan_column_where(col, mgr, &mask, |x| x == v)?;
                        out.union(&extra);
                    }
                }
            }
        }
        out.adjust_size(self.nrows);
        Ok(out)
    }

    // ------------------------------------------------------------------
    // append

    /// Extend the index by a block of rows appended to the column. The
    /// new block is indexed with this index's own boundaries and the
    /// two structures are concatenated bin by bin. Refuses (and the
    /// caller rebuilds) when the boundaries cannot reproduce the
    /// existing bins or the new rows pile up in the outermost bins.
    pub fn append(&mut self, newcol: &dyn Column, mgr: &FileManager) -> Result<()> {
        if newcol.elem_ty() != self.ty {
            return Err(err(
                ErrorKind::UnsupportedType,
                format!("appending {} rows to a {} index", newcol.elem_ty(), self.ty),
            ));
        }
        let tmp = BinIndex::build_with_bounds(newcol, &self.bounds, mgr)?;
        if tmp.bounds != self.bounds {
            return Err(err(ErrorKind::SizeMismatch, "appended block changed the boundaries"));
        }
        let nobs = self.nobs();
        if nobs > 0 {
            let weights: Vec<u32> = tmp
                .bits
                .iter()
                .map(|b| b.as_ref().map(|b| b.count()).unwrap_or(0))
                .collect();
            let total: u64 = weights.iter().map(|&w| w as u64).sum();
            let ends = weights[0] as u64 + weights[nobs - 1] as u64;
            if nobs > 2 && ends * nobs as u64 > 2 * total {
                return Err(err(
                    ErrorKind::SizeMismatch,
                    "appended rows crowd the outermost bins, rebuild instead",
                ));
            }
        }
        self.activate_all()?;
        for i in 0..nobs {
            let added = tmp.bits[i].as_ref().expect("fresh build is fully active");
            self.bits[i]
                .as_mut()
                .expect("activated above")
                .concat(added);
            self.minval[i] = self.minval[i].min(tmp.minval[i]);
            self.maxval[i] = self.maxval[i].max(tmp.maxval[i]);
        }
        self.nrows += tmp.nrows;
        for b in self.bits.iter_mut().flatten() {
            b.adjust_size(self.nrows);
        }
        self.compute_offsets();
        // The persisted copy no longer matches; the caller writes anew.
        self.file = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // diagnostics

    /// Time OR between adjacent bitmaps and report the throughput. A
    /// diagnostic, not part of evaluation.
    pub fn speed_test(&mut self, out: &mut impl Write) -> Result<()> {
        self.activate_all()?;
        let nobs = self.nobs();
        if nobs < 2 {
            writeln!(out, "speed test needs at least two bins")?;
            return Ok(());
        }
        let mut bytes = 0_u64;
        let start = Instant::now();
        for i in 0..nobs - 1 {
            let mut a = self.bits[i].as_ref().expect("active").clone();
            let b = self.bits[i + 1].as_ref().expect("active");
            a.union(b);
            bytes += (a.serialized_len() + b.serialized_len()) as u64;
        }
        let secs = start.elapsed().as_secs_f64().max(1e-9);
        writeln!(
            out,
            "OR of {} adjacent bitmap pairs: {:.3} ms, {:.1} MB/s",
            nobs - 1,
            secs * 1e3,
            bytes as f64 / secs / 1e6
        )?;
        Ok(())
    }
}

/// The most compact value c with lo < c <= hi: the fewest significant
/// digits that still separate the two observed values.
pub(crate) fn compact_value(lo: f64, hi: f64) -> f64 {
    if !(lo < hi) {
        return hi;
    }
    let span = hi - lo;
    let mut e = span.log10().floor() as i32 + 1;
    for _ in 0..4 {
        let step = 10f64.powi(e);
        let cand = (lo / step).floor() * step + step;
        if cand > lo && cand <= hi {
            return cand;
        }
        e -= 1;
    }
    hi
}
