use crate::binned::BinIndex;
use crate::bitmap::RunBitmap;
use sift_base::Result;
use tracing::debug;

// Range-join between two binned indexes under the relation
// |l - r| <= delta (delta = 0 is an equi-join). Both bin arrays are
// walked in sorted order; a pair of bins whose observed value
// intervals lie entirely within the relation yields sure row pairs,
// and a pair that only overlaps the relation yields iffy ones. The
// union of right-side rows for the current window of compatible bins
// is kept in a rolling accumulator so successive left bins extend it
// instead of recomputing it.

/// A set of row pairs, encoded as 64-bit outer-product positions
/// l_row * right_rows + r_row and stored as sorted disjoint runs.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct PairBitmap {
    nbits: u64,
    runs: Vec<(u64, u64)>,
}

impl PairBitmap {
    fn with_size(nbits: u64) -> PairBitmap {
        PairBitmap { nbits, runs: Vec::new() }
    }

    /// Mark positions [b, e). Appending past the current tail is O(1);
    /// anything else splices into place, merging overlapping runs.
    fn set_range(&mut self, b: u64, e: u64) {
        if b >= e {
            return;
        }
        match self.runs.last_mut() {
            None => {
                self.runs.push((b, e));
                return;
            }
            Some(last) if b >= last.0 => {
                if b <= last.1 {
                    last.1 = last.1.max(e);
                } else {
                    self.runs.push((b, e));
                }
                return;
            }
            _ => {}
        }
        let i = self.runs.partition_point(|&(rb, _)| rb < b);
        let mut lo_idx = i;
        let mut start = b;
        let mut end = e;
        if i > 0 && self.runs[i - 1].1 >= b {
            lo_idx = i - 1;
            start = self.runs[i - 1].0;
            end = end.max(self.runs[i - 1].1);
        }
        let mut hi_idx = lo_idx;
        while hi_idx < self.runs.len() && self.runs[hi_idx].0 <= end {
            end = end.max(self.runs[hi_idx].1);
            hi_idx += 1;
        }
        self.runs.splice(lo_idx..hi_idx, [(start, end)]);
    }

    pub fn size(&self) -> u64 {
        self.nbits
    }

    pub fn count(&self) -> u64 {
        self.runs.iter().map(|&(b, e)| e - b).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn get(&self, i: u64) -> bool {
        match self.runs.binary_search_by(|&(b, _)| b.cmp(&i)) {
            Ok(_) => true,
            Err(0) => false,
            Err(k) => i < self.runs[k - 1].1,
        }
    }

    pub fn ones(&self) -> impl Iterator<Item = u64> + '_ {
        self.runs.iter().flat_map(|&(b, e)| b..e)
    }
}

/// Outcome of a range join: sure pairs satisfy the relation for every
/// possible value, iffy pairs might and need value-level resolution.
pub struct JoinResult {
    pub sure: PairBitmap,
    pub iffy: PairBitmap,
    stride: u64,
}

impl JoinResult {
    /// Decode a 64-bit position into (left row, right row).
    pub fn decode(&self, pos: u64) -> (u32, u32) {
        ((pos / self.stride) as u32, (pos % self.stride) as u32)
    }

    pub fn sure_pairs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.sure.ones().map(|p| self.decode(p))
    }

    pub fn iffy_pairs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.iffy.ones().map(|p| self.decode(p))
    }
}

/// Rolling union of right-bin bitmaps over a window that only moves
/// forward. Extending the high edge unions in new bins; moving the low
/// edge forces a rebuild, since a union cannot subtract.
struct Window {
    lo: usize,
    hi: usize,
    rows: RunBitmap,
}

impl Window {
    fn new(nrows: u32) -> Window {
        Window { lo: 0, hi: 0, rows: RunBitmap::with_size(nrows) }
    }

    fn advance(&mut self, right: &mut BinIndex, lo: usize, hi: usize) -> Result<()> {
        if lo != self.lo {
            // The low edge moved; a union cannot subtract, so start
            // over from the new edge.
            self.rows = RunBitmap::with_size(right.nrows());
            self.lo = lo;
            self.hi = lo;
        }
        while self.hi < hi {
            self.rows.union(right.activate(self.hi)?);
            self.hi += 1;
        }
        Ok(())
    }
}

/// Join the rows of two binned indexes under |l - r| <= delta.
pub fn range_join(left: &mut BinIndex, right: &mut BinIndex, delta: f64) -> Result<JoinResult> {
    let stride = right.nrows() as u64;
    let total = left.nrows() as u64 * stride;
    let mut sure = PairBitmap::with_size(total);
    let mut iffy = PairBitmap::with_size(total);
    let nr = right.nobs();

    let mut sure_win = Window::new(right.nrows());
    let mut cand_win = Window::new(right.nrows());

    for i in 0..left.nobs() {
        let (lmin, lmax) = (left.min_seen()[i], left.max_seen()[i]);
        if !(lmin <= lmax) {
            continue; // no finite values in this bin
        }
        // Right bins whose interval might pair with this one.
        let cand_lo = (0..nr)
            .position(|j| right.max_seen()[j] >= lmin - delta)
            .unwrap_or(nr);
        let cand_hi = (cand_lo..nr)
            .find(|&j| right.min_seen()[j] > lmax + delta)
            .unwrap_or(nr);
        // Right bins whose every value pairs with every value here.
        let sure_lo = (cand_lo..cand_hi)
            .find(|&j| right.min_seen()[j] >= lmax - delta)
            .unwrap_or(cand_hi);
        let sure_hi = (sure_lo..cand_hi)
            .find(|&j| right.max_seen()[j] > lmin + delta)
            .unwrap_or(cand_hi);

        if cand_lo >= cand_hi {
            continue;
        }
        cand_win.advance(right, cand_lo, cand_hi)?;
        sure_win.advance(right, sure_lo, sure_hi)?;

        let mut iffy_rows = cand_win.rows.clone();
        iffy_rows.subtract(&sure_win.rows);

        let lbin = left.activate(i)?.clone();
        for l in lbin.ones() {
            let base = l as u64 * stride;
            for (b, e) in sure_win.rows.index_sets().map(span_bounds) {
                sure.set_range(base + b as u64, base + e as u64);
            }
            for (b, e) in iffy_rows.index_sets().map(span_bounds) {
                iffy.set_range(base + b as u64, base + e as u64);
            }
        }
    }
    debug!(target: "sift", delta, sure = sure.count(), iffy = iffy.count(), "range join");
    Ok(JoinResult { sure, iffy, stride })
}

fn span_bounds(s: crate::bitmap::IndexSet) -> (u32, u32) {
    match s {
        crate::bitmap::IndexSet::Single(r) => (r, r + 1),
        crate::bitmap::IndexSet::Range(b, e) => (b, e),
    }
}
