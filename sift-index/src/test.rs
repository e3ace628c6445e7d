use crate::{
    column_values, rescan_bin, scan_column, BinIndex, BinSpec, Column, RangePred, RunBitmap,
    SimpleColumn,
};
use sift_base::{Elem, ErrorKind, Result};
use sift_store::{FileManager, FileManagerConfig};
use std::path::PathBuf;
use std::time::Duration;
use test_log::test;

pub(crate) mod joins;

pub(crate) fn mgr() -> FileManager {
    FileManager::new(FileManagerConfig {
        max_bytes: 1 << 30,
        max_open_files: 64,
        min_map_size: 1 << 20,
        max_wait: Duration::from_millis(200),
    })
}

pub(crate) fn column_of<T: Elem>(
    dir: &tempfile::TempDir,
    name: &str,
    vals: &[T],
) -> SimpleColumn {
    let path: PathBuf = dir.path().join(name);
    SimpleColumn::from_values(path, vals).unwrap()
}

/// Every live row sits in exactly one bin, inside that bin's interval
/// and its observed extremes; the bounds are strictly ascending and end
/// at +inf; the populations sum to the live row count.
pub(crate) fn check_invariants<T: Elem>(
    idx: &mut BinIndex,
    col: &SimpleColumn,
    mgr: &FileManager,
) {
    let nobs = idx.nobs();
    if nobs == 0 {
        assert_eq!(col.live_rows().count(), 0);
        return;
    }
    let bounds = idx.bounds().to_vec();
    assert!(bounds.windows(2).all(|w| w[0] < w[1]), "bounds not ascending: {:?}", bounds);
    assert_eq!(*bounds.last().unwrap(), f64::INFINITY);

    let vals = column_values::<T>(col, mgr).unwrap();
    let mut seen = RunBitmap::with_size(idx.nrows());
    let mut total = 0;
    for i in 0..nobs {
        let rows = idx.bin_rows(i).unwrap();
        assert_eq!(rows.size(), idx.nrows(), "bin {} bitmap size", i);
        total += rows.count();
        let (lo, hi) = (idx.min_seen()[i], idx.max_seen()[i]);
        for r in rows.ones() {
            assert!(!seen.get(r), "row {} in more than one bin", r);
            seen.set(r);
            let v = vals.get(r as usize).to_f64();
            if v.is_nan() {
                continue;
            }
            assert!(v >= lo && v <= hi, "row {} value {} outside [{}, {}] of bin {}", r, v, lo, hi, i);
            assert!(v < bounds[i], "row {} value {} at or above bound {}", r, v, bounds[i]);
            if i > 0 {
                assert!(v >= bounds[i - 1], "row {} value {} below bin {}", r, v, i);
            }
        }
    }
    assert_eq!(total, col.live_rows().count(), "bin populations must cover the live rows");
}

fn ones(bm: &RunBitmap) -> Vec<u32> {
    bm.ones().collect()
}

// Ten integers in five equal-width bins; the interval 4..=7 resolves to
// the four middle rows.
#[test]
fn test_linear_int_index() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<i32> = (1..=10).collect();
    let col = column_of(&dir, "ten", &vals);
    let spec = BinSpec::parse("nbins=5 scale=linear start=1 end=11");
    let mut idx = BinIndex::build(&col, &spec, &m)?;

    assert_eq!(idx.nobs(), 5);
    assert_eq!(idx.bounds(), &[3.0, 5.0, 7.0, 9.0, f64::INFINITY]);
    assert_eq!(idx.bin_weights()?, vec![2, 2, 2, 2, 2]);
    check_invariants::<i32>(&mut idx, &col, &m);

    let span = idx.locate_range(&RangePred::between(
        crate::Edge::Closed(4.0),
        crate::Edge::Closed(7.0),
    ));
    assert_eq!((span.cand0, span.hit0, span.hit1, span.cand1), (1, 2, 3, 4));

    let pred = RangePred::between(crate::Edge::Closed(4.0), crate::Edge::Closed(7.0));
    let hits = idx.evaluate(&col, &m, &pred)?;
    assert_eq!(ones(&hits), vec![3, 4, 5, 6]);
    Ok(())
}

// Four floats under precision=1: every value gets its own granule bin,
// and a probe between granules finds nothing.
#[test]
fn test_granule_index() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals = [0.1_f64, 0.2, 0.3, 0.4];
    let col = column_of(&dir, "tenths", &vals);
    let mut idx = BinIndex::build(&col, &BinSpec::parse("precision=1"), &m)?;

    assert_eq!(idx.nobs(), 4);
    assert_eq!(idx.bin_weights()?, vec![1, 1, 1, 1]);
    check_invariants::<f64>(&mut idx, &col, &m);

    let hits = idx.evaluate(&col, &m, &RangePred::eq(0.25))?;
    assert_eq!(hits.count(), 0);
    let hits = idx.evaluate(&col, &m, &RangePred::eq(0.3))?;
    assert_eq!(ones(&hits), vec![2]);
    Ok(())
}

#[test]
fn test_empty_column() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<i32> = vec![1, 2, 3, 4];
    let path = dir.path().join("nulls");
    crate::SimpleColumn::from_values(path.clone(), &vals)?;
    let col = SimpleColumn::with_live_rows(
        sift_base::ElemTy::I32,
        4,
        RunBitmap::with_size(4),
        path,
    );
    let mut idx = BinIndex::build(&col, &BinSpec::parse(""), &m)?;
    assert_eq!(idx.nobs(), 0);
    let hits = idx.evaluate(&col, &m, &RangePred::all())?;
    assert_eq!(hits.count(), 0);
    Ok(())
}

#[test]
fn test_single_valued_column() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals = vec![7_i32; 100];
    let col = column_of(&dir, "sevens", &vals);
    let mut idx = BinIndex::build(&col, &BinSpec::parse(""), &m)?;
    assert_eq!(idx.nobs(), 1);
    assert_eq!(idx.bin_weights()?, vec![100]);
    check_invariants::<i32>(&mut idx, &col, &m);
    let hits = idx.evaluate(&col, &m, &RangePred::eq(7.0))?;
    assert_eq!(hits.count(), 100);
    Ok(())
}

#[test]
fn test_nan_predicate_and_open_top() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<f64> = (0..50).map(|i| i as f64 / 2.0).collect();
    let col = column_of(&dir, "halves", &vals);
    let mut idx = BinIndex::build(&col, &BinSpec::parse("nbins=5 scale=linear"), &m)?;
    check_invariants::<f64>(&mut idx, &col, &m);

    let hits = idx.evaluate(&col, &m, &RangePred::eq(f64::NAN))?;
    assert_eq!(hits.count(), 0);

    // x < +inf selects every non-null row.
    let hits = idx.evaluate(&col, &m, &RangePred::less_than(f64::INFINITY))?;
    assert_eq!(hits.count(), 50);
    Ok(())
}

#[test]
fn test_null_rows_stay_out() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<i32> = (0..100).collect();
    let path = dir.path().join("gappy");
    crate::SimpleColumn::from_values(path.clone(), &vals)?;
    // Odd rows are null.
    let mut live = RunBitmap::with_size(100);
    for r in (0..100).step_by(2) {
        live.set(r);
    }
    live.adjust_size(100);
    let col = SimpleColumn::with_live_rows(sift_base::ElemTy::I32, 100, live, path);
    let mut idx = BinIndex::build(&col, &BinSpec::parse("nbins=4 scale=linear start=0 end=100"), &m)?;
    check_invariants::<i32>(&mut idx, &col, &m);
    assert_eq!(idx.bin_weights()?.iter().sum::<u32>(), 50);

    let hits = idx.evaluate(&col, &m, &RangePred::at_least(0.0))?;
    assert_eq!(hits.count(), 50);
    assert!(hits.ones().all(|r| r % 2 == 0));
    Ok(())
}

// Clustered values with a reorder sidecar: edge bins resolve through
// the sidecar and the result matches a raw scan exactly.
#[test]
fn test_reorder_sidecar_evaluation() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<i32> = (0..1000).map(|i| i / 10).collect();
    let col = column_of(&dir, "clustered", &vals);
    let spec = BinSpec::parse("nbins=10 scale=linear start=0 end=100 reorder");
    let mut idx = BinIndex::build(&col, &spec, &m)?;
    check_invariants::<i32>(&mut idx, &col, &m);
    assert!(crate::sidecar_path(col.data_path().unwrap()).exists());

    let pred = RangePred::between(crate::Edge::Closed(25.0), crate::Edge::Open(73.0));
    let hits = idx.evaluate(&col, &m, &pred)?;
    assert_eq!(hits.count(), 480);
    assert_eq!(ones(&hits), (250..730).collect::<Vec<u32>>());

    let scanned = scan_column(&col, &m, &pred, col.live_rows())?;
    assert_eq!(hits, scanned);
    Ok(())
}

// Direct sidecar rescan of one bin.
#[test]
fn test_rescan_bin_against_sidecar() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<i32> = (1..=10).collect();
    let col = column_of(&dir, "ten", &vals);
    let spec = BinSpec::parse("nbins=5 scale=linear start=1 end=11 reorder");
    let mut idx = BinIndex::build(&col, &spec, &m)?;

    // Bin 1 holds values 3 and 4 on rows 2 and 3.
    let mask = idx.bin_rows(1)?;
    assert_eq!(ones(&mask), vec![2, 3]);
    let kept = rescan_bin(&col, &m, 1, &mask, &RangePred::at_least(4.0))?;
    assert_eq!(ones(&kept), vec![3]);

    // Without the sidecar the rescan reports the failure instead of
    // guessing.
    std::fs::remove_file(crate::sidecar_path(col.data_path().unwrap())).unwrap();
    let e = rescan_bin(&col, &m, 1, &mask, &RangePred::at_least(4.0)).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::NotFound);
    Ok(())
}

#[test]
fn test_estimate_bounds_hits() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<i32> = (0..1000).map(|i| i / 10).collect();
    let col = column_of(&dir, "clustered", &vals);
    let mut idx = BinIndex::build(&col, &BinSpec::parse("nbins=10 scale=linear start=0 end=100"), &m)?;

    let pred = RangePred::between(crate::Edge::Closed(25.0), crate::Edge::Open(73.0));
    let (lower, upper) = idx.estimate(&col, &pred)?;
    let exact = idx.evaluate(&col, &m, &pred)?;
    // lower <= exact <= upper.
    let mut l = lower.clone();
    l.subtract(&exact);
    assert!(l.is_empty());
    let mut e = exact.clone();
    e.subtract(&upper);
    assert!(e.is_empty());

    let undec = idx.undecidable(&col, &pred)?;
    let mut check = lower.clone();
    check.union(&undec);
    assert_eq!(check, upper);
    Ok(())
}

// Scattered rows make the run bitmaps cost more than the column; the
// index declines and reports full candidates.
#[test]
fn test_give_up_on_expensive_predicate() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<i32> = (0..1000).map(|i| (i % 2) * 100).collect();
    let col = column_of(&dir, "alternating", &vals);
    let mut idx = BinIndex::build(&col, &BinSpec::parse("nbins=2 scale=linear start=0 end=200"), &m)?;

    let pred = RangePred::eq(0.0);
    let (lower, upper) = idx.estimate(&col, &pred)?;
    assert_eq!(lower.count(), 0);
    assert_eq!(upper.count(), 1000);
    // The full evaluation still answers, through the raw data.
    let hits = idx.evaluate(&col, &m, &pred)?;
    assert_eq!(hits.count(), 500);
    assert!(hits.ones().all(|r| r % 2 == 0));
    Ok(())
}

#[test]
fn test_in_list_evaluation() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<i32> = (0..1000).map(|i| i / 10).collect();
    let col = column_of(&dir, "clustered", &vals);
    let mut idx = BinIndex::build(&col, &BinSpec::parse("nbins=10 scale=linear start=0 end=100"), &m)?;

    let hits = idx.evaluate_in(&col, &m, &[5.0, 50.0, 500.0, f64::NAN])?;
    assert_eq!(hits.count(), 20);
    let expect: Vec<u32> = (50..60).chain(500..510).collect();
    assert_eq!(ones(&hits), expect);
    Ok(())
}

#[test]
fn test_equal_weight_build() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<i64> = (0..1000).collect();
    let col = column_of(&dir, "uniform", &vals);
    let mut idx = BinIndex::build(&col, &BinSpec::parse("equal_weight nbins=4"), &m)?;
    assert_eq!(idx.nobs(), 4);
    assert_eq!(idx.bin_weights()?, vec![250, 250, 250, 250]);
    check_invariants::<i64>(&mut idx, &col, &m);
    Ok(())
}

#[test]
fn test_cumulative_weights() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<i64> = (0..1000).collect();
    let col = column_of(&dir, "uniform", &vals);
    let mut idx = BinIndex::build(&col, &BinSpec::parse("equal_weight nbins=4"), &m)?;
    assert_eq!(idx.cumulative_weights()?, vec![250, 500, 750, 1000]);
    Ok(())
}

// Append a block with the same value distribution: the combined index
// is indistinguishable from a fresh build over all rows.
#[test]
fn test_append_matches_fresh_build() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let old: Vec<i32> = (0..1000).map(|i| (i * 37) % 100).collect();
    let new: Vec<i32> = (1000..2000).map(|i| (i * 37) % 100).collect();
    let all: Vec<i32> = old.iter().chain(new.iter()).copied().collect();

    let col_old = column_of(&dir, "old", &old);
    let col_new = column_of(&dir, "new", &new);
    let col_all = column_of(&dir, "all", &all);

    let spec = BinSpec::parse("nbins=10 scale=linear start=0 end=100");
    let mut idx = BinIndex::build(&col_old, &spec, &m)?;
    idx.append(&col_new, &m)?;

    assert_eq!(idx.nrows(), 2000);
    check_invariants::<i32>(&mut idx, &col_all, &m);

    let mut fresh = BinIndex::build(&col_all, &spec, &m)?;
    let pred = RangePred::between(crate::Edge::Closed(10.0), crate::Edge::Open(30.0));
    let a = idx.evaluate(&col_all, &m, &pred)?;
    let b = fresh.evaluate(&col_all, &m, &pred)?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn test_append_refuses_crowded_end_bins() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let old: Vec<i32> = (0..100).collect();
    let crowd = vec![0_i32; 100];
    let col_old = column_of(&dir, "old", &old);
    let col_new = column_of(&dir, "crowd", &crowd);

    let spec = BinSpec::parse("nbins=10 scale=linear start=0 end=100");
    let mut idx = BinIndex::build(&col_old, &spec, &m)?;
    let e = idx.append(&col_new, &m).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::SizeMismatch);
    Ok(())
}

#[test]
fn test_speed_test_reports() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<i32> = (0..1000).map(|i| i / 100).collect();
    let col = column_of(&dir, "deciles", &vals);
    let mut idx = BinIndex::build(&col, &BinSpec::parse("nbins=10 scale=linear start=0 end=10"), &m)?;
    let mut out = Vec::new();
    idx.speed_test(&mut out)?;
    assert!(!out.is_empty());
    Ok(())
}

// Rebuilding over identical data yields an identical structure.
#[test]
fn test_rebuild_is_deterministic() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let vals: Vec<f64> = (0..500).map(|i| (i as f64).sqrt()).collect();
    let col = column_of(&dir, "roots", &vals);
    let spec = BinSpec::parse("nbins=16 scale=linear");
    let mut a = BinIndex::build(&col, &spec, &m)?;
    let mut b = BinIndex::build(&col, &spec, &m)?;
    assert_eq!(a.bounds(), b.bounds());
    assert_eq!(a.min_seen(), b.min_seen());
    assert_eq!(a.max_seen(), b.max_seen());
    assert_eq!(a.bin_weights()?, b.bin_weights()?);
    check_invariants::<f64>(&mut a, &col, &m);
    Ok(())
}
