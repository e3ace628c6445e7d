use crate::test::{column_of, mgr};
use crate::{range_join, BinIndex, BinSpec};
use sift_base::Result;
use test_log::test;

#[test]
fn test_equi_join_on_singleton_bins() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let left = column_of(&dir, "l", &[1.0_f64, 2.0, 3.0]);
    let right = column_of(&dir, "r", &[2.0_f64, 3.0, 4.0]);
    let mut li = BinIndex::build(&left, &BinSpec::parse("precision=1"), &m)?;
    let mut ri = BinIndex::build(&right, &BinSpec::parse("precision=1"), &m)?;

    let joined = range_join(&mut li, &mut ri, 0.0)?;
    let sure: Vec<(u32, u32)> = joined.sure_pairs().collect();
    assert_eq!(sure, vec![(1, 0), (2, 1)]);
    assert!(joined.iffy.is_empty());
    Ok(())
}

#[test]
fn test_delta_join_widens_the_window() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let left = column_of(&dir, "l", &[1.0_f64, 2.0, 3.0]);
    let right = column_of(&dir, "r", &[2.0_f64, 3.0, 4.0]);
    let mut li = BinIndex::build(&left, &BinSpec::parse("precision=1"), &m)?;
    let mut ri = BinIndex::build(&right, &BinSpec::parse("precision=1"), &m)?;

    let joined = range_join(&mut li, &mut ri, 1.0)?;
    let sure: Vec<(u32, u32)> = joined.sure_pairs().collect();
    assert_eq!(sure, vec![(0, 0), (1, 0), (1, 1), (2, 0), (2, 1), (2, 2)]);
    assert!(joined.iffy.is_empty());
    Ok(())
}

// One coarse bin per side: the intervals overlap the relation but do
// not sit inside it, so every pair is iffy and none is sure.
#[test]
fn test_coarse_bins_emit_iffy_pairs() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let left = column_of(&dir, "l", &[1.0_f64, 2.0, 3.0]);
    let right = column_of(&dir, "r", &[2.0_f64, 3.0, 4.0]);
    let coarse = BinSpec::parse("nbins=1 scale=linear start=0 end=10");
    let mut li = BinIndex::build(&left, &coarse, &m)?;
    let mut ri = BinIndex::build(&right, &coarse, &m)?;
    assert_eq!(li.nobs(), 1);

    let joined = range_join(&mut li, &mut ri, 0.0)?;
    assert!(joined.sure.is_empty());
    assert_eq!(joined.iffy.count(), 9);
    // Position arithmetic: left row 1 with right row 2 sits at 1*3+2.
    assert!(joined.iffy.get(5));
    Ok(())
}

// Sure and iffy together never miss a true pair: every value-level
// match appears in one of the two sets.
#[test]
fn test_join_covers_all_true_pairs() -> Result<()> {
    let dir = tempfile::TempDir::new().unwrap();
    let m = mgr();
    let lv: Vec<f64> = (0..40).map(|i| (i % 10) as f64).collect();
    let rv: Vec<f64> = (0..30).map(|i| (i % 7) as f64).collect();
    let left = column_of(&dir, "l", &lv);
    let right = column_of(&dir, "r", &rv);
    let spec = BinSpec::parse("nbins=4 scale=linear start=0 end=10");
    let mut li = BinIndex::build(&left, &spec, &m)?;
    let mut ri = BinIndex::build(&right, &spec, &m)?;

    let delta = 1.0;
    let joined = range_join(&mut li, &mut ri, delta)?;
    for (i, &l) in lv.iter().enumerate() {
        for (j, &r) in rv.iter().enumerate() {
            let pos = i as u64 * rv.len() as u64 + j as u64;
            let related = (l - r).abs() <= delta;
            if related {
                assert!(
                    joined.sure.get(pos) || joined.iffy.get(pos),
                    "true pair ({}, {}) missing", i, j
                );
            }
            if joined.sure.get(pos) {
                assert!(related, "sure pair ({}, {}) is not actually related", i, j);
            }
        }
    }
    Ok(())
}
