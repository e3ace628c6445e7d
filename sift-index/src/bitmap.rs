use sift_base::{err, ErrorKind, Result};

// The compressed bitvector the index is built over. The engine assumes
// exactly this surface: union/intersect/subtract/flip, cardinality,
// logical-size adjustment, byte serialization with a knowable length,
// and index-set iteration that distinguishes singleton positions from
// contiguous runs. Anything providing those could back the bins; this
// implementation keeps the set as a sorted list of disjoint half-open
// row ranges, which equality-encoded bins produce naturally (bins over
// clustered data are long runs, bins over scattered data are short
// ones).

/// One element of index-set iteration: either a lone row id or a
/// contiguous half-open range of them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IndexSet {
    Single(u32),
    Range(u32, u32),
}

/// A bitmap over the column's row space, stored as sorted disjoint
/// half-open runs of set rows.
#[derive(Clone, Default, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct RunBitmap {
    nbits: u32,
    runs: Vec<(u32, u32)>,
}

impl RunBitmap {
    pub fn new() -> RunBitmap {
        RunBitmap::default()
    }

    /// n logical bits, all zero.
    pub fn with_size(nbits: u32) -> RunBitmap {
        RunBitmap { nbits, runs: Vec::new() }
    }

    /// n logical bits, all one.
    pub fn all_ones(nbits: u32) -> RunBitmap {
        let runs = if nbits > 0 { vec![(0, nbits)] } else { Vec::new() };
        RunBitmap { nbits, runs }
    }

    /// Logical size in bits.
    pub fn size(&self) -> u32 {
        self.nbits
    }

    /// Number of set bits.
    pub fn count(&self) -> u32 {
        self.runs.iter().map(|&(b, e)| e - b).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn get(&self, i: u32) -> bool {
        match self.runs.binary_search_by(|&(b, _)| b.cmp(&i)) {
            Ok(_) => true,
            Err(0) => false,
            Err(k) => i < self.runs[k - 1].1,
        }
    }

    /// Set bit i, growing the logical size if needed. Appending in
    /// ascending row order, the construction pattern, extends the last
    /// run in place.
    pub fn set(&mut self, i: u32) {
        if i >= self.nbits {
            self.nbits = i + 1;
        }
        if let Some(last) = self.runs.last_mut() {
            if i == last.1 {
                last.1 += 1;
                return;
            }
            if i > last.1 {
                self.runs.push((i, i + 1));
                return;
            }
        } else {
            self.runs.push((i, i + 1));
            return;
        }
        // Out-of-order set: splice into place.
        match self.runs.binary_search_by(|&(b, _)| b.cmp(&i)) {
            Ok(_) => {}
            Err(k) => {
                if k > 0 && i < self.runs[k - 1].1 {
                    return; // already set
                }
                let joins_prev = k > 0 && self.runs[k - 1].1 == i;
                let joins_next = k < self.runs.len() && self.runs[k].0 == i + 1;
                match (joins_prev, joins_next) {
                    (true, true) => {
                        self.runs[k - 1].1 = self.runs[k].1;
                        self.runs.remove(k);
                    }
                    (true, false) => self.runs[k - 1].1 = i + 1,
                    (false, true) => self.runs[k].0 = i,
                    (false, false) => self.runs.insert(k, (i, i + 1)),
                }
            }
        }
    }

    /// Append another bitmap after this one's logical end: bit i of
    /// other becomes bit size()+i here.
    pub fn concat(&mut self, other: &RunBitmap) {
        let base = self.nbits;
        for &(b, e) in &other.runs {
            let (b, e) = (base + b, base + e);
            match self.runs.last_mut() {
                Some(last) if last.1 == b => last.1 = e,
                _ => self.runs.push((b, e)),
            }
        }
        self.nbits = base + other.nbits;
    }

    /// Pad or truncate the logical size to n bits.
    pub fn adjust_size(&mut self, nbits: u32) {
        if nbits < self.nbits {
            self.runs.retain_mut(|r| {
                if r.0 >= nbits {
                    return false;
                }
                r.1 = r.1.min(nbits);
                true
            });
        }
        self.nbits = nbits;
    }

    pub fn union(&mut self, other: &RunBitmap) {
        if other.runs.is_empty() {
            self.nbits = self.nbits.max(other.nbits);
            return;
        }
        let mut out: Vec<(u32, u32)> = Vec::with_capacity(self.runs.len() + other.runs.len());
        let mut a = self.runs.iter().peekable();
        let mut b = other.runs.iter().peekable();
        loop {
            let next = match (a.peek(), b.peek()) {
                (Some(&&ra), Some(&&rb)) => {
                    if ra.0 <= rb.0 {
                        a.next();
                        ra
                    } else {
                        b.next();
                        rb
                    }
                }
                (Some(&&ra), None) => {
                    a.next();
                    ra
                }
                (None, Some(&&rb)) => {
                    b.next();
                    rb
                }
                (None, None) => break,
            };
            match out.last_mut() {
                Some(last) if next.0 <= last.1 => last.1 = last.1.max(next.1),
                _ => out.push(next),
            }
        }
        self.runs = out;
        self.nbits = self.nbits.max(other.nbits);
    }

    pub fn intersect(&mut self, other: &RunBitmap) {
        let mut out = Vec::new();
        let mut j = 0;
        for &(b, e) in &self.runs {
            while j < other.runs.len() && other.runs[j].1 <= b {
                j += 1;
            }
            let mut k = j;
            while k < other.runs.len() && other.runs[k].0 < e {
                let lo = b.max(other.runs[k].0);
                let hi = e.min(other.runs[k].1);
                if lo < hi {
                    out.push((lo, hi));
                }
                if other.runs[k].1 >= e {
                    break;
                }
                k += 1;
            }
        }
        self.runs = out;
        self.nbits = self.nbits.max(other.nbits);
    }

    pub fn subtract(&mut self, other: &RunBitmap) {
        let mut out = Vec::new();
        let mut j = 0;
        for &(mut b, e) in &self.runs {
            while j < other.runs.len() && other.runs[j].1 <= b {
                j += 1;
            }
            let mut k = j;
            while b < e {
                if k >= other.runs.len() || other.runs[k].0 >= e {
                    out.push((b, e));
                    break;
                }
                let (ob, oe) = other.runs[k];
                if ob > b {
                    out.push((b, ob));
                }
                b = b.max(oe);
                if oe >= e {
                    break;
                }
                k += 1;
            }
        }
        self.runs = out;
        self.nbits = self.nbits.max(other.nbits);
    }

    /// Complement within [0, size).
    pub fn flip(&mut self) {
        let mut out = Vec::with_capacity(self.runs.len() + 1);
        let mut at = 0;
        for &(b, e) in &self.runs {
            if at < b {
                out.push((at, b));
            }
            at = e;
        }
        if at < self.nbits {
            out.push((at, self.nbits));
        }
        self.runs = out;
    }

    /// Iterate the set rows as singletons and runs, ascending.
    pub fn index_sets(&self) -> impl Iterator<Item = IndexSet> + '_ {
        self.runs.iter().map(|&(b, e)| {
            if e - b == 1 {
                IndexSet::Single(b)
            } else {
                IndexSet::Range(b, e)
            }
        })
    }

    /// Iterate every set row id, ascending.
    pub fn ones(&self) -> impl Iterator<Item = u32> + '_ {
        self.runs.iter().flat_map(|&(b, e)| b..e)
    }

    /// Exact length of the serialized form in bytes; always a multiple
    /// of four.
    pub fn serialized_len(&self) -> usize {
        8 + 8 * self.runs.len()
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.nbits.to_le_bytes());
        out.extend_from_slice(&(self.runs.len() as u32).to_le_bytes());
        for &(b, e) in &self.runs {
            out.extend_from_slice(&b.to_le_bytes());
            out.extend_from_slice(&e.to_le_bytes());
        }
    }

    pub fn deserialize(bytes: &[u8]) -> Result<RunBitmap> {
        if bytes.len() < 8 {
            return Err(err(ErrorKind::BadOffsets, "bitmap shorter than its header"));
        }
        let le32 = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        let nbits = le32(0);
        let nruns = le32(4) as usize;
        if bytes.len() != 8 + 8 * nruns {
            return Err(err(
                ErrorKind::BadOffsets,
                format!("bitmap of {} runs needs {} bytes, got {}", nruns, 8 + 8 * nruns, bytes.len()),
            ));
        }
        let mut runs = Vec::with_capacity(nruns);
        let mut prev = 0;
        for i in 0..nruns {
            let b = le32(8 + 8 * i);
            let e = le32(12 + 8 * i);
            if b >= e || (i > 0 && b <= prev) || e > nbits {
                return Err(err(ErrorKind::BadOffsets, "bitmap runs out of order"));
            }
            prev = e;
            runs.push((b, e));
        }
        Ok(RunBitmap { nbits, runs })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    fn from_rows(nbits: u32, rows: &[u32]) -> RunBitmap {
        let mut bm = RunBitmap::with_size(nbits);
        for &r in rows {
            bm.set(r);
        }
        bm
    }

    #[test]
    fn test_set_get_count() {
        let bm = from_rows(10, &[1, 2, 3, 7]);
        assert_eq!(bm.count(), 4);
        assert_eq!(bm.size(), 10);
        assert!(bm.get(2));
        assert!(!bm.get(0));
        assert!(!bm.get(9));
    }

    #[test]
    fn test_out_of_order_set_merges_runs() {
        let mut bm = RunBitmap::with_size(8);
        bm.set(0);
        bm.set(2);
        bm.set(1);
        assert_eq!(bm.index_sets().collect::<Vec<_>>(), vec![IndexSet::Range(0, 3)]);
        bm.set(1); // idempotent
        assert_eq!(bm.count(), 3);
    }

    #[test]
    fn test_union_intersect_subtract_flip() {
        let a0 = from_rows(12, &[0, 1, 2, 6, 10]);
        let b = from_rows(12, &[2, 3, 6, 7, 11]);

        let mut u = a0.clone();
        u.union(&b);
        assert_eq!(u.ones().collect::<Vec<_>>(), vec![0, 1, 2, 3, 6, 7, 10, 11]);

        let mut i = a0.clone();
        i.intersect(&b);
        assert_eq!(i.ones().collect::<Vec<_>>(), vec![2, 6]);

        let mut s = a0.clone();
        s.subtract(&b);
        assert_eq!(s.ones().collect::<Vec<_>>(), vec![0, 1, 10]);

        let mut f = a0.clone();
        f.flip();
        assert_eq!(f.ones().collect::<Vec<_>>(), vec![3, 4, 5, 7, 8, 9, 11]);
        assert_eq!(f.count() + a0.count(), 12);
    }

    #[test]
    fn test_adjust_size() {
        let mut bm = from_rows(10, &[0, 1, 8, 9]);
        bm.adjust_size(9);
        assert_eq!(bm.ones().collect::<Vec<_>>(), vec![0, 1, 8]);
        bm.adjust_size(16);
        assert_eq!(bm.size(), 16);
        assert_eq!(bm.count(), 3);
    }

    #[test]
    fn test_index_sets_distinguish_singletons() {
        let bm = from_rows(10, &[0, 4, 5, 6, 9]);
        assert_eq!(
            bm.index_sets().collect::<Vec<_>>(),
            vec![IndexSet::Single(0), IndexSet::Range(4, 7), IndexSet::Single(9)]
        );
    }

    #[test]
    fn test_serialize_roundtrip() {
        let bm = from_rows(100, &[3, 4, 5, 50, 99]);
        let mut buf = Vec::new();
        bm.serialize(&mut buf);
        assert_eq!(buf.len(), bm.serialized_len());
        let back = RunBitmap::deserialize(&buf).unwrap();
        assert_eq!(back, bm);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(RunBitmap::deserialize(&[0, 0]).is_err());
        // Claims one run but carries none.
        let mut buf = Vec::new();
        buf.extend_from_slice(&10_u32.to_le_bytes());
        buf.extend_from_slice(&1_u32.to_le_bytes());
        assert!(RunBitmap::deserialize(&buf).is_err());
        // Run past the logical size.
        let mut buf = Vec::new();
        buf.extend_from_slice(&10_u32.to_le_bytes());
        buf.extend_from_slice(&1_u32.to_le_bytes());
        buf.extend_from_slice(&2_u32.to_le_bytes());
        buf.extend_from_slice(&20_u32.to_le_bytes());
        assert!(RunBitmap::deserialize(&buf).is_err());
    }
}
