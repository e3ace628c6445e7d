use crate::storage::Storage;
use sift_base::{err, Elem, ErrorKind, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

// A typed, length-counted view of column data. Either a private Vec<T>
// or a shallow (storage, offset, length) window decoding little-endian
// elements straight out of the shared bytes. Shallow views are
// read-only; every mutating operation first un-shares by copying.
//
// Elements are decoded per access rather than reinterpreted in place, so
// a view is valid at any byte offset regardless of alignment; the
// compiler reduces the fixed-width from_le_bytes to a plain load.

enum ArrayBody<T: Elem> {
    Owned(Vec<T>),
    Shared {
        st: Arc<Storage>,
        off: usize,
        len: usize, // elements
    },
}

pub struct Array<T: Elem> {
    body: ArrayBody<T>,
}

impl<T: Elem> Array<T> {
    pub fn new() -> Array<T> {
        Array { body: ArrayBody::Owned(Vec::new()) }
    }

    pub fn with_capacity(n: usize) -> Array<T> {
        Array { body: ArrayBody::Owned(Vec::with_capacity(n)) }
    }

    pub fn from_vec(v: Vec<T>) -> Array<T> {
        Array { body: ArrayBody::Owned(v) }
    }

    pub fn from_elem(n: usize, val: T) -> Array<T> {
        Array { body: ArrayBody::Owned(vec![val; n]) }
    }

    /// Shallow view over [byte_off, byte_off + byte_len) of a storage.
    /// The window must lie inside the storage and hold a whole number
    /// of elements.
    pub fn shared(st: Arc<Storage>, byte_off: usize, byte_len: usize) -> Result<Array<T>> {
        if byte_off + byte_len > st.len() {
            return Err(err(
                ErrorKind::BadOffsets,
                format!("view [{}, {}) outside storage of {} bytes",
                        byte_off, byte_off + byte_len, st.len()),
            ));
        }
        if byte_len % T::SIZE != 0 {
            return Err(err(
                ErrorKind::SizeMismatch,
                format!("{} bytes is not a whole number of {}-byte elements", byte_len, T::SIZE),
            ));
        }
        Ok(Array {
            body: ArrayBody::Shared { st, off: byte_off, len: byte_len / T::SIZE },
        })
    }

    /// Read the byte range [begin, end) of a file into a fresh array.
    pub fn read(path: &Path, begin: u64, end: u64) -> Result<Array<T>> {
        let st = Storage::read_range(path, begin, end, None)?;
        if st.len() as u64 != end - begin {
            return Err(err(
                ErrorKind::IoShort,
                format!("wanted {} bytes of {}, got {}", end - begin, path.display(), st.len()),
            ));
        }
        let n = st.len();
        Array::shared(Arc::new(st), 0, n)
    }

    pub fn len(&self) -> usize {
        match &self.body {
            ArrayBody::Owned(v) => v.len(),
            ArrayBody::Shared { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements the array can hold without reallocating. A shared view
    /// has no slack: any growth un-shares first.
    pub fn capacity(&self) -> usize {
        match &self.body {
            ArrayBody::Owned(v) => v.capacity(),
            ArrayBody::Shared { len, .. } => *len,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.body, ArrayBody::Shared { .. })
    }

    /// Element at position i. Panics when out of bounds, like slice
    /// indexing.
    pub fn get(&self, i: usize) -> T {
        match &self.body {
            ArrayBody::Owned(v) => v[i],
            ArrayBody::Shared { st, off, len } => {
                assert!(i < *len, "index {} out of bounds of {}", i, len);
                let at = off + i * T::SIZE;
                T::read_le(&st.bytes()[at..at + T::SIZE])
            }
        }
    }

    pub fn first(&self) -> Option<T> {
        if self.is_empty() { None } else { Some(self.get(0)) }
    }

    pub fn last(&self) -> Option<T> {
        if self.is_empty() { None } else { Some(self.get(self.len() - 1)) }
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    /// Convert a shallow view into a private copy; no-op when already
    /// owned.
    pub fn unshare(&mut self) {
        if let ArrayBody::Shared { .. } = self.body {
            let v = self.to_vec();
            self.body = ArrayBody::Owned(v);
        }
    }

    fn owned(&mut self) -> &mut Vec<T> {
        self.unshare();
        match &mut self.body {
            ArrayBody::Owned(v) => v,
            ArrayBody::Shared { .. } => unreachable!("unshare left a shared body"),
        }
    }

    /// Slice access; copies first when the view is shared.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.owned().as_mut_slice()
    }

    pub fn set(&mut self, i: usize, val: T) {
        self.owned()[i] = val;
    }

    pub fn push(&mut self, val: T) {
        self.owned().push(val);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.owned().pop()
    }

    pub fn resize(&mut self, n: usize, val: T) {
        self.owned().resize(n, val);
    }

    pub fn reserve(&mut self, n: usize) {
        self.owned().reserve(n);
    }

    pub fn truncate(&mut self, n: usize) {
        self.owned().truncate(n);
    }

    pub fn clear(&mut self) {
        self.owned().clear();
    }

    /// O(1): exchanges the two bodies.
    pub fn swap(&mut self, other: &mut Array<T>) {
        std::mem::swap(&mut self.body, &mut other.body);
    }

    /// Introspective quicksort: median-of-three pivot, insertion sort
    /// below 16 elements, heapsort once the depth passes 2*log2(n).
    pub fn sort(&mut self) {
        let s = self.as_mut_slice();
        let depth = 2 * (usize::BITS - s.len().leading_zeros()) as usize;
        introsort(s, depth);
    }

    /// Merge sort using the caller-supplied temp buffer.
    pub fn stable_sort(&mut self, tmp: &mut Vec<T>) {
        let s = self.as_mut_slice();
        tmp.clear();
        tmp.extend_from_slice(s);
        merge_sort(s, tmp);
    }

    pub fn is_sorted(&self) -> bool {
        (1..self.len()).all(|i| self.get(i - 1).total_cmp(&self.get(i)) != std::cmp::Ordering::Greater)
    }

    /// Positions of the k largest elements, in ascending value order.
    pub fn topk(&self, k: usize) -> Vec<u32> {
        select_k(self, k, false)
    }

    /// Positions of the k smallest elements, in ascending value order.
    pub fn bottomk(&self, k: usize) -> Vec<u32> {
        select_k(self, k, true)
    }

    /// Upper bound of the equal range of val in a sorted view: the
    /// number of elements not greater than val.
    pub fn find_upper(&self, val: T) -> usize {
        let mut lo = 0;
        let mut hi = self.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get(mid).total_cmp(&val) == std::cmp::Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    /// Drop adjacent duplicates of a sorted array.
    pub fn deduplicate(&mut self) {
        let v = self.owned();
        v.dedup_by(|a, b| a.total_cmp(b) == std::cmp::Ordering::Equal);
    }

    /// Write the whole view to the named file.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::with_capacity(self.len() * T::SIZE);
        for v in self.iter() {
            v.write_le(&mut buf);
        }
        let mut file = File::create(path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }
}

impl<T: Elem> Default for Array<T> {
    fn default() -> Self {
        Array::new()
    }
}

impl<T: Elem> PartialEq for Array<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && (0..self.len())
                .all(|i| self.get(i).total_cmp(&other.get(i)) == std::cmp::Ordering::Equal)
    }
}

impl<T: Elem> Clone for Array<T> {
    fn clone(&self) -> Self {
        match &self.body {
            ArrayBody::Owned(v) => Array::from_vec(v.clone()),
            ArrayBody::Shared { st, off, len } => Array {
                body: ArrayBody::Shared { st: st.clone(), off: *off, len: *len },
            },
        }
    }
}

impl<T: Elem> std::fmt::Debug for Array<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Array[{}; {}]", T::TY, self.len())
    }
}

fn introsort<T: Elem>(s: &mut [T], depth: usize) {
    if s.len() < 16 {
        insertion_sort(s);
        return;
    }
    if depth == 0 {
        heapsort(s);
        return;
    }
    let p = partition(s);
    let (lo, hi) = s.split_at_mut(p);
    introsort(lo, depth - 1);
    introsort(&mut hi[1..], depth - 1);
}

fn insertion_sort<T: Elem>(s: &mut [T]) {
    for i in 1..s.len() {
        let mut j = i;
        while j > 0 && s[j - 1].total_cmp(&s[j]) == std::cmp::Ordering::Greater {
            s.swap(j - 1, j);
            j -= 1;
        }
    }
}

/// Median-of-three pivot moved to the end, then a two-way partition.
/// Returns the pivot's final position.
fn partition<T: Elem>(s: &mut [T]) -> usize {
    let n = s.len();
    let mid = n / 2;
    // Order s[0], s[mid], s[n-1]; the median lands at mid.
    if s[mid].total_cmp(&s[0]) == std::cmp::Ordering::Less {
        s.swap(mid, 0);
    }
    if s[n - 1].total_cmp(&s[mid]) == std::cmp::Ordering::Less {
        s.swap(n - 1, mid);
        if s[mid].total_cmp(&s[0]) == std::cmp::Ordering::Less {
            s.swap(mid, 0);
        }
    }
    s.swap(mid, n - 1);
    let pivot = s[n - 1];
    let mut store = 0;
    for i in 0..n - 1 {
        if s[i].total_cmp(&pivot) == std::cmp::Ordering::Less {
            s.swap(i, store);
            store += 1;
        }
    }
    s.swap(store, n - 1);
    store
}

fn heapsort<T: Elem>(s: &mut [T]) {
    let n = s.len();
    for i in (0..n / 2).rev() {
        sift_down(s, i, n);
    }
    for end in (1..n).rev() {
        s.swap(0, end);
        sift_down(s, 0, end);
    }
}

fn sift_down<T: Elem>(s: &mut [T], mut root: usize, end: usize) {
    loop {
        let mut child = 2 * root + 1;
        if child >= end {
            return;
        }
        if child + 1 < end && s[child].total_cmp(&s[child + 1]) == std::cmp::Ordering::Less {
            child += 1;
        }
        if s[root].total_cmp(&s[child]) == std::cmp::Ordering::Less {
            s.swap(root, child);
            root = child;
        } else {
            return;
        }
    }
}

fn merge_sort<T: Elem>(s: &mut [T], tmp: &mut [T]) {
    let n = s.len();
    let mut width = 1;
    while width < n {
        let mut lo = 0;
        while lo < n {
            let mid = (lo + width).min(n);
            let hi = (lo + 2 * width).min(n);
            merge(&s[lo..mid], &s[mid..hi], &mut tmp[lo..hi]);
            lo = hi;
        }
        s.copy_from_slice(&tmp[..n]);
        width *= 2;
    }
}

fn merge<T: Elem>(a: &[T], b: &[T], out: &mut [T]) {
    let mut i = 0;
    let mut j = 0;
    let mut k = 0;
    while i < a.len() && j < b.len() {
        if b[j].total_cmp(&a[i]) == std::cmp::Ordering::Less {
            out[k] = b[j];
            j += 1;
        } else {
            out[k] = a[i];
            i += 1;
        }
        k += 1;
    }
    while i < a.len() {
        out[k] = a[i];
        i += 1;
        k += 1;
    }
    while j < b.len() {
        out[k] = b[j];
        j += 1;
        k += 1;
    }
}

/// Heap selection of the k extreme positions. With smallest == true the
/// result holds the k smallest, otherwise the k largest; either way the
/// positions come back ordered by ascending value.
fn select_k<T: Elem>(arr: &Array<T>, k: usize, smallest: bool) -> Vec<u32> {
    use std::cmp::Ordering;
    let k = k.min(arr.len());
    if k == 0 {
        return Vec::new();
    }
    // Binary heap of positions whose root is the weakest member of the
    // current selection.
    let weaker = |a: T, b: T| -> bool {
        match a.total_cmp(&b) {
            Ordering::Less => !smallest,
            Ordering::Greater => smallest,
            Ordering::Equal => false,
        }
    };
    let mut heap: Vec<u32> = (0..k as u32).collect();
    let heapify = |heap: &mut Vec<u32>, mut root: usize| {
        loop {
            let mut child = 2 * root + 1;
            if child >= heap.len() {
                return;
            }
            if child + 1 < heap.len()
                && weaker(arr.get(heap[child + 1] as usize), arr.get(heap[child] as usize))
            {
                child += 1;
            }
            if weaker(arr.get(heap[child] as usize), arr.get(heap[root] as usize)) {
                heap.swap(root, child);
                root = child;
            } else {
                return;
            }
        }
    };
    for i in (0..k / 2).rev() {
        heapify(&mut heap, i);
    }
    for i in k..arr.len() {
        if weaker(arr.get(heap[0] as usize), arr.get(i)) {
            heap[0] = i as u32;
            heapify(&mut heap, 0);
        }
    }
    heap.sort_by(|&a, &b| {
        arr.get(a as usize)
            .total_cmp(&arr.get(b as usize))
            .then(a.cmp(&b))
    });
    heap
}
