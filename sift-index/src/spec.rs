use ordered_float::OrderedFloat;
use sift_base::{err, ElemTy, ErrorKind, Result};
use std::path::PathBuf;
use tracing::warn;

// Textual index specifications. Parsing is case-insensitive for
// keywords, tolerant of whitespace and commas, and skips (with a
// warning) anything it does not recognize rather than failing the whole
// spec: a column with a half-broken spec still gets a usable index.
//
// Recognized forms, composable in one string:
//   scale=linear|log  nbins=N (or no=N)  start=V  end=V
//   equal_weight      equal_ratio (alias for scale=log)
//   precision=D (or prec=D)
//   bins: [lo, hi, n] [lo, hi, n] ...
//   <binning (start=.. end=.. nbins=.. scale=..) (..) />
//   binFile=PATH (or file=PATH)
//   reorder

/// Bin count used when a spec names no other way to derive boundaries.
pub const DEFAULT_NBINS: u32 = 10_000;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Scale {
    #[default]
    Default,
    Linear,
    Log,
}

/// One explicit range group: n bins between start and end.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct BinRange {
    pub start: f64,
    pub end: f64,
    pub nbins: u32,
    pub scale: Scale,
}

#[derive(Clone, Debug, Default)]
pub struct BinSpec {
    pub scale: Scale,
    pub nbins: Option<u32>,
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub precision: Option<u32>,
    pub ranges: Vec<BinRange>,
    pub bin_file: Option<PathBuf>,
    pub equal_weight: bool,
    pub reorder: bool,
}

impl BinSpec {
    pub fn parse(text: &str) -> BinSpec {
        let mut spec = BinSpec::default();
        for tok in tokenize(text) {
            match tok {
                Token::Group(inner) => {
                    if let Some(r) = spec.parse_group(&inner) {
                        spec.ranges.push(r);
                    }
                }
                Token::Triple(inner) => {
                    if let Some(r) = spec.parse_triple(&inner) {
                        spec.ranges.push(r);
                    }
                }
                Token::Word(w) => spec.apply_word(&w),
            }
        }
        spec
    }

    /// Does boundary derivation need a value histogram?
    pub fn needs_histogram(&self) -> bool {
        self.precision.is_some() || self.equal_weight || self.is_vacuous()
    }

    fn is_vacuous(&self) -> bool {
        self.scale == Scale::Default
            && self.nbins.is_none()
            && self.start.is_none()
            && self.end.is_none()
            && self.precision.is_none()
            && self.ranges.is_empty()
            && self.bin_file.is_none()
            && !self.equal_weight
    }

    fn apply_word(&mut self, word: &str) {
        let word = word.trim().trim_matches(',');
        if word.is_empty() {
            return;
        }
        let lower = word.to_ascii_lowercase();
        // Structural markers of the <binning .../> form carry nothing.
        if lower == "<binning" || lower == "/>" || lower == "bins:" || lower == "bins" {
            return;
        }
        let (key, val) = match word.split_once('=') {
            Some((k, v)) => (k.trim().to_ascii_lowercase(), Some(v.trim())),
            None => (lower.clone(), None),
        };
        match key.as_str() {
            "scale" => match val.map(|v| v.to_ascii_lowercase()).as_deref() {
                Some("linear") => self.scale = Scale::Linear,
                Some("log") | Some("logarithmic") => self.scale = Scale::Log,
                other => warn!(target: "sift", scale = ?other, "unrecognized scale"),
            },
            "nbins" | "no" => match val.and_then(|v| v.parse::<u32>().ok()) {
                Some(n) if n > 0 => self.nbins = Some(n),
                _ => warn!(target: "sift", word, "bad bin count"),
            },
            "start" | "begin" => match val.and_then(|v| v.parse::<f64>().ok()) {
                Some(v) => self.start = Some(v),
                None => warn!(target: "sift", word, "bad start value"),
            },
            "end" => match val.and_then(|v| v.parse::<f64>().ok()) {
                Some(v) => self.end = Some(v),
                None => warn!(target: "sift", word, "bad end value"),
            },
            "precision" | "prec" => match val.and_then(|v| v.parse::<u32>().ok()) {
                Some(d) if d > 0 => self.precision = Some(d),
                _ => warn!(target: "sift", word, "bad precision"),
            },
            "binfile" | "file" => match val {
                Some(p) if !p.is_empty() => self.bin_file = Some(PathBuf::from(p)),
                _ => warn!(target: "sift", word, "bad bin file"),
            },
            "equal_weight" => self.equal_weight = true,
            "equal_ratio" => self.scale = Scale::Log,
            "reorder" => self.reorder = true,
            _ => warn!(target: "sift", word, "unrecognized index spec option"),
        }
    }

    /// A parenthesized group: key=value pairs overriding the outer
    /// defaults, yielding one range.
    fn parse_group(&self, inner: &str) -> Option<BinRange> {
        let mut sub = BinSpec {
            scale: self.scale,
            nbins: self.nbins,
            ..BinSpec::default()
        };
        for word in inner.split(|c: char| c.is_whitespace() || c == ',') {
            if !word.trim().is_empty() {
                sub.apply_word(word);
            }
        }
        match (sub.start, sub.end) {
            (Some(start), Some(end)) if start < end => Some(BinRange {
                start,
                end,
                nbins: sub.nbins.unwrap_or(DEFAULT_NBINS),
                scale: sub.scale,
            }),
            _ => {
                warn!(target: "sift", group = inner, "range group needs start < end");
                None
            }
        }
    }

    /// A bracketed triple [lo, hi, n].
    fn parse_triple(&self, inner: &str) -> Option<BinRange> {
        let nums: Vec<f64> = inner
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|w| !w.trim().is_empty())
            .filter_map(|w| w.trim().parse::<f64>().ok())
            .collect();
        if nums.len() != 3 || nums[0] >= nums[1] || nums[2] < 1.0 {
            warn!(target: "sift", triple = inner, "bad [lo, hi, n] range");
            return None;
        }
        Some(BinRange {
            start: nums[0],
            end: nums[1],
            nbins: nums[2] as u32,
            scale: self.scale,
        })
    }

    /// Derive the sorted boundary array. vmin/vmax are the column's
    /// observed extremes; the histogram (sorted distinct values with
    /// counts) is required by the precision and equal-weight modes.
    pub fn bounds(
        &self,
        ty: ElemTy,
        vmin: f64,
        vmax: f64,
        hist: Option<&[(f64, u32)]>,
    ) -> Result<Vec<f64>> {
        let mut out = Vec::new();
        if let Some(path) = &self.bin_file {
            read_bounds_file(path, &mut out)?;
        }
        for r in &self.ranges {
            emit_range(r, &mut out);
        }
        if let Some(d) = self.precision {
            let hist = hist.ok_or_else(|| {
                err(ErrorKind::UnsupportedType, "precision binning needs sampled values")
            })?;
            granule_bounds(hist, d, &mut out);
        } else if self.equal_weight {
            let hist = hist.ok_or_else(|| {
                err(ErrorKind::UnsupportedType, "equal-weight binning needs sampled values")
            })?;
            equal_weight_bounds(hist, self.nbins.unwrap_or(DEFAULT_NBINS), &mut out);
        } else if !self.is_vacuous() && self.ranges.is_empty() && self.bin_file.is_none() {
            let start = self.start.unwrap_or(vmin);
            let end = self.end.unwrap_or(vmax);
            let r = BinRange {
                start,
                end,
                nbins: self.nbins.unwrap_or(DEFAULT_NBINS),
                scale: self.scale,
            };
            emit_range(&r, &mut out);
        }
        if out.is_empty() {
            // Nothing usable in the spec: approximate equal weight.
            match hist {
                Some(h) => equal_weight_bounds(h, DEFAULT_NBINS, &mut out),
                None => emit_range(
                    &BinRange {
                        start: vmin,
                        end: vmax,
                        nbins: DEFAULT_NBINS,
                        scale: Scale::Linear,
                    },
                    &mut out,
                ),
            }
        }
        // Granule pairs sit one ulp apart and must survive dedup; every
        // other mode drops boundaries within numeric epsilon.
        Ok(finish_bounds(out, ty, self.precision.is_some()))
    }
}

enum Token {
    Word(String),
    Group(String),
    Triple(String),
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut word = String::new();
    let mut chars = text.chars().peekable();
    let flush = |word: &mut String, out: &mut Vec<Token>| {
        if !word.trim().is_empty() {
            out.push(Token::Word(std::mem::take(word)));
        } else {
            word.clear();
        }
    };
    while let Some(c) = chars.next() {
        match c {
            '(' | '[' => {
                flush(&mut word, &mut out);
                let close = if c == '(' { ')' } else { ']' };
                let mut inner = String::new();
                for d in chars.by_ref() {
                    if d == close {
                        break;
                    }
                    inner.push(d);
                }
                out.push(if c == '(' { Token::Group(inner) } else { Token::Triple(inner) });
            }
            c if c.is_whitespace() || c == ',' => flush(&mut word, &mut out),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut out);
    out
}

fn read_bounds_file(path: &std::path::Path, out: &mut Vec<f64>) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<f64>() {
            Ok(v) => out.push(v),
            Err(_) => warn!(target: "sift", line, "unparseable boundary line"),
        }
    }
    Ok(())
}

fn emit_range(r: &BinRange, out: &mut Vec<f64>) {
    match r.scale {
        Scale::Log => emit_log(r, out),
        Scale::Linear | Scale::Default => emit_linear(r, out),
    }
}

fn emit_linear(r: &BinRange, out: &mut Vec<f64>) {
    let n = r.nbins.max(1);
    let step = (r.end - r.start) / n as f64;
    for i in 0..=n {
        out.push(r.start + step * i as f64);
    }
}

/// Logarithmic boundaries: each order of magnitude is cut into up to
/// ten slots, evenly spaced in log space and rounded to one significant
/// digit. The slot count adapts to the requested bin count over the
/// span's orders of magnitude.
fn emit_log(r: &BinRange, out: &mut Vec<f64>) {
    if r.start <= 0.0 {
        warn!(target: "sift", start = r.start, "log scale needs a positive start, using linear");
        emit_linear(r, out);
        return;
    }
    let orders = (r.end / r.start).log10().ceil().max(1.0);
    let slots = ((r.nbins as f64 / orders).round() as u32).clamp(1, 10);
    out.push(r.start);
    let mut decade = r.start.log10().floor() as i32;
    loop {
        let base = 10f64.powi(decade);
        if base > r.end {
            break;
        }
        for j in 0..slots {
            let cut = round_sig(base * 10f64.powf(j as f64 / slots as f64), 1);
            if cut > r.start && cut < r.end {
                out.push(cut);
            }
        }
        decade += 1;
    }
    out.push(r.end);
}

/// Cut the histogram into nbins parts of roughly equal population; one
/// boundary at the first value of each part after the first. Fewer
/// distinct values than parts degrades to one bin per distinct value.
fn equal_weight_bounds(hist: &[(f64, u32)], nbins: u32, out: &mut Vec<f64>) {
    if hist.is_empty() {
        return;
    }
    if hist.len() as u32 <= nbins {
        for &(v, _) in hist {
            out.push(v);
        }
        return;
    }
    let cuts = divide_counts(hist, nbins);
    out.push(hist[0].0);
    for i in cuts {
        out.push(hist[i].0);
    }
}

/// Indices starting each part after the first, chosen so cumulative
/// weight crosses the even multiples of total/nparts.
fn divide_counts(hist: &[(f64, u32)], nparts: u32) -> Vec<usize> {
    let total: u64 = hist.iter().map(|&(_, c)| c as u64).sum();
    let mut cuts = Vec::new();
    let mut acc = 0_u64;
    let mut made = 1_u64;
    for (i, &(_, c)) in hist.iter().enumerate() {
        if i > 0 && made < nparts as u64 && acc * nparts as u64 >= total * made {
            cuts.push(i);
            made += 1;
        }
        acc += c as u64;
    }
    cuts
}

/// Granule boundaries for precision=d: every distinct value rounds to a
/// key with d significant digits, and each key contributes the pair
/// (key, just-above-key) so values below, equal to, and above the key
/// separate into their own bins.
fn granule_bounds(hist: &[(f64, u32)], digits: u32, out: &mut Vec<f64>) {
    let mut keys: Vec<OrderedFloat<f64>> = hist
        .iter()
        .map(|&(v, _)| OrderedFloat(round_sig(v, digits)))
        .collect();
    keys.sort();
    keys.dedup();
    for k in keys {
        let k = k.0;
        out.push(k);
        out.push(k.next_up());
    }
}

/// Round to d significant decimal digits.
pub(crate) fn round_sig(v: f64, digits: u32) -> f64 {
    if v == 0.0 || !v.is_finite() {
        return v;
    }
    let mag = v.abs().log10().floor() as i32;
    let scale = 10f64.powi(digits as i32 - 1 - mag);
    (v * scale).round() / scale
}

/// Sort, truncate for integer columns, drop duplicates, and append the
/// +inf sentinel. Exact dedup keeps boundaries a single ulp apart;
/// otherwise values within numeric epsilon of the previous boundary are
/// dropped.
fn finish_bounds(mut bounds: Vec<f64>, ty: ElemTy, exact: bool) -> Vec<f64> {
    bounds.retain(|v| v.is_finite());
    if ty.is_integer() {
        for v in &mut bounds {
            *v = v.trunc();
        }
    }
    bounds.sort_by(|a, b| OrderedFloat(*a).cmp(&OrderedFloat(*b)));
    let mut out: Vec<f64> = Vec::with_capacity(bounds.len() + 1);
    for v in bounds {
        match out.last() {
            Some(&prev) if !distinct(prev, v, exact) => {}
            _ => out.push(v),
        }
    }
    out.push(f64::INFINITY);
    out
}

fn distinct(a: f64, b: f64, exact: bool) -> bool {
    if exact {
        return b > a;
    }
    let eps = 1e-12 * a.abs().max(b.abs()).max(1.0);
    b - a > eps
}

/// Smallest i with bounds[i] > v: the bin a value belongs to. Binary
/// search for eight or more bins, linear below. Non-finite probes map
/// to bin zero.
pub fn locate(bounds: &[f64], v: f64) -> usize {
    if !v.is_finite() || bounds.is_empty() {
        return 0;
    }
    if bounds.len() >= 8 {
        bounds.partition_point(|b| *b <= v)
    } else {
        bounds.iter().position(|b| *b > v).unwrap_or(bounds.len() - 1)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_parse_plain_options() {
        let s = BinSpec::parse("nbins=5 scale=LINEAR start=1 end=11");
        assert_eq!(s.scale, Scale::Linear);
        assert_eq!(s.nbins, Some(5));
        assert_eq!(s.start, Some(1.0));
        assert_eq!(s.end, Some(11.0));
        assert!(!s.reorder);
    }

    #[test]
    fn test_parse_flags_and_aliases() {
        let s = BinSpec::parse("equal_weight, no=100 reorder");
        assert!(s.equal_weight);
        assert_eq!(s.nbins, Some(100));
        assert!(s.reorder);
        let s = BinSpec::parse("equal_ratio");
        assert_eq!(s.scale, Scale::Log);
        let s = BinSpec::parse("Precision=2");
        assert_eq!(s.precision, Some(2));
    }

    #[test]
    fn test_parse_binning_groups() {
        let s = BinSpec::parse("<binning (start=0 end=10 nbins=5) (start=100, end=200, nbins=2, scale=log) />");
        assert_eq!(s.ranges.len(), 2);
        assert_eq!(s.ranges[0].nbins, 5);
        assert_eq!(s.ranges[1].scale, Scale::Log);
    }

    #[test]
    fn test_parse_explicit_triples() {
        let s = BinSpec::parse("bins: [0, 10, 5] [10, 100, 9]");
        assert_eq!(s.ranges.len(), 2);
        assert_eq!(s.ranges[1].start, 10.0);
        assert_eq!(s.ranges[1].nbins, 9);
    }

    #[test]
    fn test_parse_junk_is_skipped() {
        let s = BinSpec::parse("wibble=3 scale=linear [1,2] garbage");
        assert_eq!(s.scale, Scale::Linear);
        assert!(s.ranges.is_empty());
    }

    #[test]
    fn test_linear_bounds() {
        let s = BinSpec::parse("nbins=5 scale=linear start=1 end=11");
        let b = s.bounds(ElemTy::I32, 1.0, 10.0, None).unwrap();
        assert_eq!(b, vec![1.0, 3.0, 5.0, 7.0, 9.0, 11.0, f64::INFINITY]);
    }

    #[test]
    fn test_integer_truncation_and_dedup() {
        let s = BinSpec::parse("nbins=4 scale=linear start=0 end=2");
        let b = s.bounds(ElemTy::I32, 0.0, 2.0, None).unwrap();
        // 0, 0.5, 1, 1.5, 2 truncate to 0, 0, 1, 1, 2.
        assert_eq!(b, vec![0.0, 1.0, 2.0, f64::INFINITY]);
    }

    #[test]
    fn test_log_bounds_are_sorted_and_positive() {
        let s = BinSpec::parse("scale=log nbins=9 start=1 end=1000");
        let b = s.bounds(ElemTy::F64, 1.0, 1000.0, None).unwrap();
        assert!(b.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(b[0], 1.0);
        assert_eq!(b[b.len() - 1], f64::INFINITY);
        assert!(b.contains(&1000.0));
    }

    #[test]
    fn test_equal_weight_bounds() {
        // 100 ones, 100 twos, 100 threes, 100 fours into 4 parts.
        let hist = [(1.0, 100), (2.0, 100), (3.0, 100), (4.0, 100)];
        let s = BinSpec::parse("equal_weight nbins=4");
        let b = s.bounds(ElemTy::F64, 1.0, 4.0, Some(&hist)).unwrap();
        assert_eq!(b, vec![1.0, 2.0, 3.0, 4.0, f64::INFINITY]);
    }

    #[test]
    fn test_granule_bounds_isolate_keys() {
        let hist = [(0.1, 1), (0.2, 1), (0.3, 1), (0.4, 1)];
        let s = BinSpec::parse("precision=1");
        let b = s.bounds(ElemTy::F64, 0.1, 0.4, Some(&hist)).unwrap();
        // Every key produces its own [k, k+) equality bin.
        for k in [0.1, 0.2, 0.3, 0.4] {
            let i = locate(&b, k);
            assert!(b[i] > k && i > 0 && b[i - 1] <= k);
        }
        assert!(b.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_round_sig() {
        assert_eq!(round_sig(0.123, 1), 0.1);
        assert_eq!(round_sig(0.25, 1), 0.3);
        assert_eq!(round_sig(1234.0, 2), 1200.0);
        assert_eq!(round_sig(-0.037, 1), -0.04);
    }

    #[test]
    fn test_locate_monotonic() {
        let b = vec![3.0, 5.0, 7.0, 9.0, f64::INFINITY];
        assert_eq!(locate(&b, -100.0), 0);
        assert_eq!(locate(&b, 2.9), 0);
        assert_eq!(locate(&b, 3.0), 1);
        assert_eq!(locate(&b, 8.0), 3);
        assert_eq!(locate(&b, 9.0), 4);
        assert_eq!(locate(&b, 1e300), 4);
        assert_eq!(locate(&b, f64::NAN), 0);
        let mut prev = 0;
        for v in [-5.0, 0.0, 3.0, 4.0, 6.0, 9.5, 100.0] {
            let k = locate(&b, v);
            assert!(k >= prev);
            prev = k;
        }
    }

    #[test]
    fn test_bounds_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bounds.txt");
        std::fs::write(&path, "# edges\n1.5\n2.5\n\n3.5 # trailing\n").unwrap();
        let s = BinSpec::parse(&format!("binFile={}", path.display()));
        let b = s.bounds(ElemTy::F64, 0.0, 10.0, None).unwrap();
        assert_eq!(b, vec![1.5, 2.5, 3.5, f64::INFINITY]);
    }
}
