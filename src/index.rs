use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::model::feature::TxFeatureSet;
use crate::model::graph::GenomeGraph;
use crate::model::types::FeatureId;
use crate::types::AlignedRead;

const GRAPH_MAGIC: &[u8; 4] = b"SGG1";
const FEATURES_MAGIC: &[u8; 4] = b"SGF1";
const VERSION_STR: &str = env!("CARGO_PKG_VERSION");

/// Per-chromosome bucket index: bin -> feature ids.
///
/// This is a pre-filter only: it returns candidate features whose span
/// shares a bin with the query. Positions are 1-based; bin `b` holds
/// positions `b * bin_width + 1 ..= (b + 1) * bin_width`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChrBuckets {
    pub bin_width: u32,
    pub bins: Vec<Vec<FeatureId>>,
    pub max_end: u32,
}

impl ChrBuckets {
    pub fn new(bin_width: u32) -> Self {
        Self {
            bin_width,
            bins: Vec::new(),
            max_end: 0,
        }
    }

    #[inline]
    fn bin_of(&self, pos: u32) -> usize {
        (pos.saturating_sub(1) / self.bin_width) as usize
    }

    fn ensure_len_for_end(&mut self, end: u32) {
        self.max_end = self.max_end.max(end);
        let need_bins = self.bin_of(self.max_end) + 1;
        if self.bins.len() < need_bins {
            self.bins.resize_with(need_bins, Vec::new);
        }
    }

    fn add_span(&mut self, id: FeatureId, start: u32, end: u32) {
        if end < start {
            return;
        }
        self.ensure_len_for_end(end);
        let (b0, b1) = (self.bin_of(start), self.bin_of(end));
        for bin in &mut self.bins[b0..=b1] {
            bin.push(id);
        }
    }

    fn finalize(&mut self) {
        for bin in &mut self.bins {
            bin.sort_unstable();
            bin.dedup();
        }
    }
}

/// Candidate lookup of graph features by genomic span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureIndex {
    pub bin_width: u32,
    pub chr_names: Vec<String>,
    chr_to_id: HashMap<String, usize>,
    pub chr_buckets: Vec<ChrBuckets>,
}

impl FeatureIndex {
    pub const DEFAULT_BIN_WIDTH: u32 = 10_000;

    pub fn new(bin_width: u32) -> Self {
        Self {
            bin_width: bin_width.max(1),
            chr_names: Vec::new(),
            chr_to_id: HashMap::new(),
            chr_buckets: Vec::new(),
        }
    }

    /// Index every feature of `graph` by its span.
    pub fn build(graph: &GenomeGraph, bin_width: u32) -> Self {
        let mut idx = Self::new(bin_width);
        for f in graph.features() {
            let chr_id = idx.intern_chr(&f.interval.seqname);
            idx.chr_buckets[chr_id].add_span(f.feature_id, f.start(), f.end());
        }
        for cb in &mut idx.chr_buckets {
            cb.finalize();
        }
        idx
    }

    fn intern_chr(&mut self, chr: &str) -> usize {
        if let Some(&id) = self.chr_to_id.get(chr) {
            return id;
        }
        let id = self.chr_names.len();
        self.chr_names.push(chr.to_string());
        self.chr_to_id.insert(chr.to_string(), id);
        self.chr_buckets.push(ChrBuckets::new(self.bin_width));
        id
    }

    /// Candidate features for a span (union across bins, sorted, deduped).
    pub fn candidates_for_span(&self, seqname: &str, start: u32, end: u32) -> Vec<FeatureId> {
        let Some(&chr_id) = self.chr_to_id.get(seqname) else {
            return Vec::new();
        };
        let cb = &self.chr_buckets[chr_id];
        if cb.bins.is_empty() || end < start {
            return Vec::new();
        }

        let b0 = cb.bin_of(start);
        if b0 >= cb.bins.len() {
            return Vec::new();
        }
        let b1 = cb.bin_of(end).min(cb.bins.len() - 1);

        let mut out: Vec<FeatureId> = Vec::new();
        for bin in &cb.bins[b0..=b1] {
            out.extend_from_slice(bin);
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Convenience: candidates for a read (based on its span).
    pub fn candidates_for_read(&self, read: &AlignedRead) -> Vec<FeatureId> {
        let Some((s, e)) = read.span() else {
            return Vec::new();
        };
        self.candidates_for_span(&read.seqname, s, e)
    }
}

/// Human-readable summary of the `FeatureIndex`: one global line, then
/// per chromosome the number of bins, distinct features and the mean
/// number of features per bin (empty bins included).
impl fmt::Display for FeatureIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "FeatureIndex: {} chromosomes, bin_width={} bp",
            self.chr_names.len(),
            self.bin_width
        )?;

        for (chr_name, chr) in self.chr_names.iter().zip(&self.chr_buckets) {
            let nbins = chr.bins.len();
            let total_hits: usize = chr.bins.iter().map(Vec::len).sum();
            let uniq: HashSet<FeatureId> = chr.bins.iter().flatten().copied().collect();
            let mean = if nbins == 0 {
                0.0
            } else {
                total_hits as f64 / nbins as f64
            };
            writeln!(
                f,
                "  - {}: bins={}, features={}, mean_features/bin={:.3}",
                chr_name,
                nbins,
                uniq.len(),
                mean
            )?;
        }
        Ok(())
    }
}

/// Write `value` with a small header (magic + crate version) and a bincode payload.
fn save_payload<T: Serialize>(path: &Path, magic: &[u8; 4], value: &T) -> Result<()> {
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(f);

    w.write_all(magic)?;

    let v = VERSION_STR.as_bytes();
    let len = v.len() as u16;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(v)?;

    bincode::serialize_into(&mut w, value).with_context(|| format!("serialize {}", path.display()))?;
    w.flush()?;
    Ok(())
}

/// Read a file written by `save_payload`. Rejects wrong file types and version mismatches.
fn load_payload<T: DeserializeOwned>(path: &Path, magic: &[u8; 4], what: &str) -> Result<T> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut r = BufReader::new(f);

    let mut found = [0u8; 4];
    r.read_exact(&mut found)
        .with_context(|| format!("read header of {}", path.display()))?;
    if &found != magic {
        bail!("{} is not a {} file (bad magic)", path.display(), what);
    }

    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf)?;
    let len = u16::from_le_bytes(len_buf) as usize;

    let mut ver_buf = vec![0u8; len];
    r.read_exact(&mut ver_buf)?;
    let file_version = std::str::from_utf8(&ver_buf)?;

    if file_version != VERSION_STR {
        bail!(
            "{} version mismatch: file={}, binary={}",
            what,
            file_version,
            VERSION_STR
        );
    }

    let value: T = bincode::deserialize_from(&mut r).with_context(|| format!("decode {}", path.display()))?;
    Ok(value)
}

impl GenomeGraph {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_payload(path.as_ref(), GRAPH_MAGIC, self)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_payload(path.as_ref(), GRAPH_MAGIC, "splice graph")
    }
}

impl TxFeatureSet {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_payload(path.as_ref(), FEATURES_MAGIC, self)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_payload(path.as_ref(), FEATURES_MAGIC, "feature set")
    }
}
