//! Read sources: where aligned reads for one sample come from.
//!
//! A [`ReadSource`] is opened once per sample by a [`SourceOpener`] and
//! dropped when the per-sample work finishes, on success or failure.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use log::debug;
use rust_htslib::bam::record::{Aux, Cigar, Record};
use rust_htslib::bam::{self, Read as HtsRead};

use crate::error::{Error, Result};
use crate::model::types::SampleInfo;
use crate::types::{AlignedRead, Block, Region, Strand};

/// Supplies aligned reads overlapping a region.
pub trait ReadSource {
    /// Reads overlapping `region`, finalized (sorted blocks, introns derived).
    fn fetch_reads(&mut self, region: &Region) -> Result<Vec<AlignedRead>>;

    /// Whole-sequence regions known to the source.
    fn sequences(&self) -> Vec<Region>;
}

/// Opens the read source of one sample.
pub trait SourceOpener: Sync {
    type Source: ReadSource;

    fn open(&self, sample: &SampleInfo) -> Result<Self::Source>;
}

/// Indexed BAM file.
///
/// Skips unmapped, secondary, supplementary, QC-failed and duplicate
/// records. The splice strand comes from the `XS` tag.
pub struct BamReadSource {
    sample: String,
    path: PathBuf,
    reader: bam::IndexedReader,
}

impl BamReadSource {
    pub fn open(path: impl AsRef<Path>, sample: &str) -> Result<Self> {
        let path = path.as_ref();
        let reader = bam::IndexedReader::from_path(path).map_err(|e| {
            Error::resource(sample, format!("cannot open {}: {}", path.display(), e))
        })?;
        debug!("opened {} for sample {}", path.display(), sample);
        Ok(Self {
            sample: sample.to_string(),
            path: path.to_path_buf(),
            reader,
        })
    }
}

impl Drop for BamReadSource {
    fn drop(&mut self) {
        debug!("closing {} for sample {}", self.path.display(), self.sample);
    }
}

impl ReadSource for BamReadSource {
    fn fetch_reads(&mut self, region: &Region) -> Result<Vec<AlignedRead>> {
        let Some(tid) = self.reader.header().tid(region.seqname.as_bytes()) else {
            // sequence absent from this BAM: no evidence, not an error
            return Ok(Vec::new());
        };

        let start = i64::from(region.start) - 1;
        let end = i64::from(region.end);
        self.reader
            .fetch((tid, start, end))
            .map_err(|e| Error::resource(&self.sample, format!("fetch {}: {}", region, e)))?;

        let mut reads = Vec::new();
        let mut record = Record::new();
        while let Some(res) = self.reader.read(&mut record) {
            res.map_err(|e| Error::resource(&self.sample, format!("read {}: {}", region, e)))?;
            if skip_record(&record) {
                continue;
            }
            if let Some(read) = record_to_read(&record, &region.seqname) {
                reads.push(read);
            }
        }
        Ok(reads)
    }

    fn sequences(&self) -> Vec<Region> {
        let header = self.reader.header();
        header
            .target_names()
            .iter()
            .enumerate()
            .filter_map(|(tid, name)| {
                let len = header.target_len(tid as u32)?;
                let end = u32::try_from(len).ok().filter(|&l| l > 0)?;
                Some(Region::new(String::from_utf8_lossy(name), 1, end))
            })
            .collect()
    }
}

fn skip_record(record: &Record) -> bool {
    record.is_unmapped()
        || record.is_secondary()
        || record.is_supplementary()
        || record.is_quality_check_failed()
        || record.is_duplicate()
        || record.pos() < 0
}

/// Splice strand from the `XS` tag.
fn xs_strand(record: &Record) -> Strand {
    match record.aux(b"XS") {
        Ok(Aux::Char(c)) => Strand::from_char(c as char).unwrap_or(Strand::Unknown),
        Ok(Aux::String(s)) => s
            .chars()
            .next()
            .and_then(Strand::from_char)
            .unwrap_or(Strand::Unknown),
        _ => Strand::Unknown,
    }
}

/// Convert a BAM record into blocks (1-based inclusive).
///
/// `M`, `=`, `X` and `D` extend the current block, `N` closes it.
pub fn record_to_read(record: &Record, seqname: &str) -> Option<AlignedRead> {
    let mut ref_pos = u32::try_from(record.pos()).ok()? + 1;
    let mut block_start = ref_pos;
    let mut blocks = Vec::new();

    for op in record.cigar().iter() {
        match op {
            Cigar::Match(n) | Cigar::Equal(n) | Cigar::Diff(n) | Cigar::Del(n) => {
                ref_pos = ref_pos.saturating_add(*n);
            }
            Cigar::RefSkip(n) => {
                if ref_pos > block_start {
                    blocks.push(Block::new(block_start, ref_pos - 1));
                }
                ref_pos = ref_pos.saturating_add(*n);
                block_start = ref_pos;
            }
            _ => {}
        }
    }
    if ref_pos > block_start {
        blocks.push(Block::new(block_start, ref_pos - 1));
    }
    if blocks.is_empty() {
        return None;
    }

    let name = String::from_utf8_lossy(record.qname()).into_owned();
    let mut read = AlignedRead::new(name, seqname, xs_strand(record), blocks);
    if record.is_paired() {
        read = read.with_mate(record.is_first_in_template());
    }
    Some(read.finalized())
}

/// Opens the BAM file named in the sample sheet.
#[derive(Debug, Clone, Copy, Default)]
pub struct BamOpener;

impl SourceOpener for BamOpener {
    type Source = BamReadSource;

    fn open(&self, sample: &SampleInfo) -> Result<BamReadSource> {
        BamReadSource::open(&sample.file_bam, &sample.sample_name)
    }
}

/// Reads held in memory, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryReadSource {
    reads: Vec<AlignedRead>,
}

impl MemoryReadSource {
    pub fn new(reads: Vec<AlignedRead>) -> Self {
        let reads = reads
            .into_iter()
            .map(|r| if r.is_finalized() { r } else { r.finalized() })
            .collect();
        Self { reads }
    }
}

impl ReadSource for MemoryReadSource {
    fn fetch_reads(&mut self, region: &Region) -> Result<Vec<AlignedRead>> {
        Ok(self
            .reads
            .iter()
            .filter(|r| r.seqname == region.seqname)
            .filter(|r| {
                r.span()
                    .is_some_and(|(s, e)| s <= region.end && region.start <= e)
            })
            .cloned()
            .collect())
    }

    fn sequences(&self) -> Vec<Region> {
        let mut ends: BTreeMap<&str, u32> = BTreeMap::new();
        for r in &self.reads {
            if let Some((_, end)) = r.span() {
                let e = ends.entry(r.seqname.as_str()).or_default();
                *e = (*e).max(end);
            }
        }
        ends.into_iter().map(|(seq, end)| Region::new(seq, 1, end)).collect()
    }
}

/// In-memory reads per sample name.
#[derive(Debug, Clone, Default)]
pub struct MemoryOpener {
    by_sample: HashMap<String, Vec<AlignedRead>>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sample(mut self, sample: impl Into<String>, reads: Vec<AlignedRead>) -> Self {
        self.by_sample.insert(sample.into(), reads);
        self
    }
}

impl SourceOpener for MemoryOpener {
    type Source = MemoryReadSource;

    fn open(&self, sample: &SampleInfo) -> Result<MemoryReadSource> {
        self.by_sample
            .get(&sample.sample_name)
            .map(|reads| MemoryReadSource::new(reads.clone()))
            .ok_or_else(|| Error::resource(&sample.sample_name, "no reads registered for sample"))
    }
}
