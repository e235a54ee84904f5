//! Transcript feature prediction from aligned reads.
//!
//! Junctions come from spliced reads, exons from the coverage between
//! junction flanks. Terminal exons are provisional; `merge` trims and
//! collapses them once all samples are combined.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::error::Result;
use crate::model::feature::{TxFeature, TxFeatureSet};
use crate::model::types::{FeatureType, PredictOptions, SampleInfo};
use crate::reads::{ReadSource, SourceOpener};
use crate::types::{AlignedRead, GenomicInterval, Region, Strand};

/// A supported intron, 1-based inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JunctionCall {
    pub start: u32,
    pub end: u32,
    pub strand: Strand,
    pub count: u32,
}

/// Cluster spliced reads by exact intron and strand.
///
/// Reads only count when both flanking blocks are at least `min_anchor`
/// long. Reads without a strand tag are dropped when `require_strand_tag`
/// is set; otherwise they join the single stranded cluster with the same
/// coordinates, if there is exactly one. With `paired_end`, support is
/// counted per fragment: mates sharing a name add one count per intron.
pub fn call_junctions(
    reads: &[AlignedRead],
    region: &Region,
    paired_end: bool,
    opts: &PredictOptions,
) -> Vec<JunctionCall> {
    let mut stranded: BTreeMap<(u32, u32, Strand), u32> = BTreeMap::new();
    let mut unstranded: BTreeMap<(u32, u32), u32> = BTreeMap::new();
    let mut seen: HashSet<(u32, u32, &str)> = HashSet::new();

    for read in reads.iter().filter(|r| r.seqname == region.seqname) {
        for (i, &(start, end)) in read.introns().iter().enumerate() {
            // junctions are owned by the region holding their first base
            if start < region.start || start > region.end {
                continue;
            }
            let anchor = read.blocks[i].len().min(read.blocks[i + 1].len());
            if anchor < opts.min_anchor {
                continue;
            }
            if paired_end && !seen.insert((start, end, read.name.as_str())) {
                continue;
            }
            if read.strand.is_known() {
                *stranded.entry((start, end, read.strand)).or_default() += 1;
            } else {
                *unstranded.entry((start, end)).or_default() += 1;
            }
        }
    }

    if !opts.require_strand_tag {
        for ((start, end), n) in unstranded {
            let plus = stranded.contains_key(&(start, end, Strand::Plus));
            let minus = stranded.contains_key(&(start, end, Strand::Minus));
            let strand = match (plus, minus) {
                (true, false) => Strand::Plus,
                (false, true) => Strand::Minus,
                _ => continue,
            };
            if let Some(c) = stranded.get_mut(&(start, end, strand)) {
                *c += n;
            }
        }
    }

    stranded
        .into_iter()
        .filter(|&(_, count)| count >= opts.min_junction_count)
        .map(|((start, end, strand), count)| JunctionCall {
            start,
            end,
            strand,
            count,
        })
        .collect()
}

/// Piecewise constant read depth over a region.
///
/// Only covered stretches are stored; bases between segments have depth 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coverage {
    segments: Vec<(u32, u32, u32)>,
}

impl Coverage {
    /// Depth from all read blocks clipped to `region`.
    pub fn from_reads(reads: &[AlignedRead], region: &Region) -> Self {
        let mut deltas: Vec<(u32, i64)> = Vec::new();
        for read in reads.iter().filter(|r| r.seqname == region.seqname) {
            for b in &read.blocks {
                let start = b.start.max(region.start);
                let end = b.end.min(region.end);
                if start > end {
                    continue;
                }
                deltas.push((start, 1));
                deltas.push((end + 1, -1));
            }
        }
        deltas.sort_unstable();

        let mut segments = Vec::new();
        let mut depth: i64 = 0;
        let mut i = 0;
        while i < deltas.len() {
            let pos = deltas[i].0;
            while i < deltas.len() && deltas[i].0 == pos {
                depth += deltas[i].1;
                i += 1;
            }
            if depth > 0 {
                let next = deltas.get(i).map_or(pos, |d| d.0);
                segments.push((pos, next - 1, depth as u32));
            }
        }
        Self { segments }
    }

    fn segment_at(&self, pos: u32) -> Option<usize> {
        let i = self.segments.partition_point(|s| s.1 < pos);
        self.segments.get(i).filter(|s| s.0 <= pos).map(|_| i)
    }

    pub fn depth(&self, pos: u32) -> u32 {
        self.segment_at(pos).map_or(0, |i| self.segments[i].2)
    }

    /// Maximal runs with depth >= `min_depth`.
    pub fn islands(&self, min_depth: u32) -> Vec<(u32, u32)> {
        let mut out: Vec<(u32, u32)> = Vec::new();
        for &(s, e, d) in &self.segments {
            if d < min_depth {
                continue;
            }
            match out.last_mut() {
                Some(last) if last.1 + 1 == s => last.1 = e,
                _ => out.push((s, e)),
            }
        }
        out
    }

    /// Leftmost base reachable from `pos` without dropping below `min_depth`.
    pub fn extend_left(&self, pos: u32, min_depth: u32) -> Option<u32> {
        let mut i = self.segment_at(pos)?;
        if self.segments[i].2 < min_depth {
            return None;
        }
        while i > 0 {
            let prev = self.segments[i - 1];
            if prev.1 + 1 != self.segments[i].0 || prev.2 < min_depth {
                break;
            }
            i -= 1;
        }
        Some(self.segments[i].0)
    }

    /// Rightmost base reachable from `pos` without dropping below `min_depth`.
    pub fn extend_right(&self, pos: u32, min_depth: u32) -> Option<u32> {
        let mut i = self.segment_at(pos)?;
        if self.segments[i].2 < min_depth {
            return None;
        }
        while let Some(next) = self.segments.get(i + 1) {
            if self.segments[i].1 + 1 != next.0 || next.2 < min_depth {
                break;
            }
            i += 1;
        }
        Some(self.segments[i].1)
    }
}

/// Exon type from which genomic side is spliced.
fn exon_type(strand: Strand, spliced_left: bool, spliced_right: bool) -> FeatureType {
    match strand {
        Strand::Minus => FeatureType::tx_exon(spliced_right, spliced_left),
        _ => FeatureType::tx_exon(spliced_left, spliced_right),
    }
}

/// Features of one region: junctions, internal exons and provisional
/// terminal exons.
pub fn predict_region(
    reads: &[AlignedRead],
    region: &Region,
    paired_end: bool,
    opts: &PredictOptions,
) -> TxFeatureSet {
    let junctions = call_junctions(reads, region, paired_end, opts);
    let mut set = TxFeatureSet::new();
    if junctions.is_empty() {
        return set;
    }

    let coverage = Coverage::from_reads(reads, region);
    let islands = coverage.islands(opts.min_coverage);
    let island_of = |pos: u32| -> Option<usize> {
        let i = islands.partition_point(|&(_, e)| e < pos);
        islands.get(i).filter(|&&(s, _)| s <= pos).map(|_| i)
    };
    let interval = |s: u32, e: u32, strand: Strand| GenomicInterval::new(region.seqname.as_str(), s, e, strand);

    for strand in [Strand::Plus, Strand::Minus] {
        let js: Vec<&JunctionCall> = junctions.iter().filter(|j| j.strand == strand).collect();
        if js.is_empty() {
            continue;
        }
        for j in &js {
            set.insert(TxFeature::new(interval(j.start, j.end, strand), FeatureType::Junction));
        }

        // exon boundaries spliced on their left (after an intron) / right (before one)
        let lefts: BTreeSet<u32> = js.iter().filter_map(|j| j.end.checked_add(1)).collect();
        let rights: BTreeSet<u32> = js
            .iter()
            .filter_map(|j| j.start.checked_sub(1))
            .filter(|&p| p > 0)
            .collect();

        for &left in &lefts {
            let Some(island) = island_of(left) else { continue };
            let candidates: Vec<u32> = rights
                .range(left..)
                .copied()
                .take_while(|&r| island_of(r) == Some(island))
                .collect();
            if candidates.len() > opts.max_complexity {
                debug!(
                    "{}:{}: {} internal exon candidates, keeping the nearest {}",
                    region.seqname,
                    left,
                    candidates.len(),
                    opts.max_complexity
                );
            }
            for right in candidates.into_iter().take(opts.max_complexity) {
                set.insert(TxFeature::new(
                    interval(left, right, strand),
                    exon_type(strand, true, true),
                ));
            }
        }

        let threshold = |site: u32| -> u32 {
            let relative = (opts.beta * f64::from(coverage.depth(site))).ceil() as u32;
            opts.min_coverage.max(relative)
        };
        for &right in &rights {
            if let Some(start) = coverage.extend_left(right, threshold(right)) {
                set.insert(TxFeature::new(
                    interval(start, right, strand),
                    exon_type(strand, false, true),
                ));
            }
        }
        for &left in &lefts {
            if let Some(end) = coverage.extend_right(left, threshold(left)) {
                set.insert(TxFeature::new(
                    interval(left, end, strand),
                    exon_type(strand, true, false),
                ));
            }
        }
    }

    debug!(
        "{}: {} junctions, {} features",
        region,
        junctions.len(),
        set.len()
    );
    set
}

/// Predict features of one sample over `regions`.
pub fn predict_sample<S: ReadSource>(
    source: &mut S,
    regions: &[Region],
    paired_end: bool,
    opts: &PredictOptions,
) -> Result<TxFeatureSet> {
    let mut set = TxFeatureSet::new();
    for region in regions {
        let reads = source.fetch_reads(region)?;
        set = set.merge(predict_region(&reads, region, paired_end, opts));
    }
    Ok(set)
}

/// Per-sample prediction outcome, in sample sheet order.
#[derive(Debug)]
pub struct SamplePrediction {
    pub sample: String,
    pub features: Result<TxFeatureSet>,
}

/// Predict every sample in parallel.
///
/// Options and the sample sheet are validated first; failures of single
/// samples are returned in their slot and do not stop the others. With no
/// `regions`, every sequence the sample's source knows is scanned.
pub fn predict_samples<O: SourceOpener>(
    opener: &O,
    samples: &[SampleInfo],
    regions: &[Region],
    opts: &PredictOptions,
) -> Result<Vec<SamplePrediction>> {
    opts.validate()?;
    crate::model::types::validate_samples(samples)?;

    info!("predicting features for {} samples", samples.len());
    let out: Vec<SamplePrediction> = samples
        .par_iter()
        .map(|sample| {
            let features = opener.open(sample).and_then(|mut source| {
                let scan;
                let regions: &[Region] = if regions.is_empty() {
                    scan = source.sequences();
                    &scan
                } else {
                    regions
                };
                predict_sample(&mut source, regions, sample.paired_end, opts)
            });
            match &features {
                Ok(set) => info!("{}: {} features", sample.sample_name, set.len()),
                Err(e) => warn!("{}: prediction failed: {}", sample.sample_name, e),
            }
            SamplePrediction {
                sample: sample.sample_name.clone(),
                features,
            }
        })
        .collect();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::Block;

    fn read(strand: Strand, blocks: &[(u32, u32)]) -> AlignedRead {
        AlignedRead::new(
            "r",
            "chr1",
            strand,
            blocks.iter().map(|&(s, e)| Block::new(s, e)).collect(),
        )
        .finalized()
    }

    fn region() -> Region {
        Region::new("chr1", 1, 10_000)
    }

    /// Donor at 200, acceptors at 401 and 601, uniform coverage on the exons.
    fn a3ss_reads() -> Vec<AlignedRead> {
        let mut reads = Vec::new();
        for _ in 0..3 {
            reads.push(read(Strand::Plus, &[(151, 200), (401, 450)]));
            reads.push(read(Strand::Plus, &[(151, 200), (601, 650)]));
        }
        for s in (101..=151).step_by(50) {
            reads.push(read(Strand::Plus, &[(s, s + 49)]));
        }
        for s in (401..=751).step_by(50) {
            reads.push(read(Strand::Plus, &[(s, s + 49)]));
        }
        reads
    }

    #[test]
    fn junctions_need_support_and_anchor() {
        let mut reads = a3ss_reads();
        reads.push(read(Strand::Plus, &[(151, 200), (901, 950)]));
        reads.push(read(Strand::Plus, &[(151, 200), (999, 999)]));
        reads.push(read(Strand::Plus, &[(151, 200), (999, 999)]));

        let opts = PredictOptions {
            min_anchor: 5,
            ..Default::default()
        };
        let js = call_junctions(&reads, &region(), false, &opts);
        let coords: Vec<(u32, u32)> = js.iter().map(|j| (j.start, j.end)).collect();
        assert_eq!(coords, vec![(201, 400), (201, 600)]);
        assert!(js.iter().all(|j| j.count == 3 && j.strand == Strand::Plus));
    }

    #[test]
    fn unstranded_reads_follow_strand_tag_option() {
        let reads = vec![
            read(Strand::Plus, &[(151, 200), (401, 450)]),
            read(Strand::Unknown, &[(151, 200), (401, 450)]),
        ];
        let strict = call_junctions(&reads, &region(), false, &PredictOptions::default());
        assert!(strict.is_empty());

        let lenient = PredictOptions {
            require_strand_tag: false,
            ..Default::default()
        };
        let js = call_junctions(&reads, &region(), false, &lenient);
        assert_eq!(js.len(), 1);
        assert_eq!((js[0].count, js[0].strand), (2, Strand::Plus));
    }

    #[test]
    fn mates_support_a_junction_once() {
        let mates = |name: &str| {
            let mut a = read(Strand::Plus, &[(151, 200), (401, 450)]).with_mate(true);
            let mut b = read(Strand::Plus, &[(171, 200), (401, 470)]).with_mate(false);
            a.name = name.to_string();
            b.name = name.to_string();
            [a, b]
        };
        let reads: Vec<AlignedRead> = mates("f1").into_iter().chain(mates("f2")).collect();
        let opts = PredictOptions {
            min_junction_count: 3,
            ..Default::default()
        };

        let per_read = call_junctions(&reads, &region(), false, &opts);
        assert_eq!(per_read.len(), 1);
        assert_eq!(per_read[0].count, 4);
        assert!(call_junctions(&reads, &region(), true, &opts).is_empty());

        let lenient = PredictOptions {
            min_junction_count: 2,
            ..Default::default()
        };
        let per_fragment = call_junctions(&reads, &region(), true, &lenient);
        assert_eq!((per_fragment[0].start, per_fragment[0].end, per_fragment[0].count), (201, 400, 2));
    }

    #[test]
    fn coverage_segments_and_extension() {
        let reads = vec![
            read(Strand::Plus, &[(100, 149)]),
            read(Strand::Plus, &[(120, 169)]),
            read(Strand::Plus, &[(300, 309)]),
        ];
        let cov = Coverage::from_reads(&reads, &region());
        assert_eq!(cov.depth(99), 0);
        assert_eq!(cov.depth(100), 1);
        assert_eq!(cov.depth(130), 2);
        assert_eq!(cov.islands(1), vec![(100, 169), (300, 309)]);
        assert_eq!(cov.islands(2), vec![(120, 149)]);
        assert_eq!(cov.extend_left(140, 1), Some(100));
        assert_eq!(cov.extend_left(140, 2), Some(120));
        assert_eq!(cov.extend_right(140, 2), Some(149));
        assert_eq!(cov.extend_right(200, 1), None);
    }

    #[test]
    fn a3ss_features() {
        let set = predict_region(&a3ss_reads(), &region(), false, &PredictOptions::default());
        let got: Vec<(u32, u32, char)> = set.iter().map(|f| (f.start(), f.end(), f.kind.code())).collect();
        assert_eq!(
            got,
            vec![
                (151, 200, 'F'),
                (201, 400, 'J'),
                (201, 600, 'J'),
                (401, 800, 'L'),
                (601, 800, 'L'),
            ]
        );
    }

    #[test]
    fn internal_exon_between_junctions() {
        let mut reads = Vec::new();
        for _ in 0..2 {
            reads.push(read(Strand::Minus, &[(151, 200), (301, 350)]));
            reads.push(read(Strand::Minus, &[(351, 400), (501, 550)]));
        }
        let set = predict_region(&reads, &region(), false, &PredictOptions::default());
        let internal: Vec<(u32, u32)> = set
            .iter()
            .filter(|f| f.kind == FeatureType::InternalExon)
            .map(|f| (f.start(), f.end()))
            .collect();
        assert_eq!(internal, vec![(301, 400)]);
        // on the minus strand the exon right of the last intron is the first exon
        assert!(set
            .iter()
            .any(|f| f.kind == FeatureType::FirstExon && f.start() == 501 && f.strand() == Strand::Minus));
        assert!(set.iter().any(|f| f.kind == FeatureType::LastExon && f.end() == 200));
    }

    #[test]
    fn no_junctions_no_features() {
        let reads = vec![read(Strand::Plus, &[(100, 149)])];
        assert!(predict_region(&reads, &region(), false, &PredictOptions::default()).is_empty());
    }

    #[test]
    fn samples_fail_independently() {
        use crate::reads::MemoryOpener;
        let sample = |name: &str| SampleInfo {
            sample_name: name.to_string(),
            file_bam: String::new(),
            paired_end: false,
            read_length: 50,
            lib_size: 100,
        };
        let opener = MemoryOpener::new().with_sample("s1", a3ss_reads());
        let out = predict_samples(
            &opener,
            &[sample("s1"), sample("missing")],
            &[],
            &PredictOptions::default(),
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].features.as_ref().unwrap().len(), 5);
        assert!(matches!(out[1].features, Err(Error::Resource { .. })));
    }
}
