//! Read counting and derived values.
//!
//! Feature counts are compatible reads (fragments for paired-end data) per
//! sample. FPKM uses an effective length of `width + read_length - 1` for
//! exon bins and `read_length - 1` for junctions and splice sites. Variant
//! usage divides an anchor's count by the summed anchor counts of all
//! variants of the event on the same side.

use std::collections::HashMap;
use std::io::{self, Write};

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::compat::compatibility;
use crate::error::{Error, Result};
use crate::index::FeatureIndex;
use crate::model::event::SpliceEvent;
use crate::model::feature::SgFeature;
use crate::model::graph::GenomeGraph;
use crate::model::types::{validate_samples, Compatibility, FeatureId, FeatureType, SampleInfo};
use crate::reads::{ReadSource, SourceOpener};
use crate::types::Region;

/// Rows (features or variants) by sample columns.
///
/// `counts` are raw integers, `values` the derived quantity of the table
/// (FPKM or relative usage), `None` where it is undefined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountMatrix {
    pub row_ids: Vec<usize>,
    pub samples: Vec<String>,
    pub counts: Vec<Vec<u64>>,
    pub values: Vec<Vec<Option<f64>>>,
}

impl CountMatrix {
    pub fn n_rows(&self) -> usize {
        self.row_ids.len()
    }

    pub fn n_cols(&self) -> usize {
        self.samples.len()
    }

    pub fn column(&self, sample: &str) -> Option<usize> {
        self.samples.iter().position(|s| s == sample)
    }

    /// Row holding `id`; rows are sorted by id.
    pub fn row(&self, id: usize) -> Option<usize> {
        self.row_ids.binary_search(&id).ok()
    }

    pub fn count(&self, id: usize, sample: &str) -> Option<u64> {
        Some(self.counts[self.row(id)?][self.column(sample)?])
    }

    pub fn value(&self, id: usize, sample: &str) -> Option<f64> {
        self.values[self.row(id)?][self.column(sample)?]
    }

    /// Raw counts as TSV with a header line.
    pub fn write_counts<W: Write>(&self, mut w: W, id_header: &str) -> io::Result<()> {
        writeln!(w, "{}\t{}", id_header, self.samples.join("\t"))?;
        for (id, row) in self.row_ids.iter().zip(&self.counts) {
            let cells: Vec<String> = row.iter().map(u64::to_string).collect();
            writeln!(w, "{}\t{}", id, cells.join("\t"))?;
        }
        Ok(())
    }

    /// Derived values as TSV; undefined cells are written as `NA`.
    pub fn write_values<W: Write>(&self, mut w: W, id_header: &str) -> io::Result<()> {
        writeln!(w, "{}\t{}", id_header, self.samples.join("\t"))?;
        for (id, row) in self.row_ids.iter().zip(&self.values) {
            let cells: Vec<String> = row.iter().map(|v| format_value(*v)).collect();
            writeln!(w, "{}\t{}", id, cells.join("\t"))?;
        }
        Ok(())
    }
}

pub fn format_value(v: Option<f64>) -> String {
    match v {
        Some(x) => format!("{x:.6}"),
        None => "NA".to_string(),
    }
}

/// Raw feature counts of one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleCounts {
    pub sample: String,
    /// Indexed by `feature_id - 1`.
    pub counts: Vec<u64>,
    /// Per locus (graph order): at least one read was compatible with a feature.
    pub informative: Vec<bool>,
}

/// Count compatible reads (or fragments) for every feature of `graph`.
pub fn count_sample<S: ReadSource>(
    graph: &GenomeGraph,
    index: &FeatureIndex,
    source: &mut S,
    sample: &SampleInfo,
) -> Result<SampleCounts> {
    let mut counts = vec![0u64; graph.n_features()];
    let mut informative = vec![false; graph.loci.len()];

    for (li, g) in graph.loci.iter().enumerate() {
        let Some(first) = g.first_feature_id() else {
            continue;
        };
        let local = first..first + g.features.len();
        let reads = source.fetch_reads(&Region::new(g.seqname.as_str(), g.start, g.end))?;

        // per (feature, fragment): some mate compatible, some mate contradicting
        let mut fragments: HashMap<(FeatureId, &str), (bool, bool)> = HashMap::new();
        for read in &reads {
            for id in index.candidates_for_read(read) {
                if !local.contains(&id) {
                    continue;
                }
                let Some(feature) = g.feature(id) else { continue };
                let compat = compatibility(read, feature);
                if compat == Compatibility::Compatible {
                    informative[li] = true;
                }
                if !sample.paired_end {
                    if compat == Compatibility::Compatible {
                        counts[id - 1] += 1;
                    }
                    continue;
                }
                let state = fragments.entry((id, read.name.as_str())).or_default();
                match compat {
                    Compatibility::Compatible => state.0 = true,
                    Compatibility::SpliceMismatch | Compatibility::Intronic => state.1 = true,
                    Compatibility::StrandMismatch | Compatibility::NoOverlap => {}
                }
            }
        }
        for ((id, _), (compatible, contradicted)) in fragments {
            if compatible && !contradicted {
                counts[id - 1] += 1;
            }
        }
        debug!(
            "{}: locus {} ({} reads, informative={})",
            sample.sample_name,
            g.gene_id,
            reads.len(),
            informative[li]
        );
    }

    Ok(SampleCounts {
        sample: sample.sample_name.clone(),
        counts,
        informative,
    })
}

fn effective_length(feature: &SgFeature, read_length: u32) -> u64 {
    let rl = u64::from(read_length);
    match feature.kind {
        FeatureType::ExonBin { .. } => u64::from(feature.len()) + rl - 1,
        _ => rl.saturating_sub(1),
    }
}

/// Fragments per kilobase of effective length per million library reads.
pub fn fpkm(count: u64, feature: &SgFeature, sample: &SampleInfo) -> Option<f64> {
    let eff_len = effective_length(feature, sample.read_length);
    if sample.lib_size == 0 || eff_len == 0 {
        return None;
    }
    Some(count as f64 * 1e9 / (sample.lib_size as f64 * eff_len as f64))
}

/// Feature table: rows in feature id order, FPKM as values.
///
/// `samples[i]` must describe `counts[i]`. Loci without informative reads
/// in a sample get `None` values for that sample.
pub fn feature_matrix(graph: &GenomeGraph, samples: &[&SampleInfo], counts: &[SampleCounts]) -> CountMatrix {
    let mut m = CountMatrix {
        samples: samples.iter().map(|s| s.sample_name.clone()).collect(),
        ..Default::default()
    };
    for (li, g) in graph.loci.iter().enumerate() {
        for f in &g.features {
            m.row_ids.push(f.feature_id);
            let mut row_counts = Vec::with_capacity(samples.len());
            let mut row_values = Vec::with_capacity(samples.len());
            for (info, sc) in samples.iter().zip(counts) {
                let c = sc.counts[f.feature_id - 1];
                row_counts.push(c);
                row_values.push(if sc.informative[li] { fpkm(c, f, info) } else { None });
            }
            m.counts.push(row_counts);
            m.values.push(row_values);
        }
    }
    m
}

/// A sample that could not be counted.
#[derive(Debug)]
pub struct SampleFailure {
    pub sample: String,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct CountReport {
    pub features: CountMatrix,
    pub failures: Vec<SampleFailure>,
}

/// Count all samples in parallel.
///
/// The sample sheet is validated before any work starts. A sample that
/// fails is reported and left out of the matrix columns.
pub fn count_samples<O: SourceOpener>(
    graph: &GenomeGraph,
    samples: &[SampleInfo],
    opener: &O,
) -> Result<CountReport> {
    validate_samples(samples)?;
    let index = FeatureIndex::build(graph, FeatureIndex::DEFAULT_BIN_WIDTH);
    info!(
        "counting {} features in {} samples",
        graph.n_features(),
        samples.len()
    );

    let results: Vec<Result<SampleCounts>> = samples
        .par_iter()
        .map(|s| {
            let mut source = opener.open(s)?;
            count_sample(graph, &index, &mut source, s)
        })
        .collect();

    let mut ok_samples = Vec::new();
    let mut ok_counts = Vec::new();
    let mut failures = Vec::new();
    for (s, res) in samples.iter().zip(results) {
        match res {
            Ok(c) => {
                ok_samples.push(s);
                ok_counts.push(c);
            }
            Err(error) => {
                warn!("{}: counting failed: {}", s.sample_name, error);
                failures.push(SampleFailure {
                    sample: s.sample_name.clone(),
                    error,
                });
            }
        }
    }

    Ok(CountReport {
        features: feature_matrix(graph, &ok_samples, &ok_counts),
        failures,
    })
}

/// Per-variant anchor counts and relative usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantQuant {
    /// 5' anchor counts; values are 5' usage.
    pub counts_5p: CountMatrix,
    /// 3' anchor counts; values are 3' usage.
    pub counts_3p: CountMatrix,
    /// Mean of the defined 5' and 3' usages, rows as in `counts_5p`.
    pub usage: Vec<Vec<Option<f64>>>,
}

fn side_matrix(
    events: &[SpliceEvent],
    features: &CountMatrix,
    anchor: impl Fn(&crate::model::event::SpliceVariant) -> Option<FeatureId>,
) -> CountMatrix {
    let n_cols = features.n_cols();
    let count_of = |id: FeatureId, col: usize| -> u64 { features.row(id).map_or(0, |r| features.counts[r][col]) };

    let mut m = CountMatrix {
        samples: features.samples.clone(),
        ..Default::default()
    };
    for ev in events {
        // a shared anchor counts once per variant using it, so fractions sum to 1
        let anchors: Vec<FeatureId> = ev.variants.iter().filter_map(&anchor).collect();
        let totals: Vec<u64> = (0..n_cols)
            .map(|col| anchors.iter().map(|&id| count_of(id, col)).sum())
            .collect();

        for var in &ev.variants {
            m.row_ids.push(var.variant_id);
            let a = anchor(var);
            let row_counts: Vec<u64> = (0..n_cols).map(|col| a.map_or(0, |id| count_of(id, col))).collect();
            let row_values = (0..n_cols)
                .map(|col| match a {
                    Some(_) if totals[col] > 0 => Some(row_counts[col] as f64 / totals[col] as f64),
                    _ => None,
                })
                .collect();
            m.counts.push(row_counts);
            m.values.push(row_values);
        }
    }
    m
}

impl VariantQuant {
    /// Combined usage as TSV, `NA` where undefined.
    pub fn write_usage<W: Write>(&self, w: W) -> io::Result<()> {
        let m = CountMatrix {
            row_ids: self.counts_5p.row_ids.clone(),
            samples: self.counts_5p.samples.clone(),
            counts: Vec::new(),
            values: self.usage.clone(),
        };
        m.write_values(w, "variant_id")
    }
}

/// Variant anchor counts and usage from a feature table.
pub fn quantify_variants(events: &[SpliceEvent], features: &CountMatrix) -> VariantQuant {
    let counts_5p = side_matrix(events, features, |v| v.feature_id_5p);
    let counts_3p = side_matrix(events, features, |v| v.feature_id_3p);

    let usage = counts_5p
        .values
        .iter()
        .zip(&counts_3p.values)
        .map(|(r5, r3)| {
            r5.iter()
                .zip(r3)
                .map(|(a, b)| match (a, b) {
                    (Some(x), Some(y)) => Some((x + y) / 2.0),
                    (Some(x), None) | (None, Some(x)) => Some(*x),
                    (None, None) => None,
                })
                .collect()
        })
        .collect();

    VariantQuant {
        counts_5p,
        counts_3p,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::event::find_events;
    use crate::model::feature::{TxFeature, TxFeatureSet};
    use crate::model::types::EventOptions;
    use crate::reads::{MemoryOpener, MemoryReadSource};
    use crate::types::{AlignedRead, Block, GenomicInterval, Strand};

    fn feat(start: u32, end: u32, kind: FeatureType) -> TxFeature {
        TxFeature::new(GenomicInterval::new("chr1", start, end, Strand::Plus), kind)
    }

    fn a3ss_graph() -> GenomeGraph {
        let set: TxFeatureSet = vec![
            feat(100, 200, FeatureType::FirstExon),
            feat(201, 400, FeatureType::Junction),
            feat(401, 800, FeatureType::LastExon),
            feat(201, 600, FeatureType::Junction),
            feat(601, 800, FeatureType::LastExon),
        ]
        .into_iter()
        .collect();
        GenomeGraph::build(&set).graph
    }

    fn read(name: &str, blocks: &[(u32, u32)]) -> AlignedRead {
        AlignedRead::new(
            name,
            "chr1",
            Strand::Plus,
            blocks.iter().map(|&(s, e)| Block::new(s, e)).collect(),
        )
        .finalized()
    }

    fn sample(name: &str, paired_end: bool) -> SampleInfo {
        SampleInfo {
            sample_name: name.to_string(),
            file_bam: String::new(),
            paired_end,
            read_length: 50,
            lib_size: 1_000_000,
        }
    }

    fn find(graph: &GenomeGraph, kind: char, start: u32, end: u32) -> FeatureId {
        graph
            .features()
            .find(|f| f.kind.code() == kind && f.start() == start && f.end() == end)
            .map(|f| f.feature_id)
            .unwrap()
    }

    /// 3 reads on the short junction, 1 on the long one.
    fn a3ss_reads() -> Vec<AlignedRead> {
        vec![
            read("a", &[(151, 200), (401, 450)]),
            read("b", &[(151, 200), (401, 450)]),
            read("c", &[(151, 200), (401, 450)]),
            read("d", &[(151, 200), (601, 650)]),
            read("e", &[(451, 500)]),
        ]
    }

    #[test]
    fn counts_compatible_reads() {
        let graph = a3ss_graph();
        let index = FeatureIndex::build(&graph, 100);
        let mut src = MemoryReadSource::new(a3ss_reads());
        let sc = count_sample(&graph, &index, &mut src, &sample("s1", false)).unwrap();

        assert_eq!(sc.counts[find(&graph, 'J', 201, 400) - 1], 3);
        assert_eq!(sc.counts[find(&graph, 'J', 201, 600) - 1], 1);
        assert_eq!(sc.counts[find(&graph, 'E', 401, 600) - 1], 4);
        // the acceptor at 601 is only covered by a spliced read
        assert_eq!(sc.counts[find(&graph, 'A', 601, 601) - 1], 0);
        assert_eq!(sc.informative, vec![true]);
    }

    #[test]
    fn paired_mates_count_once() {
        let graph = a3ss_graph();
        let index = FeatureIndex::build(&graph, 100);
        let reads = vec![
            read("frag", &[(411, 460)]).with_mate(true),
            read("frag", &[(521, 570)]).with_mate(false),
        ];
        let bin = find(&graph, 'E', 401, 600);

        let mut src = MemoryReadSource::new(reads.clone());
        let pe = count_sample(&graph, &index, &mut src, &sample("pe", true)).unwrap();
        assert_eq!(pe.counts[bin - 1], 1);

        let mut src = MemoryReadSource::new(reads);
        let se = count_sample(&graph, &index, &mut src, &sample("se", false)).unwrap();
        assert_eq!(se.counts[bin - 1], 2);
    }

    #[test]
    fn fpkm_uses_effective_length() {
        let graph = a3ss_graph();
        let s = sample("s1", false);
        let j = graph.feature(find(&graph, 'J', 201, 400)).unwrap();
        let v = fpkm(49, j, &s).unwrap();
        assert!((v - 1000.0).abs() < 1e-9);

        let zero_lib = SampleInfo { lib_size: 0, ..s };
        assert_eq!(fpkm(10, j, &zero_lib), None);
    }

    #[test]
    fn usage_sums_to_one_and_failed_samples_are_dropped() {
        let graph = a3ss_graph();
        let opener = MemoryOpener::new()
            .with_sample("s1", a3ss_reads())
            .with_sample("empty", vec![]);
        let samples = vec![sample("s1", false), sample("missing", false), sample("empty", false)];
        let report = count_samples(&graph, &samples, &opener).unwrap();

        assert_eq!(report.features.samples, vec!["s1".to_string(), "empty".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].sample, "missing");
        // no reads: counts are zero but derived values are missing
        let j = find(&graph, 'J', 201, 400);
        assert_eq!(report.features.count(j, "empty"), Some(0));
        assert_eq!(report.features.value(j, "empty"), None);
        assert!(report.features.value(j, "s1").is_some());

        let events = find_events(&graph, &EventOptions::default()).unwrap();
        assert_eq!(events.len(), 1);
        let q = quantify_variants(&events, &report.features);
        let s1 = q.counts_5p.column("s1").unwrap();

        let u3: f64 = q.counts_3p.values.iter().map(|r| r[s1].unwrap()).sum();
        assert!((u3 - 1.0).abs() < 1e-9);
        let combined: f64 = q.usage.iter().map(|r| r[s1].unwrap()).sum();
        assert!((combined - 1.0).abs() < 1e-9);

        let empty = q.counts_5p.column("empty").unwrap();
        assert!(q.usage.iter().all(|r| r[empty].is_none()));
    }

    #[test]
    fn contradicting_mate_drops_the_fragment() {
        let graph = a3ss_graph();
        let index = FeatureIndex::build(&graph, 100);
        let bin = find(&graph, 'E', 401, 600);
        let reads = vec![
            // second mate runs unspliced across the acceptor at 401
            read("crossing", &[(411, 460)]).with_mate(true),
            read("crossing", &[(380, 429)]).with_mate(false),
            // second mate lies in the next bin and says nothing about this one
            read("apart", &[(411, 460)]).with_mate(true),
            read("apart", &[(651, 700)]).with_mate(false),
        ];

        let mut src = MemoryReadSource::new(reads);
        let pe = count_sample(&graph, &index, &mut src, &sample("pe", true)).unwrap();
        assert_eq!(pe.counts[bin - 1], 1);
        assert_eq!(pe.counts[find(&graph, 'E', 601, 800) - 1], 1);
    }

    /// Donor 200 skips to 701, or goes through exon 301-350 whose donor at
    /// 350 has two acceptors (401, 551) before rejoining at 600.
    fn nested_graph() -> GenomeGraph {
        let set: TxFeatureSet = vec![
            feat(100, 200, FeatureType::FirstExon),
            feat(201, 300, FeatureType::Junction),
            feat(301, 350, FeatureType::InternalExon),
            feat(351, 400, FeatureType::Junction),
            feat(401, 600, FeatureType::InternalExon),
            feat(351, 550, FeatureType::Junction),
            feat(551, 600, FeatureType::InternalExon),
            feat(601, 700, FeatureType::Junction),
            feat(201, 700, FeatureType::Junction),
            feat(701, 800, FeatureType::LastExon),
        ]
        .into_iter()
        .collect();
        GenomeGraph::build(&set).graph
    }

    #[test]
    fn shared_anchors_still_sum_to_one() {
        let graph = nested_graph();
        let reads = vec![
            read("a", &[(151, 200), (301, 340)]),
            read("b", &[(151, 200), (301, 340)]),
            read("c", &[(151, 200), (701, 750)]),
            read("d", &[(151, 200), (701, 750)]),
        ];
        let opener = MemoryOpener::new().with_sample("s1", reads);
        let report = count_samples(&graph, &[sample("s1", false)], &opener).unwrap();
        let events = find_events(&graph, &EventOptions::default()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].variants.len(), 3);

        let q = quantify_variants(&events, &report.features);
        let outer: Vec<usize> = (0..3).collect();
        let u5: Vec<f64> = outer.iter().map(|&r| q.counts_5p.values[r][0].unwrap()).collect();
        // the skipping junction and the shared J201-300 both have 2 reads
        for u in &u5 {
            assert!((u - 1.0 / 3.0).abs() < 1e-9);
        }
        let u3: f64 = outer.iter().map(|&r| q.counts_3p.values[r][0].unwrap()).sum();
        assert!((u3 - 1.0).abs() < 1e-9);
        let combined: f64 = outer.iter().map(|&r| q.usage[r][0].unwrap()).sum();
        assert!((combined - 1.0).abs() < 1e-9);

        // no reads on the inner event's anchors
        assert!(q.usage[3..].iter().all(|r| r[0].is_none()));
    }

    #[test]
    fn invalid_sample_sheet_is_rejected_up_front() {
        let graph = a3ss_graph();
        let samples = vec![sample("s1", false), sample("s1", false)];
        let err = count_samples(&graph, &samples, &MemoryOpener::new()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn tsv_marks_missing_values() {
        let m = CountMatrix {
            row_ids: vec![1, 2],
            samples: vec!["a".into(), "b".into()],
            counts: vec![vec![1, 0], vec![2, 3]],
            values: vec![vec![Some(0.5), None], vec![Some(1.0), Some(0.25)]],
        };
        let mut buf = Vec::new();
        m.write_values(&mut buf, "feature_id").unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "feature_id\ta\tb\n1\t0.500000\tNA\n2\t1.000000\t0.250000\n"
        );
    }
}
