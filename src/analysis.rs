//! End-to-end runs: features -> graph -> events -> counts.
//!
//! Per-sample and per-locus failures are collected next to the results;
//! only configuration errors abort a run.

use log::{info, warn};

use crate::error::{Error, Result};
use crate::merge::merge_features;
use crate::model::event::{find_events, SpliceEvent};
use crate::model::feature::TxFeatureSet;
use crate::model::graph::{GenomeGraph, LocusFailure};
use crate::model::types::{validate_samples, EventOptions, PredictOptions, SampleInfo};
use crate::predict::predict_samples;
use crate::quant::{count_samples, quantify_variants, CountMatrix, SampleFailure, VariantQuant};
use crate::reads::SourceOpener;
use crate::types::Region;

/// Options of a full run.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    pub predict: PredictOptions,
    /// Terminal exon processing after merging; `None` keeps raw features.
    pub min_overhang: Option<u32>,
    pub events: EventOptions,
    /// Regions scanned for prediction; empty means every sequence.
    pub regions: Vec<Region>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            predict: PredictOptions::default(),
            min_overhang: Some(Self::DEFAULT_MIN_OVERHANG),
            events: EventOptions::default(),
            regions: Vec::new(),
        }
    }
}

impl AnalysisConfig {
    pub const DEFAULT_MIN_OVERHANG: u32 = 12;

    pub fn validate(&self) -> Result<()> {
        self.predict.validate()?;
        self.events.validate()?;
        if let Some(r) = self.regions.iter().find(|r| r.start == 0 || r.end < r.start) {
            return Err(Error::config(format!("invalid region {r}")));
        }
        Ok(())
    }
}

/// Predicted and merged features of all samples.
#[derive(Debug, Default)]
pub struct FeatureReport {
    pub features: TxFeatureSet,
    pub failures: Vec<SampleFailure>,
}

/// Predict features per sample in parallel and merge the successful ones.
pub fn predict_features<O: SourceOpener>(
    opener: &O,
    samples: &[SampleInfo],
    config: &AnalysisConfig,
) -> Result<FeatureReport> {
    config.validate()?;
    let predictions = predict_samples(opener, samples, &config.regions, &config.predict)?;

    let mut sets = Vec::new();
    let mut failures = Vec::new();
    for p in predictions {
        match p.features {
            Ok(set) => sets.push(set),
            Err(error) => failures.push(SampleFailure {
                sample: p.sample,
                error,
            }),
        }
    }

    let features = merge_features(sets, config.min_overhang);
    info!(
        "merged features: {} ({} samples failed)",
        features.len(),
        failures.len()
    );
    Ok(FeatureReport { features, failures })
}

/// Everything a full run produces.
#[derive(Debug, Default)]
pub struct AnalysisReport {
    pub features: TxFeatureSet,
    pub graph: GenomeGraph,
    pub events: Vec<SpliceEvent>,
    pub feature_counts: CountMatrix,
    pub variant_counts: VariantQuant,
    pub sample_failures: Vec<SampleFailure>,
    pub locus_failures: Vec<LocusFailure>,
}

/// Full run. With `annotation`, its features replace prediction.
pub fn analyze<O: SourceOpener>(
    opener: &O,
    samples: &[SampleInfo],
    annotation: Option<TxFeatureSet>,
    config: &AnalysisConfig,
) -> Result<AnalysisReport> {
    config.validate()?;
    validate_samples(samples)?;

    let mut report = AnalysisReport::default();
    report.features = match annotation {
        Some(set) => set,
        None => {
            let predicted = predict_features(opener, samples, config)?;
            report.sample_failures.extend(predicted.failures);
            predicted.features
        }
    };

    let built = GenomeGraph::build(&report.features);
    report.graph = built.graph;
    report.locus_failures = built.failures;
    report.events = find_events(&report.graph, &config.events)?;

    let counted = count_samples(&report.graph, samples, opener)?;
    for f in counted.failures {
        // a sample that already failed prediction is reported once
        if !report.sample_failures.iter().any(|s| s.sample == f.sample) {
            report.sample_failures.push(f);
        }
    }
    report.variant_counts = quantify_variants(&report.events, &counted.features);
    report.feature_counts = counted.features;

    if !report.sample_failures.is_empty() || !report.locus_failures.is_empty() {
        warn!(
            "{} samples and {} loci failed",
            report.sample_failures.len(),
            report.locus_failures.len()
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reads::MemoryOpener;
    use crate::types::{AlignedRead, Block, Strand};

    fn read(blocks: &[(u32, u32)]) -> AlignedRead {
        AlignedRead::new(
            "r",
            "chr1",
            Strand::Plus,
            blocks.iter().map(|&(s, e)| Block::new(s, e)).collect(),
        )
    }

    fn sample(name: &str) -> SampleInfo {
        SampleInfo {
            sample_name: name.to_string(),
            file_bam: String::new(),
            paired_end: false,
            read_length: 50,
            lib_size: 1_000,
        }
    }

    #[test]
    fn invalid_config_stops_before_work() {
        let config = AnalysisConfig {
            events: EventOptions {
                max_variants: 0,
                include_terminal: true,
            },
            ..Default::default()
        };
        let err = analyze(&MemoryOpener::new(), &[sample("s1")], None, &config).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn failing_sample_does_not_stop_the_run() {
        let reads = vec![
            read(&[(151, 200), (401, 450)]),
            read(&[(151, 200), (401, 450)]),
            read(&[(101, 150)]),
        ];
        let opener = MemoryOpener::new().with_sample("good", reads);
        let report = analyze(
            &opener,
            &[sample("good"), sample("bad")],
            None,
            &AnalysisConfig::default(),
        )
        .unwrap();

        assert_eq!(report.sample_failures.len(), 1);
        assert_eq!(report.sample_failures[0].sample, "bad");
        assert_eq!(report.graph.loci.len(), 1);
        assert!(report.events.is_empty());
        assert_eq!(report.feature_counts.samples, vec!["good".to_string()]);
    }

    /// Donor at 200, acceptors at 401 and 601.
    fn a3ss_reads() -> Vec<AlignedRead> {
        let mut reads = Vec::new();
        for _ in 0..3 {
            reads.push(read(&[(151, 200), (401, 450)]));
            reads.push(read(&[(151, 200), (601, 650)]));
        }
        for s in (101..=151).step_by(50) {
            reads.push(read(&[(s, s + 49)]));
        }
        for s in (401..=751).step_by(50) {
            reads.push(read(&[(s, s + 49)]));
        }
        reads
    }

    #[test]
    fn predicted_a3ss_is_quantified() {
        let opener = MemoryOpener::new()
            .with_sample("s1", a3ss_reads())
            .with_sample("s2", a3ss_reads());
        let report = analyze(
            &opener,
            &[sample("s1"), sample("s2")],
            None,
            &AnalysisConfig::default(),
        )
        .unwrap();

        assert!(report.sample_failures.is_empty());
        assert!(report.locus_failures.is_empty());
        assert_eq!(report.events.len(), 1);
        let ev = &report.events[0];
        assert_eq!(ev.variants.len(), 2);
        assert!(ev.closed5p && ev.closed3p);

        let usage = &report.variant_counts.usage;
        assert_eq!(usage.len(), 2);
        for col in 0..2 {
            let total: f64 = usage.iter().map(|row| row[col].unwrap()).sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn runs_are_deterministic() {
        let opener = MemoryOpener::new().with_sample("s1", a3ss_reads());
        let run = || analyze(&opener, &[sample("s1")], None, &AnalysisConfig::default()).unwrap();
        let (a, b) = (run(), run());
        assert_eq!(a.features, b.features);
        assert_eq!(a.events, b.events);
        assert_eq!(a.feature_counts, b.feature_counts);
        assert_eq!(a.variant_counts, b.variant_counts);
    }

    #[test]
    fn annotation_replaces_prediction() {
        use crate::model::feature::TxFeature;
        use crate::model::types::FeatureType;
        use crate::types::GenomicInterval;

        let feat = |s, e, kind| TxFeature::new(GenomicInterval::new("chr1", s, e, Strand::Plus), kind);
        let set: TxFeatureSet = vec![
            feat(101, 200, FeatureType::FirstExon),
            feat(201, 400, FeatureType::Junction),
            feat(401, 800, FeatureType::LastExon),
        ]
        .into_iter()
        .collect();

        let opener = MemoryOpener::new().with_sample("s1", a3ss_reads());
        let report = analyze(&opener, &[sample("s1")], Some(set.clone()), &AnalysisConfig::default()).unwrap();
        assert_eq!(report.features, set);
        assert!(report.events.is_empty());
        let j = report
            .graph
            .features()
            .find(|f| f.kind == FeatureType::Junction)
            .map(|f| f.feature_id)
            .unwrap();
        assert_eq!(report.feature_counts.count(j, "s1"), Some(3));
    }
}
