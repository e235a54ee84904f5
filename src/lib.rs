//! splice_graph
//!
//! Splice graphs from aligned reads or annotation, decomposed into splice
//! events and variants, with per-sample read counts and variant usage.
//! Coordinates are 1-based and inclusive throughout.
//!
//! # Example
//! ```
//! use splice_graph::{EventOptions, FeatureType, GenomeGraph, GenomicInterval, Strand, TxFeature, TxFeatureSet};
//!
//! let feat = |s, e, kind| TxFeature::new(GenomicInterval::new("chr1", s, e, Strand::Plus), kind);
//! let set: TxFeatureSet = vec![
//!     feat(100, 200, FeatureType::FirstExon),
//!     feat(201, 400, FeatureType::Junction),
//!     feat(201, 600, FeatureType::Junction),
//!     feat(401, 800, FeatureType::LastExon),
//!     feat(601, 800, FeatureType::LastExon),
//! ]
//! .into_iter()
//! .collect();
//!
//! let graph = GenomeGraph::build(&set).graph;
//! let events = splice_graph::find_events(&graph, &EventOptions::default()).unwrap();
//! assert_eq!(events.len(), 1);
//! assert_eq!(events[0].variants.len(), 2);
//! ```

pub mod analysis;
pub mod annotation;
pub mod compat;
pub mod error;
pub mod export;
pub mod index;
pub mod merge;
pub mod model;
pub mod predict;
pub mod quant;
pub mod reads;
pub mod types;

pub use analysis::{analyze, AnalysisConfig, AnalysisReport};
pub use annotation::AnnotationBuilder;
pub use error::{Error, Result};
pub use index::FeatureIndex;
pub use merge::{merge_features, partition_loci, process_terminal_exons};
pub use model::event::{find_events, SpliceEvent, SpliceVariant};
pub use model::feature::{SgFeature, TxFeature, TxFeatureSet};
pub use model::graph::{GenomeGraph, SpliceGraph};
pub use model::types::{EventOptions, FeatureId, FeatureType, GeneId, PredictOptions, SampleInfo};
pub use quant::{CountMatrix, VariantQuant};
pub use reads::{BamOpener, MemoryOpener, ReadSource, SourceOpener};
pub use types::{AlignedRead, Block, GenomicInterval, Region, Strand};
