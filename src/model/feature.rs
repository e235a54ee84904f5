use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::types::{FeatureId, FeatureType, GeneId};
use crate::types::{GenomicInterval, Strand};

/// Identity of a transcript feature: exact coordinates plus type.
pub type FeatureKey = (GenomicInterval, FeatureType);

/// A pre-graph feature (J/I/F/L/U) from prediction or annotation.
///
/// Name sets are ordered so that merged output is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxFeature {
    pub interval: GenomicInterval,
    pub kind: FeatureType,
    pub tx_names: BTreeSet<String>,
    pub gene_names: BTreeSet<String>,
}

impl TxFeature {
    pub fn new(interval: GenomicInterval, kind: FeatureType) -> Self {
        Self {
            interval,
            kind,
            tx_names: BTreeSet::new(),
            gene_names: BTreeSet::new(),
        }
    }

    pub fn with_tx(mut self, name: impl Into<String>) -> Self {
        self.tx_names.insert(name.into());
        self
    }

    pub fn with_gene(mut self, name: impl Into<String>) -> Self {
        self.gene_names.insert(name.into());
        self
    }

    pub fn key(&self) -> FeatureKey {
        (self.interval.clone(), self.kind)
    }

    #[inline]
    pub fn start(&self) -> u32 {
        self.interval.start
    }

    #[inline]
    pub fn end(&self) -> u32 {
        self.interval.end
    }

    #[inline]
    pub fn strand(&self) -> Strand {
        self.interval.strand
    }

    /// Whether the genomically lower boundary of an exon is spliced.
    pub fn spliced_left(&self) -> bool {
        match self.strand() {
            Strand::Minus => self.kind.spliced3p(),
            _ => self.kind.spliced5p(),
        }
    }

    /// Whether the genomically upper boundary of an exon is spliced.
    pub fn spliced_right(&self) -> bool {
        match self.strand() {
            Strand::Minus => self.kind.spliced5p(),
            _ => self.kind.spliced3p(),
        }
    }

    /// Union the names of `other` into `self`.
    pub fn absorb_names(&mut self, other: &TxFeature) {
        self.tx_names.extend(other.tx_names.iter().cloned());
        self.gene_names.extend(other.gene_names.iter().cloned());
    }
}

impl fmt::Display for TxFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.interval)
    }
}

/// Ordered set of transcript features keyed by `(interval, type)`.
///
/// Inserting a feature that already exists unions its names into the
/// stored one, so `merge` is commutative and associative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxFeatureSet {
    features: BTreeMap<FeatureKey, TxFeature>,
}

impl TxFeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, feature: TxFeature) {
        match self.features.get_mut(&feature.key()) {
            Some(existing) => existing.absorb_names(&feature),
            None => {
                self.features.insert(feature.key(), feature);
            }
        }
    }

    pub fn remove(&mut self, key: &FeatureKey) -> Option<TxFeature> {
        self.features.remove(key)
    }

    pub fn get(&self, key: &FeatureKey) -> Option<&TxFeature> {
        self.features.get(key)
    }

    pub fn contains(&self, key: &FeatureKey) -> bool {
        self.features.contains_key(key)
    }

    /// Union of two sets.
    pub fn merge(mut self, other: TxFeatureSet) -> TxFeatureSet {
        // Fold the smaller set into the larger one.
        if self.len() < other.len() {
            return other.merge(self);
        }
        for f in other.features.into_values() {
            self.insert(f);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Features in (seqname, start, end, strand, type) order.
    pub fn iter(&self) -> impl Iterator<Item = &TxFeature> {
        self.features.values()
    }

    pub fn into_features(self) -> Vec<TxFeature> {
        self.features.into_values().collect()
    }
}

impl FromIterator<TxFeature> for TxFeatureSet {
    fn from_iter<I: IntoIterator<Item = TxFeature>>(iter: I) -> Self {
        let mut set = TxFeatureSet::new();
        for f in iter {
            set.insert(f);
        }
        set
    }
}

impl Extend<TxFeature> for TxFeatureSet {
    fn extend<I: IntoIterator<Item = TxFeature>>(&mut self, iter: I) {
        for f in iter {
            self.insert(f);
        }
    }
}

/// A splice graph feature (J/E/D/A).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SgFeature {
    pub feature_id: FeatureId,
    pub gene_id: GeneId,
    pub interval: GenomicInterval,
    pub kind: FeatureType,
    pub tx_names: BTreeSet<String>,
    pub gene_names: BTreeSet<String>,
}

impl SgFeature {
    #[inline]
    pub fn start(&self) -> u32 {
        self.interval.start
    }

    #[inline]
    pub fn end(&self) -> u32 {
        self.interval.end
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.interval.len()
    }

    /// Exon bin boundary flags in genomic orientation (left, right).
    pub fn spliced_sides(&self) -> (bool, bool) {
        let (s5, s3) = (self.kind.spliced5p(), self.kind.spliced3p());
        match self.interval.strand {
            Strand::Minus => (s3, s5),
            _ => (s5, s3),
        }
    }

    /// Short label used in exports: `<type>:<feature_id>`.
    pub fn label(&self) -> String {
        format!("{}:{}", self.kind.code(), self.feature_id)
    }
}

impl fmt::Display for SgFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} gene={}", self.label(), self.interval, self.gene_id)
    }
}
