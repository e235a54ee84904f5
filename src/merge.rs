//! Consensus feature sets.
//!
//! - [`merge_features`] unions per-sample sets (rayon reduce) and optionally
//!   runs terminal exon processing.
//! - [`process_terminal_exons`] trims, drops and collapses F/L exons.
//! - [`partition_loci`] splits a feature set into connected gene loci.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info};
use rayon::prelude::*;

use crate::model::feature::{FeatureKey, TxFeature, TxFeatureSet};
use crate::model::types::{FeatureType, GeneId};
use crate::types::{GenomicInterval, Strand};

/// Union all sets, then process terminal exons when `min_overhang` is set.
///
/// With `min_overhang == None` the raw union is returned so that partial
/// merges can be combined later and processed exactly once.
pub fn merge_features(sets: Vec<TxFeatureSet>, min_overhang: Option<u32>) -> TxFeatureSet {
    let n_sets = sets.len();
    let merged = sets
        .into_par_iter()
        .reduce(TxFeatureSet::new, TxFeatureSet::merge);

    info!("merged {} feature sets into {} features", n_sets, merged.len());

    match min_overhang {
        Some(k) => process_terminal_exons(merged, k),
        None => merged,
    }
}

type SeqStrand = (String, Strand);

fn seq_strand(iv: &GenomicInterval) -> SeqStrand {
    (iv.seqname.clone(), iv.strand)
}

/// Positions where an exon may start after an intron, and end before one.
#[derive(Default)]
struct SpliceSites {
    left: HashMap<SeqStrand, BTreeSet<u32>>,
    right: HashMap<SeqStrand, BTreeSet<u32>>,
}

impl SpliceSites {
    fn collect(set: &TxFeatureSet) -> Self {
        let mut sites = SpliceSites::default();
        for f in set.iter() {
            let key = seq_strand(&f.interval);
            if f.kind.is_junction() {
                sites.left.entry(key.clone()).or_default().insert(f.end() + 1);
                if f.start() > 1 {
                    sites.right.entry(key).or_default().insert(f.start() - 1);
                }
            } else if f.kind.is_exon() {
                if f.spliced_left() {
                    sites.left.entry(key.clone()).or_default().insert(f.start());
                }
                if f.spliced_right() {
                    sites.right.entry(key).or_default().insert(f.end());
                }
            }
        }
        sites
    }

    /// Nearest left site to `start` within `[start, end]`.
    fn first_left(&self, key: &SeqStrand, start: u32, end: u32) -> Option<u32> {
        self.left.get(key)?.range(start..=end).next().copied()
    }

    /// Nearest right site to `end` within `[start, end]`.
    fn last_right(&self, key: &SeqStrand, start: u32, end: u32) -> Option<u32> {
        self.right.get(key)?.range(start..=end).next_back().copied()
    }
}

/// Trim, drop and collapse terminal exons. Idempotent.
pub fn process_terminal_exons(set: TxFeatureSet, min_overhang: u32) -> TxFeatureSet {
    let n_before = set.len();
    let sites = SpliceSites::collect(&set);

    // 1. trim terminal exons with a short overhang into internal exons
    let mut trimmed = TxFeatureSet::new();
    let mut n_trimmed = 0usize;
    for f in set.into_features() {
        if !f.kind.is_terminal() {
            trimmed.insert(f);
            continue;
        }
        let key = seq_strand(&f.interval);
        let (start, end) = (f.start(), f.end());

        let cut = if f.spliced_right() {
            sites
                .first_left(&key, start, end)
                .filter(|&p| p - start < min_overhang)
                .map(|p| (p, end))
        } else {
            sites
                .last_right(&key, start, end)
                .filter(|&p| end - p < min_overhang)
                .map(|p| (start, p))
        };

        match cut {
            Some((s, e)) => {
                n_trimmed += 1;
                let iv = GenomicInterval::new(key.0, s, e, key.1);
                let mut exon = TxFeature::new(iv, FeatureType::InternalExon);
                exon.absorb_names(&f);
                trimmed.insert(exon);
            }
            None => trimmed.insert(f),
        }
    }

    // 2. drop terminal exons inside an internal exon sharing the spliced boundary
    let mut internal_by_end: HashMap<(SeqStrand, u32), u32> = HashMap::new();
    let mut internal_by_start: HashMap<(SeqStrand, u32), u32> = HashMap::new();
    for f in trimmed.iter().filter(|f| f.kind == FeatureType::InternalExon) {
        let key = seq_strand(&f.interval);
        let min_start = internal_by_end.entry((key.clone(), f.end())).or_insert(f.start());
        *min_start = (*min_start).min(f.start());
        let max_end = internal_by_start.entry((key, f.start())).or_insert(f.end());
        *max_end = (*max_end).max(f.end());
    }

    let subsumed: Vec<FeatureKey> = trimmed
        .iter()
        .filter(|f| f.kind.is_terminal())
        .filter(|f| {
            let key = seq_strand(&f.interval);
            if f.spliced_right() {
                internal_by_end
                    .get(&(key, f.end()))
                    .is_some_and(|&s| s <= f.start())
            } else {
                internal_by_start
                    .get(&(key, f.start()))
                    .is_some_and(|&e| e >= f.end())
            }
        })
        .map(|f| f.key())
        .collect();
    for key in &subsumed {
        trimmed.remove(key);
    }

    // 3. keep only the longest terminal exon per (type, spliced boundary)
    let mut groups: BTreeMap<(SeqStrand, FeatureType, bool, u32), Vec<FeatureKey>> = BTreeMap::new();
    for f in trimmed.iter().filter(|f| f.kind.is_terminal()) {
        let right = f.spliced_right();
        let boundary = if right { f.end() } else { f.start() };
        groups
            .entry((seq_strand(&f.interval), f.kind, right, boundary))
            .or_default()
            .push(f.key());
    }

    let mut n_collapsed = 0usize;
    for keys in groups.into_values().filter(|k| k.len() > 1) {
        // Longest wins; keys are in genomic order so ties resolve to the first.
        let mut best = 0;
        for (i, k) in keys.iter().enumerate() {
            if k.0.len() > keys[best].0.len() {
                best = i;
            }
        }
        let mut absorbed = Vec::with_capacity(keys.len() - 1);
        for (i, k) in keys.iter().enumerate() {
            if i != best {
                if let Some(f) = trimmed.remove(k) {
                    absorbed.push(f);
                }
            }
        }
        n_collapsed += absorbed.len();
        if let Some(mut keep) = trimmed.remove(&keys[best]) {
            for f in &absorbed {
                keep.absorb_names(f);
            }
            trimmed.insert(keep);
        }
    }

    debug!(
        "terminal exon processing: {} -> {} features (trimmed {}, subsumed {}, collapsed {})",
        n_before,
        trimmed.len(),
        n_trimmed,
        subsumed.len(),
        n_collapsed
    );

    trimmed
}

/// One connected set of same-strand features; becomes one splice graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Locus {
    pub gene_id: GeneId,
    pub seqname: String,
    pub strand: Strand,
    pub start: u32,
    pub end: u32,
    pub features: Vec<TxFeature>,
}

impl Locus {
    pub fn name(&self) -> String {
        format!("{}:{}-{}:{}", self.seqname, self.start, self.end, self.strand)
    }
}

/// Disjoint-set forest with path halving.
pub(crate) struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    pub(crate) fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Union by smaller root so that roots are stable under re-runs.
    pub(crate) fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Split features into loci and number them in genomic order (1-based).
///
/// Exons are connected by overlap, junctions to the exons containing their
/// flanking bases and to junctions sharing a flank. Splice site features are
/// ignored.
pub fn partition_loci(set: &TxFeatureSet) -> Vec<Locus> {
    let mut by_strand: BTreeMap<SeqStrand, Vec<&TxFeature>> = BTreeMap::new();
    for f in set.iter().filter(|f| f.kind.is_exon() || f.kind.is_junction()) {
        by_strand.entry(seq_strand(&f.interval)).or_default().push(f);
    }

    let mut loci: Vec<Locus> = Vec::new();
    for ((seqname, strand), feats) in by_strand {
        let mut uf = UnionFind::new(feats.len());

        // exon clusters: disjoint merged spans with one representative each
        let mut exons: Vec<usize> = (0..feats.len()).filter(|&i| feats[i].kind.is_exon()).collect();
        exons.sort_by_key(|&i| (feats[i].start(), feats[i].end()));

        let mut clusters: Vec<(u32, u32, usize)> = Vec::new();
        for &i in &exons {
            let f = feats[i];
            match clusters.last_mut() {
                Some((_, end, rep)) if f.start() <= *end => {
                    *end = (*end).max(f.end());
                    uf.union(*rep, i);
                }
                _ => clusters.push((f.start(), f.end(), i)),
            }
        }

        let cluster_at = |pos: u32| -> Option<usize> {
            let idx = clusters.partition_point(|&(s, _, _)| s <= pos);
            let &(s, e, rep) = clusters.get(idx.checked_sub(1)?)?;
            (s <= pos && pos <= e).then_some(rep)
        };

        let mut by_donor: HashMap<u32, usize> = HashMap::new();
        let mut by_acceptor: HashMap<u32, usize> = HashMap::new();
        for (i, f) in feats.iter().enumerate().filter(|(_, f)| f.kind.is_junction()) {
            if let Some(rep) = f.start().checked_sub(1).and_then(|p| cluster_at(p)) {
                uf.union(rep, i);
            }
            if let Some(rep) = cluster_at(f.end() + 1) {
                uf.union(rep, i);
            }
            let first = *by_donor.entry(f.start()).or_insert(i);
            uf.union(first, i);
            let first = *by_acceptor.entry(f.end()).or_insert(i);
            uf.union(first, i);
        }

        let mut components: BTreeMap<usize, Vec<TxFeature>> = BTreeMap::new();
        for (i, f) in feats.iter().enumerate() {
            let root = uf.find(i);
            components.entry(root).or_default().push((*f).clone());
        }

        for features in components.into_values() {
            let start = features.iter().map(|f| f.start()).min().unwrap_or(0);
            let end = features.iter().map(|f| f.end()).max().unwrap_or(0);
            loci.push(Locus {
                gene_id: 0,
                seqname: seqname.clone(),
                strand,
                start,
                end,
                features,
            });
        }
    }

    loci.sort_by(|a, b| {
        (&a.seqname, a.start, a.end, a.strand).cmp(&(&b.seqname, b.start, b.end, b.strand))
    });
    for (i, locus) in loci.iter_mut().enumerate() {
        locus.gene_id = i + 1;
    }
    loci
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feat(start: u32, end: u32, kind: FeatureType, tx: &str) -> TxFeature {
        TxFeature::new(GenomicInterval::new("chr1", start, end, Strand::Plus), kind).with_tx(tx)
    }

    fn set(v: Vec<TxFeature>) -> TxFeatureSet {
        v.into_iter().collect()
    }

    #[test]
    fn merge_is_associative() {
        let a = set(vec![feat(100, 200, FeatureType::FirstExon, "a"), feat(201, 300, FeatureType::Junction, "a")]);
        let b = set(vec![feat(201, 300, FeatureType::Junction, "b"), feat(301, 400, FeatureType::LastExon, "b")]);
        let c = set(vec![feat(50, 200, FeatureType::FirstExon, "c")]);

        let left = merge_features(vec![merge_features(vec![a.clone(), b.clone()], None), c.clone()], None);
        let right = merge_features(vec![a.clone(), merge_features(vec![c.clone(), b.clone()], None)], None);
        let flat = merge_features(vec![c, a, b], None);

        assert_eq!(left, right);
        assert_eq!(left, flat);
        assert_eq!(left.len(), 4);
    }

    #[test]
    fn short_overhang_is_trimmed_to_internal_exon() {
        // junction [91,99] makes 100 an acceptor; F starting at 95 overhangs by 5
        let s = set(vec![
            feat(50, 90, FeatureType::FirstExon, "t1"),
            feat(91, 99, FeatureType::Junction, "t1"),
            feat(100, 200, FeatureType::InternalExon, "t1"),
            feat(95, 150, FeatureType::FirstExon, "t2"),
        ]);
        let out = process_terminal_exons(s, 10);

        // [95,150] -> [100,150] I
        assert!(out.contains(&(GenomicInterval::new("chr1", 100, 150, Strand::Plus), FeatureType::InternalExon)));
        assert!(!out.iter().any(|f| f.start() == 95));
    }

    #[test]
    fn long_overhang_is_kept() {
        let s = set(vec![
            feat(91, 99, FeatureType::Junction, "t1"),
            feat(100, 200, FeatureType::InternalExon, "t1"),
            feat(40, 250, FeatureType::LastExon, "t2"),
        ]);
        let out = process_terminal_exons(s.clone(), 10);
        assert!(out.contains(&(GenomicInterval::new("chr1", 40, 250, Strand::Plus), FeatureType::LastExon)));
    }

    #[test]
    fn subsumed_terminal_exon_is_dropped() {
        let s = set(vec![
            feat(100, 200, FeatureType::InternalExon, "t1"),
            feat(150, 200, FeatureType::FirstExon, "t2"),
        ]);
        let out = process_terminal_exons(s, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out.iter().next().unwrap().kind, FeatureType::InternalExon);
    }

    #[test]
    fn terminal_exons_sharing_a_site_collapse_to_longest() {
        let s = set(vec![
            feat(100, 300, FeatureType::FirstExon, "t1"),
            feat(150, 300, FeatureType::FirstExon, "t2"),
            feat(301, 400, FeatureType::Junction, "t1"),
        ]);
        let out = process_terminal_exons(s, 1);
        let firsts: Vec<_> = out.iter().filter(|f| f.kind == FeatureType::FirstExon).collect();
        assert_eq!(firsts.len(), 1);
        assert_eq!(firsts[0].start(), 100);
        assert_eq!(firsts[0].tx_names.len(), 2);
    }

    #[test]
    fn terminal_processing_is_idempotent() {
        let s = set(vec![
            feat(50, 90, FeatureType::FirstExon, "t1"),
            feat(91, 99, FeatureType::Junction, "t1"),
            feat(100, 200, FeatureType::InternalExon, "t1"),
            feat(95, 150, FeatureType::FirstExon, "t2"),
            feat(60, 90, FeatureType::FirstExon, "t3"),
            feat(201, 299, FeatureType::Junction, "t1"),
            feat(300, 420, FeatureType::LastExon, "t1"),
            feat(300, 380, FeatureType::LastExon, "t4"),
        ]);
        let once = process_terminal_exons(s, 10);
        let twice = process_terminal_exons(once.clone(), 10);
        assert_eq!(once, twice);
    }

    #[test]
    fn loci_are_connected_components_in_genomic_order() {
        let s = set(vec![
            feat(1000, 1100, FeatureType::UnsplicedExon, "t9"),
            feat(100, 200, FeatureType::FirstExon, "t1"),
            feat(201, 300, FeatureType::Junction, "t1"),
            feat(301, 400, FeatureType::LastExon, "t1"),
            feat(350, 500, FeatureType::LastExon, "t2"),
        ]);
        let loci = partition_loci(&s);
        assert_eq!(loci.len(), 2);
        assert_eq!(loci[0].gene_id, 1);
        assert_eq!((loci[0].start, loci[0].end), (100, 500));
        assert_eq!(loci[0].features.len(), 4);
        assert_eq!(loci[1].gene_id, 2);
        assert_eq!(loci[1].start, 1000);
    }

    #[test]
    fn strands_never_share_a_locus() {
        let mut s = set(vec![feat(100, 200, FeatureType::UnsplicedExon, "p")]);
        s.insert(TxFeature::new(
            GenomicInterval::new("chr1", 150, 250, Strand::Minus),
            FeatureType::UnsplicedExon,
        ));
        assert_eq!(partition_loci(&s).len(), 2);
    }
}
