use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::merge::{partition_loci, Locus};
use crate::model::feature::{SgFeature, TxFeature, TxFeatureSet};
use crate::model::types::{FeatureId, FeatureType, GeneId, NodeId};
use crate::types::{GenomicInterval, Strand};

/// Which side of a cut a node sits on.
///
/// A cut `c` separates base `c - 1` from base `c`. `Left` nodes close an
/// exon ending at `c - 1`, `Right` nodes open an exon starting at `c`, and
/// `Both` is used when some exon runs straight through the cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Both,
    Right,
}

type NodeKey = (u32, Side);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRoles {
    pub donor: bool,
    pub acceptor: bool,
    pub start: bool,
    pub end: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub cut: u32,
    pub side: Side,
    pub roles: NodeRoles,
    /// Local feature index of the donor / acceptor site at this node.
    pub donor_site: Option<usize>,
    pub acceptor_site: Option<usize>,
    out_edges: Vec<usize>,
    in_edges: Vec<usize>,
}

impl Node {
    pub fn out_edges(&self) -> &[usize] {
        &self.out_edges
    }

    pub fn in_edges(&self) -> &[usize] {
        &self.in_edges
    }
}

/// A directed 5'->3' edge carrying an exon bin or a junction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Local index into `SpliceGraph::features`.
    pub feature: usize,
    pub from: NodeId,
    pub to: NodeId,
}

/// Splice graph of one gene locus.
///
/// Nodes are stored in topological order, so `edge.from < edge.to` for
/// every edge. Features are sorted by (start, end, type) and carry
/// consecutive feature ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpliceGraph {
    pub gene_id: GeneId,
    pub seqname: String,
    pub strand: Strand,
    pub start: u32,
    pub end: u32,
    pub gene_names: BTreeSet<String>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub features: Vec<SgFeature>,
}

struct PendingFeature {
    interval: GenomicInterval,
    kind: FeatureType,
    tx_names: BTreeSet<String>,
    gene_names: BTreeSet<String>,
    /// Oriented endpoints for edge features.
    ends: Option<(NodeKey, NodeKey)>,
    /// Node whose site this is.
    site_of: Option<NodeKey>,
}

impl SpliceGraph {
    /// Build the graph of one locus.
    ///
    /// Fails with `InputValidation` when the locus has no usable strand or the
    /// resulting graph is not acyclic.
    pub fn build(locus: &Locus) -> Result<Self> {
        let name = locus.name();
        if !locus.strand.is_known() {
            return Err(Error::invalid_locus(name, "features have no known strand"));
        }
        let plus = locus.strand == Strand::Plus;

        let exons: Vec<&TxFeature> = locus.features.iter().filter(|f| f.kind.is_exon()).collect();
        let junctions: Vec<&TxFeature> =
            locus.features.iter().filter(|f| f.kind.is_junction()).collect();
        if exons.is_empty() && junctions.is_empty() {
            return Err(Error::invalid_locus(name, "no exon or junction features"));
        }

        let spans = |c: u32| exons.iter().any(|x| x.start() < c && c <= x.end());

        // exon bins: sweep over all exon boundaries and junction flanks inside exons
        let mut cuts: BTreeSet<u32> = BTreeSet::new();
        for x in &exons {
            cuts.insert(x.start());
            cuts.insert(x.end() + 1);
        }
        for j in &junctions {
            for c in [j.start(), j.end() + 1] {
                if spans(c) {
                    cuts.insert(c);
                }
            }
        }
        let spanned: BTreeSet<u32> = cuts.iter().copied().filter(|&c| spans(c)).collect();

        let key = |c: u32, side: Side| -> NodeKey {
            if spanned.contains(&c) {
                (c, Side::Both)
            } else {
                (c, side)
            }
        };
        let orient = |left: NodeKey, right: NodeKey| if plus { (left, right) } else { (right, left) };

        let mut pending: Vec<PendingFeature> = Vec::new();
        let cuts: Vec<u32> = cuts.into_iter().collect();
        for w in cuts.windows(2) {
            let (a, b) = (w[0], w[1]);
            let contributing: Vec<&&TxFeature> =
                exons.iter().filter(|x| x.start() <= a && x.end() >= b - 1).collect();
            if contributing.is_empty() {
                continue;
            }

            let left = !spanned.contains(&a)
                && exons.iter().any(|x| x.start() == a && x.spliced_left());
            let right = !spanned.contains(&b)
                && exons.iter().any(|x| x.end() + 1 == b && x.spliced_right());
            let (spliced5p, spliced3p) = if plus { (left, right) } else { (right, left) };

            let mut tx_names = BTreeSet::new();
            let mut gene_names = BTreeSet::new();
            for x in &contributing {
                tx_names.extend(x.tx_names.iter().cloned());
                gene_names.extend(x.gene_names.iter().cloned());
            }

            pending.push(PendingFeature {
                interval: GenomicInterval::new(locus.seqname.clone(), a, b - 1, locus.strand),
                kind: FeatureType::ExonBin { spliced5p, spliced3p },
                tx_names,
                gene_names,
                ends: Some(orient(key(a, Side::Right), key(b, Side::Left))),
                site_of: None,
            });
        }

        for j in &junctions {
            pending.push(PendingFeature {
                interval: j.interval.clone(),
                kind: FeatureType::Junction,
                tx_names: j.tx_names.clone(),
                gene_names: j.gene_names.clone(),
                ends: Some(orient(key(j.start(), Side::Left), key(j.end() + 1, Side::Right))),
                site_of: None,
            });
        }

        // nodes and their roles
        let mut roles: BTreeMap<NodeKey, NodeRoles> = BTreeMap::new();
        for p in &pending {
            if let Some((from, to)) = p.ends {
                roles.entry(from).or_default();
                roles.entry(to).or_default();
            }
        }
        for j in &junctions {
            let (from, to) = orient(key(j.start(), Side::Left), key(j.end() + 1, Side::Right));
            if let Some(r) = roles.get_mut(&from) {
                r.donor = true;
            }
            if let Some(r) = roles.get_mut(&to) {
                r.acceptor = true;
            }
        }
        for x in &exons {
            let (five, three) = orient(key(x.start(), Side::Right), key(x.end() + 1, Side::Left));
            if let Some(r) = roles.get_mut(&five) {
                if x.kind.spliced5p() {
                    r.acceptor = true;
                } else {
                    r.start = true;
                }
            }
            if let Some(r) = roles.get_mut(&three) {
                if x.kind.spliced3p() {
                    r.donor = true;
                } else {
                    r.end = true;
                }
            }
        }

        // topological order (Kahn), ties broken by 5'->3' genomic position
        let keys: Vec<NodeKey> = roles.keys().copied().collect();
        let index_of: BTreeMap<NodeKey, usize> = keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();
        let mut succ: Vec<Vec<usize>> = vec![Vec::new(); keys.len()];
        let mut indegree = vec![0usize; keys.len()];
        for (from, to) in pending.iter().filter_map(|p| p.ends) {
            succ[index_of[&from]].push(index_of[&to]);
            indegree[index_of[&to]] += 1;
        }

        let priority = |k: &NodeKey| -> (i64, Side) {
            let pos = i64::from(k.0);
            if plus {
                (pos, k.1)
            } else {
                (-pos, k.1)
            }
        };
        let mut heap: BinaryHeap<Reverse<((i64, Side), usize)>> = BinaryHeap::new();
        for (i, k) in keys.iter().enumerate() {
            if indegree[i] == 0 {
                heap.push(Reverse((priority(k), i)));
            }
        }
        let mut order: Vec<usize> = Vec::with_capacity(keys.len());
        while let Some(Reverse((_, i))) = heap.pop() {
            order.push(i);
            for &t in &succ[i] {
                indegree[t] -= 1;
                if indegree[t] == 0 {
                    heap.push(Reverse((priority(&keys[t]), t)));
                }
            }
        }
        if order.len() < keys.len() {
            return Err(Error::invalid_locus(
                name,
                format!("splice graph has a cycle ({} of {} nodes ordered)", order.len(), keys.len()),
            ));
        }

        // splice site features
        for (&(cut, side), r) in &roles {
            let mut push_site = |kind: FeatureType, pos: u32| {
                if pos == 0 {
                    return;
                }
                pending.push(PendingFeature {
                    interval: GenomicInterval::new(locus.seqname.clone(), pos, pos, locus.strand),
                    kind,
                    tx_names: BTreeSet::new(),
                    gene_names: BTreeSet::new(),
                    ends: None,
                    site_of: Some((cut, side)),
                });
            };
            if r.donor {
                push_site(FeatureType::DonorSite, if plus { cut - 1 } else { cut });
            }
            if r.acceptor {
                push_site(FeatureType::AcceptorSite, if plus { cut } else { cut - 1 });
            }
        }

        // site names come from the junctions using them
        let mut site_names: BTreeMap<NodeKey, (BTreeSet<String>, BTreeSet<String>)> = BTreeMap::new();
        for p in pending.iter().filter(|p| p.kind.is_junction()) {
            if let Some((from, to)) = p.ends {
                for k in [from, to] {
                    let e = site_names.entry(k).or_default();
                    e.0.extend(p.tx_names.iter().cloned());
                    e.1.extend(p.gene_names.iter().cloned());
                }
            }
        }
        for p in pending.iter_mut() {
            if let Some((tx, genes)) = p.site_of.and_then(|k| site_names.get(&k)) {
                p.tx_names = tx.clone();
                p.gene_names = genes.clone();
            }
        }

        pending.sort_by(|a, b| {
            (a.interval.start, a.interval.end, a.kind).cmp(&(b.interval.start, b.interval.end, b.kind))
        });

        let mut node_of: Vec<NodeId> = vec![0; keys.len()];
        for (pos, &i) in order.iter().enumerate() {
            node_of[i] = pos;
        }
        let mut nodes: Vec<Node> = order
            .iter()
            .map(|&i| Node {
                cut: keys[i].0,
                side: keys[i].1,
                roles: roles[&keys[i]],
                donor_site: None,
                acceptor_site: None,
                out_edges: Vec::new(),
                in_edges: Vec::new(),
            })
            .collect();

        let mut features = Vec::with_capacity(pending.len());
        let mut edges = Vec::new();
        for (local, p) in pending.into_iter().enumerate() {
            if let Some((from, to)) = p.ends {
                let (from, to) = (node_of[index_of[&from]], node_of[index_of[&to]]);
                let e = edges.len();
                edges.push(Edge { feature: local, from, to });
                nodes[from].out_edges.push(e);
                nodes[to].in_edges.push(e);
            }
            if let Some(k) = p.site_of {
                let n = &mut nodes[node_of[index_of[&k]]];
                match p.kind {
                    FeatureType::DonorSite => n.donor_site = Some(local),
                    _ => n.acceptor_site = Some(local),
                }
            }
            features.push(SgFeature {
                feature_id: local + 1,
                gene_id: locus.gene_id,
                interval: p.interval,
                kind: p.kind,
                tx_names: p.tx_names,
                gene_names: p.gene_names,
            });
        }

        let gene_names = locus
            .features
            .iter()
            .flat_map(|f| f.gene_names.iter().cloned())
            .collect();

        debug!(
            "locus {}: {} nodes, {} edges, {} features",
            name,
            nodes.len(),
            edges.len(),
            features.len()
        );

        Ok(Self {
            gene_id: locus.gene_id,
            seqname: locus.seqname.clone(),
            strand: locus.strand,
            start: locus.start,
            end: locus.end,
            gene_names,
            nodes,
            edges,
            features,
        })
    }

    /// Shift local feature ids so that the first one is `first_id`.
    fn assign_feature_ids(&mut self, first_id: FeatureId) {
        for (i, f) in self.features.iter_mut().enumerate() {
            f.feature_id = first_id + i;
        }
    }

    pub fn first_feature_id(&self) -> Option<FeatureId> {
        self.features.first().map(|f| f.feature_id)
    }

    /// Feature by id (ids are consecutive within a locus).
    pub fn feature(&self, id: FeatureId) -> Option<&SgFeature> {
        let first = self.first_feature_id()?;
        self.features.get(id.checked_sub(first)?)
    }

    pub fn edge_feature(&self, edge: usize) -> &SgFeature {
        &self.features[self.edges[edge].feature]
    }

    /// Label used in variant names.
    pub fn label(&self) -> String {
        self.gene_id.to_string()
    }

    /// Structural self-check: endpoints exist and every edge points forward.
    pub fn validate(&self) -> Result<()> {
        let locus = format!("{}:{}-{}:{}", self.seqname, self.start, self.end, self.strand);
        for (i, e) in self.edges.iter().enumerate() {
            if e.from >= self.nodes.len() || e.to >= self.nodes.len() {
                return Err(Error::invalid_locus(locus, format!("edge {i} has a dangling endpoint")));
            }
            if e.from >= e.to {
                return Err(Error::invalid_locus(locus, format!("edge {i} is not topologically ordered")));
            }
            if e.feature >= self.features.len() {
                return Err(Error::invalid_locus(locus, format!("edge {i} has no feature")));
            }
        }
        Ok(())
    }
}

/// A locus that could not be turned into a splice graph.
#[derive(Debug)]
pub struct LocusFailure {
    pub gene_id: GeneId,
    pub locus: String,
    pub error: Error,
}

/// Splice graphs of all loci with globally unique feature ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenomeGraph {
    pub loci: Vec<SpliceGraph>,
}

/// Result of a genome-wide build: the graph plus excluded loci.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub graph: GenomeGraph,
    pub failures: Vec<LocusFailure>,
}

impl GenomeGraph {
    /// Partition features into loci and build each locus in parallel.
    ///
    /// Loci that fail validation are reported and left out; feature ids are
    /// assigned after the parallel phase, in gene order.
    pub fn build(features: &TxFeatureSet) -> BuildReport {
        let loci = partition_loci(features);
        info!("building splice graphs for {} loci", loci.len());

        let built: Vec<Result<SpliceGraph>> = loci.par_iter().map(SpliceGraph::build).collect();

        let mut report = BuildReport::default();
        let mut next_id: FeatureId = 1;
        for (locus, res) in loci.iter().zip(built) {
            match res {
                Ok(mut g) => {
                    g.assign_feature_ids(next_id);
                    next_id += g.features.len();
                    report.graph.loci.push(g);
                }
                Err(error) => {
                    warn!("excluding locus {}: {}", locus.name(), error);
                    report.failures.push(LocusFailure {
                        gene_id: locus.gene_id,
                        locus: locus.name(),
                        error,
                    });
                }
            }
        }
        report
    }

    pub fn features(&self) -> impl Iterator<Item = &SgFeature> {
        self.loci.iter().flat_map(|g| g.features.iter())
    }

    pub fn n_features(&self) -> usize {
        self.loci.iter().map(|g| g.features.len()).sum()
    }

    pub fn locus(&self, gene_id: GeneId) -> Option<&SpliceGraph> {
        let i = self.loci.binary_search_by_key(&gene_id, |g| g.gene_id).ok()?;
        self.loci.get(i)
    }

    /// Locus holding a feature id.
    pub fn locus_of_feature(&self, id: FeatureId) -> Option<&SpliceGraph> {
        let i = self
            .loci
            .partition_point(|g| g.first_feature_id().is_some_and(|first| first <= id));
        let g = self.loci.get(i.checked_sub(1)?)?;
        g.feature(id).map(|_| g)
    }

    pub fn feature(&self, id: FeatureId) -> Option<&SgFeature> {
        self.locus_of_feature(id)?.feature(id)
    }

    pub fn validate(&self) -> Result<()> {
        self.loci.iter().try_for_each(SpliceGraph::validate)
    }
}

/// Summary of the graph for quick inspection.
///
/// Prints one global line and one line per sequence with loci, nodes,
/// edges and the feature counts per type.
impl fmt::Display for GenomeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n_nodes: usize = self.loci.iter().map(|g| g.nodes.len()).sum();
        let n_edges: usize = self.loci.iter().map(|g| g.edges.len()).sum();
        writeln!(
            f,
            "SpliceGraph: {} loci, {} nodes, {} edges, {} features",
            self.loci.len(),
            n_nodes,
            n_edges,
            self.n_features()
        )?;

        let mut per_seq: BTreeMap<&str, (usize, BTreeMap<char, usize>)> = BTreeMap::new();
        for g in &self.loci {
            let entry = per_seq.entry(g.seqname.as_str()).or_default();
            entry.0 += 1;
            for feat in &g.features {
                *entry.1.entry(feat.kind.code()).or_default() += 1;
            }
        }
        for (seq, (n_loci, counts)) in per_seq {
            let types: Vec<String> = counts.iter().map(|(c, n)| format!("{c}={n}")).collect();
            writeln!(f, "  - {}: loci={}, {}", seq, n_loci, types.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feat(strand: Strand, start: u32, end: u32, kind: FeatureType) -> TxFeature {
        TxFeature::new(GenomicInterval::new("chr1", start, end, strand), kind)
    }

    /// One donor, two acceptors 200 bp apart.
    fn a3ss() -> TxFeatureSet {
        let p = Strand::Plus;
        vec![
            feat(p, 100, 200, FeatureType::FirstExon).with_tx("t1"),
            feat(p, 201, 400, FeatureType::Junction).with_tx("t1"),
            feat(p, 401, 800, FeatureType::LastExon).with_tx("t1"),
            feat(p, 100, 200, FeatureType::FirstExon).with_tx("t2"),
            feat(p, 201, 600, FeatureType::Junction).with_tx("t2"),
            feat(p, 601, 800, FeatureType::LastExon).with_tx("t2"),
        ]
        .into_iter()
        .collect()
    }

    fn bins(g: &SpliceGraph) -> Vec<(u32, u32, bool, bool)> {
        g.features
            .iter()
            .filter_map(|f| match f.kind {
                FeatureType::ExonBin { spliced5p, spliced3p } => Some((f.start(), f.end(), spliced5p, spliced3p)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn overlapping_exons_are_cut_into_disjoint_bins() {
        let report = GenomeGraph::build(&a3ss());
        assert!(report.failures.is_empty());
        assert_eq!(report.graph.loci.len(), 1);
        let g = &report.graph.loci[0];

        assert_eq!(
            bins(g),
            vec![(100, 200, false, true), (401, 600, true, false), (601, 800, false, false)]
        );
        // start 100, donor 201, acceptor 401, merged 601, end 801
        assert_eq!(g.nodes.len(), 5);
        assert_eq!(g.edges.len(), 5);
        g.validate().unwrap();

        let sites: Vec<(FeatureType, u32)> = g
            .features
            .iter()
            .filter(|f| f.kind.is_site())
            .map(|f| (f.kind, f.start()))
            .collect();
        assert!(sites.contains(&(FeatureType::DonorSite, 200)));
        assert!(sites.contains(&(FeatureType::AcceptorSite, 401)));
        assert!(sites.contains(&(FeatureType::AcceptorSite, 601)));
    }

    #[test]
    fn feature_ids_follow_genomic_order() {
        let g = GenomeGraph::build(&a3ss()).graph;
        let ids: Vec<FeatureId> = g.features().map(|f| f.feature_id).collect();
        assert_eq!(ids, (1..=ids.len()).collect::<Vec<_>>());
        let starts: Vec<u32> = g.features().map(|f| f.start()).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
        assert_eq!(g.feature(3).map(|f| f.feature_id), Some(3));
    }

    #[test]
    fn build_is_deterministic() {
        let a = GenomeGraph::build(&a3ss()).graph;
        let b = GenomeGraph::build(&a3ss()).graph;
        assert_eq!(a, b);
    }

    #[test]
    fn minus_strand_edges_run_high_to_low() {
        let m = Strand::Minus;
        let set: TxFeatureSet = vec![
            feat(m, 100, 200, FeatureType::LastExon),
            feat(m, 201, 300, FeatureType::Junction),
            feat(m, 301, 400, FeatureType::FirstExon),
        ]
        .into_iter()
        .collect();
        let g = &GenomeGraph::build(&set).graph.loci[0];
        g.validate().unwrap();
        // first node in topological order is the transcript start at the high end
        assert_eq!(g.nodes[0].cut, 401);
        assert!(g.nodes[0].roles.start);
        let donor = g.features.iter().find(|f| f.kind == FeatureType::DonorSite).unwrap();
        assert_eq!(donor.start(), 301);
        let acceptor = g.features.iter().find(|f| f.kind == FeatureType::AcceptorSite).unwrap();
        assert_eq!(acceptor.start(), 200);
    }

    #[test]
    fn unknown_strand_locus_is_excluded_not_fatal() {
        let mut set = a3ss();
        set.insert(feat(Strand::Unknown, 5000, 5100, FeatureType::UnsplicedExon));
        let report = GenomeGraph::build(&set);
        assert_eq!(report.graph.loci.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].error, Error::InputValidation { .. }));
    }

    #[test]
    fn retained_intron_gives_parallel_edges() {
        let p = Strand::Plus;
        let set: TxFeatureSet = vec![
            feat(p, 100, 200, FeatureType::FirstExon),
            feat(p, 201, 300, FeatureType::Junction),
            feat(p, 301, 400, FeatureType::LastExon),
            feat(p, 100, 400, FeatureType::UnsplicedExon),
        ]
        .into_iter()
        .collect();
        let g = &GenomeGraph::build(&set).graph.loci[0];
        assert_eq!(bins(g), vec![(100, 200, false, false), (201, 300, false, false), (301, 400, false, false)]);
        let donor = g.nodes.iter().find(|n| n.roles.donor).unwrap();
        assert_eq!(donor.out_edges().len(), 2);
        assert_eq!(donor.side, Side::Both);
    }
}
