use std::collections::BTreeSet;
use std::fmt;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::merge::UnionFind;
use crate::model::classify::{classify, VariantType};
use crate::model::graph::{GenomeGraph, SpliceGraph};
use crate::model::types::{EventId, EventOptions, FeatureId, FeatureType, GeneId, NodeId, VariantId};

/// Event endpoint: a graph node or one of the virtual terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventNode {
    Root,
    Node(NodeId),
    Sink,
}

impl fmt::Display for EventNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventNode::Root => f.write_str("R"),
            EventNode::Node(n) => write!(f, "N{n}"),
            EventNode::Sink => f.write_str("K"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpliceVariant {
    pub variant_id: VariantId,
    pub event_id: EventId,
    pub gene_id: GeneId,
    /// Features along the path, 5'->3'. Empty for a bare start/end alternative.
    pub features: Vec<FeatureId>,
    /// Unbranched segments the path runs through (locus-local ids).
    pub segment_ids: Vec<usize>,
    pub feature_id_5p: Option<FeatureId>,
    pub feature_id_3p: Option<FeatureId>,
    pub variant_type: BTreeSet<VariantType>,
    pub variant_name: String,
    pub tx_names: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpliceEvent {
    pub event_id: EventId,
    pub gene_id: GeneId,
    pub from: EventNode,
    pub to: EventNode,
    pub closed5p: bool,
    pub closed3p: bool,
    pub variants: Vec<SpliceVariant>,
}

impl SpliceEvent {
    pub fn n_variants(&self) -> usize {
        self.variants.len()
    }
}

/// One step of a path in the augmented graph; `edge` is `None` for virtual edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Step {
    to: usize,
    edge: Option<usize>,
}

/// Locus graph plus a virtual root (index 0) and sink (index n + 1).
///
/// Real node `i` has index `i + 1`, so indices are a topological order.
struct Augmented<'g> {
    g: &'g SpliceGraph,
    out: Vec<Vec<Step>>,
    inc: Vec<Vec<Step>>,
    include_terminal: bool,
}

impl<'g> Augmented<'g> {
    fn new(g: &'g SpliceGraph, include_terminal: bool) -> Self {
        let n = g.nodes.len();
        let sink = n + 1;
        let mut out = vec![Vec::new(); n + 2];
        let mut inc = vec![Vec::new(); n + 2];
        let mut link = |from: usize, to: usize, edge: Option<usize>| {
            out[from].push(Step { to, edge });
            inc[to].push(Step { to: from, edge });
        };

        for (i, node) in g.nodes.iter().enumerate() {
            if node.roles.start {
                link(0, i + 1, None);
            }
        }
        for (e, edge) in g.edges.iter().enumerate() {
            link(edge.from + 1, edge.to + 1, Some(e));
        }
        for (i, node) in g.nodes.iter().enumerate() {
            if node.roles.end {
                link(i + 1, sink, None);
            }
        }

        Self {
            g,
            out,
            inc,
            include_terminal,
        }
    }

    fn len(&self) -> usize {
        self.out.len()
    }

    fn sink(&self) -> usize {
        self.out.len() - 1
    }

    /// Out-steps used for event discovery.
    fn branches(&self, v: usize) -> impl Iterator<Item = &Step> {
        let terminal = self.include_terminal;
        self.out[v].iter().filter(move |s| terminal || s.edge.is_some())
    }

    fn endpoint(&self, v: usize) -> EventNode {
        if v == 0 {
            EventNode::Root
        } else if v == self.sink() {
            EventNode::Sink
        } else {
            EventNode::Node(v - 1)
        }
    }

    /// Convergence points of the branches leaving `u`, in topological order.
    fn convergences(&self, u: usize) -> Vec<usize> {
        let branches: Vec<&Step> = self.branches(u).collect();
        if branches.len() < 2 {
            return Vec::new();
        }

        let mut uf = UnionFind::new(branches.len());
        let mut reach: Vec<Vec<usize>> = vec![Vec::new(); self.len()];
        for (b, s) in branches.iter().enumerate() {
            reach[s.to].push(b);
        }

        let mut out = Vec::new();
        for v in (u + 1)..self.len() {
            if reach[v].is_empty() {
                continue;
            }
            let mut roots: Vec<usize> = reach[v].iter().map(|&b| uf.find(b)).collect();
            roots.sort_unstable();
            roots.dedup();
            if roots.len() >= 2 {
                out.push(v);
                for &r in &roots[1..] {
                    uf.union(roots[0], r);
                }
            }
            let root = uf.find(roots[0]);
            for s in self.branches(v) {
                reach[s.to].push(root);
            }
        }
        out
    }

    /// Nodes in `[u, v]` that can reach `v`.
    fn reaches(&self, u: usize, v: usize) -> Vec<bool> {
        let mut ok = vec![false; self.len()];
        ok[v] = true;
        for x in (u..v).rev() {
            ok[x] = self.branches(x).any(|s| ok[s.to]);
        }
        ok
    }

    /// Number of paths from `u` to `v`, saturating.
    fn count_paths(&self, u: usize, v: usize) -> u64 {
        let mut n = vec![0u64; self.len()];
        n[u] = 1;
        for x in u..v {
            if n[x] == 0 {
                continue;
            }
            for s in self.branches(x) {
                if s.to <= v {
                    n[s.to] = n[s.to].saturating_add(n[x]);
                }
            }
        }
        n[v]
    }

    /// All paths `u -> v` as step lists, explicit stack.
    fn paths(&self, u: usize, v: usize) -> Vec<Vec<Step>> {
        let ok = self.reaches(u, v);
        let mut out = Vec::new();
        // (node, index of next branch to try)
        let mut stack: Vec<(usize, usize)> = vec![(u, 0)];
        let mut path: Vec<Step> = Vec::new();

        while let Some(top) = stack.last_mut() {
            let (x, next) = *top;
            if x == v {
                out.push(path.clone());
                stack.pop();
                path.pop();
                continue;
            }
            top.1 += 1;
            let step = self
                .branches(x)
                .filter(|s| s.to <= v && ok[s.to])
                .nth(next)
                .copied();
            match step {
                Some(s) => {
                    path.push(s);
                    stack.push((s.to, 0));
                }
                None => {
                    stack.pop();
                    path.pop();
                }
            }
        }
        out
    }

    /// Event closure: internal nodes only connect to the event (virtual edges included).
    fn closure(&self, u: usize, v: usize, internal: &BTreeSet<usize>) -> (bool, bool) {
        let inside = |x: usize| internal.contains(&x);
        let closed5p = internal
            .iter()
            .all(|&x| self.inc[x].iter().all(|s| s.to == u || inside(s.to)));
        let closed3p = internal
            .iter()
            .all(|&x| self.out[x].iter().all(|s| s.to == v || inside(s.to)));
        (closed5p, closed3p)
    }

    /// First junction, or donor site left through an exon bin.
    fn anchor_5p(&self, path: &[Step], from: usize) -> Option<usize> {
        let mut at = from;
        for s in path {
            if let Some(e) = s.edge {
                let feature = &self.g.features[self.g.edges[e].feature];
                if feature.kind.is_junction() {
                    return Some(self.g.edges[e].feature);
                }
                let node = &self.g.nodes[at - 1];
                if node.roles.donor && node.donor_site.is_some() {
                    return node.donor_site;
                }
            }
            at = s.to;
        }
        None
    }

    /// Last junction, or acceptor site entered through an exon bin.
    fn anchor_3p(&self, path: &[Step]) -> Option<usize> {
        for s in path.iter().rev() {
            if let Some(e) = s.edge {
                let feature = &self.g.features[self.g.edges[e].feature];
                if feature.kind.is_junction() {
                    return Some(self.g.edges[e].feature);
                }
                let node = &self.g.nodes[s.to - 1];
                if node.roles.acceptor && node.acceptor_site.is_some() {
                    return node.acceptor_site;
                }
            }
        }
        None
    }

    /// Segment id per edge: edges chained through nodes with a single
    /// in-step and a single out-step share a segment.
    fn segments(&self) -> Vec<usize> {
        let n_edges = self.g.edges.len();
        let mut uf = UnionFind::new(n_edges);
        for x in 1..self.sink() {
            if let ([a], [b]) = (self.inc[x].as_slice(), self.out[x].as_slice()) {
                if let (Some(ea), Some(eb)) = (a.edge, b.edge) {
                    uf.union(ea, eb);
                }
            }
        }
        let mut ids = vec![0usize; n_edges];
        let mut next = 0;
        let mut seen: Vec<Option<usize>> = vec![None; n_edges];
        for e in 0..n_edges {
            let root = uf.find(e);
            let id = *seen[root].get_or_insert_with(|| {
                next += 1;
                next
            });
            ids[e] = id;
        }
        ids
    }
}

/// Events of one locus; ids are local (1-based) until renumbered.
pub fn find_locus_events(g: &SpliceGraph, opts: &EventOptions) -> Vec<SpliceEvent> {
    let aug = Augmented::new(g, opts.include_terminal);
    let segments = aug.segments();
    let mut events = Vec::new();

    for u in 0..aug.len() {
        for v in aug.convergences(u) {
            let n_paths = aug.count_paths(u, v);
            if n_paths > opts.max_variants as u64 {
                warn!(
                    "gene {}: skipping event {}->{} with {} variants (max {})",
                    g.gene_id,
                    aug.endpoint(u),
                    aug.endpoint(v),
                    n_paths,
                    opts.max_variants
                );
                continue;
            }
            if let Some(ev) = build_event(&aug, &segments, u, v) {
                events.push(ev);
            }
        }
    }

    for (i, ev) in events.iter_mut().enumerate() {
        ev.event_id = i + 1;
    }
    debug!("gene {}: {} events", g.gene_id, events.len());
    events
}

fn build_event(aug: &Augmented<'_>, segments: &[usize], u: usize, v: usize) -> Option<SpliceEvent> {
    let g = aug.g;
    let paths = aug.paths(u, v);
    if paths.len() < 2 {
        return None;
    }

    let internal: BTreeSet<usize> = paths
        .iter()
        .flat_map(|p| p.iter().map(|s| s.to))
        .filter(|&x| x != v)
        .collect();
    let (closed5p, closed3p) = aug.closure(u, v, &internal);

    let mut variants: Vec<(SpliceVariant, Vec<FeatureType>, (Option<u32>, u64))> = paths
        .iter()
        .map(|path| {
            let edges: Vec<usize> = path.iter().filter_map(|s| s.edge).collect();
            let locals: Vec<usize> = edges.iter().map(|&e| g.edges[e].feature).collect();
            let features: Vec<FeatureId> = locals.iter().map(|&l| g.features[l].feature_id).collect();
            let kinds: Vec<FeatureType> = locals.iter().map(|&l| g.features[l].kind).collect();

            let mut segment_ids: Vec<usize> = edges.iter().map(|&e| segments[e]).collect();
            segment_ids.dedup();

            let tx_names = locals
                .iter()
                .map(|&l| &g.features[l].tx_names)
                .fold(None::<BTreeSet<String>>, |acc, names| match acc {
                    None => Some(names.clone()),
                    Some(acc) => Some(acc.intersection(names).cloned().collect()),
                })
                .unwrap_or_default();

            let first_start = locals.iter().map(|&l| g.features[l].start()).min();
            let bp: u64 = locals
                .iter()
                .filter(|&&l| g.features[l].kind.is_exon())
                .map(|&l| u64::from(g.features[l].len()))
                .sum();

            let variant = SpliceVariant {
                variant_id: 0,
                event_id: 0,
                gene_id: g.gene_id,
                features,
                segment_ids,
                feature_id_5p: aug.anchor_5p(path, u).map(|l| g.features[l].feature_id),
                feature_id_3p: aug.anchor_3p(path).map(|l| g.features[l].feature_id),
                variant_type: BTreeSet::new(),
                variant_name: String::new(),
                tx_names,
            };
            (variant, kinds, (first_start, bp))
        })
        .collect();

    variants.sort_by(|a, b| (a.2, &a.0.features).cmp(&(b.2, &b.0.features)));

    let kinds: Vec<Vec<FeatureType>> = variants.iter().map(|v| v.1.clone()).collect();
    let types = classify(u == 0, v == aug.sink(), &kinds);

    Some(SpliceEvent {
        event_id: 0,
        gene_id: g.gene_id,
        from: aug.endpoint(u),
        to: aug.endpoint(v),
        closed5p,
        closed3p,
        variants: variants
            .into_iter()
            .zip(types)
            .map(|((mut var, _, _), t)| {
                var.variant_type = t;
                var
            })
            .collect(),
    })
}

/// Events of all loci with graph-wide event and variant ids and names.
pub fn find_events(graph: &GenomeGraph, opts: &EventOptions) -> Result<Vec<SpliceEvent>> {
    opts.validate()?;

    let per_locus: Vec<Vec<SpliceEvent>> = graph
        .loci
        .par_iter()
        .map(|g| find_locus_events(g, opts))
        .collect();

    let mut events = Vec::new();
    let mut next_event: EventId = 1;
    let mut next_variant: VariantId = 1;
    for (g, locus_events) in graph.loci.iter().zip(per_locus) {
        for mut ev in locus_events {
            ev.event_id = next_event;
            next_event += 1;
            let n = ev.variants.len();
            for (k, var) in ev.variants.iter_mut().enumerate() {
                var.event_id = ev.event_id;
                var.variant_id = next_variant;
                next_variant += 1;
                var.variant_name = format!("{}_{}_{}/{}", g.label(), ev.event_id, k + 1, n);
            }
            events.push(ev);
        }
    }

    info!(
        "found {} events with {} variants in {} loci",
        events.len(),
        next_variant - 1,
        graph.loci.len()
    );
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::feature::{TxFeature, TxFeatureSet};
    use crate::model::graph::GenomeGraph;
    use crate::types::{GenomicInterval, Strand};

    fn feat(start: u32, end: u32, kind: FeatureType, tx: &str) -> TxFeature {
        TxFeature::new(GenomicInterval::new("chr1", start, end, Strand::Plus), kind).with_tx(tx)
    }

    fn graph(features: Vec<TxFeature>) -> GenomeGraph {
        let set: TxFeatureSet = features.into_iter().collect();
        let report = GenomeGraph::build(&set);
        assert!(report.failures.is_empty());
        report.graph
    }

    fn a3ss() -> GenomeGraph {
        graph(vec![
            feat(100, 200, FeatureType::FirstExon, "t1"),
            feat(201, 400, FeatureType::Junction, "t1"),
            feat(401, 800, FeatureType::LastExon, "t1"),
            feat(100, 200, FeatureType::FirstExon, "t2"),
            feat(201, 600, FeatureType::Junction, "t2"),
            feat(601, 800, FeatureType::LastExon, "t2"),
        ])
    }

    #[test]
    fn a3ss_gives_one_closed_event_with_two_variants() {
        let g = a3ss();
        let events = find_events(&g, &EventOptions::default()).unwrap();
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.variants.len(), 2);
        assert!(ev.closed5p);
        assert!(ev.closed3p);

        let types: Vec<String> = ev
            .variants
            .iter()
            .map(|v| crate::model::classify::format_types(&v.variant_type))
            .collect();
        // same first start; the distal variant has no exonic bases and sorts first
        assert_eq!(types, vec!["A3SS:D", "A3SS:P"]);
        assert_eq!(ev.variants[0].variant_name, "1_1_1/2");
        assert_eq!(ev.variants[1].variant_name, "1_1_2/2");

        // proximal: junction to 401 then bin [401,600]; distal: junction to 601
        let locus = &g.loci[0];
        let f = |id: FeatureId| locus.feature(id).unwrap();
        let prox = &ev.variants[1];
        assert_eq!(prox.features.len(), 2);
        assert_eq!(f(prox.feature_id_5p.unwrap()).end(), 400);
        let a3 = f(prox.feature_id_3p.unwrap());
        assert_eq!((a3.kind, a3.start()), (FeatureType::AcceptorSite, 601));
        let dist = &ev.variants[0];
        assert_eq!(dist.feature_id_5p, dist.feature_id_3p);
        assert_eq!(f(dist.feature_id_5p.unwrap()).end(), 600);
        assert_eq!(prox.tx_names.iter().collect::<Vec<_>>(), vec!["t1"]);
    }

    #[test]
    fn linear_chain_has_no_events() {
        let g = graph(vec![
            feat(100, 200, FeatureType::FirstExon, "t1"),
            feat(201, 300, FeatureType::Junction, "t1"),
            feat(301, 400, FeatureType::InternalExon, "t1"),
            feat(401, 500, FeatureType::Junction, "t1"),
            feat(501, 600, FeatureType::LastExon, "t1"),
        ]);
        assert!(find_events(&g, &EventOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn skipped_exon_is_minimal_event() {
        let g = graph(vec![
            feat(100, 200, FeatureType::FirstExon, "inc"),
            feat(201, 300, FeatureType::Junction, "inc"),
            feat(301, 400, FeatureType::InternalExon, "inc"),
            feat(401, 500, FeatureType::Junction, "inc"),
            feat(501, 600, FeatureType::LastExon, "inc"),
            feat(201, 500, FeatureType::Junction, "skip"),
        ]);
        let events = find_events(&g, &EventOptions::default()).unwrap();
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        let types: Vec<VariantType> = ev.variants.iter().flat_map(|v| v.variant_type.iter().copied()).collect();
        assert_eq!(types, vec![VariantType::SeS, VariantType::SeI]);
        // skipping path has no exonic bases and sorts first
        assert_eq!(ev.variants[0].features.len(), 1);
        assert_eq!(ev.variants[1].features.len(), 3);
        assert!(ev.closed5p && ev.closed3p);
    }

    #[test]
    fn alternative_first_exons_start_at_root() {
        let g = graph(vec![
            feat(100, 200, FeatureType::FirstExon, "a"),
            feat(201, 500, FeatureType::Junction, "a"),
            feat(301, 400, FeatureType::FirstExon, "b"),
            feat(401, 500, FeatureType::Junction, "b"),
            feat(501, 600, FeatureType::LastExon, "a"),
        ]);
        let events = find_events(&g, &EventOptions::default()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from, EventNode::Root);
        assert!(events[0].variants.iter().all(|v| v.variant_type.contains(&VariantType::Afe)));

        let opts = EventOptions {
            include_terminal: false,
            ..Default::default()
        };
        assert!(find_events(&g, &opts).unwrap().is_empty());
    }

    #[test]
    fn events_over_max_variants_are_skipped() {
        // two mutually exclusive exons plus a skipping junction: 3 paths
        let g = graph(vec![
            feat(100, 200, FeatureType::FirstExon, "t"),
            feat(201, 300, FeatureType::Junction, "a"),
            feat(301, 400, FeatureType::InternalExon, "a"),
            feat(401, 700, FeatureType::Junction, "a"),
            feat(201, 500, FeatureType::Junction, "b"),
            feat(501, 600, FeatureType::InternalExon, "b"),
            feat(601, 700, FeatureType::Junction, "b"),
            feat(201, 700, FeatureType::Junction, "s"),
            feat(701, 800, FeatureType::LastExon, "t"),
        ]);
        let all = find_events(&g, &EventOptions::default()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].variants.len(), 3);

        let opts = EventOptions {
            max_variants: 2,
            include_terminal: true,
        };
        assert!(find_events(&g, &opts).unwrap().is_empty());
    }

    #[test]
    fn nested_event_is_reported_inside_and_alone() {
        // skip 201-700 around an exon at 301-350 whose donor has acceptors 401 and 551
        let g = graph(vec![
            feat(100, 200, FeatureType::FirstExon, "t"),
            feat(201, 300, FeatureType::Junction, "a"),
            feat(301, 350, FeatureType::InternalExon, "a"),
            feat(351, 400, FeatureType::Junction, "a"),
            feat(401, 600, FeatureType::InternalExon, "a"),
            feat(351, 550, FeatureType::Junction, "b"),
            feat(551, 600, FeatureType::InternalExon, "b"),
            feat(601, 700, FeatureType::Junction, "a"),
            feat(201, 700, FeatureType::Junction, "s"),
            feat(701, 800, FeatureType::LastExon, "t"),
        ]);
        let locus = &g.loci[0];
        let span = |id: Option<FeatureId>| {
            let f = locus.feature(id.unwrap()).unwrap();
            (f.start(), f.end())
        };

        let events = find_events(&g, &EventOptions::default()).unwrap();
        assert_eq!(events.len(), 2);
        let (outer, inner) = (&events[0], &events[1]);
        assert!(outer.closed5p && outer.closed3p);
        assert!(inner.closed5p && inner.closed3p);

        // outer keeps both inner choices: skip, via 551, via 401
        let lens: Vec<usize> = outer.variants.iter().map(|v| v.features.len()).collect();
        assert_eq!(lens, vec![1, 5, 6]);
        let a5: Vec<(u32, u32)> = outer.variants.iter().map(|v| span(v.feature_id_5p)).collect();
        assert_eq!(a5, vec![(201, 700), (201, 300), (201, 300)]);
        let a3: Vec<(u32, u32)> = outer.variants.iter().map(|v| span(v.feature_id_3p)).collect();
        assert_eq!(a3, vec![(201, 700), (601, 700), (601, 700)]);

        assert_eq!(inner.variants.len(), 2);
        let a5: Vec<(u32, u32)> = inner.variants.iter().map(|v| span(v.feature_id_5p)).collect();
        assert_eq!(a5, vec![(351, 550), (351, 400)]);
        let a3: Vec<(u32, u32)> = inner.variants.iter().map(|v| span(v.feature_id_3p)).collect();
        assert_eq!(a3, vec![(351, 550), (551, 551)]);
        assert!(inner.variants[1].variant_type.contains(&VariantType::A3ssP));
    }

    #[test]
    fn event_ids_are_deterministic() {
        let a = find_events(&a3ss(), &EventOptions::default()).unwrap();
        let b = find_events(&a3ss(), &EventOptions::default()).unwrap();
        assert_eq!(a, b);
    }
}
