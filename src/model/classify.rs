use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::types::FeatureType;

/// Splice variant categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VariantType {
    /// Skipped exon, included / skipped.
    SeI,
    SeS,
    /// Two consecutive skipped exons, included / skipped.
    S2eI,
    S2eS,
    /// Retained intron, retained / excised.
    RiR,
    RiE,
    /// Alternative 5' splice site, proximal / distal.
    A5ssP,
    A5ssD,
    /// Alternative 3' splice site, proximal / distal.
    A3ssP,
    A3ssD,
    Mxe,
    Afe,
    Ale,
    As,
    Ae,
    Other,
}

impl VariantType {
    pub fn code(self) -> &'static str {
        match self {
            VariantType::SeI => "SE:I",
            VariantType::SeS => "SE:S",
            VariantType::S2eI => "S2E:I",
            VariantType::S2eS => "S2E:S",
            VariantType::RiR => "RI:R",
            VariantType::RiE => "RI:E",
            VariantType::A5ssP => "A5SS:P",
            VariantType::A5ssD => "A5SS:D",
            VariantType::A3ssP => "A3SS:P",
            VariantType::A3ssD => "A3SS:D",
            VariantType::Mxe => "MXE",
            VariantType::Afe => "AFE",
            VariantType::Ale => "ALE",
            VariantType::As => "AS",
            VariantType::Ae => "AE",
            VariantType::Other => "OTHER",
        }
    }
}

impl fmt::Display for VariantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Comma separated codes, e.g. `SE:I`.
pub fn format_types(types: &BTreeSet<VariantType>) -> String {
    types.iter().map(|t| t.code()).collect::<Vec<_>>().join(",")
}

/// Junction and exon counts of one path; consecutive bins form one exon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Shape {
    junctions: usize,
    exons: usize,
    starts_with_exon: bool,
    ends_with_exon: bool,
}

impl Shape {
    fn of(path: &[FeatureType]) -> Self {
        let mut junctions = 0;
        let mut exons = 0;
        let mut in_exon = false;
        for kind in path {
            if kind.is_junction() {
                junctions += 1;
                in_exon = false;
            } else if !in_exon {
                exons += 1;
                in_exon = true;
            }
        }
        Self {
            junctions,
            exons,
            starts_with_exon: path.first().is_some_and(|k| k.is_exon()),
            ends_with_exon: path.last().is_some_and(|k| k.is_exon()),
        }
    }

    fn is_bare_junction(self) -> bool {
        self.junctions == 1 && self.exons == 0
    }

    fn is_cassette(self, n_exons: usize) -> bool {
        self.exons == n_exons
            && self.junctions == n_exons + 1
            && !self.starts_with_exon
            && !self.ends_with_exon
    }
}

/// Classify every path of one event.
///
/// `paths` hold the feature types along each variant (5'->3'). Events opened
/// by the transcript-start root or closed by the transcript-end sink are
/// alternative first/last exons when any path is spliced, and alternative
/// starts/ends otherwise.
pub fn classify(from_root: bool, to_sink: bool, paths: &[Vec<FeatureType>]) -> Vec<BTreeSet<VariantType>> {
    let single = |t: VariantType| -> Vec<BTreeSet<VariantType>> {
        paths.iter().map(|_| BTreeSet::from([t])).collect()
    };
    let spliced = paths.iter().any(|p| p.iter().any(|k| k.is_junction()));

    if from_root {
        return single(if spliced { VariantType::Afe } else { VariantType::As });
    }
    if to_sink {
        return single(if spliced { VariantType::Ale } else { VariantType::Ae });
    }

    let shapes: Vec<Shape> = paths.iter().map(|p| Shape::of(p)).collect();
    let types: Option<Vec<VariantType>> = match shapes.as_slice() {
        [a, b] => classify_pair(*a, *b),
        _ => classify_many(&shapes),
    };

    match types {
        Some(t) => t.into_iter().map(|t| BTreeSet::from([t])).collect(),
        None => single(VariantType::Other),
    }
}

fn classify_pair(a: Shape, b: Shape) -> Option<Vec<VariantType>> {
    // (skipping-like, other) with the answer mapped back to input order
    let oriented = |skip: Shape, other: Shape| -> Option<(VariantType, VariantType)> {
        if !skip.is_bare_junction() {
            return None;
        }
        if other.junctions == 0 && other.exons >= 1 {
            return Some((VariantType::RiE, VariantType::RiR));
        }
        if other.is_cassette(1) {
            return Some((VariantType::SeS, VariantType::SeI));
        }
        if other.is_cassette(2) {
            return Some((VariantType::S2eS, VariantType::S2eI));
        }
        if other.junctions == 1 && other.exons == 1 {
            if other.starts_with_exon {
                return Some((VariantType::A5ssD, VariantType::A5ssP));
            }
            if other.ends_with_exon {
                return Some((VariantType::A3ssD, VariantType::A3ssP));
            }
        }
        None
    };

    if let Some((ta, tb)) = oriented(a, b) {
        return Some(vec![ta, tb]);
    }
    if let Some((tb, ta)) = oriented(b, a) {
        return Some(vec![ta, tb]);
    }
    if a.is_cassette(1) && b.is_cassette(1) {
        return Some(vec![VariantType::Mxe, VariantType::Mxe]);
    }
    None
}

fn classify_many(shapes: &[Shape]) -> Option<Vec<VariantType>> {
    if shapes.iter().all(|s| s.is_cassette(1)) {
        return Some(vec![VariantType::Mxe; shapes.len()]);
    }

    let bare = shapes.iter().filter(|s| s.is_bare_junction()).count();
    let rest = || shapes.iter().filter(|s| !s.is_bare_junction());
    if bare != 1 {
        return None;
    }
    let extended = |s: &Shape| s.junctions == 1 && s.exons == 1;

    let (distal, proximal) = if rest().all(|s| extended(s) && s.starts_with_exon) {
        (VariantType::A5ssD, VariantType::A5ssP)
    } else if rest().all(|s| extended(s) && s.ends_with_exon) {
        (VariantType::A3ssD, VariantType::A3ssP)
    } else {
        return None;
    };

    Some(
        shapes
            .iter()
            .map(|s| if s.is_bare_junction() { distal } else { proximal })
            .collect(),
    )
}
