//! Structural compatibility of a read with a splice graph feature.
//!
//! Rules:
//! - Junction: the read reports exactly that intron.
//! - Exon bin: the read overlaps the bin, has no intron starting or ending
//!   inside it, and only runs contiguously past a boundary that is not spliced.
//! - Donor/acceptor site: one block covers the site base and the adjacent
//!   intronic base, i.e. the read does not splice at that site.
//!
//! Reads are expected to be finalized.

use crate::model::feature::SgFeature;
use crate::model::types::{Compatibility, FeatureType};
use crate::types::{AlignedRead, Block, Strand};

pub fn compatibility(read: &AlignedRead, feature: &SgFeature) -> Compatibility {
    debug_assert!(read.is_finalized(), "reads must be finalized before matching");

    if read.seqname != feature.interval.seqname {
        return Compatibility::NoOverlap;
    }
    let Some((start, end)) = read.span() else {
        return Compatibility::NoOverlap;
    };
    if end < feature.start() || feature.end() < start {
        return Compatibility::NoOverlap;
    }
    if !read.strand.is_compatible_with(feature.interval.strand) {
        return Compatibility::StrandMismatch;
    }

    match feature.kind {
        FeatureType::Junction => junction(read, feature),
        FeatureType::DonorSite | FeatureType::AcceptorSite => site(read, feature),
        _ => exon_bin(read, feature),
    }
}

#[inline]
pub fn is_compatible(read: &AlignedRead, feature: &SgFeature) -> bool {
    compatibility(read, feature) == Compatibility::Compatible
}

fn junction(read: &AlignedRead, feature: &SgFeature) -> Compatibility {
    if read.introns().contains(&(feature.start(), feature.end())) {
        Compatibility::Compatible
    } else {
        Compatibility::SpliceMismatch
    }
}

fn exon_bin(read: &AlignedRead, feature: &SgFeature) -> Compatibility {
    let bin = Block::new(feature.start(), feature.end());
    let overlapping: Vec<Block> = read.blocks.iter().copied().filter(|b| b.overlaps(bin)).collect();
    if overlapping.is_empty() {
        return Compatibility::NoOverlap;
    }

    if read
        .introns()
        .iter()
        .any(|&(s, e)| Block::new(s, e).overlaps(bin))
    {
        return Compatibility::Intronic;
    }

    let (spliced_left, spliced_right) = feature.spliced_sides();
    for b in overlapping {
        if (b.start < bin.start && spliced_left) || (b.end > bin.end && spliced_right) {
            return Compatibility::SpliceMismatch;
        }
    }
    Compatibility::Compatible
}

/// Intronic neighbour of a splice site base.
fn intron_base(kind: FeatureType, strand: Strand, pos: u32) -> Option<u32> {
    let downstream = matches!(
        (kind, strand),
        (FeatureType::DonorSite, Strand::Plus) | (FeatureType::AcceptorSite, Strand::Minus)
    );
    if downstream {
        pos.checked_add(1)
    } else {
        pos.checked_sub(1).filter(|&p| p > 0)
    }
}

fn site(read: &AlignedRead, feature: &SgFeature) -> Compatibility {
    let pos = feature.start();
    let Some(intronic) = intron_base(feature.kind, feature.interval.strand, pos) else {
        return Compatibility::NoOverlap;
    };
    let (lo, hi) = (pos.min(intronic), pos.max(intronic));

    if read.blocks.iter().any(|b| b.start <= lo && hi <= b.end) {
        Compatibility::Compatible
    } else if read.blocks.iter().any(|b| b.contains_pos(pos)) {
        Compatibility::SpliceMismatch
    } else {
        Compatibility::NoOverlap
    }
}
