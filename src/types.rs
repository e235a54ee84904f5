use serde::{Deserialize, Serialize};
use std::fmt;

/// Genomic strand/orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Strand {
    Plus,
    Minus,
    Unknown,
}

impl Strand {
    #[inline]
    pub fn is_compatible_with(self, other: Strand) -> bool {
        // "Unknown" is treated as compatible with either.
        self == Strand::Unknown || other == Strand::Unknown || self == other
    }

    #[inline]
    pub fn is_known(self) -> bool {
        self != Strand::Unknown
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Strand::Plus),
            '-' => Some(Strand::Minus),
            '.' | '?' | '*' => Some(Strand::Unknown),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Strand::Plus => '+',
            Strand::Minus => '-',
            Strand::Unknown => '*',
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// A contiguous genomic stretch.
/// Coordinates are 1-based, inclusive: [start, end]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Block {
    pub start: u32,
    pub end: u32,
}

impl Block {
    /// Create a new block. Panics if start > end.
    pub fn new(start: u32, end: u32) -> Self {
        assert!(start <= end, "Block requires start <= end");
        Self { start, end }
    }

    #[inline]
    pub fn len(self) -> u32 {
        self.end - self.start + 1
    }

    #[inline]
    pub fn overlaps(self, other: Block) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    #[inline]
    pub fn contains(self, other: Block) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    #[inline]
    pub fn contains_pos(self, pos: u32) -> bool {
        self.start <= pos && pos <= self.end
    }

    /// Introns implied by an ordered list of blocks.
    ///
    /// Intron i is `[blocks[i].end + 1, blocks[i+1].start - 1]`. Touching or
    /// overlapping blocks do not produce an intron.
    pub fn introns_from_blocks(blocks: &[Block]) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for w in blocks.windows(2) {
            let a = w[0];
            let b = w[1];
            if b.start <= a.end + 1 {
                continue;
            }
            out.push((a.end + 1, b.start - 1));
        }
        out
    }
}

/// A stranded genomic interval, 1-based inclusive.
///
/// Ordering is by sequence name, then start, then end (then strand).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GenomicInterval {
    pub seqname: String,
    pub start: u32,
    pub end: u32,
    pub strand: Strand,
}

impl GenomicInterval {
    pub fn new(seqname: impl Into<String>, start: u32, end: u32, strand: Strand) -> Self {
        assert!(start <= end, "GenomicInterval requires start <= end");
        Self {
            seqname: seqname.into(),
            start,
            end,
            strand,
        }
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    #[inline]
    pub fn block(&self) -> Block {
        Block {
            start: self.start,
            end: self.end,
        }
    }

    /// Same sequence, compatible strand and overlapping coordinates.
    pub fn overlaps(&self, other: &GenomicInterval) -> bool {
        self.seqname == other.seqname
            && self.strand.is_compatible_with(other.strand)
            && self.block().overlaps(other.block())
    }
}

impl fmt::Display for GenomicInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}:{}", self.seqname, self.start, self.end, self.strand)
    }
}

/// A region to fetch reads from (1-based inclusive).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    pub seqname: String,
    pub start: u32,
    pub end: u32,
}

impl Region {
    pub fn new(seqname: impl Into<String>, start: u32, end: u32) -> Self {
        Self {
            seqname: seqname.into(),
            start,
            end,
        }
    }

    /// Parse `chr:start-end` (1-based inclusive).
    pub fn parse(s: &str) -> Option<Self> {
        let (seqname, range) = s.rsplit_once(':')?;
        let (start, end) = range.split_once('-')?;
        let start: u32 = start.replace(',', "").parse().ok()?;
        let end: u32 = end.replace(',', "").parse().ok()?;
        if seqname.is_empty() || start == 0 || end < start {
            return None;
        }
        Some(Self::new(seqname, start, end))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.seqname, self.start, self.end)
    }
}

/// A gapped read alignment in genomic coordinates (BAM-independent).
///
/// Design:
/// - `name` groups mates of a fragment.
/// - `strand` is the splice strand (from the XS tag or the library protocol), or Unknown.
/// - `blocks` are the aligned stretches, 1-based inclusive; gaps between blocks are introns.
///
/// You can create it with unsorted blocks and then call `finalize()`
/// to sort and merge them for stable matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedRead {
    pub name: String,
    pub seqname: String,
    pub strand: Strand,
    pub blocks: Vec<Block>,
    pub paired: bool,
    pub first_mate: bool,
    introns: Vec<(u32, u32)>,
    finalized: bool,
}

impl AlignedRead {
    pub fn new(
        name: impl Into<String>,
        seqname: impl Into<String>,
        strand: Strand,
        blocks: Vec<Block>,
    ) -> Self {
        Self {
            name: name.into(),
            seqname: seqname.into(),
            strand,
            blocks,
            paired: false,
            first_mate: true,
            introns: Vec::new(),
            finalized: false,
        }
    }

    pub fn with_mate(mut self, first_mate: bool) -> Self {
        self.paired = true;
        self.first_mate = first_mate;
        self
    }

    /// Sort blocks by start, merge overlapping/adjacent ones and derive introns.
    pub fn finalize(&mut self) {
        if self.blocks.is_empty() {
            self.introns.clear();
            self.finalized = true;
            return;
        }

        self.blocks.sort_by_key(|b| (b.start, b.end));

        let mut merged: Vec<Block> = Vec::with_capacity(self.blocks.len());
        let mut cur = self.blocks[0];

        for &b in &self.blocks[1..] {
            if b.start <= cur.end + 1 {
                cur.end = cur.end.max(b.end);
            } else {
                merged.push(cur);
                cur = b;
            }
        }
        merged.push(cur);

        self.introns = Block::introns_from_blocks(&merged);
        self.blocks = merged;
        self.finalized = true;
    }

    /// Builder-style `finalize()`.
    pub fn finalized(mut self) -> Self {
        self.finalize();
        self
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Span of the read blocks (min start, max end).
    pub fn span(&self) -> Option<(u32, u32)> {
        let first = self.blocks.first()?;
        let last = self.blocks.last()?;
        Some((first.start, last.end))
    }

    /// Introns (first and last intronic base) implied by the blocks.
    pub fn introns(&self) -> &[(u32, u32)] {
        &self.introns
    }

    #[inline]
    pub fn is_spliced(&self) -> bool {
        !self.introns.is_empty()
    }
}
