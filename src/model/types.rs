use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::BufRead;

use crate::error::{Error, Result};

/// Internal numeric IDs.
pub type FeatureId = usize;
pub type GeneId = usize;
pub type NodeId = usize;
pub type EventId = usize;
pub type VariantId = usize;

/// Feature type with the per-type payload.
///
/// Transcript-level features use J/I/F/L/U, splice graph features use J/E/D/A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FeatureType {
    Junction,
    InternalExon,
    FirstExon,
    LastExon,
    UnsplicedExon,
    ExonBin { spliced5p: bool, spliced3p: bool },
    DonorSite,
    AcceptorSite,
}

impl FeatureType {
    pub fn code(self) -> char {
        match self {
            FeatureType::Junction => 'J',
            FeatureType::InternalExon => 'I',
            FeatureType::FirstExon => 'F',
            FeatureType::LastExon => 'L',
            FeatureType::UnsplicedExon => 'U',
            FeatureType::ExonBin { .. } => 'E',
            FeatureType::DonorSite => 'D',
            FeatureType::AcceptorSite => 'A',
        }
    }

    /// Parse a one-letter code. Exon bins come back with both boundaries unspliced.
    pub fn from_code(c: char) -> Option<Self> {
        let t = match c {
            'J' => FeatureType::Junction,
            'I' => FeatureType::InternalExon,
            'F' => FeatureType::FirstExon,
            'L' => FeatureType::LastExon,
            'U' => FeatureType::UnsplicedExon,
            'E' => FeatureType::ExonBin {
                spliced5p: false,
                spliced3p: false,
            },
            'D' => FeatureType::DonorSite,
            'A' => FeatureType::AcceptorSite,
            _ => return None,
        };
        Some(t)
    }

    /// Transcript exon type from its boundary status.
    pub fn tx_exon(spliced5p: bool, spliced3p: bool) -> Self {
        match (spliced5p, spliced3p) {
            (true, true) => FeatureType::InternalExon,
            (false, true) => FeatureType::FirstExon,
            (true, false) => FeatureType::LastExon,
            (false, false) => FeatureType::UnsplicedExon,
        }
    }

    #[inline]
    pub fn is_junction(self) -> bool {
        self == FeatureType::Junction
    }

    #[inline]
    pub fn is_exon(self) -> bool {
        matches!(
            self,
            FeatureType::InternalExon
                | FeatureType::FirstExon
                | FeatureType::LastExon
                | FeatureType::UnsplicedExon
                | FeatureType::ExonBin { .. }
        )
    }

    #[inline]
    pub fn is_site(self) -> bool {
        matches!(self, FeatureType::DonorSite | FeatureType::AcceptorSite)
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, FeatureType::FirstExon | FeatureType::LastExon)
    }

    /// Whether the 5' boundary of an exon is a splice acceptor.
    pub fn spliced5p(self) -> bool {
        match self {
            FeatureType::InternalExon | FeatureType::LastExon => true,
            FeatureType::ExonBin { spliced5p, .. } => spliced5p,
            _ => false,
        }
    }

    /// Whether the 3' boundary of an exon is a splice donor.
    pub fn spliced3p(self) -> bool {
        match self {
            FeatureType::InternalExon | FeatureType::FirstExon => true,
            FeatureType::ExonBin { spliced3p, .. } => spliced3p,
            _ => false,
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Classification of how a read relates to a single feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// Read structure is consistent with the feature.
    Compatible,

    /// Read crosses a spliced boundary without the matching intron.
    SpliceMismatch,

    /// Read has an intron that starts or ends inside the feature.
    Intronic,

    /// Strand was incompatible.
    StrandMismatch,

    /// Read does not touch the feature.
    NoOverlap,
}

impl fmt::Display for Compatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Compatibility::Compatible => "Compatible",
            Compatibility::SpliceMismatch => "SpliceMismatch",
            Compatibility::Intronic => "Intronic",
            Compatibility::StrandMismatch => "StrandMismatch",
            Compatibility::NoOverlap => "NoOverlap",
        };
        write!(f, "{s}")
    }
}

/// Options controlling feature prediction from aligned reads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictOptions {
    /// Minimum number of reads supporting a junction.
    pub min_junction_count: u32,

    /// Minimum aligned bases on each side of an intron for the read to count.
    pub min_anchor: u32,

    /// Spliced reads without a strand tag are ignored for junction calling.
    pub require_strand_tag: bool,

    /// Minimum per-base coverage for a position to be part of an exon.
    pub min_coverage: u32,

    /// Terminal exons extend while coverage stays above `beta` times the
    /// coverage at their splice site.
    pub beta: f64,

    /// Maximum number of internal exons started at a single splice site.
    pub max_complexity: usize,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            min_junction_count: 2,
            min_anchor: 1,
            require_strand_tag: true,
            min_coverage: 1,
            beta: 0.2,
            max_complexity: 20,
        }
    }
}

impl PredictOptions {
    pub fn validate(&self) -> Result<()> {
        if self.min_junction_count == 0 {
            return Err(Error::config("min_junction_count must be >= 1"));
        }
        if self.min_anchor == 0 {
            return Err(Error::config("min_anchor must be >= 1"));
        }
        if self.min_coverage == 0 {
            return Err(Error::config("min_coverage must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.beta) {
            return Err(Error::config(format!("beta must be in [0, 1], got {}", self.beta)));
        }
        if self.max_complexity == 0 {
            return Err(Error::config("max_complexity must be >= 1"));
        }
        Ok(())
    }
}

/// Options controlling event and variant discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOptions {
    /// Events with more variants than this are skipped.
    pub max_variants: usize,

    /// Connect transcript starts/ends to a virtual root/sink so that
    /// alternative first/last exons and alternative starts/ends become events.
    pub include_terminal: bool,
}

impl Default for EventOptions {
    fn default() -> Self {
        Self {
            max_variants: 20,
            include_terminal: true,
        }
    }
}

impl EventOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_variants < 2 {
            return Err(Error::config("max_variants must be >= 2"));
        }
        Ok(())
    }
}

/// Per-sample metadata supplied by the sample bookkeeping collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleInfo {
    pub sample_name: String,
    pub file_bam: String,
    pub paired_end: bool,
    pub read_length: u32,
    pub lib_size: u64,
}

impl SampleInfo {
    pub fn validate(&self) -> Result<()> {
        if self.sample_name.trim().is_empty() {
            return Err(Error::config("sample name must not be empty"));
        }
        if self.read_length == 0 {
            return Err(Error::config(format!(
                "sample '{}': read_length must be >= 1",
                self.sample_name
            )));
        }
        Ok(())
    }
}

const SHEET_COLUMNS: [&str; 5] = ["sample_name", "file_bam", "paired_end", "read_length", "lib_size"];

/// Parse a tab-separated sample sheet.
///
/// The header names the columns `sample_name`, `file_bam`, `paired_end`,
/// `read_length` and `lib_size` in any order; extra columns are ignored.
/// `paired_end` accepts `true/false`, `TRUE/FALSE`, `yes/no` or `1/0`.
pub fn read_sample_sheet<R: BufRead>(reader: R) -> Result<Vec<SampleInfo>> {
    let mut lines = reader
        .lines()
        .enumerate()
        .map(|(i, l)| l.map(|l| (i + 1, l)))
        .filter(|l| !matches!(l, Ok((_, s)) if s.trim().is_empty() || s.starts_with('#')));

    let Some(header) = lines.next() else {
        return Err(Error::config("sample sheet is empty"));
    };
    let (header_no, header) = header?;
    let names: Vec<&str> = header.trim_end().split('\t').collect();
    let mut cols = [0usize; 5];
    for (slot, wanted) in cols.iter_mut().zip(SHEET_COLUMNS) {
        *slot = names.iter().position(|n| *n == wanted).ok_or_else(|| Error::Parse {
            line_no: header_no,
            problem: format!("sample sheet lacks column '{wanted}'"),
            line: header.clone(),
        })?;
    }

    let mut out = Vec::new();
    for line in lines {
        let (line_no, line) = line?;
        let fields: Vec<&str> = line.trim_end().split('\t').collect();
        let err = |problem: String| Error::Parse {
            line_no,
            problem,
            line: line.clone(),
        };
        let field = |i: usize| {
            fields
                .get(cols[i])
                .copied()
                .ok_or_else(|| err(format!("missing column '{}'", SHEET_COLUMNS[i])))
        };

        let paired_end = match field(2)?.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => true,
            "false" | "no" | "0" => false,
            other => return Err(err(format!("bad paired_end '{other}'"))),
        };
        let read_length = field(3)?
            .parse()
            .map_err(|_| err(format!("bad read_length '{}'", fields[cols[3]])))?;
        let lib_size = field(4)?
            .parse()
            .map_err(|_| err(format!("bad lib_size '{}'", fields[cols[4]])))?;

        out.push(SampleInfo {
            sample_name: field(0)?.to_string(),
            file_bam: field(1)?.to_string(),
            paired_end,
            read_length,
            lib_size,
        });
    }
    Ok(out)
}

/// Validate a sample sheet: every sample valid, names unique.
pub fn validate_samples(samples: &[SampleInfo]) -> Result<()> {
    if samples.is_empty() {
        return Err(Error::config("no samples provided"));
    }
    let mut seen = std::collections::HashSet::new();
    for s in samples {
        s.validate()?;
        if !seen.insert(s.sample_name.as_str()) {
            return Err(Error::config(format!("duplicate sample name '{}'", s.sample_name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for c in ['J', 'I', 'F', 'L', 'U', 'E', 'D', 'A'] {
            assert_eq!(FeatureType::from_code(c).unwrap().code(), c);
        }
        assert!(FeatureType::from_code('X').is_none());
    }

    #[test]
    fn tx_exon_types_follow_boundaries() {
        assert_eq!(FeatureType::tx_exon(true, true), FeatureType::InternalExon);
        assert_eq!(FeatureType::tx_exon(false, true), FeatureType::FirstExon);
        assert_eq!(FeatureType::tx_exon(true, false), FeatureType::LastExon);
        assert_eq!(FeatureType::tx_exon(false, false), FeatureType::UnsplicedExon);
        assert!(FeatureType::FirstExon.spliced3p());
        assert!(!FeatureType::FirstExon.spliced5p());
    }

    #[test]
    fn invalid_options_are_configuration_errors() {
        let opts = PredictOptions {
            beta: 1.5,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(Error::Configuration(_))));
        assert!(EventOptions { max_variants: 1, include_terminal: true }.validate().is_err());
        assert!(validate_samples(&[]).is_err());
    }

    #[test]
    fn sample_sheet_columns_in_any_order() {
        let sheet = "\
# samples
file_bam\tsample_name\tread_length\tlib_size\tpaired_end\tnote
a.bam\tA\t100\t2000000\tTRUE\tx
b.bam\tB\t75\t1000\tno\ty
";
        let samples = read_sample_sheet(std::io::Cursor::new(sheet)).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].sample_name, "A");
        assert!(samples[0].paired_end);
        assert_eq!((samples[1].read_length, samples[1].lib_size), (75, 1000));
        assert!(validate_samples(&samples).is_ok());

        let bad = "sample_name\tfile_bam\tpaired_end\tread_length\tlib_size\nA\ta.bam\tmaybe\t100\t10\n";
        assert!(matches!(
            read_sample_sheet(std::io::Cursor::new(bad)),
            Err(Error::Parse { line_no: 2, .. })
        ));
    }
}
