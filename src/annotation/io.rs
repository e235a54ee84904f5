use std::collections::HashMap;
use std::io::BufRead;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::Strand;

/// Attribute syntax of the ninth column: `key=value` (GFF3) or
/// `key "value"` (GTF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Gff3,
    Gtf,
    Unknown,
}

impl Dialect {
    /// Guess from one attribute column; `=` wins over quotes.
    pub fn sniff(column: &str) -> Self {
        if column.contains('=') {
            Dialect::Gff3
        } else if column.contains('"') {
            Dialect::Gtf
        } else {
            Dialect::Unknown
        }
    }

    fn split_pair(self, part: &str) -> Option<(&str, &str)> {
        match self {
            Dialect::Gff3 => part.split_once('='),
            Dialect::Gtf => part.split_once(char::is_whitespace),
            Dialect::Unknown => part
                .split_once('=')
                .or_else(|| part.split_once(char::is_whitespace)),
        }
    }
}

/// One feature line. Coordinates stay 1-based inclusive as in the file.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRecord {
    pub line_no: usize,
    pub seqname: String,
    pub feature_type: String,
    pub start: u32,
    pub end: u32,
    pub strand: Strand,
    pub dialect: Dialect,
    attributes: HashMap<String, String>,
}

impl AnnotationRecord {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// First non-empty value among `keys`, in key order.
    pub fn first_attr(&self, keys: &[String]) -> Option<String> {
        keys.iter()
            .filter_map(|k| self.attr(k))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .map(str::to_string)
    }

    pub fn has_type(&self, types: &[String]) -> bool {
        types.iter().any(|t| *t == self.feature_type)
    }
}

/// Streaming GTF/GFF3 reader; blank and `#` lines are skipped.
///
/// [`crate::annotation::AnnotationBuilder`] is the usual entry point; this
/// is for callers that want the raw lines.
///
/// ```no_run
/// use std::fs::File;
/// use std::io::BufReader;
/// use splice_graph::annotation::io::AnnotationReader;
///
/// let file = File::open("genes.gtf").unwrap();
/// for rec in AnnotationReader::new(BufReader::new(file)).records() {
///     let rec = rec.unwrap();
///     println!("{}:{}-{} {}", rec.seqname, rec.start, rec.end, rec.feature_type);
/// }
/// ```
pub struct AnnotationReader<R: BufRead> {
    reader: R,
    line: String,
    line_no: usize,
}

impl<R: BufRead> AnnotationReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_no: 0,
        }
    }

    pub fn records(self) -> Records<R> {
        Records { inner: self }
    }

    /// Next content line and its number, `None` at end of input.
    fn next_line(&mut self) -> Option<Result<(usize, &str)>> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => self.line_no += 1,
                Err(e) => return Some(Err(Error::io(e, "<annotation>"))),
            }
            let trimmed = self.line.trim_end_matches(['\n', '\r']);
            if !trimmed.trim().is_empty() && !trimmed.starts_with('#') {
                break;
            }
        }
        Some(Ok((self.line_no, self.line.trim_end_matches(['\n', '\r']))))
    }
}

/// Iterator returned by [`AnnotationReader::records`].
pub struct Records<R: BufRead> {
    inner: AnnotationReader<R>,
}

impl<R: BufRead> Iterator for Records<R> {
    type Item = Result<AnnotationRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.inner.next_line()?.and_then(|(line_no, line)| parse_record_line(line, line_no)))
    }
}

fn malformed(line_no: usize, line: &str, problem: impl Into<String>) -> Error {
    let mut shown: String = line.chars().take(120).collect();
    if shown.len() < line.len() {
        shown.push_str("...");
    }
    Error::Parse {
        line_no,
        problem: problem.into(),
        line: shown,
    }
}

fn field<T: FromStr>(value: &str, what: &str, line_no: usize, line: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| malformed(line_no, line, format!("bad {what} '{value}'")))
}

/// Parse one content line. Score and phase are validated, not kept.
pub fn parse_record_line(line: &str, line_no: usize) -> Result<AnnotationRecord> {
    let cols: Vec<&str> = line.split('\t').collect();
    let [seqname, _source, feature_type, start, end, score, strand, phase, attributes] = cols[..] else {
        return Err(malformed(
            line_no,
            line,
            format!("expected 9 tab-separated columns, found {}", cols.len()),
        ));
    };

    let start: u32 = field(start, "start", line_no, line)?;
    let end: u32 = field(end, "end", line_no, line)?;
    if start == 0 || end < start {
        return Err(malformed(line_no, line, format!("invalid interval {start}-{end}")));
    }
    if score != "." {
        field::<f64>(score, "score", line_no, line)?;
    }
    if phase != "." && !matches!(phase, "0" | "1" | "2") {
        return Err(malformed(line_no, line, format!("bad phase '{phase}'")));
    }
    let strand = strand
        .chars()
        .next()
        .filter(|_| strand.len() == 1)
        .and_then(Strand::from_char)
        .ok_or_else(|| malformed(line_no, line, format!("bad strand '{strand}'")))?;

    let (dialect, attributes) = parse_attributes(attributes);
    Ok(AnnotationRecord {
        line_no,
        seqname: seqname.to_string(),
        feature_type: feature_type.to_string(),
        start,
        end,
        strand,
        dialect,
        attributes,
    })
}

/// Split the attribute column into key/value pairs; quotes are stripped
/// and empty values dropped.
pub fn parse_attributes(column: &str) -> (Dialect, HashMap<String, String>) {
    let column = column.trim();
    let dialect = Dialect::sniff(column);
    let attributes = column
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| dialect.split_pair(p))
        .map(|(k, v)| (k.trim(), v.trim().trim_matches('"')))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    (dialect, attributes)
}
