//! Text exports: BED6 features and the variant table.

use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};

use crate::error::{Error, Result};
use crate::model::classify::format_types;
use crate::model::event::SpliceEvent;
use crate::model::feature::SgFeature;
use crate::model::graph::GenomeGraph;
use crate::model::types::FeatureType;
use crate::types::{GenomicInterval, Strand};

/// Name column: `<type>:<feature_id>`, with `:<5p><3p>` spliced flags
/// (`1`/`0`) appended for exon bins, e.g. `E:12:10`.
fn bed_name(f: &SgFeature) -> String {
    match f.kind {
        FeatureType::ExonBin { spliced5p, spliced3p } => {
            format!("{}:{}{}", f.label(), u8::from(spliced5p), u8::from(spliced3p))
        }
        _ => f.label(),
    }
}

/// One BED6 line: 0-based start, score 0.
pub fn bed_line(f: &SgFeature) -> String {
    format!(
        "{}\t{}\t{}\t{}\t0\t{}",
        f.interval.seqname,
        f.start() - 1,
        f.end(),
        bed_name(f),
        f.interval.strand
    )
}

fn flag(c: char) -> Option<bool> {
    match c {
        '1' => Some(true),
        '0' => Some(false),
        _ => None,
    }
}

/// All features of the graph in feature id order.
pub fn write_bed<W: Write>(graph: &GenomeGraph, mut w: W) -> io::Result<()> {
    for f in graph.features() {
        writeln!(w, "{}", bed_line(f))?;
    }
    Ok(())
}

fn bed_error(line_no: usize, line: &str, problem: impl Into<String>) -> Error {
    Error::Parse {
        line_no,
        problem: problem.into(),
        line: line.to_string(),
    }
}

/// Read features back from BED6 written by [`write_bed`].
///
/// Exon bins without the flag suffix come back with both boundaries
/// unspliced. The gene id is not part of the format and is set to 0. Lines
/// starting with `#`, `track` or `browser` are skipped.
pub fn import_bed<R: BufRead>(reader: R) -> Result<Vec<SgFeature>> {
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line_no = i + 1;
        let line = line?;
        let s = line.trim_end();
        if s.is_empty() || s.starts_with('#') || s.starts_with("track") || s.starts_with("browser") {
            continue;
        }

        let cols: Vec<&str> = s.split('\t').collect();
        if cols.len() < 6 {
            return Err(bed_error(line_no, s, "expected at least 6 columns"));
        }
        let start0: u32 = cols[1]
            .parse()
            .map_err(|_| bed_error(line_no, s, "bad start"))?;
        let end: u32 = cols[2].parse().map_err(|_| bed_error(line_no, s, "bad end"))?;
        if end <= start0 {
            return Err(bed_error(line_no, s, "empty interval"));
        }

        let mut name = cols[3].split(':');
        let (Some(code), Some(id)) = (name.next(), name.next()) else {
            return Err(bed_error(line_no, s, "name is not <type>:<id>"));
        };
        let mut kind = code
            .chars()
            .next()
            .filter(|_| code.len() == 1)
            .and_then(FeatureType::from_code)
            .ok_or_else(|| bed_error(line_no, s, format!("unknown feature type '{code}'")))?;
        let feature_id = id
            .parse()
            .map_err(|_| bed_error(line_no, s, format!("bad feature id '{id}'")))?;
        if let (FeatureType::ExonBin { .. }, Some(flags)) = (kind, name.next()) {
            let mut chars = flags.chars();
            let (Some(spliced5p), Some(spliced3p), None) =
                (chars.next().and_then(flag), chars.next().and_then(flag), chars.next())
            else {
                return Err(bed_error(line_no, s, format!("bad spliced flags '{flags}'")));
            };
            kind = FeatureType::ExonBin { spliced5p, spliced3p };
        }

        let strand = cols[5]
            .chars()
            .next()
            .filter(|_| cols[5].len() == 1)
            .and_then(Strand::from_char)
            .ok_or_else(|| bed_error(line_no, s, "bad strand"))?;

        out.push(SgFeature {
            feature_id,
            gene_id: 0,
            interval: GenomicInterval::new(cols[0], start0 + 1, end, strand),
            kind,
            tx_names: BTreeSet::new(),
            gene_names: BTreeSet::new(),
        });
    }
    Ok(out)
}

const VARIANT_HEADER: &str = "variant_id\tevent_id\tgene_id\tvariant_name\tvariant_type\tfrom\tto\tclosed5p\tclosed3p\tfeatures\tsegments\tfeature_id_5p\tfeature_id_3p\ttx_names";

fn join<T: ToString>(items: impl IntoIterator<Item = T>) -> String {
    let v: Vec<String> = items.into_iter().map(|x| x.to_string()).collect();
    if v.is_empty() {
        ".".to_string()
    } else {
        v.join(",")
    }
}

fn opt(id: Option<usize>) -> String {
    id.map_or_else(|| "NA".to_string(), |i| i.to_string())
}

/// One row per variant.
pub fn write_variants<W: Write>(events: &[SpliceEvent], mut w: W) -> io::Result<()> {
    writeln!(w, "{VARIANT_HEADER}")?;
    for ev in events {
        for v in &ev.variants {
            writeln!(
                w,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                v.variant_id,
                v.event_id,
                v.gene_id,
                v.variant_name,
                format_types(&v.variant_type),
                ev.from,
                ev.to,
                ev.closed5p,
                ev.closed3p,
                join(&v.features),
                join(&v.segment_ids),
                opt(v.feature_id_5p),
                opt(v.feature_id_3p),
                join(&v.tx_names),
            )?;
        }
    }
    Ok(())
}
