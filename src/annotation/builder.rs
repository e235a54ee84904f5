use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::GzDecoder;
use log::{debug, info};

use crate::annotation::io::{AnnotationReader, AnnotationRecord};
use crate::error::{Error, Result};
use crate::model::feature::{TxFeature, TxFeatureSet};
use crate::model::types::FeatureType;
use crate::types::{Block, GenomicInterval, Strand};

/// Configure which attribute keys are used to extract:
/// - gene stable identifier and display names
/// - transcript stable identifier
/// - (GFF3) exon -> transcript linking keys
///
/// Notes:
/// - We allow multiple keys per category; first present wins.
/// - For GFF3 Parent values, we split by ',' and treat each parent as a transcript ID.
#[derive(Debug, Clone)]
pub struct IdNameKeys {
    pub gene_id_keys: Vec<String>,
    pub gene_name_keys: Vec<String>,
    pub transcript_id_keys: Vec<String>,

    /// GFF3 exon->transcript linkage (most commonly: Parent)
    pub parent_keys: Vec<String>,

    /// Feature types that count as exon blocks (default: ["exon"])
    pub exon_feature_types: Vec<String>,
}

impl Default for IdNameKeys {
    fn default() -> Self {
        Self {
            gene_id_keys: vec!["gene_id".into(), "gene".into(), "GeneID".into()],
            gene_name_keys: vec!["gene_name".into(), "Name".into(), "gene".into()],
            transcript_id_keys: vec!["transcript_id".into(), "transcript".into()],
            parent_keys: vec!["Parent".into()],
            exon_feature_types: vec!["exon".into()],
        }
    }
}

/// Exons of one annotated transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedTranscript {
    pub transcript_id: String,
    pub gene_name: String,
    pub seqname: String,
    pub strand: Strand,
    exons: Vec<Block>,
}

impl AnnotatedTranscript {
    pub fn exons(&self) -> &[Block] {
        &self.exons
    }

    /// Sort exons and merge overlapping or touching ones.
    fn finalize(&mut self) {
        self.exons.sort_unstable();
        let mut merged: Vec<Block> = Vec::with_capacity(self.exons.len());
        for b in self.exons.drain(..) {
            match merged.last_mut() {
                Some(last) if b.start <= last.end + 1 => last.end = last.end.max(b.end),
                _ => merged.push(b),
            }
        }
        self.exons = merged;
    }

    /// Transcript features: typed exons plus the junctions between them.
    pub fn features(&self) -> Vec<TxFeature> {
        let n = self.exons.len();
        let mut out = Vec::with_capacity(2 * n);
        let named = |interval: GenomicInterval, kind: FeatureType| {
            TxFeature::new(interval, kind)
                .with_tx(self.transcript_id.as_str())
                .with_gene(self.gene_name.as_str())
        };

        for (i, b) in self.exons.iter().enumerate() {
            let (spliced_left, spliced_right) = (i > 0, i + 1 < n);
            let kind = match self.strand {
                Strand::Minus => FeatureType::tx_exon(spliced_right, spliced_left),
                _ => FeatureType::tx_exon(spliced_left, spliced_right),
            };
            out.push(named(
                GenomicInterval::new(self.seqname.as_str(), b.start, b.end, self.strand),
                kind,
            ));
        }
        for (start, end) in Block::introns_from_blocks(&self.exons) {
            out.push(named(
                GenomicInterval::new(self.seqname.as_str(), start, end, self.strand),
                FeatureType::Junction,
            ));
        }
        out
    }
}

/// High-level builder turning a GTF/GFF3 file into transcript features.
///
/// - parses whole file (optionally gzipped)
/// - configurable mapping of ID/NAME keys for gene + transcript
/// - groups exon records into transcripts, then emits F/I/L/U exons and junctions
#[derive(Debug, Clone, Default)]
pub struct AnnotationBuilder {
    pub keys: IdNameKeys,
}

impl AnnotationBuilder {
    /// Start with defaults that work reasonably for many GTF/GFF3 files.
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience: set a single key (or first-preference key) for gene id.
    pub fn gene_id_key(mut self, key: &str) -> Self {
        self.keys.gene_id_keys = vec![key.to_string()];
        self
    }

    pub fn gene_name_keys(mut self, keys: &[&str]) -> Self {
        self.keys.gene_name_keys = keys.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn transcript_id_keys(mut self, keys: &[&str]) -> Self {
        self.keys.transcript_id_keys = keys.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Parent keys for GFF3 exon->transcript linking (usually ["Parent"]).
    pub fn parent_keys(mut self, keys: &[&str]) -> Self {
        self.keys.parent_keys = keys.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Feature types that count as exon blocks.
    pub fn exon_feature_types(mut self, types: &[&str]) -> Self {
        self.keys.exon_feature_types = types.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Transcripts in first-seen order.
    pub fn transcripts_from_reader<R: BufRead>(&self, reader: R) -> Result<Vec<AnnotatedTranscript>> {
        let keys = &self.keys;
        let mut tx_key_to_idx: HashMap<String, usize> = HashMap::new();
        let mut transcripts: Vec<AnnotatedTranscript> = Vec::new();

        for rec in AnnotationReader::new(reader).records() {
            let rec = rec?;
            if !rec.has_type(&keys.exon_feature_types) {
                continue;
            }

            let gene_key = rec
                .first_attr(&keys.gene_id_keys)
                .ok_or_else(|| missing_attr(&rec, "gene id", &keys.gene_id_keys))?;
            let gene_name = rec.first_attr(&keys.gene_name_keys).unwrap_or(gene_key);

            let tx_key_raw = rec
                .first_attr(&keys.transcript_id_keys)
                .or_else(|| rec.first_attr(&keys.parent_keys))
                .ok_or_else(|| {
                    let mut tried = keys.transcript_id_keys.clone();
                    tried.extend(keys.parent_keys.iter().cloned());
                    missing_attr(&rec, "transcript id", &tried)
                })?;

            // Parent can be comma-separated in GFF3; support multi-parent exons.
            for tx_key in split_gff3_parent_list(&tx_key_raw) {
                let idx = *tx_key_to_idx.entry(tx_key.clone()).or_insert_with(|| {
                    transcripts.push(AnnotatedTranscript {
                        transcript_id: tx_key,
                        gene_name: gene_name.clone(),
                        seqname: rec.seqname.clone(),
                        strand: rec.strand,
                        exons: Vec::new(),
                    });
                    transcripts.len() - 1
                });
                let tx = &mut transcripts[idx];
                if tx.seqname != rec.seqname || tx.strand != rec.strand {
                    return Err(Error::Parse {
                        line_no: rec.line_no,
                        problem: format!(
                            "transcript '{}' changes sequence or strand ({}:{} vs {}:{})",
                            tx.transcript_id, tx.seqname, tx.strand, rec.seqname, rec.strand
                        ),
                        line: String::new(),
                    });
                }
                tx.exons.push(Block::new(rec.start, rec.end));
            }
        }

        for tx in &mut transcripts {
            tx.finalize();
        }
        debug!("parsed {} transcripts", transcripts.len());
        Ok(transcripts)
    }

    /// Features of all transcripts, merged by identity.
    pub fn build_from_reader<R: BufRead>(&self, reader: R) -> Result<TxFeatureSet> {
        let transcripts = self.transcripts_from_reader(reader)?;
        let set: TxFeatureSet = transcripts.iter().flat_map(AnnotatedTranscript::features).collect();
        let genes: BTreeSet<&str> = transcripts.iter().map(|t| t.gene_name.as_str()).collect();
        info!(
            "annotation: {} genes, {} transcripts, {} features",
            genes.len(),
            transcripts.len(),
            set.len()
        );
        Ok(set)
    }

    /// Build from a file path; `.gz` files are decompressed on the fly.
    pub fn build_from_path<P: AsRef<Path>>(&self, path: P) -> Result<TxFeatureSet> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(e, path))?;

        let is_gz = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));

        if is_gz {
            self.build_from_reader(BufReader::new(GzDecoder::new(file)))
        } else {
            self.build_from_reader(BufReader::new(file))
        }
    }
}

fn missing_attr(rec: &AnnotationRecord, what: &str, tried: &[String]) -> Error {
    Error::Parse {
        line_no: rec.line_no,
        problem: format!("missing required {what} attribute (tried keys: {tried:?})"),
        line: format!("{}:{}-{} {}", rec.seqname, rec.start, rec.end, rec.feature_type),
    }
}

/// Split Parent= list (GFF3) by commas; also trim whitespace.
fn split_gff3_parent_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
