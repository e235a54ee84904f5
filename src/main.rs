use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use splice_graph::analysis::{predict_features, AnalysisConfig};
use splice_graph::annotation::{AnnotationBuilder, IdNameKeys};
use splice_graph::export::{write_bed, write_variants};
use splice_graph::model::types::read_sample_sheet;
use splice_graph::quant::count_samples;
use splice_graph::{
    find_events, merge_features, quant, BamOpener, EventOptions, GenomeGraph, PredictOptions, Region, SampleInfo,
    TxFeatureSet,
};

/// Build splice graphs, find splice events and count reads.
#[derive(Parser, Debug)]
#[command(name = "splice-graph")]
#[command(author, version, about)]
struct Cli {
    /// Worker threads (0 = all cores)
    #[arg(long, short = 't', global = true, default_value_t = 0)]
    threads: usize,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Predict transcript features from BAM files and write the merged set
    Predict(PredictArgs),

    /// Build splice graphs from annotation and/or feature sets
    Build(BuildArgs),

    /// Write the splice variant table of a graph
    Events(EventsArgs),

    /// Count reads per feature and variant
    Count(CountArgs),

    /// Export graph features as BED6
    Export(ExportArgs),

    /// Load a graph from disk and print summary stats
    Stats(StatsArgs),
}

#[derive(Args, Debug)]
struct SamplesArgs {
    /// Tab-separated sample sheet (sample_name, file_bam, paired_end, read_length, lib_size)
    #[arg(long, short)]
    samples: PathBuf,
}

#[derive(Args, Debug)]
struct PredictArgs {
    #[command(flatten)]
    samples: SamplesArgs,

    /// Region to scan, chr:start-end (repeatable); default: every sequence
    #[arg(long = "region", value_name = "REGION")]
    regions: Vec<String>,

    #[arg(long, default_value_t = PredictOptions::default().min_junction_count)]
    min_junction_count: u32,

    #[arg(long, default_value_t = PredictOptions::default().min_anchor)]
    min_anchor: u32,

    /// Also use spliced reads without an XS tag
    #[arg(long)]
    allow_unstranded: bool,

    #[arg(long, default_value_t = PredictOptions::default().min_coverage)]
    min_coverage: u32,

    #[arg(long, default_value_t = PredictOptions::default().beta)]
    beta: f64,

    #[arg(long, default_value_t = PredictOptions::default().max_complexity)]
    max_complexity: usize,

    /// Terminal exon overhang below which exons are trimmed
    #[arg(long, default_value_t = AnalysisConfig::DEFAULT_MIN_OVERHANG)]
    min_overhang: u32,

    /// Skip terminal exon processing (for merging later with `build`)
    #[arg(long)]
    raw: bool,

    /// Output feature set file
    #[arg(long, short)]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Input annotation file (.gtf/.gff/.gff3, optionally .gz)
    #[arg(long, short)]
    annotation: Option<PathBuf>,

    /// Feature set files written by `predict` (repeatable)
    #[arg(long = "features", value_name = "FILE")]
    features: Vec<PathBuf>,

    /// Run terminal exon processing on the merged set with this overhang
    #[arg(long)]
    min_overhang: Option<u32>,

    /// Output splice graph file
    #[arg(long, short)]
    graph: PathBuf,

    /// Attribute keys to use for gene ID (repeatable).
    #[arg(long = "gene-id-key", value_name = "KEY", num_args = 1.., default_values_t = vec!["gene_id".to_string()])]
    gene_id_keys: Vec<String>,

    /// Attribute keys to use for gene name (repeatable).
    #[arg(long = "gene-name-key", value_name = "KEY", num_args = 1.., default_values_t = vec!["gene_name".to_string()])]
    gene_name_keys: Vec<String>,

    /// Attribute keys to use for transcript ID (repeatable).
    #[arg(long = "transcript-id-key", value_name = "KEY", num_args = 1.., default_values_t = vec!["transcript_id".to_string()])]
    transcript_id_keys: Vec<String>,

    /// GFF3 exon->transcript linkage keys (repeatable).
    #[arg(long = "parent-key", value_name = "KEY", num_args = 1.., default_values_t = vec!["Parent".to_string()])]
    parent_keys: Vec<String>,

    /// Feature types that count as exon blocks (repeatable).
    #[arg(long = "exon-feature-type", value_name = "TYPE", num_args = 1.., default_values_t = vec!["exon".to_string()])]
    exon_feature_types: Vec<String>,
}

#[derive(Args, Debug)]
struct EventArgs {
    /// Skip events with more variants than this
    #[arg(long, default_value_t = EventOptions::default().max_variants)]
    max_variants: usize,

    /// Do not report alternative first/last exons and starts/ends
    #[arg(long)]
    no_terminal: bool,
}

impl EventArgs {
    fn options(&self) -> EventOptions {
        EventOptions {
            max_variants: self.max_variants,
            include_terminal: !self.no_terminal,
        }
    }
}

#[derive(Args, Debug)]
struct EventsArgs {
    /// Serialized splice graph
    #[arg(long, short)]
    graph: PathBuf,

    #[command(flatten)]
    events: EventArgs,

    /// Output TSV (default: stdout)
    #[arg(long, short)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CountArgs {
    /// Serialized splice graph
    #[arg(long, short)]
    graph: PathBuf,

    #[command(flatten)]
    samples: SamplesArgs,

    #[command(flatten)]
    events: EventArgs,

    /// Prefix of the output tables
    #[arg(long, short)]
    prefix: PathBuf,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Serialized splice graph
    #[arg(long, short)]
    graph: PathBuf,

    /// Output BED (default: stdout)
    #[arg(long, short)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StatsArgs {
    /// Serialized splice graph
    #[arg(long, short)]
    graph: PathBuf,
}

fn output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    let w: Box<dyn Write> = match path {
        Some(p) => Box::new(BufWriter::new(
            File::create(p).with_context(|| format!("create {}", p.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    Ok(w)
}

fn load_samples(path: &Path) -> Result<Vec<SampleInfo>> {
    let f = File::open(path).with_context(|| format!("open sample sheet {}", path.display()))?;
    read_sample_sheet(BufReader::new(f)).with_context(|| format!("parse sample sheet {}", path.display()))
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn predict(args: PredictArgs) -> Result<()> {
    let samples = load_samples(&args.samples.samples)?;
    let regions = args
        .regions
        .iter()
        .map(|r| Region::parse(r).with_context(|| format!("invalid region '{r}'")))
        .collect::<Result<Vec<_>>>()?;

    let config = AnalysisConfig {
        predict: PredictOptions {
            min_junction_count: args.min_junction_count,
            min_anchor: args.min_anchor,
            require_strand_tag: !args.allow_unstranded,
            min_coverage: args.min_coverage,
            beta: args.beta,
            max_complexity: args.max_complexity,
        },
        min_overhang: (!args.raw).then_some(args.min_overhang),
        regions,
        ..Default::default()
    };

    let report = predict_features(&BamOpener, &samples, &config).context("predicting features")?;
    for f in &report.failures {
        eprintln!("sample {} failed: {}", f.sample, f.error);
    }
    if report.failures.len() == samples.len() {
        bail!("prediction failed for every sample");
    }

    report
        .features
        .save(&args.out)
        .with_context(|| format!("writing features to {}", args.out.display()))?;
    eprintln!("{} features written to {}", report.features.len(), args.out.display());
    Ok(())
}

fn build(args: BuildArgs) -> Result<()> {
    if args.annotation.is_none() && args.features.is_empty() {
        bail!("nothing to build from: give --annotation and/or --features");
    }

    let mut sets: Vec<TxFeatureSet> = Vec::new();
    if let Some(path) = &args.annotation {
        let builder = AnnotationBuilder {
            keys: IdNameKeys {
                gene_id_keys: args.gene_id_keys,
                gene_name_keys: args.gene_name_keys,
                transcript_id_keys: args.transcript_id_keys,
                parent_keys: args.parent_keys,
                exon_feature_types: args.exon_feature_types,
            },
        };
        let set = builder
            .build_from_path(path)
            .with_context(|| format!("reading annotation {}", path.display()))?;
        sets.push(set);
    }
    for path in &args.features {
        let set = TxFeatureSet::load(path).with_context(|| format!("reading features {}", path.display()))?;
        sets.push(set);
    }

    let features = merge_features(sets, args.min_overhang);
    let report = GenomeGraph::build(&features);
    for f in &report.failures {
        eprintln!("locus {} (gene {}) excluded: {}", f.locus, f.gene_id, f.error);
    }

    println!("{}", report.graph);
    report
        .graph
        .save(&args.graph)
        .with_context(|| format!("writing graph to {}", args.graph.display()))?;
    eprintln!("Graph written to {}", args.graph.display());
    Ok(())
}

fn load_graph(path: &Path) -> Result<GenomeGraph> {
    GenomeGraph::load(path).with_context(|| format!("reading graph {}", path.display()))
}

fn events(args: EventsArgs) -> Result<()> {
    let graph = load_graph(&args.graph)?;
    let events = find_events(&graph, &args.events.options())?;
    let mut w = output(args.out.as_deref())?;
    write_variants(&events, &mut w)?;
    w.flush()?;
    Ok(())
}

fn count(args: CountArgs) -> Result<()> {
    let graph = load_graph(&args.graph)?;
    let samples = load_samples(&args.samples.samples)?;
    let events = find_events(&graph, &args.events.options())?;

    let report = count_samples(&graph, &samples, &BamOpener).context("counting reads")?;
    for f in &report.failures {
        eprintln!("sample {} failed: {}", f.sample, f.error);
    }
    let variants = quant::quantify_variants(&events, &report.features);

    let write = |suffix: &str, f: &dyn Fn(&mut dyn Write) -> io::Result<()>| -> Result<()> {
        let path = with_suffix(&args.prefix, suffix);
        let mut w = output(Some(path.as_path()))?;
        f(&mut w).with_context(|| format!("writing {}", path.display()))?;
        w.flush()?;
        info!("wrote {}", path.display());
        Ok(())
    };
    write(".features.counts.tsv", &|w| report.features.write_counts(w, "feature_id"))?;
    write(".features.fpkm.tsv", &|w| report.features.write_values(w, "feature_id"))?;
    write(".variants.counts5p.tsv", &|w| variants.counts_5p.write_counts(w, "variant_id"))?;
    write(".variants.counts3p.tsv", &|w| variants.counts_3p.write_counts(w, "variant_id"))?;
    write(".variants.usage.tsv", &|w| variants.write_usage(w))?;
    write(".variants.tsv", &|w| write_variants(&events, w))?;
    Ok(())
}

fn export(args: ExportArgs) -> Result<()> {
    let graph = load_graph(&args.graph)?;
    let mut w = output(args.out.as_deref())?;
    write_bed(&graph, &mut w)?;
    w.flush()?;
    Ok(())
}

fn stats(args: StatsArgs) -> Result<()> {
    let graph = load_graph(&args.graph)?;
    graph.validate()?;
    println!("{graph}");
    let events = find_events(&graph, &EventOptions::default())?;
    let n_variants: usize = events.iter().map(|e| e.n_variants()).sum();
    println!("events: {}, variants: {}", events.len(), n_variants);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.threads)
        .build_global()
        .context("configuring the thread pool")?;

    match cli.cmd {
        Command::Predict(args) => predict(args),
        Command::Build(args) => build(args),
        Command::Events(args) => events(args),
        Command::Count(args) => count(args),
        Command::Export(args) => export(args),
        Command::Stats(args) => stats(args),
    }
}
