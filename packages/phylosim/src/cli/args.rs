use crate::io::output::OutputFormat;
use clap::{Parser, ValueHint};
use log::LevelFilter;
use std::path::PathBuf;

/// Simulates multiple sequence alignments along a phylogenetic tree
#[derive(Parser, Debug)]
#[clap(name = "phylosim", version)]
pub struct PhylosimArgs {
  /// Name of a file containing the tree in Newick format, with branch lengths
  ///
  /// Branch-local substitution models can be attached to edges using
  /// annotations of the form `[&model=HKY{2.0}]`.
  #[clap(long, short = 't')]
  #[clap(value_hint = ValueHint::FilePath)]
  pub tree: PathBuf,

  /// Length of the output sequences, in characters
  ///
  /// Required unless an ancestral sequence file provides the length. Codon
  /// data requires a multiple of three.
  #[clap(long = "length", short = 'l')]
  pub sequence_length: Option<usize>,

  /// Number of alignments to simulate from the same tree and model
  #[clap(long = "num-alignments", default_value_t = 1)]
  pub num_datasets: usize,

  /// Sequence type: BIN, DNA, AA, NT2AA, CODON, or MORPH{<NUM_STATES>}
  #[clap(long = "seqtype", default_value = "DNA")]
  pub seqtype: String,

  /// Substitution model description
  ///
  /// Examples: `JC`, `HKY{2.0}+F{0.1/0.4/0.4/0.1}`, `GTR{1/2/1/1/2/1}+G4{0.5}+I{0.2}`,
  /// `MIX{JC:0.3,HKY{2.0}:0.7}`, `JC+ASC`, `JC+E{0.01}`
  #[clap(long = "model", short = 'm', default_value = "JC")]
  pub model: String,

  /// Scale factor applied to every branch length
  #[clap(long = "branch-scale", default_value_t = 1.0)]
  pub branch_scale: f64,

  /// Rate multiplier of the partition this alignment belongs to
  #[clap(long = "partition-rate", default_value_t = 1.0)]
  pub partition_rate: f64,

  /// Override of the oversampling ratio used with ascertainment-bias models
  #[clap(long = "length-ratio")]
  pub length_ratio: Option<f64>,

  /// Insertion rate relative to the substitution rate
  #[clap(long = "insertion-ratio", default_value_t = 0.0)]
  pub insertion_ratio: f64,

  /// Deletion rate relative to the substitution rate
  #[clap(long = "deletion-ratio", default_value_t = 0.0)]
  pub deletion_ratio: f64,

  /// Insertion-size distribution: NB{r/p}, ZIPF{a/max}, LAV{a/max}, GEO{p} or USER{p1/p2/...}
  #[clap(long = "insertion-size", default_value = "GEO{0.5}")]
  pub insertion_distribution: String,

  /// Deletion-size distribution: NB{r/p}, ZIPF{a/max}, LAV{a/max}, GEO{p} or USER{p1/p2/...}
  #[clap(long = "deletion-size", default_value = "GEO{0.5}")]
  pub deletion_distribution: String,

  /// Proportion of sites permuted by the functional divergence operator
  #[clap(long = "fundi-proportion", default_value_t = 0.0)]
  pub fundi_proportion: f64,

  /// Comma-separated taxa the functional divergence permutation applies to
  #[clap(long = "fundi-taxa", use_value_delimiter = true)]
  pub fundi_taxon_set: Vec<String>,

  /// Output format of the alignment
  #[clap(long = "format", arg_enum, default_value_t = OutputFormat::Phylip)]
  pub output_format: OutputFormat,

  /// Compress the output with gzip
  #[clap(long = "gzip")]
  pub compress: bool,

  /// Override of the branch-length threshold that switches the per-branch
  /// algorithm to the transition-probability matrix
  #[clap(long = "simulation-thresh")]
  pub simulation_thresh: Option<f64>,

  /// Multiplier of the leaf count between rebuilds of the indel history
  #[clap(long = "rebuild-indel-history")]
  pub rebuild_indel_history_param: Option<f64>,

  /// FASTA file whose first record seeds the root sequence
  #[clap(long = "ancestral-sequence")]
  #[clap(value_hint = ValueHint::FilePath)]
  pub ancestral_sequence: Option<PathBuf>,

  /// Also write the sequences of internal nodes
  #[clap(long = "write-internal")]
  pub write_internal_sequences: bool,

  /// Sample the mixture class per substitution event instead of per site
  #[clap(long = "mixture-at-sub-level")]
  pub mixture_at_sub_level: bool,

  /// Output path prefix; the format extension is appended
  #[clap(long, short = 'o', default_value = "alignment")]
  pub out: PathBuf,

  /// Random seed
  #[clap(long)]
  pub seed: Option<u64>,

  /// Log verbosity
  #[clap(long, default_value = "warn")]
  pub verbosity: LevelFilter,
}
