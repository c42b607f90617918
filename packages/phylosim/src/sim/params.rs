use crate::constants::DEFAULT_REBUILD_INDEL_HISTORY_PARAM;
use crate::indel::distribution::IndelDistribution;

/// Everything the simulation core needs to know about one run, decoupled from
/// the command line surface.
#[derive(Clone, Debug)]
pub struct SimulationParams {
  /// Target output length in characters (codon data: divisible by 3)
  pub sequence_length: usize,
  pub num_datasets: usize,
  pub branch_scale: f64,
  /// Rate multiplier of the partition this simulation belongs to
  pub partition_rate: f64,
  pub insertion_ratio: f64,
  pub deletion_ratio: f64,
  pub insertion_distribution: IndelDistribution,
  pub deletion_distribution: IndelDistribution,
  pub fundi_proportion: f64,
  pub fundi_taxon_set: Vec<String>,
  /// User override of the estimated oversampling ratio
  pub length_ratio: Option<f64>,
  /// User override of the method-switching threshold
  pub simulation_thresh: Option<f64>,
  /// Multiplier `kappa` of the leaf count between indel-history rebuilds
  pub rebuild_indel_history_param: f64,
  pub write_internal_sequences: bool,
  /// Sample the mixture class per substitution event instead of per site
  pub mixture_at_sub_level: bool,
}

impl Default for SimulationParams {
  fn default() -> Self {
    Self {
      sequence_length: 1000,
      num_datasets: 1,
      branch_scale: 1.0,
      partition_rate: 1.0,
      insertion_ratio: 0.0,
      deletion_ratio: 0.0,
      insertion_distribution: IndelDistribution::geo(0.5),
      deletion_distribution: IndelDistribution::geo(0.5),
      fundi_proportion: 0.0,
      fundi_taxon_set: vec![],
      length_ratio: None,
      simulation_thresh: None,
      rebuild_indel_history_param: DEFAULT_REBUILD_INDEL_HISTORY_PARAM,
      write_internal_sequences: false,
      mixture_at_sub_level: false,
    }
  }
}

impl SimulationParams {
  #[inline]
  pub fn indels_enabled(&self) -> bool {
    self.insertion_ratio + self.deletion_ratio != 0.0
  }

  #[inline]
  pub fn insertions_enabled(&self) -> bool {
    self.insertion_ratio > 0.0
  }

  #[inline]
  pub fn fundi_enabled(&self) -> bool {
    !self.fundi_taxon_set.is_empty()
  }
}
