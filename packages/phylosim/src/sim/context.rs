use crate::alphabet::alphabet::{Alphabet, SeqKind, State};
use crate::genome::insertion::InsertionLog;
use crate::make_error;
use crate::model::subst_model::{FreqPolicy, SubstModel};
use crate::rates::rate_profile::{RateProfile, RateSpec};
use crate::sim::params::SimulationParams;
use crate::sim::branch::JMatrixCache;
use crate::sim::fundi::{select_and_permute_sites, FunDiItem};
use crate::sim::length_ratio::estimate_length_ratio;
use crate::sim::sampling::sample_max_prob_first;
use crate::constants::{SWITCHING_PARAM_BREAKPOINTS, SWITCHING_PARAM_CONTINUOUS, SWITCHING_PARAM_DISCRETE};
use crate::tree::tree::PhyloTree;
use eyre::Report;
use ndarray::prelude::*;
use rand::Rng;

/// All state one simulation run threads through its operations: the
/// configuration, the model, the tree, the RNG and the insertion timeline.
/// No globals; everything is owned here and passed down explicitly.
pub struct Simulator<R: Rng> {
  pub params: SimulationParams,
  pub alphabet: Alphabet,
  pub model: SubstModel,
  pub rate_spec: RateSpec,
  pub tree: PhyloTree,
  pub rng: R,

  /// Oversampling ratio for ascertainment-bias correction (1 without it)
  pub length_ratio: f64,
  /// Number of simulated sites per sequence before constant-site filtering
  pub expected_num_sites: usize,

  // per-dataset state
  pub seq_len: usize,
  pub profile: RateProfile,
  pub insertions: InsertionLog,
  pub jcache: JMatrixCache,
  pub switching_thresh: f64,
  pub fundi_items: Vec<FunDiItem>,
  pub mean_deletion_size: Option<f64>,
  /// Final sequence length after indel events, recorded at traversal end
  pub seq_length_indels: usize,

  pub(crate) freqs_initialized: bool,
  pub(crate) warned_nan_sub_rate: bool,
}

impl<R: Rng> Simulator<R> {
  pub fn new(
    params: SimulationParams,
    alphabet: Alphabet,
    mut model: SubstModel,
    rate_spec: RateSpec,
    tree: PhyloTree,
    mut rng: R,
  ) -> Result<Self, Report> {
    validate_config(&params, &alphabet, &tree)?;

    let length_ratio = estimate_length_ratio(
      &mut model,
      &rate_spec,
      &tree,
      params.branch_scale * params.partition_rate,
      params.length_ratio,
    )?;

    let expected_num_sites =
      (params.sequence_length as f64 / alphabet.chars_per_state as f64 * length_ratio).round() as usize;

    let jcache = JMatrixCache::from_model(&model);
    let profile = RateProfile::generate(
      &rate_spec,
      model.mixture_weights().as_slice().expect("mixture weights are contiguous"),
      0,
      &mut rng,
    )?;

    let mut this = Self {
      params,
      alphabet,
      model,
      rate_spec,
      tree,
      rng,
      length_ratio,
      expected_num_sites,
      seq_len: expected_num_sites,
      profile,
      insertions: InsertionLog::new(),
      jcache,
      switching_thresh: 0.0,
      fundi_items: vec![],
      mean_deletion_size: None,
      seq_length_indels: 0,
      freqs_initialized: false,
      warned_nan_sub_rate: false,
    };
    this.compute_switching_param(this.expected_num_sites);
    Ok(this)
  }

  /// Number of target sites after constant-site filtering
  #[inline]
  pub fn target_num_sites(&self) -> usize {
    (self.expected_num_sites as f64 / self.length_ratio).round() as usize
  }

  /// Global branch scale: user scale times the partition rate
  #[inline]
  pub fn beta(&self) -> f64 {
    self.params.branch_scale * self.params.partition_rate
  }

  /// Re-initializes all per-dataset state and materializes the root sequence
  pub fn prepare_dataset(&mut self, ancestral_sequence: Option<&[State]>) -> Result<(), Report> {
    self.tree.reset_run_state();
    self.seq_len = self.expected_num_sites;
    self.insertions = InsertionLog::new();
    self.mean_deletion_size = None;
    self.seq_length_indels = 0;
    self.warned_nan_sub_rate = false;

    self.profile = RateProfile::generate(
      &self.rate_spec,
      self
        .model
        .mixture_weights()
        .as_slice()
        .expect("mixture weights are contiguous"),
      self.expected_num_sites,
      &mut self.rng,
    )?;
    self.jcache = JMatrixCache::from_model(&self.model);
    self.compute_switching_param(self.expected_num_sites);

    // root sequence: the supplied ancestral sequence padded with
    // frequency-drawn sites, or an entirely frequency-drawn sequence
    let root_seq = match ancestral_sequence {
      Some(ancestral) => {
        let mut seq = ancestral.to_vec();
        if seq.len() < self.expected_num_sites {
          let abundant = self.generate_random_sequence(self.expected_num_sites - seq.len(), true)?;
          seq.extend(abundant);
        }
        seq.truncate(self.expected_num_sites);
        seq
      }
      None => self.generate_random_sequence(self.expected_num_sites, true)?,
    };

    let root = self.tree.root;
    if self.params.indels_enabled() {
      self.tree.nodes[root].num_gaps = root_seq
        .iter()
        .filter(|&&s| self.alphabet.is_unknown(s))
        .count();
    }
    self.tree.nodes[root].sequence = root_seq;

    // the root freezes at the sentinel if it is itself a leaf
    if self.params.insertions_enabled() && self.tree.is_leaf(root) {
      self.tree.nodes[root].insertion_pos = Some(self.insertions.head());
    }

    self.fundi_items = if self.params.fundi_enabled() {
      select_and_permute_sites(self.params.fundi_proportion, self.expected_num_sites, &mut self.rng)?
    } else {
      vec![]
    };

    Ok(())
  }

  /// Draws a sequence from the model state frequencies. With `initial_freqs`,
  /// components without defined frequencies get theirs drawn first; insertions
  /// pass `false` so frequencies are never re-initialized mid-run.
  pub fn generate_random_sequence(&mut self, length: usize, initial_freqs: bool) -> Result<Vec<State>, Report> {
    let num_states = self.alphabet.num_states;

    if self.model.components.iter().all(|c| c.freq_policy == FreqPolicy::Equal) {
      return Ok((0..length).map(|_| self.rng.gen_range(0..num_states) as State).collect());
    }

    if initial_freqs && !self.freqs_initialized {
      self.init_state_freqs()?;
    }

    let freqs = self.model.freqs();
    let max_prob_pos = freqs
      .iter()
      .enumerate()
      .max_by(|(_, a), (_, b)| a.total_cmp(b))
      .map(|(i, _)| i)
      .unwrap_or(0);

    let mut cum = freqs.clone();
    let mut acc = 0.0;
    for f in cum.iter_mut() {
      acc += *f;
      *f = acc;
    }

    Ok(
      (0..length)
        .map(|_| sample_max_prob_first(cum.view(), max_prob_pos, &mut self.rng) as State)
        .collect(),
    )
  }

  /// Draws random frequencies for components that have none, normalized to
  /// sum one, and re-derives their decompositions
  fn init_state_freqs(&mut self) -> Result<(), Report> {
    let num_states = self.alphabet.num_states;
    for i in 0..self.model.components.len() {
      if self.model.components[i].freq_policy == FreqPolicy::Empirical {
        let mut freqs = Array1::<f64>::zeros(num_states);
        for f in freqs.iter_mut() {
          *f = self.rng.gen::<f64>();
        }
        let freqs = &freqs / freqs.sum();
        self.model.set_state_frequency(i, freqs)?;
      }
    }
    self.jcache = JMatrixCache::from_model(&self.model);
    self.freqs_initialized = true;
    Ok(())
  }

  /// Recomputes the method-switching threshold `a / L` for the current
  /// sequence length; called again whenever an insertion changes the length
  pub fn compute_switching_param(&mut self, seq_len: usize) {
    if let Some(thresh) = self.params.simulation_thresh {
      self.switching_thresh = thresh;
      return;
    }

    let table = if self.rate_spec.is_continuous_gamma() {
      &SWITCHING_PARAM_CONTINUOUS
    } else {
      &SWITCHING_PARAM_DISCRETE
    };

    let a = if seq_len >= SWITCHING_PARAM_BREAKPOINTS[2] {
      table[3]
    } else if seq_len >= SWITCHING_PARAM_BREAKPOINTS[1] {
      table[2]
    } else if seq_len >= SWITCHING_PARAM_BREAKPOINTS[0] {
      table[1]
    } else {
      table[0]
    };

    self.switching_thresh = a / seq_len as f64;
  }
}

fn validate_config(params: &SimulationParams, alphabet: &Alphabet, tree: &PhyloTree) -> Result<(), Report> {
  if params.sequence_length == 0 {
    return make_error!("Sequence length must be positive");
  }

  if alphabet.kind == SeqKind::Codon && params.sequence_length % 3 != 0 {
    return make_error!("Sequence length of Codon must be divisible by 3. Please check & try again!");
  }

  if params.insertion_ratio < 0.0 || params.deletion_ratio < 0.0 {
    return make_error!("Insertion and deletion ratios must be non-negative");
  }

  if params.fundi_enabled() {
    if !(0.0..1.0).contains(&params.fundi_proportion) || params.fundi_proportion == 0.0 {
      return make_error!(
        "Proportion of sites permuted by functional divergence must be in (0, 1), got {}",
        params.fundi_proportion
      );
    }
    let leaf_names: Vec<&str> = tree
      .output_leaves()
      .into_iter()
      .map(|id| tree.nodes[id].name.as_str())
      .collect();
    for taxon in &params.fundi_taxon_set {
      if !leaf_names.contains(&taxon.as_str()) {
        return make_error!("Taxon '{taxon}' of the functional divergence set does not name a leaf of the tree");
      }
    }
  }

  Ok(())
}
