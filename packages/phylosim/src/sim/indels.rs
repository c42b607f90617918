use crate::alphabet::alphabet::State;
use crate::genome::genome_tree::GenomeTree;
use crate::make_error;
use crate::sim::branch::SimulationMethod;
use crate::sim::context::Simulator;
use crate::sim::sampling::sample_max_prob_first;
use crate::tree::tree::NodeId;
use eyre::Report;
use log::warn;
use rand::distributions::{Distribution as RandDistribution, WeightedIndex};
use rand::Rng;
use rand_distr::Exp;

/// Transient per-branch bookkeeping of the rate-matrix method: the summed
/// substitution rate and its per-site decomposition. Gap sites carry rate
/// zero and therefore never host substitution events.
#[derive(Clone, Debug, Default)]
pub struct RateMatrixState {
  pub total_sub_rate: f64,
  pub sub_rate_by_site: Vec<f64>,
}

enum EventType {
  Insertion,
  Deletion,
  Substitution,
}

impl<R: Rng> Simulator<R> {
  /// Initializes the per-site substitution rates from the child sequence
  fn init_rate_matrix_state(&mut self, seq: &[State]) -> RateMatrixState {
    let mut total_sub_rate = 0.0;
    let mut sub_rate_by_site = vec![0.0; seq.len()];

    for (site, &state) in seq.iter().enumerate() {
      if self.alphabet.is_unknown(state) || self.profile.rate(site) == 0.0 {
        continue;
      }
      let rate = self.profile.rate(site) * self.jcache.sub_rate(self.profile.class(site), state);
      sub_rate_by_site[site] = rate;
      total_sub_rate += rate;
    }

    if total_sub_rate.is_nan() {
      if !self.warned_nan_sub_rate {
        warn!("Total substitution rate is not a number (extreme state frequencies?); treating it as zero");
        self.warned_nan_sub_rate = true;
      }
      total_sub_rate = 0.0;
    }

    RateMatrixState {
      total_sub_rate,
      sub_rate_by_site,
    }
  }

  /// Empirical mean deletion size, estimated once per run from as many draws
  /// as there are sites
  fn mean_deletion_size(&mut self) -> Result<f64, Report> {
    if let Some(mean) = self.mean_deletion_size {
      return Ok(mean);
    }
    let mean = self
      .params
      .deletion_distribution
      .empirical_mean(self.seq_len, &mut self.rng)?;
    self.mean_deletion_size = Some(mean);
    Ok(mean)
  }

  /// Uniformly selects a position in `[0, upper_bound)` that is not a gap.
  /// A draw landing on a gap scans forward to the next non-gap site; the
  /// retry bound guards against almost-fully-deleted sequences.
  fn select_valid_position(&mut self, upper_bound: usize, seq: &[State]) -> Result<usize, Report> {
    for _ in 0..upper_bound {
      let mut position = self.rng.gen_range(0..upper_bound);

      while position < upper_bound && position < seq.len() && self.alphabet.is_unknown(seq[position]) {
        position += 1;
      }
      if position == upper_bound && position != seq.len() {
        continue;
      }
      if position == seq.len() || !self.alphabet.is_unknown(seq[position]) {
        return Ok(position);
      }
    }

    make_error!(
      "Could not select a valid position (not a deleted site) for insertion/deletion events. Almost all sites may \
       have been deleted; please try again with a smaller deletion ratio"
    )
  }

  /// Runs the joint insertion/deletion/substitution event process along one
  /// branch. The child sequence is mutated in place; insertions are recorded
  /// on the global timeline and propagated to ancestors. Returns true iff at
  /// least one insertion occurred on this branch.
  pub fn simulate_branch_events(
    &mut self,
    child: NodeId,
    edge_length: f64,
    method: SimulationMethod,
  ) -> Result<bool, Report> {
    let mut seq = std::mem::take(&mut self.tree.nodes[child].sequence);
    let ori_seq_len = seq.len();
    let insertion_before = self.insertions.tail();

    let mut state = if method == SimulationMethod::RateMatrix {
      self.init_rate_matrix_state(&seq)
    } else {
      RateMatrixState::default()
    };

    let mut num_gaps = self.tree.nodes[child].num_gaps;

    let (mut total_ins_rate, mut total_del_rate) = if self.params.indels_enabled() {
      let mean_del = if self.params.deletion_ratio > 0.0 {
        self.mean_deletion_size()?
      } else {
        0.0
      };
      (
        self.params.insertion_ratio * (self.seq_len as f64 + 1.0 - num_gaps as f64),
        self.params.deletion_ratio * (self.seq_len as f64 - 1.0 - num_gaps as f64 + mean_del),
      )
    } else {
      (0.0, 0.0)
    };

    let mut remaining = edge_length * self.beta();
    loop {
      let total_event_rate = state.total_sub_rate + total_ins_rate + total_del_rate;
      if total_event_rate <= 0.0 {
        break;
      }

      let waiting_time = Exp::new(total_event_rate)
        .map_err(|err| eyre::eyre!("When drawing event waiting time: {err}"))?
        .sample(&mut self.rng);
      if waiting_time > remaining {
        break;
      }
      remaining -= waiting_time;

      let event_type = if total_ins_rate > 0.0 || total_del_rate > 0.0 {
        let r = self.rng.gen::<f64>() * total_event_rate;
        if r < total_ins_rate {
          EventType::Insertion
        } else if r < total_ins_rate + total_del_rate {
          EventType::Deletion
        } else {
          EventType::Substitution
        }
      } else {
        EventType::Substitution
      };

      let mut length_change = 0_i64;
      match event_type {
        EventType::Insertion => {
          let inserted = self.handle_insertion(&mut seq, &mut state, method)?;
          length_change = inserted as i64;
        }
        EventType::Deletion => {
          let deleted = self.handle_deletion(&mut seq, &mut state, method)?;
          num_gaps += deleted;
          length_change = -(deleted as i64);
        }
        EventType::Substitution => {
          if method == SimulationMethod::RateMatrix {
            self.handle_substitution(&mut seq, &mut state)?;
          }
        }
      }

      if length_change != 0 {
        total_ins_rate += self.params.insertion_ratio * length_change as f64;
        total_del_rate += self.params.deletion_ratio * length_change as f64;
      }
    }

    self.tree.nodes[child].num_gaps = num_gaps;
    self.tree.nodes[child].sequence = seq;

    let any_insertion = self.insertions.tail() != insertion_before;
    if any_insertion {
      // ancestors recorded before this branch lack the inserted positions;
      // pad them through a genome tree spanning only the new events
      let genome_tree = GenomeTree::build(&self.insertions, insertion_before, ori_seq_len);
      self.update_internal_seqs_indels(&genome_tree, child)?;
      self.compute_switching_param(self.seq_len);
    }

    Ok(any_insertion)
  }

  /// Inserts frequency-drawn sites at a gap-free position, records the event
  /// on the timeline and keeps the rate bookkeeping current. Returns the
  /// insertion length.
  fn handle_insertion(
    &mut self,
    seq: &mut Vec<State>,
    state: &mut RateMatrixState,
    method: SimulationMethod,
  ) -> Result<usize, Report> {
    let position = self.select_valid_position(self.seq_len + 1, seq)?;
    let length = self
      .params
      .insertion_distribution
      .sample_positive(&mut self.rng, "insertion")?;

    let new_sites = self.generate_random_sequence(length, false)?;
    seq.splice(position..position, new_sites);
    self.profile.insert_sites(position, length, &mut self.rng)?;

    if method == SimulationMethod::RateMatrix {
      state.sub_rate_by_site.splice(position..position, vec![0.0; length]);
      let mut sub_rate_change = 0.0;
      for site in position..position + length {
        let rate = self.profile.rate(site) * self.jcache.sub_rate(self.profile.class(site), seq[site]);
        state.sub_rate_by_site[site] = rate;
        sub_rate_change += rate;
      }
      state.total_sub_rate += sub_rate_change;
    }

    let appended = position == self.seq_len;
    self.insertions.push(position, length, appended);
    self.seq_len += length;

    Ok(length)
  }

  /// Replaces sites with gaps starting at a gap-free position, walking
  /// forward over already-deleted sites. Returns how many sites were
  /// actually deleted.
  fn handle_deletion(
    &mut self,
    seq: &mut [State],
    state: &mut RateMatrixState,
    method: SimulationMethod,
  ) -> Result<usize, Report> {
    let length = self
      .params
      .deletion_distribution
      .sample_positive(&mut self.rng, "deletion")?;

    let upper_bound = self.seq_len.saturating_sub(length);
    let position = if upper_bound > 0 {
      self.select_valid_position(upper_bound, seq)?
    } else {
      0
    };

    let unknown = self.alphabet.unknown();
    let mut deleted = 0;
    let mut site = position;
    let mut sub_rate_change = 0.0;
    while deleted < length && site < seq.len() {
      if seq[site] != unknown {
        seq[site] = unknown;
        deleted += 1;
        if method == SimulationMethod::RateMatrix {
          sub_rate_change -= state.sub_rate_by_site[site];
          state.sub_rate_by_site[site] = 0.0;
        }
      }
      site += 1;
    }

    if method == SimulationMethod::RateMatrix {
      state.total_sub_rate += sub_rate_change;
    }

    Ok(deleted)
  }

  /// One substitution event of the rate-matrix method: position proportional
  /// to the per-site rates, next state from the jump matrix row of the
  /// current state.
  fn handle_substitution(&mut self, seq: &mut [State], state: &mut RateMatrixState) -> Result<(), Report> {
    if state.total_sub_rate <= 0.0 {
      return Ok(());
    }

    let position_distr = WeightedIndex::new(&state.sub_rate_by_site)
      .map_err(|err| eyre::eyre!("When selecting a substitution position: {err}"))?;
    let position = position_distr.sample(&mut self.rng);

    let current_state = seq[position];
    let class = self.profile.class(position);
    let num_states = self.alphabet.num_states;

    let row = self.jcache.jmatrix_cum[class].row(current_state as usize);
    let new_state = sample_max_prob_first(row, num_states / 2, &mut self.rng) as State;
    seq[position] = new_state;

    let site_rate = self.profile.rate(position);
    let sub_rate_change =
      site_rate * (self.jcache.sub_rate(class, new_state) - self.jcache.sub_rate(class, current_state));
    state.total_sub_rate += sub_rate_change;
    state.sub_rate_by_site[position] += sub_rate_change;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alphabet::alphabet::{Alphabet, SeqKind};
  use crate::indel::distribution::IndelDistribution;
  use crate::io::nwk::read_nwk_str;
  use crate::model::catalog::jc;
  use crate::rates::rate_profile::RateSpec;
  use crate::sim::params::SimulationParams;
  use approx::assert_abs_diff_eq;
  use eyre::Report;
  use rand::SeedableRng;
  use rand_isaac::Isaac64Rng;
  use rstest::rstest;

  fn simulator(params: SimulationParams) -> Result<Simulator<Isaac64Rng>, Report> {
    let alphabet = Alphabet::new(SeqKind::Dna)?;
    let tree = read_nwk_str("(A:1.0,B:1.0);")?;
    let rng = Isaac64Rng::seed_from_u64(21);
    Simulator::new(params, alphabet, jc(4)?, RateSpec::default(), tree, rng)
  }

  #[rstest]
  fn rate_state_skips_gaps() -> Result<(), Report> {
    let mut sim = simulator(SimulationParams {
      sequence_length: 10,
      ..SimulationParams::default()
    })?;
    sim.prepare_dataset(None)?;

    let unknown = sim.alphabet.unknown();
    let seq = vec![0, 1, unknown, 2, unknown];
    let state = sim.init_rate_matrix_state(&seq);

    assert_abs_diff_eq!(state.sub_rate_by_site[2], 0.0);
    assert_abs_diff_eq!(state.sub_rate_by_site[4], 0.0);
    assert_abs_diff_eq!(
      state.total_sub_rate,
      state.sub_rate_by_site.iter().sum::<f64>(),
      epsilon = 1e-12
    );
    // JC leaves every state at rate one
    assert_abs_diff_eq!(state.total_sub_rate, 3.0, epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn substitutions_preserve_rate_invariant() -> Result<(), Report> {
    let mut sim = simulator(SimulationParams {
      sequence_length: 100,
      ..SimulationParams::default()
    })?;
    sim.prepare_dataset(None)?;

    let mut seq = sim.generate_random_sequence(100, true)?;
    let mut state = sim.init_rate_matrix_state(&seq);

    for _ in 0..50 {
      sim.handle_substitution(&mut seq, &mut state)?;
    }

    let expected = sim.init_rate_matrix_state(&seq);
    assert_abs_diff_eq!(state.total_sub_rate, expected.total_sub_rate, epsilon = 1e-9);
    Ok(())
  }

  #[rstest]
  fn insertions_grow_sequence_and_timeline() -> Result<(), Report> {
    let params = SimulationParams {
      sequence_length: 100,
      insertion_ratio: 0.05,
      insertion_distribution: IndelDistribution::geo(0.5),
      ..SimulationParams::default()
    };
    let mut sim = simulator(params)?;
    sim.prepare_dataset(None)?;

    let root = sim.tree.root;
    let child = sim.tree.nodes[root].neighbors[0].target;
    let root_seq = sim.tree.nodes[root].sequence.clone();
    sim.tree.nodes[child].sequence = root_seq;

    let any_insertion = sim.simulate_branch_events(child, 1.0, SimulationMethod::RateMatrix)?;

    assert!(any_insertion, "with rate 5 per unit time some insertion should occur");
    assert!(sim.seq_len > 100);
    assert_eq!(sim.tree.nodes[child].sequence.len(), sim.seq_len);
    assert!(!sim.insertions.is_empty());

    // positions recorded in event-time coordinates never exceed the length
    // that was current at the event
    let mut len_at_event = 100;
    for id in sim.insertions.iter_after(sim.insertions.head()) {
      let insertion = sim.insertions.get(id);
      assert!(insertion.position <= len_at_event);
      assert_eq!(insertion.appended, insertion.position == len_at_event);
      len_at_event += insertion.length;
    }
    Ok(())
  }

  #[rstest]
  fn deletions_leave_gaps_and_count_them() -> Result<(), Report> {
    let params = SimulationParams {
      sequence_length: 200,
      deletion_ratio: 0.02,
      deletion_distribution: IndelDistribution::geo(0.5),
      ..SimulationParams::default()
    };
    let mut sim = simulator(params)?;
    sim.prepare_dataset(None)?;

    let root = sim.tree.root;
    let child = sim.tree.nodes[root].neighbors[0].target;
    let root_seq = sim.tree.nodes[root].sequence.clone();
    sim.tree.nodes[child].sequence = root_seq;

    sim.simulate_branch_events(child, 1.0, SimulationMethod::RateMatrix)?;

    let unknown = sim.alphabet.unknown();
    let num_unknown = sim.tree.nodes[child]
      .sequence
      .iter()
      .filter(|&&s| s == unknown)
      .count();
    assert_eq!(num_unknown, sim.tree.nodes[child].num_gaps);
    // deletions never change the sequence length
    assert_eq!(sim.tree.nodes[child].sequence.len(), 200);
    assert_eq!(sim.seq_len, 200);
    Ok(())
  }
}
