use crate::alphabet::alphabet::State;
use crate::make_error;
use crate::sim::context::Simulator;
use crate::tree::tree::NodeId;
use eyre::Report;
use rand::Rng;

/// Randomly flips `round(error_prop * sites.len())` of the given sites to a
/// different state, skipping gaps.
fn change_sites_error_model(
  mut available: Vec<usize>,
  seq: &mut [State],
  error_prop: f64,
  num_states: usize,
  unknown: State,
  rng: &mut impl Rng,
) -> Result<(), Report> {
  let num_changes = (error_prop * available.len() as f64).round() as usize;

  let mut changed = 0;
  while changed < num_changes {
    if num_changes - changed > available.len() {
      return make_error!(
        "Cannot select a site for changing state (to simulate the sequencing error model). The proportion of error \
         seems to be too high; please try again with a smaller proportion"
      );
    }

    let index = rng.gen_range(0..available.len());
    let site = available.swap_remove(index);
    if seq[site] == unknown {
      continue;
    }

    let mut new_state = rng.gen_range(0..num_states) as State;
    while new_state == seq[site] && num_states > 1 {
      new_state = rng.gen_range(0..num_states) as State;
    }
    seq[site] = new_state;
    changed += 1;
  }

  Ok(())
}

impl<R: Rng> Simulator<R> {
  /// Applies the sequencing error model to a finalized leaf sequence. Under a
  /// mixture model, each component flips only the sites assigned to it, with
  /// its own error probability.
  pub fn apply_dna_error(&mut self, node: NodeId) -> Result<(), Report> {
    if !self.model.contains_dna_error() {
      return Ok(());
    }

    let mut seq = std::mem::take(&mut self.tree.nodes[node].sequence);
    let num_states = self.alphabet.num_states;
    let unknown = self.alphabet.unknown();

    if self.model.is_mixture() {
      for mix in 0..self.model.n_mixtures() {
        let sites: Vec<usize> = (0..seq.len()).filter(|&i| self.profile.class(i) == mix).collect();
        change_sites_error_model(sites, &mut seq, self.model.dna_error_prob(mix), num_states, unknown, &mut self.rng)?;
      }
    } else {
      let sites: Vec<usize> = (0..seq.len()).collect();
      change_sites_error_model(sites, &mut seq, self.model.dna_error_prob(0), num_states, unknown, &mut self.rng)?;
    }

    self.tree.nodes[node].sequence = seq;
    Ok(())
  }
}
