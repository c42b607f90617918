use crate::alphabet::alphabet::State;
use crate::model::subst_model::SubstModel;
use crate::sim::context::Simulator;
use crate::sim::sampling::{cumulative_rows_inplace, sample_max_prob_first};
use crate::tree::tree::EdgeTo;
use eyre::Report;
use ndarray::prelude::*;
use rand::Rng;
use std::collections::HashMap;

/// Per-branch simulation algorithm: explicit event simulation from the rate
/// matrix, or direct sampling from the transition probability matrix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimulationMethod {
  RateMatrix,
  TransProb,
}

/// Per-mixture-class jump matrices and leaving rates extracted from `Q` once
/// per run: `sub_rates[mix][i] = -Q[i][i]`, and `jmatrix_cum[mix]` holds the
/// row-cumulative categorical distribution `J[i][j] = Q[i][j] / -Q[i][i]`
/// over next states given a substitution away from `i`.
#[derive(Clone, Debug)]
pub struct JMatrixCache {
  pub sub_rates: Array2<f64>,
  pub jmatrix_cum: Vec<Array2<f64>>,
}

impl JMatrixCache {
  pub fn from_model(model: &SubstModel) -> Self {
    let num_states = model.num_states();
    let n_mix = model.n_mixtures();

    let mut sub_rates = Array2::<f64>::zeros((n_mix, num_states));
    let mut jmatrix_cum = Vec::with_capacity(n_mix);

    for mix in 0..n_mix {
      let q = model.q_matrix(mix);
      let mut jmatrix = Array2::<f64>::zeros((num_states, num_states));
      for i in 0..num_states {
        let leave_rate = -q[[i, i]];
        sub_rates[[mix, i]] = leave_rate;
        for j in 0..num_states {
          if i != j {
            jmatrix[[i, j]] = q[[i, j]] / leave_rate;
          }
        }
      }
      cumulative_rows_inplace(&mut jmatrix);
      jmatrix_cum.push(jmatrix);
    }

    Self { sub_rates, jmatrix_cum }
  }

  /// Leaving rate of `state` under mixture class `mix`
  #[inline]
  pub fn sub_rate(&self, mix: usize, state: State) -> f64 {
    self.sub_rates[[mix, state as usize]]
  }
}

impl<R: Rng> Simulator<R> {
  /// Selects the per-branch algorithm: long branches, heterotachy models,
  /// branch-local model overrides and substitution-level mixture sampling go
  /// through the transition probability matrix, everything else through the
  /// rate matrix.
  pub fn choose_method(&self, edge: &EdgeTo) -> SimulationMethod {
    if edge.length * self.beta() > self.switching_thresh
      || self.model.is_heterotachy
      || edge.attrs.contains_key("model")
      || (self.model.is_mixture() && self.params.mixture_at_sub_level)
    {
      SimulationMethod::TransProb
    } else {
      SimulationMethod::RateMatrix
    }
  }

  /// Samples a child sequence from `P(beta * length)`, site by site. Sites are
  /// keyed by their mixture class and rate category so the cumulative matrix
  /// is computed once per distinct `(class, category)` pair; continuous
  /// per-site rates force a fresh matrix per site.
  pub fn evolve_trans_prob(
    &mut self,
    parent_seq: &[State],
    length: f64,
    model_override: Option<&SubstModel>,
  ) -> Result<Vec<State>, Report> {
    let t_branch = length * self.beta();
    let model = model_override.unwrap_or(&self.model);
    let profile = &self.profile;
    let alphabet = &self.alphabet;
    let rng = &mut self.rng;

    let mut cache: HashMap<(usize, usize), Array2<f64>> = HashMap::new();
    let mut child_seq = Vec::with_capacity(parent_seq.len());

    for (site, &parent_state) in parent_seq.iter().enumerate() {
      if alphabet.is_unknown(parent_state) {
        child_seq.push(alphabet.unknown());
        continue;
      }

      let rate = profile.rate(site);
      if rate == 0.0 {
        child_seq.push(parent_state);
        continue;
      }

      let class = profile.class(site).min(model.n_mixtures() - 1);
      let row = if profile.continuous {
        let mut p = model.p_matrix(t_branch * rate, class);
        cumulative_rows_inplace(&mut p);
        let state = sample_max_prob_first(p.row(parent_state as usize), parent_state as usize, rng);
        child_seq.push(state as State);
        continue;
      } else {
        let category = profile.category(site);
        cache.entry((class, category)).or_insert_with(|| {
          let mut p = model.p_matrix(t_branch * rate, class);
          cumulative_rows_inplace(&mut p);
          p
        });
        cache[&(class, category)].row(parent_state as usize)
      };

      let state = sample_max_prob_first(row, parent_state as usize, rng);
      child_seq.push(state as State);
    }

    Ok(child_seq)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alphabet::alphabet::{Alphabet, SeqKind};
  use crate::io::nwk::read_nwk_str;
  use crate::model::catalog::{hky85, jc};
  use crate::rates::rate_profile::RateSpec;
  use crate::sim::params::SimulationParams;
  use approx::assert_abs_diff_eq;
  use eyre::Report;
  use ndarray::array;
  use rand::SeedableRng;
  use rand_isaac::Isaac64Rng;
  use rstest::rstest;

  fn simulator(model: crate::model::subst_model::SubstModel) -> Result<Simulator<Isaac64Rng>, Report> {
    let params = SimulationParams {
      sequence_length: 1000,
      ..SimulationParams::default()
    };
    let alphabet = Alphabet::new(SeqKind::Dna)?;
    let tree = read_nwk_str("(A:0.1,B:0.1);")?;
    let rng = Isaac64Rng::seed_from_u64(11);
    Simulator::new(params, alphabet, model, RateSpec::default(), tree, rng)
  }

  #[rstest]
  fn jump_matrix_rows_accumulate_to_one() -> Result<(), Report> {
    let cache = JMatrixCache::from_model(&jc(4)?);
    let jmatrix = &cache.jmatrix_cum[0];
    for i in 0..4 {
      assert_abs_diff_eq!(jmatrix[[i, 3]], 1.0, epsilon = 1e-12);
    }
    // diagonal contributes nothing: the cumulative value stays flat across it
    assert_abs_diff_eq!(jmatrix[[0, 0]], 0.0, epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn sub_rates_match_diagonal() -> Result<(), Report> {
    let model = hky85(2.0, array![0.1, 0.4, 0.4, 0.1])?;
    let cache = JMatrixCache::from_model(&model);
    let q = model.q_matrix(0);
    for i in 0..4 {
      assert_abs_diff_eq!(cache.sub_rate(0, i as State), -q[[i, i]], epsilon = 1e-12);
    }
    Ok(())
  }

  #[rstest]
  fn gaps_propagate_to_the_child() -> Result<(), Report> {
    let mut sim = simulator(jc(4)?)?;
    let unknown = sim.alphabet.unknown();
    let parent = vec![0, unknown, 2, unknown];
    let child = sim.evolve_trans_prob(&parent, 0.5, None)?;
    assert_eq!(child.len(), 4);
    assert_eq!(child[1], unknown);
    assert_eq!(child[3], unknown);
    assert_ne!(child[0], unknown);
    Ok(())
  }

  #[rstest]
  fn long_branches_converge_to_equilibrium() -> Result<(), Report> {
    let pi = array![0.1, 0.4, 0.4, 0.1];
    let mut sim = simulator(hky85(2.0, pi.clone())?)?;

    let parent = vec![0 as State; 100_000];
    let child = sim.evolve_trans_prob(&parent, 50.0, None)?;

    let mut counts = [0_usize; 4];
    for &s in &child {
      counts[s as usize] += 1;
    }
    for (i, &count) in counts.iter().enumerate() {
      let freq = count as f64 / 100_000.0;
      assert!((freq - pi[i]).abs() < 0.01, "state {i} frequency {freq} too far from {}", pi[i]);
    }
    Ok(())
  }
}
