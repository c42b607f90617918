#![allow(non_snake_case)]

use crate::make_error;
use eyre::Report;
use ndarray::prelude::*;
use ndarray_linalg::UPLO::Lower;
use ndarray_linalg::Eigh;
use num_traits::abs;

/// Average substitution rate `pi' W pi` implied by exchangeabilities `W` and
/// equilibrium frequencies `pi`. Used to normalize `Q` to one expected
/// substitution per site per unit time.
pub fn avg_transition(W: &Array2<f64>, pi: &Array1<f64>) -> f64 {
  pi.dot(&W.dot(pi))
}

/// Performs eigendecomposition of the rate matrix via its symmetrization
/// `sqrt(pi_i) Q_ij / sqrt(pi_j)` and stores the left- and right-matrices
/// needed to exponentiate `Q` cheaply per branch.
/// NOTE: this assumes the diagonal of W is all zeros
fn eig_single_site(W: &Array2<f64>, pi: &Array1<f64>) -> Result<(Array1<f64>, Array2<f64>, Array2<f64>), Report> {
  assert!(abs(W.diag().sum()) < 1e-10);

  let sqrt_pi: Array1<f64> = pi.mapv(f64::sqrt);
  let outer = {
    let n = sqrt_pi.len();
    let col = sqrt_pi.view().into_shape((n, 1))?;
    let row = sqrt_pi.view().into_shape((1, n))?;
    col.dot(&row)
  };
  let mut sym_Q: Array2<f64> = W * &outer;

  let diag = -(W * pi).sum_axis(Axis(1));
  sym_Q.diag_mut().assign(&diag);

  let (eigvals, eigvecs) = sym_Q.eigh(Lower)?;

  let v = &eigvecs / &sqrt_pi.clone().insert_axis(Axis(1));
  let v_inv = eigvecs.t().to_owned() * &sqrt_pi;

  Ok((eigvals, v, v_inv))
}

/// How the equilibrium frequencies of a component were determined. `Empirical`
/// components get frequencies drawn at simulation start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreqPolicy {
  Equal,
  UserDefined,
  Empirical,
}

/// One mixture class: a reversible rate matrix in `(W, pi)` parameterization
/// together with its eigendecomposition.
#[derive(Clone, Debug)]
pub struct SubstComponent {
  pub weight: f64,
  pub pi: Array1<f64>,
  pub W: Array2<f64>,
  pub freq_policy: FreqPolicy,
  pub dna_error_prob: f64,
  eigvals: Array1<f64>,
  v: Array2<f64>,
  v_inv: Array2<f64>,
}

impl SubstComponent {
  pub fn new(W: Array2<f64>, pi: Array1<f64>, weight: f64, freq_policy: FreqPolicy) -> Result<Self, Report> {
    if pi.len() != W.nrows() || W.nrows() != W.ncols() {
      return make_error!(
        "Dimensions of exchangeability matrix ({}x{}) don't match the frequency vector length ({})",
        W.nrows(),
        W.ncols(),
        pi.len()
      );
    }

    let W = {
      let mut W = 0.5 * (&W.view() + &W.t());
      W.diag_mut().fill(0.0);
      W
    };

    let pi = {
      let pi_sum = pi.sum();
      pi / pi_sum
    };

    let average_rate = avg_transition(&W, &pi);
    let W = W / average_rate;

    let (eigvals, v, v_inv) = eig_single_site(&W, &pi)?;

    Ok(Self {
      weight,
      pi,
      W,
      freq_policy,
      dna_error_prob: 0.0,
      eigvals,
      v,
      v_inv,
    })
  }

  #[inline]
  pub fn num_states(&self) -> usize {
    self.pi.len()
  }

  /// Instantaneous rate matrix with rows summing to zero and unit average rate
  pub fn q_matrix(&self) -> Array2<f64> {
    let mut Q = &self.W * &self.pi;
    let diag = -Q.sum_axis(Axis(1));
    Q.diag_mut().assign(&diag);
    Q
  }

  /// Transition probability matrix `P(t) = exp(Q t)`, row-stochastic:
  /// `P[i][j]` is the probability of a child state `j` given parent state `i`.
  pub fn p_matrix(&self, t: f64) -> Array2<f64> {
    let eLambdaT = Array2::from_diag(&(t * &self.eigvals).mapv(f64::exp));
    let P = self.v.dot(&eLambdaT).dot(&self.v_inv);
    P.mapv(|x| x.max(0.0))
  }

  /// Replaces the equilibrium frequencies, re-deriving the decomposition
  pub fn set_state_frequency(&mut self, pi: Array1<f64>) -> Result<(), Report> {
    let updated = Self::new(self.W.clone(), pi, self.weight, self.freq_policy)?;
    self.pi = updated.pi;
    self.W = updated.W;
    self.eigvals = updated.eigvals;
    self.v = updated.v;
    self.v_inv = updated.v_inv;
    Ok(())
  }
}

/// Substitution model consumed by the simulation: one or more reversible
/// components plus the modifier flags parsed from the model description.
#[derive(Clone, Debug)]
pub struct SubstModel {
  pub name: String,
  pub components: Vec<SubstComponent>,
  pub is_fused: bool,
  pub is_heterotachy: bool,
  /// Ascertainment-bias correction: the output may contain only variant sites
  pub ascertainment: bool,
}

impl SubstModel {
  pub fn new(name: impl Into<String>, components: Vec<SubstComponent>) -> Result<Self, Report> {
    let name = name.into();
    if components.is_empty() {
      return make_error!("When creating model '{name}': at least one model component is required");
    }
    let num_states = components[0].num_states();
    if components.iter().any(|c| c.num_states() != num_states) {
      return make_error!("When creating model '{name}': mixture components disagree on the number of states");
    }
    Ok(Self {
      name,
      components,
      is_fused: false,
      is_heterotachy: false,
      ascertainment: false,
    })
  }

  #[inline]
  pub fn num_states(&self) -> usize {
    self.components[0].num_states()
  }

  #[inline]
  pub fn n_mixtures(&self) -> usize {
    self.components.len()
  }

  #[inline]
  pub fn is_mixture(&self) -> bool {
    self.components.len() > 1
  }

  #[inline]
  pub fn component(&self, mix: usize) -> &SubstComponent {
    &self.components[mix]
  }

  pub fn mixture_weights(&self) -> Array1<f64> {
    let weights = Array1::from_iter(self.components.iter().map(|c| c.weight));
    let total = weights.sum();
    weights / total
  }

  /// Weighted equilibrium frequencies over all mixture classes
  pub fn freqs(&self) -> Array1<f64> {
    let weights = self.mixture_weights();
    let mut pi = Array1::<f64>::zeros(self.num_states());
    for (component, &w) in self.components.iter().zip(weights.iter()) {
      pi = pi + w * &component.pi;
    }
    pi
  }

  pub fn q_matrix(&self, mix: usize) -> Array2<f64> {
    self.components[mix].q_matrix()
  }

  pub fn p_matrix(&self, t: f64, mix: usize) -> Array2<f64> {
    self.components[mix].p_matrix(t)
  }

  pub fn contains_dna_error(&self) -> bool {
    self.components.iter().any(|c| c.dna_error_prob > 0.0)
  }

  pub fn dna_error_prob(&self, mix: usize) -> f64 {
    self.components[mix].dna_error_prob
  }

  pub fn state_frequency(&self, mix: usize) -> &Array1<f64> {
    &self.components[mix].pi
  }

  pub fn set_state_frequency(&mut self, mix: usize, pi: Array1<f64>) -> Result<(), Report> {
    self.components[mix].set_state_frequency(pi)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::catalog::{jc, hky85};
  use approx::assert_abs_diff_eq;
  use eyre::Report;
  use rstest::rstest;

  #[rstest]
  fn jc_rate_matrix_is_normalized() -> Result<(), Report> {
    let model = jc(4)?;
    let Q = model.q_matrix(0);

    // rows sum to zero
    for row in Q.rows() {
      assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-12);
    }

    // average rate is one
    let pi = model.freqs();
    let avg: f64 = (0..4).map(|i| -pi[i] * Q[[i, i]]).sum();
    assert_abs_diff_eq!(avg, 1.0, epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn p_matrix_rows_are_stochastic() -> Result<(), Report> {
    let pi = array![0.1, 0.4, 0.4, 0.1];
    let model = hky85(2.0, pi)?;

    for &t in &[0.01, 0.1, 1.0, 10.0] {
      let P = model.p_matrix(t, 0);
      for row in P.rows() {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
      }
    }
    Ok(())
  }

  #[rstest]
  fn p_matrix_converges_to_equilibrium() -> Result<(), Report> {
    let pi = array![0.1, 0.4, 0.4, 0.1];
    let model = hky85(2.0, pi.clone())?;

    let P = model.p_matrix(100.0, 0);
    for row in P.rows() {
      for (j, &p) in row.iter().enumerate() {
        assert_abs_diff_eq!(p, pi[j], epsilon = 1e-9);
      }
    }
    Ok(())
  }

  #[rstest]
  fn p_matrix_at_zero_is_identity() -> Result<(), Report> {
    let model = jc(4)?;
    let P = model.p_matrix(0.0, 0);
    assert_abs_diff_eq!(P, Array2::eye(4), epsilon = 1e-12);
    Ok(())
  }
}
