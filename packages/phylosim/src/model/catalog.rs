#![allow(non_snake_case)]

use crate::make_error;
use crate::model::subst_model::{FreqPolicy, SubstComponent, SubstModel};
use eyre::Report;
use ndarray::prelude::*;

/// Exchangeability matrix with transitions (A<->G, C<->T) scaled by `kappa`
/// relative to transversions. Nucleotide order is A, C, G, T.
fn transversion_transition_W(kappa: f64) -> Array2<f64> {
  let mut W = Array2::<f64>::ones((4, 4));
  W[[0, 2]] = kappa;
  W[[2, 0]] = kappa;
  W[[1, 3]] = kappa;
  W[[3, 1]] = kappa;
  W.diag_mut().fill(0.0);
  W
}

/// Jukes-Cantor model generalized to any number of states: equal
/// exchangeabilities and equal frequencies.
pub fn jc(num_states: usize) -> Result<SubstModel, Report> {
  let W = Array2::<f64>::ones((num_states, num_states));
  let pi = Array1::<f64>::ones(num_states) / (num_states as f64);
  let component = SubstComponent::new(W, pi, 1.0, FreqPolicy::Equal)?;
  SubstModel::new("JC", vec![component])
}

/// Kimura 1980: equal frequencies, transition/transversion ratio `kappa`
pub fn k80(kappa: f64) -> Result<SubstModel, Report> {
  let W = transversion_transition_W(kappa);
  let pi = Array1::<f64>::ones(4) / 4.0;
  let component = SubstComponent::new(W, pi, 1.0, FreqPolicy::Equal)?;
  SubstModel::new("K80", vec![component])
}

/// Felsenstein 1981: equal exchangeabilities, unequal frequencies
pub fn f81(pi: Array1<f64>) -> Result<SubstModel, Report> {
  validate_dna_freqs(&pi, "F81")?;
  let W = Array2::<f64>::ones((4, 4));
  let component = SubstComponent::new(W, pi, 1.0, FreqPolicy::UserDefined)?;
  SubstModel::new("F81", vec![component])
}

/// Hasegawa, Kishino and Yano 1985: unequal frequencies with
/// transition/transversion ratio `kappa`
pub fn hky85(kappa: f64, pi: Array1<f64>) -> Result<SubstModel, Report> {
  validate_dna_freqs(&pi, "HKY85")?;
  let W = transversion_transition_W(kappa);
  let component = SubstComponent::new(W, pi, 1.0, FreqPolicy::UserDefined)?;
  SubstModel::new("HKY85", vec![component])
}

/// General time-reversible model for nucleotides. `rates` are the six
/// exchangeabilities in the order AC, AG, AT, CG, CT, GT.
pub fn gtr(rates: &[f64], pi: Array1<f64>) -> Result<SubstModel, Report> {
  if rates.len() != 6 {
    return make_error!("GTR expects 6 exchangeability rates (AC/AG/AT/CG/CT/GT), got {}", rates.len());
  }
  validate_dna_freqs(&pi, "GTR")?;

  let mut W = Array2::<f64>::zeros((4, 4));
  let pairs = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
  for (&rate, &(i, j)) in rates.iter().zip(pairs.iter()) {
    W[[i, j]] = rate;
    W[[j, i]] = rate;
  }

  let component = SubstComponent::new(W, pi, 1.0, FreqPolicy::UserDefined)?;
  SubstModel::new("GTR", vec![component])
}

/// Resolves a model family name and its brace parameters into the
/// `(W, pi, policy)` triple a component is built from. `user_freqs` comes from
/// a `+F{...}` modifier and overrides the family default.
pub fn family_matrices(
  name: &str,
  params: &[f64],
  user_freqs: Option<&Array1<f64>>,
  num_states: usize,
) -> Result<(Array2<f64>, Array1<f64>, FreqPolicy), Report> {
  let require_dna = |family: &str| -> Result<(), Report> {
    if num_states != 4 {
      return make_error!("Model '{family}' is only defined for nucleotide data (4 states), got {num_states} states");
    }
    Ok(())
  };

  let param = |i: usize, family: &str| -> Result<f64, Report> {
    params
      .get(i)
      .copied()
      .ok_or_else(|| eyre::eyre!("Model '{family}' is missing parameter {}", i + 1))
  };

  let (W, default_pi, policy): (Array2<f64>, Array1<f64>, FreqPolicy) = match name {
    "JC" | "JC69" | "MK" | "POISSON" => (
      Array2::<f64>::ones((num_states, num_states)),
      Array1::<f64>::ones(num_states) / (num_states as f64),
      FreqPolicy::Equal,
    ),
    "K80" | "K2P" => {
      require_dna(name)?;
      (
        transversion_transition_W(param(0, name)?),
        Array1::<f64>::ones(4) / 4.0,
        FreqPolicy::Equal,
      )
    }
    "F81" => {
      require_dna(name)?;
      (
        Array2::<f64>::ones((4, 4)),
        Array1::<f64>::ones(4) / 4.0,
        FreqPolicy::Empirical,
      )
    }
    "HKY" | "HKY85" => {
      require_dna(name)?;
      (
        transversion_transition_W(param(0, name)?),
        Array1::<f64>::ones(4) / 4.0,
        FreqPolicy::Empirical,
      )
    }
    "GTR" => {
      require_dna(name)?;
      if params.len() != 6 {
        return make_error!(
          "GTR expects 6 exchangeability rates (AC/AG/AT/CG/CT/GT), got {}",
          params.len()
        );
      }
      let mut W = Array2::<f64>::zeros((4, 4));
      let pairs = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
      for (&rate, &(i, j)) in params.iter().zip(pairs.iter()) {
        W[[i, j]] = rate;
        W[[j, i]] = rate;
      }
      (W, Array1::<f64>::ones(4) / 4.0, FreqPolicy::Empirical)
    }
    _ => {
      return make_error!(
        "Unknown model family: '{name}'. Supported families: JC, JC69, K80, K2P, F81, HKY, HKY85, GTR, POISSON, MK"
      )
    }
  };

  match user_freqs {
    Some(pi) => {
      if pi.len() != num_states {
        return make_error!(
          "The number of frequencies ({}) is different from the number of states ({num_states}). Please check and try again!",
          pi.len()
        );
      }
      Ok((W, pi.clone(), FreqPolicy::UserDefined))
    }
    None => Ok((W, default_pi, policy)),
  }
}

fn validate_dna_freqs(pi: &Array1<f64>, model: &str) -> Result<(), Report> {
  if pi.len() != 4 {
    return make_error!("When creating model '{model}': expected 4 state frequencies, got {}", pi.len());
  }
  if pi.iter().any(|&f| f <= 0.0) {
    return make_error!("When creating model '{model}': state frequencies must be positive");
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;
  use eyre::Report;
  use rstest::rstest;

  #[rstest]
  fn k80_transitions_exceed_transversions() -> Result<(), Report> {
    let model = k80(4.0)?;
    let Q = model.q_matrix(0);
    assert!(Q[[0, 2]] > Q[[0, 1]]);
    assert!(Q[[1, 3]] > Q[[1, 0]]);
    Ok(())
  }

  #[rstest]
  fn gtr_keeps_detailed_balance() -> Result<(), Report> {
    let pi = array![0.3, 0.2, 0.2, 0.3];
    let model = gtr(&[1.0, 2.0, 1.5, 0.5, 3.0, 1.0], pi.clone())?;
    let Q = model.q_matrix(0);

    let pi = model.freqs();
    for i in 0..4 {
      for j in 0..4 {
        assert_abs_diff_eq!(pi[i] * Q[[i, j]], pi[j] * Q[[j, i]], epsilon = 1e-12);
      }
    }
    Ok(())
  }

  #[rstest]
  fn rejects_wrong_rate_count() {
    let pi = array![0.25, 0.25, 0.25, 0.25];
    assert!(gtr(&[1.0, 2.0], pi).is_err());
  }
}
