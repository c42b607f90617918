use crate::constants::{DEFAULT_GAMMA_CATEGORIES, FALLBACK_CONSTANT_PATTERN_PROB, LENGTH_RATIO_MARGIN};
use crate::model::subst_model::SubstModel;
use crate::rates::rate_profile::{discrete_gamma_rates, RateSpec};
use crate::tree::tree::{NodeId, PhyloTree};
use eyre::Report;
use log::warn;
use ndarray::prelude::*;

/// Estimates the oversampling ratio `rho >= 1` for ascertainment-bias
/// correction: simulating `ceil(L * rho)` sites yields at least `L` variant
/// sites with high probability. Without the correction the ratio is 1; a user
/// override is taken verbatim. The correction flag is switched off for the
/// likelihood computation and restored on every exit path.
pub fn estimate_length_ratio(
  model: &mut SubstModel,
  rate_spec: &RateSpec,
  tree: &PhyloTree,
  beta: f64,
  user_override: Option<f64>,
) -> Result<f64, Report> {
  if !model.ascertainment {
    return Ok(1.0);
  }

  if let Some(ratio) = user_override {
    return Ok(ratio);
  }

  if tree.rooted {
    warn!("The input tree is treated as unrooted while estimating the ascertainment length ratio.");
  }

  let saved_ascertainment = model.ascertainment;
  model.ascertainment = false;
  let p_const = constant_pattern_probability(model, rate_spec, tree, beta);
  model.ascertainment = saved_ascertainment;

  let p_const = if !p_const.is_finite() || p_const > 1.0 {
    warn!("The probability of constant patterns could not be estimated reliably; falling back to a safe default.");
    FALLBACK_CONSTANT_PATTERN_PROB
  } else {
    p_const
  };

  Ok(1.0 / (1.0 - p_const) + LENGTH_RATIO_MARGIN)
}

/// Sum over all states of the likelihood of the all-constant site pattern,
/// averaged over mixture classes and rate categories.
fn constant_pattern_probability(model: &SubstModel, rate_spec: &RateSpec, tree: &PhyloTree, beta: f64) -> f64 {
  let categories = rate_categories(rate_spec);
  let weights = model.mixture_weights();

  let mut p_const = 0.0;
  for (mix, &mix_weight) in weights.iter().enumerate() {
    for &(cat_prob, rate) in &categories {
      for state in 0..model.num_states() {
        p_const += mix_weight * cat_prob * pattern_likelihood(model, tree, mix, rate * beta, state);
      }
    }
  }
  p_const
}

/// Probability categories of the among-site rate model. Continuous gamma is
/// approximated by its discrete counterpart for the purpose of estimation.
fn rate_categories(rate_spec: &RateSpec) -> Vec<(f64, f64)> {
  let p_invar = rate_spec.p_invar;
  let mut categories = vec![];
  if p_invar > 0.0 {
    categories.push((p_invar, 0.0));
  }

  if let Some(gamma) = &rate_spec.gamma {
    let num_cats = if gamma.continuous { DEFAULT_GAMMA_CATEGORIES } else { gamma.categories };
    if let Ok(rates) = discrete_gamma_rates(gamma.alpha, num_cats) {
      for rate in rates {
        categories.push(((1.0 - p_invar) / num_cats as f64, rate / (1.0 - p_invar)));
      }
    }
  } else if let Some(free) = &rate_spec.free_rates {
    let weight_sum: f64 = free.weights.iter().sum();
    let mean: f64 = free
      .weights
      .iter()
      .zip(free.rates.iter())
      .map(|(w, r)| w / weight_sum * r)
      .sum();
    for (&w, &r) in free.weights.iter().zip(free.rates.iter()) {
      categories.push(((1.0 - p_invar) * w / weight_sum, r / mean / (1.0 - p_invar)));
    }
  } else {
    categories.push((1.0 - p_invar, 1.0 / (1.0 - p_invar)));
  }

  categories
}

/// Felsenstein pruning for the pattern in which every leaf holds `state`,
/// under mixture class `mix` with all branch lengths scaled by `rate`
fn pattern_likelihood(model: &SubstModel, tree: &PhyloTree, mix: usize, rate: f64, state: usize) -> f64 {
  let num_states = model.num_states();

  // preorder, processed in reverse for a postorder sweep
  let mut order: Vec<(NodeId, Option<NodeId>)> = vec![];
  tree.visit_dfs(|_, node, dad| order.push((node, dad)));

  let mut partials: Vec<Array1<f64>> = vec![Array1::zeros(num_states); tree.nodes.len()];
  for &(node, dad) in order.iter().rev() {
    let children = tree.children(node, dad);
    if children.is_empty() {
      partials[node] = Array1::zeros(num_states);
      partials[node][state] = 1.0;
      continue;
    }

    let mut partial = Array1::<f64>::ones(num_states);
    for edge_index in children {
      let edge = &tree.nodes[node].neighbors[edge_index];
      let p = model.p_matrix(edge.length * rate, mix);
      partial = partial * p.dot(&partials[edge.target]);
    }
    partials[node] = partial;
  }

  model.state_frequency(mix).dot(&partials[tree.root])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::nwk::read_nwk_str;
  use crate::model::catalog::jc;
  use approx::assert_abs_diff_eq;
  use eyre::Report;
  use rstest::rstest;

  #[rstest]
  fn ratio_is_one_without_ascertainment() -> Result<(), Report> {
    let mut model = jc(4)?;
    let tree = read_nwk_str("(A:0.1,B:0.1);")?;
    let ratio = estimate_length_ratio(&mut model, &RateSpec::default(), &tree, 1.0, None)?;
    assert_abs_diff_eq!(ratio, 1.0);
    Ok(())
  }

  #[rstest]
  fn user_override_is_taken_verbatim() -> Result<(), Report> {
    let mut model = jc(4)?;
    model.ascertainment = true;
    let tree = read_nwk_str("(A:0.1,B:0.1);")?;
    let ratio = estimate_length_ratio(&mut model, &RateSpec::default(), &tree, 1.0, Some(3.5))?;
    assert_abs_diff_eq!(ratio, 3.5);
    assert!(model.ascertainment, "the correction flag must be restored");
    Ok(())
  }

  #[rstest]
  fn estimated_ratio_exceeds_one_and_restores_flag() -> Result<(), Report> {
    let mut model = jc(4)?;
    model.ascertainment = true;
    let tree = read_nwk_str("((A:0.2,B:0.2):0.1,(C:0.2,D:0.2):0.1);")?;
    let ratio = estimate_length_ratio(&mut model, &RateSpec::default(), &tree, 1.0, None)?;

    assert!(ratio > 1.0 + LENGTH_RATIO_MARGIN);
    assert!(ratio < 10.0, "short branches keep the constant-pattern probability moderate, got {ratio}");
    assert!(model.ascertainment, "the correction flag must be restored");
    Ok(())
  }

  #[rstest]
  fn zero_branch_tree_is_all_constant() -> Result<(), Report> {
    let model = jc(4)?;
    let tree = read_nwk_str("(A:0.0,B:0.0);")?;
    let mut total = 0.0;
    for state in 0..4 {
      total += pattern_likelihood(&model, &tree, 0, 1.0, state);
    }
    // with zero branch lengths every site pattern is constant
    assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
    Ok(())
  }
}
