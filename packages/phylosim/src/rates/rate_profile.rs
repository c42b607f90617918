use crate::make_error;
use eyre::Report;
use rand::Rng;
use rand_distr::{Distribution, Gamma as GammaDistr};
use statrs::distribution::{ContinuousCDF, Gamma};

/// Gamma-distributed rate heterogeneity: either `categories` discrete
/// categories (Yang 1994, mean of equal-probability quantile bins) or a
/// continuous per-site draw.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GammaSpec {
  pub alpha: f64,
  pub categories: usize,
  pub continuous: bool,
}

/// Free-rate heterogeneity: explicit category weights and rates
#[derive(Clone, Debug, PartialEq)]
pub struct FreeRates {
  pub weights: Vec<f64>,
  pub rates: Vec<f64>,
}

/// Among-site rate variation parsed from the model description
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RateSpec {
  pub p_invar: f64,
  pub gamma: Option<GammaSpec>,
  pub free_rates: Option<FreeRates>,
}

impl RateSpec {
  pub fn is_uniform(&self) -> bool {
    self.p_invar == 0.0 && self.gamma.is_none() && self.free_rates.is_none()
  }

  pub fn is_continuous_gamma(&self) -> bool {
    self.gamma.map_or(false, |g| g.continuous)
  }
}

/// Mean rate within each of `categories` equal-probability bins of a
/// Gamma(alpha, alpha) distribution (unit mean), renormalized to mean one.
pub fn discrete_gamma_rates(alpha: f64, categories: usize) -> Result<Vec<f64>, Report> {
  if alpha <= 0.0 {
    return make_error!("Gamma shape must be positive, got {alpha}");
  }
  if categories == 0 {
    return make_error!("At least one gamma rate category is required");
  }

  let gamma = Gamma::new(alpha, alpha).map_err(|err| eyre::eyre!("When constructing gamma distribution: {err}"))?;
  let gamma_plus = Gamma::new(alpha + 1.0, alpha).map_err(|err| eyre::eyre!("When constructing gamma distribution: {err}"))?;

  let k = categories as f64;
  let mut boundaries = Vec::with_capacity(categories + 1);
  boundaries.push(0.0);
  for i in 1..categories {
    boundaries.push(gamma.inverse_cdf(i as f64 / k));
  }
  boundaries.push(f64::INFINITY);

  // E[X | b_i < X < b_{i+1}] * Pr(bin) summed over bins equals 1, and
  // Pr(bin) = 1/k, so the bin mean is k times the partial expectation.
  let mut rates: Vec<f64> = (0..categories)
    .map(|i| {
      let hi = if boundaries[i + 1].is_finite() { gamma_plus.cdf(boundaries[i + 1]) } else { 1.0 };
      let lo = gamma_plus.cdf(boundaries[i]);
      k * (hi - lo)
    })
    .collect();

  let mean: f64 = rates.iter().sum::<f64>() / k;
  for rate in &mut rates {
    *rate /= mean;
  }

  Ok(rates)
}

/// Per-site rate multipliers and mixture class indices, produced once before
/// simulation and extended whenever an insertion creates new sites. Empty
/// vectors mean "no heterogeneity" and "single model class" respectively.
#[derive(Clone, Debug)]
pub struct RateProfile {
  spec: RateSpec,
  mixture_cum_weights: Vec<f64>,
  /// Rate and cumulative probability per discrete category; empty for
  /// continuous-gamma profiles
  category_rates: Vec<f64>,
  category_cum_probs: Vec<f64>,
  pub site_rates: Vec<f64>,
  pub site_classes: Vec<usize>,
  pub site_categories: Vec<usize>,
  pub continuous: bool,
}

impl RateProfile {
  pub fn generate(
    spec: &RateSpec,
    mixture_weights: &[f64],
    length: usize,
    rng: &mut impl Rng,
  ) -> Result<Self, Report> {
    let mixture_cum_weights = if mixture_weights.len() > 1 {
      cumulative(mixture_weights)
    } else {
      vec![]
    };

    let (category_rates, category_cum_probs) = Self::categories(spec)?;
    let continuous = spec.is_continuous_gamma();

    let mut profile = Self {
      spec: spec.clone(),
      mixture_cum_weights,
      category_rates,
      category_cum_probs,
      site_rates: vec![],
      site_classes: vec![],
      site_categories: vec![],
      continuous,
    };

    profile.insert_sites(0, length, rng)?;
    Ok(profile)
  }

  /// Discrete categories implied by the rate spec: invariant sites at rate 0,
  /// then gamma or free-rate categories rescaled so that the overall mean
  /// stays at one.
  fn categories(spec: &RateSpec) -> Result<(Vec<f64>, Vec<f64>), Report> {
    if spec.is_uniform() || spec.is_continuous_gamma() {
      return Ok((vec![], vec![]));
    }

    let p_invar = spec.p_invar;
    let mut rates = vec![];
    let mut probs = vec![];
    if p_invar > 0.0 {
      rates.push(0.0);
      probs.push(p_invar);
    }

    if let Some(gamma) = &spec.gamma {
      let gamma_rates = discrete_gamma_rates(gamma.alpha, gamma.categories)?;
      for rate in gamma_rates {
        rates.push(rate / (1.0 - p_invar));
        probs.push((1.0 - p_invar) / gamma.categories as f64);
      }
    } else if let Some(free) = &spec.free_rates {
      let weight_sum: f64 = free.weights.iter().sum();
      let mean: f64 = free
        .weights
        .iter()
        .zip(free.rates.iter())
        .map(|(w, r)| w / weight_sum * r)
        .sum();
      for (&w, &r) in free.weights.iter().zip(free.rates.iter()) {
        rates.push(r / mean / (1.0 - p_invar));
        probs.push((1.0 - p_invar) * w / weight_sum);
      }
    } else {
      // invariant sites only: variable sites keep the mean at one
      rates.push(1.0 / (1.0 - p_invar));
      probs.push(1.0 - p_invar);
    }

    Ok((rates, cumulative(&probs)))
  }

  #[inline]
  pub fn has_site_rates(&self) -> bool {
    !self.site_rates.is_empty()
  }

  #[inline]
  pub fn has_classes(&self) -> bool {
    !self.site_classes.is_empty()
  }

  #[inline]
  pub fn rate(&self, site: usize) -> f64 {
    if self.site_rates.is_empty() {
      1.0
    } else {
      self.site_rates[site]
    }
  }

  #[inline]
  pub fn class(&self, site: usize) -> usize {
    if self.site_classes.is_empty() {
      0
    } else {
      self.site_classes[site]
    }
  }

  /// Distinct categorical rates, usable to cache one transition matrix per
  /// (class, category) pair. Empty under continuous gamma.
  #[inline]
  pub fn category_rates(&self) -> &[f64] {
    &self.category_rates
  }

  #[inline]
  pub fn category(&self, site: usize) -> usize {
    if self.site_categories.is_empty() {
      0
    } else {
      self.site_categories[site]
    }
  }

  /// Samples rates and classes for `len` new sites spliced in at `pos`
  pub fn insert_sites(&mut self, pos: usize, len: usize, rng: &mut impl Rng) -> Result<(), Report> {
    if !self.mixture_cum_weights.is_empty() {
      let classes = (0..len).map(|_| sample_cumulative(&self.mixture_cum_weights, rng));
      self.site_classes.splice(pos..pos, classes.collect::<Vec<_>>());
    }

    if self.continuous {
      let gamma = self.spec.gamma.expect("continuous profile implies a gamma spec");
      let distr = GammaDistr::new(gamma.alpha, 1.0 / gamma.alpha)
        .map_err(|err| eyre::eyre!("When constructing gamma distribution: {err}"))?;
      let p_invar = self.spec.p_invar;
      let rates: Vec<f64> = (0..len)
        .map(|_| {
          if p_invar > 0.0 && rng.gen::<f64>() < p_invar {
            0.0
          } else {
            distr.sample(rng) / (1.0 - p_invar)
          }
        })
        .collect();
      self.site_rates.splice(pos..pos, rates);
    } else if !self.category_rates.is_empty() {
      let mut rates = Vec::with_capacity(len);
      let mut categories = Vec::with_capacity(len);
      for _ in 0..len {
        let cat = sample_cumulative(&self.category_cum_probs, rng);
        categories.push(cat);
        rates.push(self.category_rates[cat]);
      }
      self.site_rates.splice(pos..pos, rates);
      self.site_categories.splice(pos..pos, categories);
    }

    Ok(())
  }
}

fn cumulative(weights: &[f64]) -> Vec<f64> {
  let total: f64 = weights.iter().sum();
  let mut acc = 0.0;
  weights
    .iter()
    .map(|w| {
      acc += w / total;
      acc
    })
    .collect()
}

fn sample_cumulative(cum: &[f64], rng: &mut impl Rng) -> usize {
  let r: f64 = rng.gen();
  cum.iter().position(|&c| r <= c).unwrap_or(cum.len() - 1)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::utils::random::get_random_number_generator;
  use approx::assert_abs_diff_eq;
  use eyre::Report;
  use rstest::rstest;

  #[rstest]
  fn gamma_category_rates_have_unit_mean() -> Result<(), Report> {
    for &alpha in &[0.1, 0.5, 1.0, 2.0, 10.0] {
      let rates = discrete_gamma_rates(alpha, 4)?;
      assert_eq!(rates.len(), 4);
      assert_abs_diff_eq!(rates.iter().sum::<f64>() / 4.0, 1.0, epsilon = 1e-9);
      assert!(rates.windows(2).all(|w| w[0] < w[1]));
    }
    Ok(())
  }

  #[rstest]
  fn uniform_spec_yields_empty_profile() -> Result<(), Report> {
    let mut rng = get_random_number_generator(Some(42));
    let profile = RateProfile::generate(&RateSpec::default(), &[1.0], 100, &mut rng)?;
    assert!(!profile.has_site_rates());
    assert!(!profile.has_classes());
    assert_abs_diff_eq!(profile.rate(57), 1.0);
    assert_eq!(profile.class(57), 0);
    Ok(())
  }

  #[rstest]
  fn invariant_sites_have_zero_rate() -> Result<(), Report> {
    let mut rng = get_random_number_generator(Some(42));
    let spec = RateSpec {
      p_invar: 0.3,
      ..RateSpec::default()
    };
    let profile = RateProfile::generate(&spec, &[1.0], 10_000, &mut rng)?;

    let num_invariant = profile.site_rates.iter().filter(|&&r| r == 0.0).count();
    let fraction = num_invariant as f64 / 10_000.0;
    assert!((fraction - 0.3).abs() < 0.03, "invariant fraction {fraction} too far from 0.3");

    let mean: f64 = profile.site_rates.iter().sum::<f64>() / 10_000.0;
    assert!((mean - 1.0).abs() < 0.05, "mean rate {mean} too far from 1.0");
    Ok(())
  }

  #[rstest]
  fn inserted_sites_extend_the_profile() -> Result<(), Report> {
    let mut rng = get_random_number_generator(Some(7));
    let spec = RateSpec {
      p_invar: 0.0,
      gamma: Some(GammaSpec {
        alpha: 0.5,
        categories: 4,
        continuous: false,
      }),
      free_rates: None,
    };
    let mut profile = RateProfile::generate(&spec, &[0.5, 0.5], 50, &mut rng)?;
    assert_eq!(profile.site_rates.len(), 50);
    assert_eq!(profile.site_classes.len(), 50);

    profile.insert_sites(10, 5, &mut rng)?;
    assert_eq!(profile.site_rates.len(), 55);
    assert_eq!(profile.site_classes.len(), 55);
    assert_eq!(profile.site_categories.len(), 55);
    Ok(())
  }
}
