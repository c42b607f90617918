use crate::constants::MAX_SAMPLING_ATTEMPTS;
use crate::make_error;
use eyre::Report;
use rand::Rng;
use rand_distr::{Distribution, Gamma, Geometric, Poisson, Zipf};
use std::str::FromStr;

/// Distribution of insertion/deletion lengths. Sizes are drawn per event;
/// non-positive draws are rejected and retried by the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum IndelDistribution {
  /// Negative binomial with `r` successes and success probability `p`,
  /// sampled through its Poisson-Gamma mixture representation
  NegBin { r: f64, p: f64 },
  /// Zipf distribution with exponent `a`, truncated at `max`
  Zipf { a: f64, max: u64 },
  /// Lavalette distribution with exponent `a`, truncated at `max`
  Lav { a: f64, max: usize, cum_weights: Vec<f64> },
  /// Geometric distribution of sizes `>= 1` with success probability `p`
  Geo { p: f64 },
  /// User-defined size probabilities: entry `i` is the probability of size `i+1`
  User { cum_probs: Vec<f64> },
}

impl IndelDistribution {
  pub fn geo(p: f64) -> Self {
    IndelDistribution::Geo { p }
  }

  fn lav(a: f64, max: usize) -> Self {
    let n = max as f64;
    let weights: Vec<f64> = (1..=max)
      .map(|k| {
        let k = k as f64;
        (k * n / (n - k + 1.0)).powf(-a)
      })
      .collect();
    let total: f64 = weights.iter().sum();
    let mut acc = 0.0;
    let cum_weights = weights
      .iter()
      .map(|w| {
        acc += w / total;
        acc
      })
      .collect();
    IndelDistribution::Lav { a, max, cum_weights }
  }

  fn user(probs: Vec<f64>) -> Result<Self, Report> {
    if probs.is_empty() || probs.iter().any(|&p| p < 0.0) {
      return make_error!("User-defined indel-size distribution requires a non-empty list of non-negative probabilities");
    }
    let total: f64 = probs.iter().sum();
    if total <= 0.0 {
      return make_error!("User-defined indel-size distribution must contain at least one positive probability");
    }
    let mut acc = 0.0;
    let cum_probs = probs
      .iter()
      .map(|p| {
        acc += p / total;
        acc
      })
      .collect();
    Ok(IndelDistribution::User { cum_probs })
  }

  /// One draw from the size distribution; may be zero
  pub fn sample(&self, rng: &mut impl Rng) -> Result<usize, Report> {
    Ok(match self {
      IndelDistribution::NegBin { r, p } => {
        let lambda_distr =
          Gamma::new(*r, (1.0 - p) / p).map_err(|err| eyre::eyre!("When sampling negative binomial: {err}"))?;
        let lambda = lambda_distr.sample(rng);
        if lambda <= 0.0 {
          0
        } else {
          let poisson = Poisson::new(lambda).map_err(|err| eyre::eyre!("When sampling negative binomial: {err}"))?;
          poisson.sample(rng) as usize
        }
      }
      IndelDistribution::Zipf { a, max } => {
        let zipf = Zipf::new(*max, *a).map_err(|err| eyre::eyre!("When sampling Zipf: {err}"))?;
        zipf.sample(rng) as usize
      }
      IndelDistribution::Lav { cum_weights, .. } => {
        let r: f64 = rng.gen();
        cum_weights.iter().position(|&c| r <= c).unwrap_or(cum_weights.len() - 1) + 1
      }
      IndelDistribution::Geo { p } => {
        let geo = Geometric::new(*p).map_err(|err| eyre::eyre!("When sampling geometric: {err}"))?;
        // Geometric counts failures before the first success; sizes start at 1
        geo.sample(rng) as usize + 1
      }
      IndelDistribution::User { cum_probs } => {
        let r: f64 = rng.gen();
        cum_probs.iter().position(|&c| r <= c).unwrap_or(cum_probs.len() - 1) + 1
      }
    })
  }

  /// Draws a strictly positive size, retrying a bounded number of times
  pub fn sample_positive(&self, rng: &mut impl Rng, what: &str) -> Result<usize, Report> {
    for _ in 0..MAX_SAMPLING_ATTEMPTS {
      let size = self.sample(rng)?;
      if size > 0 {
        return Ok(size);
      }
    }
    make_error!(
      "Could not generate a positive length (for {what} events) based on the {what}-distribution within {MAX_SAMPLING_ATTEMPTS} attempts"
    )
  }

  /// Empirical mean size from `num_draws` draws, counting positive draws only
  pub fn empirical_mean(&self, num_draws: usize, rng: &mut impl Rng) -> Result<f64, Report> {
    let mut total = 0_usize;
    let mut num_success = 0_usize;
    for _ in 0..num_draws {
      let size = self.sample(rng)?;
      if size > 0 {
        total += size;
        num_success += 1;
      }
    }
    if num_success == 0 {
      return make_error!("Could not generate positive deletion-sizes from the deletion-distribution. Please check and try again!");
    }
    Ok(total as f64 / num_success as f64)
  }
}

impl FromStr for IndelDistribution {
  type Err = Report;

  /// Parses descriptions like `GEO{0.5}`, `NB{4/0.3}`, `ZIPF{1.5/100}`,
  /// `LAV{1.5/100}`, `USER{0.5/0.3/0.2}`
  fn from_str(s: &str) -> Result<Self, Report> {
    let s = s.trim();
    let (name, params) = match s.find('{') {
      Some(open) if s.ends_with('}') => {
        let params: Vec<f64> = s[open + 1..s.len() - 1]
          .split(|c| c == '/' || c == ',')
          .map(|part| {
            part
              .trim()
              .parse::<f64>()
              .map_err(|_| eyre::eyre!("Invalid number '{part}' in indel-size distribution '{s}'"))
          })
          .collect::<Result<Vec<f64>, Report>>()?;
        (s[..open].to_uppercase(), params)
      }
      _ => (s.to_uppercase(), vec![]),
    };

    let expect = |n: usize| -> Result<(), Report> {
      if params.len() != n {
        return make_error!("Indel-size distribution '{name}' expects {n} parameter(s), got {}", params.len());
      }
      Ok(())
    };

    match name.as_str() {
      "NB" | "NEGBIN" | "NEG_BIN" => {
        expect(2)?;
        let (r, p) = (params[0], params[1]);
        if r <= 0.0 || !(0.0..1.0).contains(&p) || p == 0.0 {
          return make_error!("Negative binomial requires r > 0 and 0 < p < 1, got r={r}, p={p}");
        }
        Ok(IndelDistribution::NegBin { r, p })
      }
      "ZIPF" => {
        expect(2)?;
        let (a, max) = (params[0], params[1]);
        if a <= 0.0 || max < 1.0 {
          return make_error!("Zipf requires a > 0 and max >= 1, got a={a}, max={max}");
        }
        Ok(IndelDistribution::Zipf { a, max: max as u64 })
      }
      "LAV" => {
        expect(2)?;
        let (a, max) = (params[0], params[1]);
        if a <= 0.0 || max < 1.0 {
          return make_error!("Lavalette requires a > 0 and max >= 1, got a={a}, max={max}");
        }
        Ok(IndelDistribution::lav(a, max as usize))
      }
      "GEO" => {
        expect(1)?;
        let p = params[0];
        if !(0.0..=1.0).contains(&p) || p == 0.0 {
          return make_error!("Geometric requires 0 < p <= 1, got p={p}");
        }
        Ok(IndelDistribution::geo(p))
      }
      "USER" => IndelDistribution::user(params),
      _ => make_error!("Unknown indel-size distribution: '{s}'. Expected one of: NB, ZIPF, LAV, GEO, USER"),
    }
  }
}
