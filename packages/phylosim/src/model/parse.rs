use crate::alphabet::alphabet::Alphabet;
use crate::constants::DEFAULT_GAMMA_CATEGORIES;
use crate::make_error;
use crate::model::catalog::family_matrices;
use crate::model::subst_model::{FreqPolicy, SubstComponent, SubstModel};
use crate::rates::rate_profile::{FreeRates, GammaSpec, RateSpec};
use eyre::{Report, WrapErr};
use log::warn;
use ndarray::Array1;

/// Splits on `sep` at brace depth zero, so that separators inside `{...}`
/// stay attached to their token.
fn split_top_level(s: &str, sep: char) -> Vec<String> {
  let mut tokens = vec![];
  let mut depth = 0_i32;
  let mut current = String::new();
  for c in s.chars() {
    match c {
      '{' => {
        depth += 1;
        current.push(c);
      }
      '}' => {
        depth -= 1;
        current.push(c);
      }
      c if c == sep && depth == 0 => {
        tokens.push(std::mem::take(&mut current));
      }
      _ => current.push(c),
    }
  }
  tokens.push(current);
  tokens
}

/// Splits `NAME{p1/p2/...}` into the name and its numeric parameters
fn split_name_params(token: &str) -> Result<(String, Vec<f64>), Report> {
  match token.find('{') {
    None => Ok((token.to_owned(), vec![])),
    Some(open) => {
      if !token.ends_with('}') {
        return make_error!("Unbalanced braces in model token '{token}'");
      }
      let name = token[..open].to_owned();
      let params = parse_number_list(&token[open + 1..token.len() - 1])?;
      Ok((name, params))
    }
  }
}

fn parse_number_list(s: &str) -> Result<Vec<f64>, Report> {
  s.split(|c| c == '/' || c == ',')
    .filter(|part| !part.is_empty())
    .map(|part| {
      part
        .trim()
        .parse::<f64>()
        .map_err(|_| eyre::eyre!("Invalid number '{part}'"))
    })
    .collect()
}

struct ComponentSpec {
  family: String,
  params: Vec<f64>,
  weight: f64,
}

/// Parses a model description like `HKY{2.0}+F{0.1/0.4/0.4/0.1}+G4{0.5}+I{0.2}`
/// or `MIX{JC:0.3,HKY{2.0}:0.7}+G{1.0}` into the substitution model and the
/// among-site rate specification.
pub fn parse_model(spec: &str, alphabet: &Alphabet) -> Result<(SubstModel, RateSpec), Report> {
  parse_model_impl(spec, alphabet).wrap_err_with(|| format!("When parsing model description '{spec}'"))
}

fn parse_model_impl(spec: &str, alphabet: &Alphabet) -> Result<(SubstModel, RateSpec), Report> {
  let spec = spec.trim().replace('*', "+");
  if spec.is_empty() {
    return make_error!("Model description is empty");
  }

  let tokens = split_top_level(&spec, '+');
  let (family_token, modifiers) = tokens.split_first().expect("split always yields at least one token");

  // collect component specs: a single family, or MIX{...}
  let component_specs: Vec<ComponentSpec> = if family_token.to_uppercase().starts_with("MIX{") {
    if !family_token.ends_with('}') {
      return make_error!("Use MIX{{m1,...,mK}} to define a mixture model");
    }
    let inner = &family_token["MIX{".len()..family_token.len() - 1];
    let parts = split_top_level(inner, ',');
    if parts.len() < 2 {
      return make_error!("Use MIX{{m1,...,mK}} to define a mixture model");
    }
    parts
      .iter()
      .map(|part| {
        let (token, weight) = match part.rfind(':') {
          Some(colon) if !part[colon + 1..].contains('}') => {
            let weight: f64 = part[colon + 1..]
              .parse()
              .map_err(|_| eyre::eyre!("Invalid mixture weight in '{part}'"))?;
            (&part[..colon], weight)
          }
          _ => (part.as_ref(), 1.0),
        };
        let (family, params) = split_name_params(token)?;
        Ok(ComponentSpec {
          family: family.to_uppercase(),
          params,
          weight,
        })
      })
      .collect::<Result<Vec<ComponentSpec>, Report>>()?
  } else {
    let (family, params) = split_name_params(family_token)?;
    vec![ComponentSpec {
      family: family.to_uppercase(),
      params,
      weight: 1.0,
    }]
  };

  // modifiers
  let mut user_freqs: Option<Array1<f64>> = None;
  let mut rate_spec = RateSpec::default();
  let mut ascertainment = false;
  let mut dna_error_prob = 0.0;

  for modifier in modifiers {
    let (name, params) = split_name_params(modifier)?;
    let name = name.to_uppercase();
    match name.as_str() {
      "F" => {
        if params.is_empty() {
          return make_error!("Use +F{{f1/.../fN}} to specify state frequencies");
        }
        user_freqs = Some(Array1::from_vec(params));
      }
      "FQ" => {
        user_freqs = Some(Array1::<f64>::ones(alphabet.num_states) / (alphabet.num_states as f64));
      }
      "ASC" => ascertainment = true,
      "E" => {
        let prob = params
          .first()
          .copied()
          .ok_or_else(|| eyre::eyre!("Use +E{{<PROB>}} to specify the sequencing error probability"))?;
        if !(0.0..=1.0).contains(&prob) {
          return make_error!("Sequencing error probability must be in [0, 1], got {prob}");
        }
        dna_error_prob = prob;
      }
      "I" => {
        rate_spec.p_invar = match params.first() {
          Some(&p) if (0.0..1.0).contains(&p) => p,
          Some(&p) => return make_error!("Proportion of invariant sites must be in [0, 1), got {p}"),
          None => {
            warn!("Invariant rate is now set to Zero since it has not been specified");
            0.0
          }
        };
      }
      name if name.starts_with("GC") => {
        let alpha = params
          .first()
          .copied()
          .ok_or_else(|| eyre::eyre!("Use +GC{{<ALPHA>}} to specify the continuous gamma shape"))?;
        rate_spec.gamma = Some(GammaSpec {
          alpha,
          categories: 0,
          continuous: true,
        });
      }
      name if name.starts_with('G') => {
        let categories = if name.len() > 1 {
          name[1..]
            .parse::<usize>()
            .map_err(|_| eyre::eyre!("Invalid number of gamma categories in '+{name}'"))?
        } else {
          DEFAULT_GAMMA_CATEGORIES
        };
        let alpha = params
          .first()
          .copied()
          .ok_or_else(|| eyre::eyre!("Use +G{{<ALPHA>}} to specify the gamma shape"))?;
        rate_spec.gamma = Some(GammaSpec {
          alpha,
          categories,
          continuous: false,
        });
      }
      name if name.starts_with('R') => {
        let categories = if name.len() > 1 {
          name[1..]
            .parse::<usize>()
            .map_err(|_| eyre::eyre!("Invalid number of free-rate categories in '+{name}'"))?
        } else {
          params.len() / 2
        };
        if params.len() != 2 * categories || categories == 0 {
          return make_error!("Use +R{{w1,r1,...,wK,rK}} to specify free rates (got {} numbers)", params.len());
        }
        let weights = params.iter().step_by(2).copied().collect();
        let rates = params.iter().skip(1).step_by(2).copied().collect();
        rate_spec.free_rates = Some(FreeRates { weights, rates });
      }
      _ => return make_error!("Unknown model modifier: '+{name}'"),
    }
  }

  if rate_spec.gamma.is_some() && rate_spec.free_rates.is_some() {
    return make_error!("Gamma rates (+G) and free rates (+R) cannot be combined");
  }

  // build the components
  let mut components = Vec::with_capacity(component_specs.len());
  let mut warned_empirical = false;
  for spec in &component_specs {
    let (w, pi, policy) = family_matrices(&spec.family, &spec.params, user_freqs.as_ref(), alphabet.num_states)?;
    if policy == FreqPolicy::Empirical && !warned_empirical {
      warn!(
        "{} must have unequal base frequencies. The base frequencies could be randomly generated if users do not \
         provide them. However, we strongly recommend users specify the base frequencies by using \
         +F{{freq1/.../freqN}} for better simulation accuracy.",
        spec.family
      );
      warned_empirical = true;
    }
    let mut component = SubstComponent::new(w, pi, spec.weight, policy)?;
    component.dna_error_prob = dna_error_prob;
    components.push(component);
  }

  let mut model = SubstModel::new(spec.clone(), components)?;
  model.ascertainment = ascertainment;

  Ok((model, rate_spec))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alphabet::alphabet::SeqKind;
  use approx::assert_abs_diff_eq;
  use eyre::Report;
  use ndarray::array;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn dna() -> Alphabet {
    Alphabet::new(SeqKind::Dna).unwrap()
  }

  #[rstest]
  fn parses_plain_jc() -> Result<(), Report> {
    let (model, rates) = parse_model("JC", &dna())?;
    assert_eq!(model.n_mixtures(), 1);
    assert!(!model.is_mixture());
    assert!(!model.ascertainment);
    assert!(rates.is_uniform());
    Ok(())
  }

  #[rstest]
  fn parses_hky_with_freqs_and_gamma() -> Result<(), Report> {
    let (model, rates) = parse_model("HKY{2.0}+F{0.1/0.4/0.4/0.1}+G4{0.5}", &dna())?;
    assert_abs_diff_eq!(model.freqs(), array![0.1, 0.4, 0.4, 0.1], epsilon = 1e-12);
    assert_eq!(
      rates.gamma,
      Some(GammaSpec {
        alpha: 0.5,
        categories: 4,
        continuous: false
      })
    );
    Ok(())
  }

  #[rstest]
  fn parses_mixture_with_weights() -> Result<(), Report> {
    let (model, _) = parse_model("MIX{JC:0.3,HKY{2.0}:0.7}", &dna())?;
    assert_eq!(model.n_mixtures(), 2);
    let weights = model.mixture_weights();
    assert_abs_diff_eq!(weights[0], 0.3, epsilon = 1e-12);
    assert_abs_diff_eq!(weights[1], 0.7, epsilon = 1e-12);
    Ok(())
  }

  #[rstest]
  fn parses_asc_and_error_modifiers() -> Result<(), Report> {
    let (model, _) = parse_model("JC+ASC+E{0.01}", &dna())?;
    assert!(model.ascertainment);
    assert!(model.contains_dna_error());
    assert_abs_diff_eq!(model.dna_error_prob(0), 0.01);
    Ok(())
  }

  #[rstest]
  fn parses_invariant_and_free_rates() -> Result<(), Report> {
    let (_, rates) = parse_model("JC+I{0.2}+R2{0.6,0.5,0.4,1.75}", &dna())?;
    assert_abs_diff_eq!(rates.p_invar, 0.2);
    let free = rates.free_rates.expect("free rates should be parsed");
    assert_eq!(free.weights, vec![0.6, 0.4]);
    assert_eq!(free.rates, vec![0.5, 1.75]);
    Ok(())
  }

  #[rstest]
  fn rejects_unknown_family() {
    assert!(parse_model("LG", &dna()).is_err());
  }

  #[rstest]
  fn rejects_gamma_without_shape() {
    assert!(parse_model("JC+G", &dna()).is_err());
  }
}
