use crate::alphabet::alphabet::State;
use crate::constants::MAX_SAMPLING_ATTEMPTS;
use crate::make_error;
use eyre::Report;
use rand::Rng;
use std::collections::HashMap;

/// One site-permutation target of the functional divergence operator: the
/// state at `selected_site` overwrites the state at `new_position`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunDiItem {
  pub selected_site: usize,
  pub new_position: usize,
}

/// Selects `round(proportion * num_sites)` distinct sites and pairs each with
/// a new position drawn from the same set, such that no site maps to itself.
pub fn select_and_permute_sites(
  proportion: f64,
  num_sites: usize,
  rng: &mut impl Rng,
) -> Result<Vec<FunDiItem>, Report> {
  assert!(proportion < 1.0);

  let num_selected = (proportion * num_sites as f64).round() as usize;
  if num_selected < 2 {
    return make_error!(
      "Functional divergence requires at least two selected sites; the proportion {proportion} of {num_sites} sites \
       selects {num_selected}"
    );
  }

  // select distinct sites one by one
  let mut selected: Vec<usize> = Vec::with_capacity(num_selected);
  for i in 0..num_selected {
    for _ in 0..MAX_SAMPLING_ATTEMPTS {
      let site = rng.gen_range(0..num_sites);
      if !selected.contains(&site) {
        selected.push(site);
        break;
      }
    }
    if selected.len() <= i {
      return make_error!(
        "Failed to select random sites for permutations (of the functional divergence model) after {MAX_SAMPLING_ATTEMPTS} attempts"
      );
    }
  }

  // pair all but the last site with a new position from the shrinking pool
  let mut items: Vec<FunDiItem> = Vec::with_capacity(num_selected);
  let mut position_pool = selected.clone();
  for i in 0..num_selected - 1 {
    for _ in 0..MAX_SAMPLING_ATTEMPTS {
      let pool_index = rng.gen_range(0..position_pool.len());
      let new_position = position_pool[pool_index];
      if new_position == selected[i] {
        continue;
      }
      items.push(FunDiItem {
        selected_site: selected[i],
        new_position,
      });
      position_pool.remove(pool_index);
      break;
    }
    if items.len() <= i {
      return make_error!(
        "Failed to select positions to permute the selected sites (of the functional divergence model) after {MAX_SAMPLING_ATTEMPTS} attempts"
      );
    }
  }

  // the last site takes the last pool entry, swapping with the first pair if
  // that would map it onto itself
  assert_eq!(position_pool.len(), 1);
  let last_site = selected[num_selected - 1];
  if last_site != position_pool[0] {
    items.push(FunDiItem {
      selected_site: last_site,
      new_position: position_pool[0],
    });
  } else {
    items.push(FunDiItem {
      selected_site: last_site,
      new_position: items[0].new_position,
    });
    items[0].new_position = position_pool[0];
  }

  Ok(items)
}

/// Applies the permutation to one sequence: selected states are cached first,
/// then written to their targets, so overlapping pairs see original states.
pub fn permute_selected_sites(items: &[FunDiItem], seq: &mut [State]) {
  let cached: HashMap<usize, State> = items.iter().map(|item| (item.selected_site, seq[item.selected_site])).collect();
  for item in items {
    seq[item.new_position] = cached[&item.selected_site];
  }
}
