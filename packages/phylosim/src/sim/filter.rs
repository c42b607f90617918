use crate::make_error;
use crate::sim::context::Simulator;
use eyre::Report;
use rand::Rng;

/// Per-column entry of the variant mask: the constant state observed so far,
/// or `VARIANT` once two distinct non-gap states were seen.
const VARIANT: i64 = -1;

impl<R: Rng> Simulator<R> {
  /// Removes columns that are invariant across all leaves, compacting every
  /// leaf sequence down to the target length. Fails when the oversampled
  /// simulation still produced too few variant sites.
  pub fn remove_constant_sites(&mut self) -> Result<(), Report> {
    let expected_num_variant = self.target_num_sites();
    let (mask, num_variant) = self.create_variant_state_mask(expected_num_variant);

    if num_variant < expected_num_variant {
      return make_error!(
        "Unfortunately, after removing constant sites, the number of variant sites is less than the expected sequence \
         length. Please use --length-ratio <LENGTH_RATIO> to generate more abundant sites and try again. The current \
         <LENGTH_RATIO> is {}",
        self.length_ratio
      );
    }

    if self.params.insertions_enabled() {
      self.seq_length_indels = num_variant;
    }

    self.keep_only_variant_sites(&mask, expected_num_variant);
    Ok(())
  }

  /// Builds the per-column mask by sweeping leaves in traversal order.
  /// Starting from the first leaf, a column flips to variant when a later
  /// leaf shows a different non-gap state; gap mask entries adopt the first
  /// non-gap state seen. Early-exits once enough variant columns are found,
  /// unless indels require the full count.
  fn create_variant_state_mask(&self, expected_num_variant: usize) -> (Vec<i64>, usize) {
    let unknown = i64::from(self.alphabet.unknown());
    let full_pass = self.params.insertions_enabled();

    let mut mask: Vec<i64> = vec![];
    let mut num_variant = 0_usize;

    for leaf in self.tree.output_leaves() {
      let seq = &self.tree.nodes[leaf].sequence;

      if mask.is_empty() {
        mask = seq.iter().map(|&s| i64::from(s)).collect();
        continue;
      }

      if num_variant >= expected_num_variant && !full_pass {
        break;
      }

      for (i, &state) in seq.iter().enumerate() {
        let state = i64::from(state);
        if mask[i] != VARIANT && mask[i] != state && state != unknown {
          if mask[i] == unknown {
            mask[i] = state;
          } else {
            mask[i] = VARIANT;
            num_variant += 1;
            if num_variant >= expected_num_variant && !full_pass {
              break;
            }
          }
        }
      }
    }

    (mask, num_variant)
  }

  /// Compacts every leaf sequence to the variant columns, truncated to the
  /// expected count unless indels require keeping all of them
  fn keep_only_variant_sites(&mut self, mask: &[i64], expected_num_variant: usize) {
    let full_pass = self.params.insertions_enabled();

    for leaf in self.tree.output_leaves() {
      let seq = &mut self.tree.nodes[leaf].sequence;
      let mut variant_sites = Vec::with_capacity(expected_num_variant);
      for (i, &state) in seq.iter().enumerate() {
        if mask[i] == VARIANT {
          variant_sites.push(state);
          if variant_sites.len() >= expected_num_variant && !full_pass {
            break;
          }
        }
      }
      *seq = variant_sites;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alphabet::alphabet::{Alphabet, SeqKind, State};
  use crate::io::nwk::read_nwk_str;
  use crate::model::catalog::jc;
  use crate::rates::rate_profile::RateSpec;
  use crate::sim::params::SimulationParams;
  use eyre::Report;
  use pretty_assertions::assert_eq;
  use rand::SeedableRng;
  use rand_isaac::Isaac64Rng;
  use rstest::rstest;

  fn simulator_with_leaf_seqs(seqs: &[(&str, Vec<State>)], sequence_length: usize) -> Result<Simulator<Isaac64Rng>, Report> {
    let newick = format!(
      "({});",
      seqs.iter().map(|(name, _)| format!("{name}:0.1")).collect::<Vec<_>>().join(",")
    );
    let mut tree = read_nwk_str(&newick)?;
    for (name, seq) in seqs {
      let id = (0..tree.nodes.len())
        .find(|&i| tree.nodes[i].name == *name)
        .expect("leaf exists");
      tree.nodes[id].sequence = seq.clone();
    }

    let params = SimulationParams {
      sequence_length,
      length_ratio: Some(2.0),
      ..SimulationParams::default()
    };
    let alphabet = Alphabet::new(SeqKind::Dna)?;
    let rng = Isaac64Rng::seed_from_u64(51);
    let mut sim = Simulator::new(params, alphabet, jc(4)?, RateSpec::default(), tree, rng)?;
    // pretend ascertainment estimation produced ratio 2
    sim.length_ratio = 2.0;
    sim.expected_num_sites = sequence_length * 2;
    Ok(sim)
  }

  #[rstest]
  fn keeps_only_variant_columns() -> Result<(), Report> {
    // columns:        0  1  2  3  4  5
    // A               0  1  2  3  0  1
    // B               0  2  2  3  1  1
    // C               0  2  2  0  1  1
    // variant:           x        x     -> plus column 3 (A=3, C=0)
    let mut sim = simulator_with_leaf_seqs(
      &[
        ("A", vec![0, 1, 2, 3, 0, 1]),
        ("B", vec![0, 2, 2, 3, 1, 1]),
        ("C", vec![0, 2, 2, 0, 1, 1]),
      ],
      3,
    )?;

    sim.remove_constant_sites()?;

    for leaf in sim.tree.output_leaves() {
      assert_eq!(sim.tree.nodes[leaf].sequence.len(), 3);
    }
    // leaf A keeps its states at the variant columns 1, 3, 4
    let a = (0..sim.tree.nodes.len())
      .find(|&i| sim.tree.nodes[i].name == "A")
      .expect("leaf A exists");
    assert_eq!(sim.tree.nodes[a].sequence, vec![1, 3, 0]);
    Ok(())
  }

  #[rstest]
  fn gap_columns_do_not_count_as_variant() -> Result<(), Report> {
    let unknown = Alphabet::new(SeqKind::Dna)?.unknown();
    let mut sim = simulator_with_leaf_seqs(
      &[
        ("A", vec![0, unknown, 1, 2]),
        ("B", vec![0, 1, 1, 3]),
        ("C", vec![unknown, 1, 1, 2]),
      ],
      1,
    )?;

    sim.remove_constant_sites()?;

    // only the last column has two distinct non-gap states
    let a = (0..sim.tree.nodes.len())
      .find(|&i| sim.tree.nodes[i].name == "A")
      .expect("leaf A exists");
    assert_eq!(sim.tree.nodes[a].sequence, vec![2]);
    Ok(())
  }

  #[rstest]
  fn errors_when_too_few_variant_sites() -> Result<(), Report> {
    let mut sim = simulator_with_leaf_seqs(
      &[("A", vec![0, 1, 2, 3]), ("B", vec![0, 1, 2, 3]), ("C", vec![0, 1, 2, 3])],
      2,
    )?;

    assert!(sim.remove_constant_sites().is_err());
    Ok(())
  }
}
