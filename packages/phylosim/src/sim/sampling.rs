use ndarray::prelude::*;
use rand::Rng;

/// Converts each row of a probability matrix into its running sum, so rows
/// can be sampled by binary search.
pub fn cumulative_rows_inplace(matrix: &mut Array2<f64>) {
  matrix.accumulate_axis_inplace(Axis(1), |&prev, cur| *cur += prev);
}

/// Binary search for the first index whose cumulative value is `>= target`
/// within `[start, end]`. Falls back to `end` so that rounding never pushes
/// the draw out of range.
fn binary_search_cumulative(cum: ArrayView1<f64>, target: f64, start: usize, end: usize) -> usize {
  let (mut lo, mut hi) = (start, end);
  while lo < hi {
    let mid = (lo + hi) / 2;
    if target <= cum[mid] {
      hi = mid;
    } else {
      lo = mid + 1;
    }
  }
  lo
}

/// Samples an index from a cumulative probability row
pub fn sample_cumulative_row(cum: ArrayView1<f64>, rng: &mut impl Rng) -> usize {
  let r: f64 = rng.gen();
  binary_search_cumulative(cum, r, 0, cum.len() - 1)
}

/// Samples an index from a cumulative probability row, checking the highest
/// probability cell first. Branch transitions are dominated by the
/// unchanged-state cell, so testing it before the binary search wins on
/// average.
pub fn sample_max_prob_first(cum: ArrayView1<f64>, max_prob_pos: usize, rng: &mut impl Rng) -> usize {
  let r: f64 = rng.gen();

  let below = if max_prob_pos == 0 { 0.0 } else { cum[max_prob_pos - 1] };
  if r >= below {
    if r <= cum[max_prob_pos] {
      return max_prob_pos;
    }
    // the draw landed right of the max cell
    return binary_search_cumulative(cum, r, max_prob_pos + 1, cum.len() - 1);
  }

  binary_search_cumulative(cum, r, 0, max_prob_pos.saturating_sub(1))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::utils::random::get_random_number_generator;
  use approx::assert_ulps_eq;
  use ndarray::array;
  use rstest::rstest;

  #[rstest]
  fn accumulates_rows() {
    let mut m = array![[0.1, 0.2, 0.3, 0.4], [0.25, 0.25, 0.25, 0.25]];
    cumulative_rows_inplace(&mut m);
    assert_ulps_eq!(m[[0, 3]], 1.0);
    assert_ulps_eq!(m[[1, 1]], 0.5);
  }

  #[rstest]
  fn max_prob_first_matches_plain_search() {
    let mut rng = get_random_number_generator(Some(5));
    let cum = array![0.05, 0.1, 0.9, 1.0];

    let mut counts = [0_usize; 4];
    for _ in 0..100_000 {
      counts[sample_max_prob_first(cum.view(), 2, &mut rng)] += 1;
    }

    let freqs: Vec<f64> = counts.iter().map(|&c| c as f64 / 100_000.0).collect();
    let expected = [0.05, 0.05, 0.8, 0.1];
    for (f, e) in freqs.iter().zip(expected.iter()) {
      assert!((f - e).abs() < 0.01, "frequency {f} too far from {e}");
    }
  }

  #[rstest]
  fn plain_search_covers_all_cells() {
    let mut rng = get_random_number_generator(Some(6));
    let cum = array![0.25, 0.5, 0.75, 1.0];
    let mut counts = [0_usize; 4];
    for _ in 0..10_000 {
      counts[sample_cumulative_row(cum.view(), &mut rng)] += 1;
    }
    assert!(counts.iter().all(|&c| c > 2000));
  }
}
