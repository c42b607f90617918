/// Name assigned to the root node grafted onto an unrooted input tree.
/// Sequences of this node are never written to the output alignment.
pub const ROOT_NAME: &str = "__root__";

/// Attempts allowed when drawing a positive indel size or a unique site.
pub const MAX_SAMPLING_ATTEMPTS: usize = 1000;

/// Fallback oversampling ratio when the estimate is non-finite or out of range.
pub const FALLBACK_CONSTANT_PATTERN_PROB: f64 = 0.5;

/// Extra oversampling margin added on top of the estimated length ratio.
pub const LENGTH_RATIO_MARGIN: f64 = 0.1;

// Numerator `a` of the method-switching threshold `a / L`, by sequence-length
// regime. Branches with expected substitutions per site above the threshold
// are simulated with the transition-probability matrix.
pub const SWITCHING_PARAM_DISCRETE: [f64; 4] = [2.226_224_503, 1.4, 1.1, 1.0];
pub const SWITCHING_PARAM_CONTINUOUS: [f64; 4] = [13.307_360_5, 9.1, 7.0, 6.0];
pub const SWITCHING_PARAM_BREAKPOINTS: [usize; 3] = [100_000, 500_000, 1_000_000];

/// Default number of discrete gamma rate categories.
pub const DEFAULT_GAMMA_CATEGORIES: usize = 4;

/// Default multiplier `kappa` of the leaf count: the indel history is rebuilt
/// from scratch after every `kappa * num_leaves` exported tips.
pub const DEFAULT_REBUILD_INDEL_HISTORY_PARAM: f64 = 0.5;
