use crate::make_error;
use eyre::Report;
use indexmap::IndexMap;
use itertools::Itertools;
use std::fmt;
use std::str::FromStr;

/// Numerical state code. States are `0..num_states`; the value `num_states`
/// itself is the sentinel for gaps and missing data.
pub type State = u16;

pub const NUC_CHARS: &[char] = &['A', 'C', 'G', 'T'];
pub const AA_CHARS: &[char] = &[
  'A', 'R', 'N', 'D', 'C', 'Q', 'E', 'G', 'H', 'I', 'L', 'K', 'M', 'F', 'P', 'S', 'T', 'W', 'Y', 'V',
];
pub const BIN_CHARS: &[char] = &['0', '1'];
pub const MORPH_CHARS: &[char] = &[
  '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M',
  'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V',
];

/// Standard genetic code, indexed by `16*n1 + 4*n2 + n3` with A=0, C=1, G=2, T=3.
const GENETIC_CODE: &str = "KNKNTTTTRSRSIIMIQHQHPPPPRRRRLLLLEDEDAAAAGGGGVVVV*Y*YSSSS*CWCLFLF";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqKind {
  Bin,
  Dna,
  Aa,
  Nt2aa,
  Codon,
  Morph(usize),
}

impl fmt::Display for SeqKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SeqKind::Bin => write!(f, "BIN"),
      SeqKind::Dna => write!(f, "DNA"),
      SeqKind::Aa => write!(f, "AA"),
      SeqKind::Nt2aa => write!(f, "NT2AA"),
      SeqKind::Codon => write!(f, "CODON"),
      SeqKind::Morph(n) => write!(f, "MORPH{{{n}}}"),
    }
  }
}

impl FromStr for SeqKind {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Report> {
    match s.to_uppercase().as_str() {
      "BIN" => Ok(SeqKind::Bin),
      "DNA" => Ok(SeqKind::Dna),
      "AA" => Ok(SeqKind::Aa),
      "NT2AA" => Ok(SeqKind::Nt2aa),
      "CODON" => Ok(SeqKind::Codon),
      s if s.starts_with("MORPH{") && s.ends_with('}') => {
        let n: usize = s["MORPH{".len()..s.len() - 1]
          .parse()
          .map_err(|_| eyre::eyre!("Invalid number of states in '{s}'"))?;
        if !(2..=MORPH_CHARS.len()).contains(&n) {
          return make_error!(
            "Morphological data supports between 2 and {} states, got {n}",
            MORPH_CHARS.len()
          );
        }
        Ok(SeqKind::Morph(n))
      }
      _ => make_error!(
        "Unknown sequence type: '{s}'. Expected one of: BIN, DNA, AA, NT2AA, CODON, MORPH{{<NUM_STATES>}}"
      ),
    }
  }
}

/// Immutable alphabet facts shared by the whole simulation: how many states
/// there are, how many output characters one state occupies, and which
/// sentinel marks a gap.
#[derive(Clone, Debug)]
pub struct Alphabet {
  pub kind: SeqKind,
  pub num_states: usize,
  /// Output characters per state: 3 for codons, 1 otherwise.
  pub chars_per_state: usize,
  /// Input characters consumed per state when encoding (3 for codon data).
  pub encode_chars_per_state: usize,
  state_chars: Vec<String>,
  gap_chars: String,
  char_to_state: IndexMap<String, State>,
}

fn sense_codons() -> Vec<(String, char)> {
  let mut codons = Vec::with_capacity(61);
  for (index, aa) in GENETIC_CODE.chars().enumerate() {
    if aa == '*' {
      continue;
    }
    let triplet: String = [index / 16, (index / 4) % 4, index % 4]
      .iter()
      .map(|&i| NUC_CHARS[i])
      .collect();
    codons.push((triplet, aa));
  }
  codons
}

impl Alphabet {
  pub fn new(kind: SeqKind) -> Result<Self, Report> {
    let (state_chars, chars_per_state, encode_chars_per_state): (Vec<String>, usize, usize) = match kind {
      SeqKind::Bin => (BIN_CHARS.iter().map(ToString::to_string).collect(), 1, 1),
      SeqKind::Dna => (NUC_CHARS.iter().map(ToString::to_string).collect(), 1, 1),
      SeqKind::Aa => (AA_CHARS.iter().map(ToString::to_string).collect(), 1, 1),
      SeqKind::Codon => (sense_codons().into_iter().map(|(triplet, _)| triplet).collect(), 3, 3),
      SeqKind::Nt2aa => (sense_codons().into_iter().map(|(_, aa)| aa.to_string()).collect(), 1, 3),
      SeqKind::Morph(n) => (MORPH_CHARS[..n].iter().map(ToString::to_string).collect(), 1, 1),
    };

    let num_states = state_chars.len();

    // For codon data the lookup is keyed by triplet, not by the output string
    let char_to_state: IndexMap<String, State> = match kind {
      SeqKind::Nt2aa | SeqKind::Codon => sense_codons()
        .into_iter()
        .enumerate()
        .map(|(i, (triplet, _))| (triplet, i as State))
        .collect(),
      _ => state_chars
        .iter()
        .enumerate()
        .map(|(i, chars)| (chars.clone(), i as State))
        .collect(),
    };

    Ok(Self {
      kind,
      num_states,
      chars_per_state,
      encode_chars_per_state,
      state_chars,
      gap_chars: "-".repeat(chars_per_state),
      char_to_state,
    })
  }

  #[inline]
  pub fn unknown(&self) -> State {
    self.num_states as State
  }

  #[inline]
  pub fn is_unknown(&self, state: State) -> bool {
    state as usize >= self.num_states
  }

  /// Readable characters for a state; gaps map to a run of '-'
  #[inline]
  pub fn decode(&self, state: State) -> &str {
    if self.is_unknown(state) {
      &self.gap_chars
    } else {
      &self.state_chars[state as usize]
    }
  }

  /// Encodes a readable sequence into numerical states. Characters are
  /// consumed `encode_chars_per_state` at a time; gap runs become the
  /// unknown sentinel.
  pub fn encode(&self, seq: &str) -> Result<Vec<State>, Report> {
    let chars = seq.trim().to_uppercase();
    if !chars.is_ascii() {
      let offender = chars.chars().find(|c| !c.is_ascii()).expect("a non-ASCII character exists");
      return make_error!("Sequence contains non-ASCII character '{offender}'; expected plain {} data", self.kind);
    }
    if chars.len() % self.encode_chars_per_state != 0 {
      return make_error!(
        "Sequence length {} is not a multiple of {} characters per state",
        chars.len(),
        self.encode_chars_per_state
      );
    }

    (0..chars.len())
      .step_by(self.encode_chars_per_state)
      .map(|i| {
        let chunk = &chars[i..i + self.encode_chars_per_state];
        if chunk.contains('-') || chunk.contains('?') || chunk.contains('N') && self.kind == SeqKind::Dna {
          return Ok(self.unknown());
        }
        self.char_to_state.get(chunk).copied().ok_or_else(|| {
          eyre::eyre!(
            "Unknown character '{chunk}' for sequence type {}. Known characters: {}",
            self.kind,
            self.char_to_state.keys().join(", ")
          )
        })
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use eyre::Report;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn counts_sense_codons() -> Result<(), Report> {
    let alphabet = Alphabet::new(SeqKind::Codon)?;
    assert_eq!(alphabet.num_states, 61);
    assert_eq!(alphabet.chars_per_state, 3);
    assert_eq!(alphabet.decode(alphabet.unknown()), "---");
    Ok(())
  }

  #[rstest]
  fn translates_codons_to_aminoacids() -> Result<(), Report> {
    let alphabet = Alphabet::new(SeqKind::Nt2aa)?;
    assert_eq!(alphabet.num_states, 61);
    assert_eq!(alphabet.chars_per_state, 1);

    let states = alphabet.encode("ATGAAA")?;
    let decoded: String = states.iter().map(|&s| alphabet.decode(s)).collect();
    assert_eq!(decoded, "MK");
    Ok(())
  }

  #[rstest]
  fn roundtrips_dna() -> Result<(), Report> {
    let alphabet = Alphabet::new(SeqKind::Dna)?;
    let states = alphabet.encode("ACGT-A")?;
    assert_eq!(states, vec![0, 1, 2, 3, alphabet.unknown(), 0]);

    let decoded: String = states.iter().map(|&s| alphabet.decode(s)).collect();
    assert_eq!(decoded, "ACGT-A");
    Ok(())
  }

  #[rstest]
  fn parses_morph_state_count() -> Result<(), Report> {
    let kind = SeqKind::from_str("MORPH{12}")?;
    assert_eq!(kind, SeqKind::Morph(12));

    let alphabet = Alphabet::new(kind)?;
    assert_eq!(alphabet.num_states, 12);
    assert_eq!(alphabet.decode(11), "B");
    Ok(())
  }

  #[rstest]
  fn rejects_non_ascii_input() -> Result<(), Report> {
    let alphabet = Alphabet::new(SeqKind::Dna)?;
    assert!(alphabet.encode("ACG\u{00c9}T").is_err());
    assert!(alphabet.encode("AC\u{feff}GT").is_err());
    Ok(())
  }

  #[rstest]
  fn rejects_unknown_kind() {
    assert!(SeqKind::from_str("POMO").is_err());
  }
}
