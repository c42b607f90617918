use crate::alphabet::alphabet::{Alphabet, State};
use crate::io::compression::{Compressor, CompressionType};
use crate::io::file::create_file;
use crate::make_error;
use clap::ArgEnum;
use eyre::{Report, WrapErr};
use smart_default::SmartDefault;
use std::io::Write;
use std::path::{Path, PathBuf};
use strum_macros::Display;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ArgEnum, SmartDefault, Display)]
#[clap(rename_all = "kebab-case")]
pub enum OutputFormat {
  #[default]
  Phylip,
  Fasta,
}

impl OutputFormat {
  pub fn extension(self) -> &'static str {
    match self {
      OutputFormat::Phylip => "phy",
      OutputFormat::Fasta => "fa",
    }
  }
}

/// Converts a numerical sequence into readable characters, truncated to the
/// first `num_sites` sites.
pub fn states_to_string(alphabet: &Alphabet, states: &[State], num_sites: usize) -> String {
  let num_sites = num_sites.min(states.len());
  let mut out = String::with_capacity(num_sites * alphabet.chars_per_state);
  for &state in &states[..num_sites] {
    out.push_str(alphabet.decode(state));
  }
  out
}

/// Streams one alignment to disk in PHYLIP or FASTA layout, optionally
/// through the gzip codec.
pub struct AlignmentWriter<'w> {
  writer: Box<dyn Write + Send + 'w>,
  format: OutputFormat,
  max_name_len: usize,
}

impl<'w> AlignmentWriter<'w> {
  pub fn from_path(
    filepath: impl AsRef<Path>,
    format: OutputFormat,
    compression: CompressionType,
    max_name_len: usize,
  ) -> Result<AlignmentWriter<'static>, Report> {
    let filepath = filepath.as_ref();
    let file = create_file(filepath).wrap_err_with(|| format!("When opening output file {filepath:?}"))?;
    let writer: Box<dyn Write + Send> = match compression {
      CompressionType::None => file,
      compression => Box::new(Compressor::new(file, compression)),
    };
    Ok(AlignmentWriter::new(writer, format, max_name_len))
  }

  pub fn new(writer: Box<dyn Write + Send + 'w>, format: OutputFormat, max_name_len: usize) -> Self {
    Self {
      writer,
      format,
      max_name_len,
    }
  }

  /// PHYLIP first line; a no-op for FASTA output
  pub fn write_header(&mut self, num_leaves: usize, num_chars: usize) -> Result<(), Report> {
    if self.format == OutputFormat::Phylip {
      writeln!(self.writer, "{num_leaves} {num_chars}").wrap_err("When writing alignment header")?;
    }
    Ok(())
  }

  pub fn write_record(&mut self, name: &str, seq: &str) -> Result<(), Report> {
    match self.format {
      OutputFormat::Phylip => {
        writeln!(self.writer, "{name:<width$} {seq}", width = self.max_name_len)
      }
      OutputFormat::Fasta => {
        writeln!(self.writer, ">{name}\n{seq}")
      }
    }
    .wrap_err_with(|| format!("When writing sequence of taxon '{name}'"))
  }

  pub fn finish(mut self) -> Result<(), Report> {
    self.writer.flush().wrap_err("When flushing alignment output")
  }
}

/// Appends `.phy`/`.fa` (and `.gz`) to the output prefix, numbering datasets
/// beyond the first
pub fn output_filepath(
  prefix: impl AsRef<Path>,
  format: OutputFormat,
  compression: CompressionType,
  dataset: usize,
  num_datasets: usize,
) -> PathBuf {
  let prefix = prefix.as_ref();
  let mut name = prefix.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned());
  if num_datasets > 1 {
    name.push_str(&format!("_{dataset}"));
  }
  name.push('.');
  name.push_str(format.extension());
  if compression == CompressionType::Gzip {
    name.push_str(".gz");
  }
  prefix.with_file_name(name)
}

/// One line of the temporary spill written while indels are active:
/// `<name>@<len>@s0 s1 ... sN`
pub fn write_spill_record(writer: &mut impl Write, name: &str, states: &[State]) -> Result<(), Report> {
  write!(writer, "{name}@{}@", states.len())?;
  for state in states {
    write!(writer, "{state} ")?;
  }
  writeln!(writer)?;
  Ok(())
}

pub fn parse_spill_line(line: &str) -> Result<(String, Vec<State>), Report> {
  let mut parts = line.splitn(3, '@');
  let (name, len, states) = match (parts.next(), parts.next(), parts.next()) {
    (Some(name), Some(len), Some(states)) => (name, len, states),
    _ => return make_error!("Malformed temporary sequence record: '{line}'"),
  };

  let len: usize = len
    .parse()
    .map_err(|_| eyre::eyre!("Invalid sequence length in temporary record: '{len}'"))?;

  let states = states
    .split_ascii_whitespace()
    .map(|s| {
      s.parse::<State>()
        .map_err(|_| eyre::eyre!("Invalid state code in temporary record: '{s}'"))
    })
    .collect::<Result<Vec<State>, Report>>()?;

  if states.len() != len {
    return make_error!(
      "Temporary record of '{name}' declares {len} states but contains {}",
      states.len()
    );
  }

  Ok((name.to_owned(), states))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alphabet::alphabet::SeqKind;
  use eyre::Report;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn writes_phylip_layout() -> Result<(), Report> {
    let mut buf = vec![];
    {
      let mut writer = AlignmentWriter::new(Box::new(&mut buf), OutputFormat::Phylip, 5);
      writer.write_header(2, 4)?;
      writer.write_record("A", "ACGT")?;
      writer.write_record("taxon", "TTTT")?;
      writer.finish()?;
    }
    assert_eq!(String::from_utf8(buf)?, "2 4\nA     ACGT\ntaxon TTTT\n");
    Ok(())
  }

  #[rstest]
  fn writes_fasta_layout() -> Result<(), Report> {
    let mut buf = vec![];
    {
      let mut writer = AlignmentWriter::new(Box::new(&mut buf), OutputFormat::Fasta, 0);
      writer.write_header(2, 4)?;
      writer.write_record("A", "ACGT")?;
      writer.finish()?;
    }
    assert_eq!(String::from_utf8(buf)?, ">A\nACGT\n");
    Ok(())
  }

  #[rstest]
  fn converts_states_with_gaps() -> Result<(), Report> {
    let alphabet = Alphabet::new(SeqKind::Dna)?;
    let unknown = alphabet.unknown();
    assert_eq!(states_to_string(&alphabet, &[0, unknown, 3, 2], 4), "A-TG");
    assert_eq!(states_to_string(&alphabet, &[0, 1, 2, 3], 2), "AC");
    Ok(())
  }

  #[rstest]
  fn spill_roundtrip() -> Result<(), Report> {
    let mut buf = vec![];
    write_spill_record(&mut buf, "taxon1", &[0, 4, 2])?;
    let line = String::from_utf8(buf)?;
    let (name, states) = parse_spill_line(line.trim_end())?;
    assert_eq!(name, "taxon1");
    assert_eq!(states, vec![0, 4, 2]);
    Ok(())
  }

  #[rstest]
  fn numbered_output_paths() {
    let path = output_filepath("out/alignment", OutputFormat::Phylip, CompressionType::None, 0, 1);
    assert_eq!(path, PathBuf::from("out/alignment.phy"));

    let path = output_filepath("out/alignment", OutputFormat::Fasta, CompressionType::Gzip, 2, 5);
    assert_eq!(path, PathBuf::from("out/alignment_2.fa.gz"));
  }
}
