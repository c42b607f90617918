use crate::alphabet::alphabet::{Alphabet, SeqKind, State};
use crate::cli::args::PhylosimArgs;
use crate::constants::DEFAULT_REBUILD_INDEL_HISTORY_PARAM;
use crate::io::compression::CompressionType;
use crate::io::file::create_file;
use crate::io::fs::read_file_to_string;
use crate::io::nwk::read_nwk_file;
use crate::io::output::{output_filepath, states_to_string, AlignmentWriter, OutputFormat, parse_spill_line};
use crate::make_error;
use crate::model::parse::parse_model;
use crate::sim::context::Simulator;
use crate::sim::params::SimulationParams;
use crate::utils::random::get_random_number_generator;
use eyre::{Report, WrapErr};
use log::info;
use rand::Rng;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

pub fn run(args: &PhylosimArgs) -> Result<(), Report> {
  let kind = SeqKind::from_str(&args.seqtype)?;
  let alphabet = Alphabet::new(kind)?;
  let (model, rate_spec) = parse_model(&args.model, &alphabet)?;
  let tree = read_nwk_file(&args.tree)?;

  let ancestral = args
    .ancestral_sequence
    .as_ref()
    .map(|path| read_ancestral_sequence(path, &alphabet))
    .transpose()?;

  let sequence_length = match (args.sequence_length, &ancestral) {
    (Some(length), _) => length,
    (None, Some(seq)) => seq.len() * alphabet.chars_per_state,
    (None, None) => {
      return make_error!("Please specify the output sequence length with --length, or supply an ancestral sequence")
    }
  };

  let params = SimulationParams {
    sequence_length,
    num_datasets: args.num_datasets,
    branch_scale: args.branch_scale,
    partition_rate: args.partition_rate,
    insertion_ratio: args.insertion_ratio,
    deletion_ratio: args.deletion_ratio,
    insertion_distribution: args.insertion_distribution.parse()?,
    deletion_distribution: args.deletion_distribution.parse()?,
    fundi_proportion: args.fundi_proportion,
    fundi_taxon_set: args.fundi_taxon_set.clone(),
    length_ratio: args.length_ratio,
    simulation_thresh: args.simulation_thresh,
    rebuild_indel_history_param: args
      .rebuild_indel_history_param
      .unwrap_or(DEFAULT_REBUILD_INDEL_HISTORY_PARAM),
    write_internal_sequences: args.write_internal_sequences,
    mixture_at_sub_level: args.mixture_at_sub_level,
  };

  let compression = if args.compress {
    CompressionType::Gzip
  } else {
    CompressionType::None
  };

  let rng = get_random_number_generator(args.seed);
  let mut sim = Simulator::new(params, alphabet, model, rate_spec, tree, rng)?;

  info!(" - Tree filepath: {:?}", args.tree);
  info!(" - Length of output sequences: {sequence_length}");
  info!(" - Model: {}", args.model);
  info!(" - Number of output datasets: {}", args.num_datasets);

  for dataset in 0..args.num_datasets.max(1) {
    sim.prepare_dataset(ancestral.as_deref())?;
    let filepath = output_filepath(&args.out, args.output_format, compression, dataset, args.num_datasets);
    run_one_dataset(&mut sim, &filepath, args.output_format, compression)?;
    info!("An alignment has just been exported to {filepath:?}");
  }

  Ok(())
}

fn read_ancestral_sequence(path: &Path, alphabet: &Alphabet) -> Result<Vec<State>, Report> {
  let contents = read_file_to_string(path)?;
  let seq: String = contents
    .lines()
    .filter(|line| !line.starts_with('>') && !line.trim().is_empty())
    .collect();
  alphabet
    .encode(&seq)
    .wrap_err_with(|| format!("When encoding ancestral sequence from {path:?}"))
}

fn run_one_dataset<R: Rng>(
  sim: &mut Simulator<R>,
  filepath: &Path,
  format: OutputFormat,
  compression: CompressionType,
) -> Result<(), Report> {
  let num_leaves = sim.tree.output_leaves().len();
  let max_name_len = sim.tree.max_name_len();
  let target_num_sites = sim.target_num_sites();
  let alphabet = sim.alphabet.clone();

  if sim.can_stream() {
    let mut writer = AlignmentWriter::from_path(filepath, format, compression, max_name_len)?;
    writer.write_header(num_leaves, target_num_sites * alphabet.chars_per_state)?;

    let mut on_seq = |name: &str, states: &[State]| -> Result<(), Report> {
      writer.write_record(name, &states_to_string(&alphabet, states, target_num_sites))
    };
    sim.simulate_seqs(Some(&mut on_seq), None)?;

    return writer.finish();
  }

  // deferred materialization: indels and/or constant-site filtering first
  if sim.uses_spill() {
    let spill_path = filepath.with_extension("tmp");
    {
      let mut spill = create_file(&spill_path)?;
      let spill_ref: &mut dyn Write = &mut spill;
      sim.simulate_seqs(None, Some(spill_ref))?;
      spill.flush()?;
    }
    rematerialize_from_spill(sim, &spill_path)?;
    std::fs::remove_file(&spill_path).wrap_err_with(|| format!("When removing temporary file {spill_path:?}"))?;
  } else {
    sim.simulate_seqs(None, None)?;
  }

  if sim.params.insertions_enabled() {
    sim.reconcile_frozen_leaves()?;
  }
  if sim.params.fundi_enabled() && sim.params.insertions_enabled() {
    sim.process_delayed_fundi();
  }
  if sim.length_ratio > 1.0 {
    sim.remove_constant_sites()?;
  }

  // all leaves now share one final length; indels may have grown it past the
  // configured target
  let leaves = sim.tree.output_leaves();
  let final_num_sites = leaves
    .first()
    .map_or(target_num_sites, |&leaf| sim.tree.nodes[leaf].sequence.len());

  let mut writer = AlignmentWriter::from_path(filepath, format, compression, max_name_len)?;
  writer.write_header(num_leaves, final_num_sites * alphabet.chars_per_state)?;
  for leaf in leaves {
    let name = sim.tree.nodes[leaf].name.clone();
    let seq = &sim.tree.nodes[leaf].sequence;
    writer.write_record(&name, &states_to_string(&alphabet, seq, final_num_sites))?;
  }

  if sim.params.write_internal_sequences {
    for node in 0..sim.tree.nodes.len() {
      if !sim.tree.is_leaf(node) && !sim.tree.nodes[node].sequence.is_empty() {
        let name = if sim.tree.nodes[node].name.is_empty() {
          node.to_string()
        } else {
          sim.tree.nodes[node].name.clone()
        };
        let seq = &sim.tree.nodes[node].sequence;
        let num_sites = seq.len();
        writer.write_record(&name, &states_to_string(&alphabet, seq, num_sites))?;
      }
    }
  }

  writer.finish()
}

/// Reads the temporary per-leaf state records back into the tree so the
/// genome-tree reconciliation can pad them
fn rematerialize_from_spill<R: Rng>(sim: &mut Simulator<R>, spill_path: &Path) -> Result<(), Report> {
  let node_by_name: HashMap<String, usize> = (0..sim.tree.nodes.len())
    .map(|id| (sim.tree.nodes[id].name.clone(), id))
    .collect();

  let contents = read_file_to_string(spill_path)?;
  for line in contents.lines() {
    if line.trim().is_empty() {
      continue;
    }
    let (name, states) = parse_spill_line(line)?;
    let node = node_by_name
      .get(&name)
      .copied()
      .ok_or_else(|| eyre::eyre!("Temporary record names unknown taxon '{name}'"))?;
    sim.tree.nodes[node].sequence = states;
  }

  Ok(())
}
