use crate::alphabet::alphabet::State;
use crate::constants::ROOT_NAME;
use crate::genome::genome_tree::GenomeTree;
use crate::genome::insertion::InsertionId;
use crate::io::output::write_spill_record;
use crate::model::parse::parse_model;
use crate::sim::branch::SimulationMethod;
use crate::sim::context::Simulator;
use crate::sim::fundi::permute_selected_sites;
use crate::tree::tree::NodeId;
use eyre::{Report, WrapErr};
use rand::Rng;
use std::io::Write;

/// Callback receiving finalized sequences (leaf or internal) during a
/// streaming traversal
pub type SeqCallback<'a> = &'a mut dyn FnMut(&str, &[State]) -> Result<(), Report>;

impl<R: Rng> Simulator<R> {
  /// True when leaves can be converted and written the moment they finalize:
  /// no insertions to reconcile and no constant-site filtering ahead
  pub fn can_stream(&self) -> bool {
    !self.params.insertions_enabled() && self.length_ratio <= 1.0
  }

  /// True when leaf states are spilled to a temporary file to bound memory:
  /// insertions defer materialization but neither functional divergence nor
  /// constant-site filtering needs the sequences resident
  pub fn uses_spill(&self) -> bool {
    self.params.insertions_enabled() && !self.params.fundi_enabled() && self.length_ratio <= 1.0
  }

  /// Depth-first simulation of all sequences from the root. Every edge picks
  /// its method, evolves the child, runs the indel/substitution event loop,
  /// and finalizes leaves as they complete. Uses an explicit stack so deep
  /// phylogenies cannot exhaust the call stack.
  pub fn simulate_seqs(
    &mut self,
    mut on_seq: Option<SeqCallback>,
    mut spill: Option<&mut dyn Write>,
  ) -> Result<(), Report> {
    if !self.tree.rooted {
      self.graft_and_seed_root();
    }

    // (node, dad, next neighbor index)
    let mut stack: Vec<(NodeId, Option<NodeId>, usize)> = vec![(self.tree.root, None, 0)];

    while let Some(&(node, dad, cursor)) = stack.last() {
      // next neighbor that is not the dad
      let mut edge_index = None;
      let mut next_cursor = cursor;
      while next_cursor < self.tree.nodes[node].neighbors.len() {
        let i = next_cursor;
        next_cursor += 1;
        if Some(self.tree.nodes[node].neighbors[i].target) != dad {
          edge_index = Some(i);
          break;
        }
      }
      stack.last_mut().expect("stack is non-empty").2 = next_cursor;

      let Some(edge_index) = edge_index else {
        stack.pop();
        continue;
      };

      let edge = self.tree.nodes[node].neighbors[edge_index].clone();
      let child = edge.target;

      let parent_gaps = self.tree.nodes[node].num_gaps;
      self.tree.nodes[child].parent = Some(node);
      self.tree.nodes[child].num_gaps = parent_gaps;
      if self.tree.nodes[node].num_children_done >= self.tree.nodes[node].neighbors.len().saturating_sub(1) {
        self.tree.nodes[node].num_children_done = 0;
      }

      let method = self.choose_method(&edge);

      // a zero-length branch transmits the sequence unchanged
      if edge.length == 0.0 {
        let parent_seq = self.tree.nodes[node].sequence.clone();
        self.tree.nodes[child].sequence = parent_seq;
      } else {
        if method == SimulationMethod::TransProb {
          let model_override = match edge.attrs.get("model") {
            Some(spec) => Some(parse_model(spec, &self.alphabet).wrap_err("When parsing branch-local model")?.0),
            None => None,
          };

          let parent_seq = std::mem::take(&mut self.tree.nodes[node].sequence);
          let child_seq = self.evolve_trans_prob(&parent_seq, edge.length, model_override.as_ref())?;
          self.tree.nodes[node].sequence = parent_seq;
          self.tree.nodes[child].sequence = child_seq;
        } else {
          let parent_seq = self.tree.nodes[node].sequence.clone();
          self.tree.nodes[child].sequence = parent_seq;
        }

        if self.params.indels_enabled() || method == SimulationMethod::RateMatrix {
          self.simulate_branch_events(child, edge.length, method)?;
        }
      }

      // a completed leaf freezes at the current tail of the insertion timeline
      if self.params.insertions_enabled() && self.tree.is_leaf(child) {
        let tail = self.insertions.tail();
        self.tree.nodes[child].insertion_pos = Some(tail);
        self.insertions.attach_leaf(tail, child);
      }

      if self.tree.is_leaf(child) {
        self.finalize_leaf(child, &mut on_seq, &mut spill)?;
      }
      if self.tree.is_leaf(node) {
        // only a root grafted onto an unrooted tree can be a leaf with
        // children; its sequence is not part of the output
        self.release_sequence(node);
      }

      self.tree.nodes[node].num_children_done += 1;
      self.maybe_release_internal(node, &mut on_seq)?;

      stack.push((child, Some(node), 0));
    }

    if self.params.insertions_enabled() {
      self.seq_length_indels = self.seq_len;
    }

    Ok(())
  }

  fn graft_and_seed_root(&mut self) {
    let old_root = self.tree.root;
    let seq = self.tree.nodes[old_root].sequence.clone();
    let num_gaps = self.tree.nodes[old_root].num_gaps;
    self.tree.graft_root();
    let new_root = self.tree.root;
    self.tree.nodes[new_root].sequence = seq;
    self.tree.nodes[new_root].num_gaps = num_gaps;
    if self.params.insertions_enabled() {
      self.tree.nodes[new_root].insertion_pos = Some(self.insertions.head());
    }
  }

  /// Applies the per-leaf finishing steps in order: site permutation (unless
  /// deferred behind insertions), sequencing error, then write, spill or keep
  fn finalize_leaf(
    &mut self,
    leaf: NodeId,
    on_seq: &mut Option<SeqCallback>,
    spill: &mut Option<&mut dyn Write>,
  ) -> Result<(), Report> {
    if self.tree.nodes[leaf].name == ROOT_NAME {
      self.release_sequence(leaf);
      return Ok(());
    }

    if self.params.fundi_enabled() && !self.params.insertions_enabled() && self.is_fundi_taxon(leaf) {
      let mut seq = std::mem::take(&mut self.tree.nodes[leaf].sequence);
      permute_selected_sites(&self.fundi_items, &mut seq);
      self.tree.nodes[leaf].sequence = seq;
    }

    self.apply_dna_error(leaf)?;

    if let Some(spill) = spill {
      write_spill_record(spill, &self.tree.nodes[leaf].name.clone(), &self.tree.nodes[leaf].sequence)?;
      self.release_sequence(leaf);
    } else if let Some(on_seq) = on_seq {
      if self.can_stream() {
        let seq = std::mem::take(&mut self.tree.nodes[leaf].sequence);
        on_seq(&self.tree.nodes[leaf].name.clone(), &seq)?;
      }
      // deferred modes keep the sequence resident for reconciliation,
      // permutation and filtering
    }

    Ok(())
  }

  fn is_fundi_taxon(&self, node: NodeId) -> bool {
    self.params.fundi_taxon_set.iter().any(|t| *t == self.tree.nodes[node].name)
  }

  fn release_sequence(&mut self, node: NodeId) {
    self.tree.nodes[node].sequence = vec![];
  }

  /// Frees an internal node's sequence once all its children are simulated,
  /// writing it out first when internal output was requested. With indels and
  /// internal output the sequence stays resident for later gap updates.
  fn maybe_release_internal(&mut self, node: NodeId, on_seq: &mut Option<SeqCallback>) -> Result<(), Report> {
    if self.tree.is_leaf(node) {
      return Ok(());
    }
    if self.tree.nodes[node].num_children_done < self.tree.nodes[node].neighbors.len().saturating_sub(1) {
      return Ok(());
    }
    if self.params.indels_enabled() && self.params.write_internal_sequences {
      return Ok(());
    }

    if self.params.write_internal_sequences && self.can_stream() {
      if let Some(on_seq) = on_seq {
        let seq = std::mem::take(&mut self.tree.nodes[node].sequence);
        let name = if self.tree.nodes[node].name.is_empty() {
          node.to_string()
        } else {
          self.tree.nodes[node].name.clone()
        };
        on_seq(&name, &seq)?;
        return Ok(());
      }
    }

    self.release_sequence(node);
    Ok(())
  }

  /// Propagates freshly recorded insertions into ancestor sequences: every
  /// internal node on the path back to the root (or, with internal output, in
  /// the whole traversed region up to the current node) gains gap columns at
  /// the inserted positions.
  pub(crate) fn update_internal_seqs_indels(&mut self, genome_tree: &GenomeTree, node: NodeId) -> Result<(), Report> {
    if self.params.write_internal_sequences {
      self.update_internal_seqs_from_root_to_node(genome_tree, node)
    } else {
      self.update_internal_seqs_from_node_to_root(genome_tree, node)
    }
  }

  fn pad_node_sequence(&mut self, genome_tree: &GenomeTree, node: NodeId) -> Result<(), Report> {
    let seq = std::mem::take(&mut self.tree.nodes[node].sequence);
    self.tree.nodes[node].num_gaps += self.seq_len - seq.len();
    let padded = genome_tree.export(&seq, self.seq_len, self.alphabet.unknown())?;
    self.tree.nodes[node].sequence = padded;
    Ok(())
  }

  fn update_internal_seqs_from_node_to_root(&mut self, genome_tree: &GenomeTree, node: NodeId) -> Result<(), Report> {
    let mut cursor = self.tree.nodes[node].parent;
    while let Some(internal) = cursor {
      if !self.tree.is_leaf(internal) && !self.tree.nodes[internal].sequence.is_empty() {
        self.pad_node_sequence(genome_tree, internal)?;
      }
      cursor = self.tree.nodes[internal].parent;
    }
    Ok(())
  }

  fn update_internal_seqs_from_root_to_node(
    &mut self,
    genome_tree: &GenomeTree,
    stopping_node: NodeId,
  ) -> Result<(), Report> {
    // preorder in traversal order, stopping once the just-simulated node is
    // reached: everything visited later has no sequence yet
    let mut stack: Vec<(NodeId, Option<NodeId>)> = vec![(self.tree.root, None)];
    while let Some((node, dad)) = stack.pop() {
      if node == stopping_node {
        break;
      }

      let is_internal = !self.tree.is_leaf(node) || self.tree.nodes[node].name == ROOT_NAME;
      if is_internal && !self.tree.nodes[node].sequence.is_empty() {
        self.pad_node_sequence(genome_tree, node)?;
      }

      for edge_index in self.tree.children(node, dad).into_iter().rev() {
        let child = self.tree.nodes[node].neighbors[edge_index].target;
        stack.push((child, Some(node)));
      }
    }
    Ok(())
  }

  /// Walks the insertion timeline and pads every frozen leaf into the final
  /// coordinate space. The genome tree is extended incrementally from event
  /// to event and rebuilt from scratch every `kappa * num_leaves` exported
  /// tips, bounding the cost of accumulated segments.
  pub fn reconcile_frozen_leaves(&mut self) -> Result<(), Report> {
    let new_length = self.seq_length_indels.max(self.seq_len);
    let rebuild_step = ((self.params.rebuild_indel_history_param * self.tree.leaf_num as f64) as usize).max(1);
    let mut rebuild_thresh = rebuild_step;
    let mut tips_count = 0_usize;

    // timeline events that froze at least one leaf, with whether more
    // insertions follow them
    let mut events: Vec<(InsertionId, bool)> = vec![];
    let mut cursor = Some(self.insertions.head());
    while let Some(id) = cursor {
      let insertion = self.insertions.get(id);
      if !insertion.phylo_nodes.is_empty() {
        events.push((id, insertion.next.is_some()));
      }
      cursor = insertion.next;
    }

    let mut genome_tree: Option<GenomeTree> = None;
    let mut prev: Option<InsertionId> = None;

    for (id, has_later_insertions) in events {
      let frozen = self.insertions.get(id).phylo_nodes.clone();

      if has_later_insertions {
        let base_length = self.tree.nodes[frozen[0]].sequence.len();
        genome_tree = Some(match (genome_tree.take(), prev) {
          (Some(tree), Some(prev)) if tips_count < rebuild_thresh => {
            let mut tree = tree;
            tree.update(&self.insertions, prev, id);
            tree
          }
          (Some(_), Some(_)) => {
            rebuild_thresh += rebuild_step;
            GenomeTree::build(&self.insertions, id, base_length)
          }
          _ => GenomeTree::build(&self.insertions, id, base_length),
        });
        prev = Some(id);
      } else {
        // frozen at the end of the timeline: the sequence is already in the
        // final coordinate space
        genome_tree = Some(GenomeTree::identity(new_length));
        prev = Some(id);
      }

      let tree = genome_tree.as_ref().expect("genome tree was just set");
      for node in frozen {
        tips_count += 1;
        let seq = std::mem::take(&mut self.tree.nodes[node].sequence);
        self.tree.nodes[node].num_gaps += new_length - seq.len();
        self.tree.nodes[node].sequence = tree.export(&seq, new_length, self.alphabet.unknown())?;
        self.tree.nodes[node].insertion_pos = None;
      }
      self.insertions.get_mut(id).phylo_nodes.clear();
    }

    Ok(())
  }

  /// Site permutation deferred behind insertion reconciliation: applied to
  /// each leaf of the divergence set exactly once
  pub fn process_delayed_fundi(&mut self) {
    for leaf in self.tree.output_leaves() {
      if self.is_fundi_taxon(leaf) {
        let mut seq = std::mem::take(&mut self.tree.nodes[leaf].sequence);
        permute_selected_sites(&self.fundi_items, &mut seq);
        self.tree.nodes[leaf].sequence = seq;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alphabet::alphabet::Alphabet;
  use crate::alphabet::alphabet::SeqKind;
  use crate::indel::distribution::IndelDistribution;
  use crate::io::nwk::read_nwk_str;
  use crate::model::parse::parse_model;
  use crate::sim::params::SimulationParams;
  use eyre::Report;
  use pretty_assertions::assert_eq;
  use rand::SeedableRng;
  use rand_isaac::Isaac64Rng;
  use rstest::rstest;

  fn make_sim(newick: &str, model_spec: &str, params: SimulationParams, seed: u64) -> Result<Simulator<Isaac64Rng>, Report> {
    let alphabet = Alphabet::new(SeqKind::Dna)?;
    let (model, rate_spec) = parse_model(model_spec, &alphabet)?;
    let tree = read_nwk_str(newick)?;
    let rng = Isaac64Rng::seed_from_u64(seed);
    Simulator::new(params, alphabet, model, rate_spec, tree, rng)
  }

  fn leaf_by_name<R: rand::Rng>(sim: &Simulator<R>, name: &str) -> NodeId {
    (0..sim.tree.nodes.len())
      .find(|&i| sim.tree.nodes[i].name == name)
      .expect("leaf exists")
  }

  #[rstest]
  fn two_taxon_divergence_matches_the_model() -> Result<(), Report> {
    let params = SimulationParams {
      sequence_length: 10_000,
      ..SimulationParams::default()
    };
    let mut sim = make_sim("(A:0.1,B:0.1);", "JC", params, 101)?;
    sim.prepare_dataset(None)?;
    sim.simulate_seqs(None, None)?;

    let a = leaf_by_name(&sim, "A");
    let b = leaf_by_name(&sim, "B");
    let (seq_a, seq_b) = (&sim.tree.nodes[a].sequence, &sim.tree.nodes[b].sequence);
    assert_eq!(seq_a.len(), 10_000);
    assert_eq!(seq_b.len(), 10_000);

    // without indels no leaf may contain the unknown sentinel
    let unknown = sim.alphabet.unknown();
    assert!(seq_a.iter().all(|&s| s != unknown));
    assert!(seq_b.iter().all(|&s| s != unknown));

    // under JC at path length 0.2 the expected difference fraction is
    // 3/4 (1 - exp(-4/3 * 0.2)) ~ 0.176
    let diffs = seq_a.iter().zip(seq_b.iter()).filter(|(a, b)| a != b).count();
    let fraction = diffs as f64 / 10_000.0;
    assert!((0.15..0.21).contains(&fraction), "difference fraction {fraction} out of range");
    Ok(())
  }

  #[rstest]
  fn zero_length_branches_clone_the_parent() -> Result<(), Report> {
    let params = SimulationParams {
      sequence_length: 500,
      ..SimulationParams::default()
    };
    let mut sim = make_sim("(A:0.0,B:0.0);", "JC", params, 102)?;
    sim.prepare_dataset(None)?;
    sim.simulate_seqs(None, None)?;

    let a = leaf_by_name(&sim, "A");
    let b = leaf_by_name(&sim, "B");
    assert_eq!(sim.tree.nodes[a].sequence, sim.tree.nodes[b].sequence);
    Ok(())
  }

  #[rstest]
  fn insertions_grow_the_alignment_and_pad_frozen_leaves() -> Result<(), Report> {
    let params = SimulationParams {
      sequence_length: 100,
      insertion_ratio: 0.05,
      insertion_distribution: IndelDistribution::geo(0.5),
      ..SimulationParams::default()
    };
    let mut sim = make_sim("(A:1.0,B:1.0);", "JC", params, 103)?;
    sim.prepare_dataset(None)?;
    sim.simulate_seqs(None, None)?;
    sim.reconcile_frozen_leaves()?;

    // with insertion rate ~5 per unit time over two branches, some insertion
    // occurred at this seed
    assert!(!sim.insertions.is_empty());
    assert!(sim.seq_len > 100);

    let unknown = sim.alphabet.unknown();
    for name in ["A", "B"] {
      let leaf = leaf_by_name(&sim, name);
      let seq = &sim.tree.nodes[leaf].sequence;
      assert_eq!(seq.len(), sim.seq_len, "leaf {name} must be padded to the final length");

      // without deletions, a leaf keeps all of its own sites; gaps stem only
      // from insertions on the other lineage
      let non_gaps = seq.iter().filter(|&&s| s != unknown).count();
      assert!(non_gaps >= 100);
      assert_eq!(sim.tree.nodes[leaf].num_gaps, seq.len() - non_gaps);
    }
    Ok(())
  }

  #[rstest]
  fn ascertainment_filtering_leaves_only_variant_columns() -> Result<(), Report> {
    let params = SimulationParams {
      sequence_length: 50,
      length_ratio: Some(3.0),
      ..SimulationParams::default()
    };
    let mut sim = make_sim("((A:0.3,B:0.3):0.1,(C:0.3,D:0.3):0.1);", "JC+ASC", params, 104)?;
    assert!(sim.length_ratio > 1.0);

    sim.prepare_dataset(None)?;
    sim.simulate_seqs(None, None)?;
    sim.remove_constant_sites()?;

    let leaves: Vec<NodeId> = sim.tree.output_leaves();
    for &leaf in &leaves {
      assert_eq!(sim.tree.nodes[leaf].sequence.len(), 50);
    }

    // every surviving column carries at least two distinct non-gap states
    let unknown = sim.alphabet.unknown();
    for site in 0..50 {
      let mut states: Vec<State> = leaves
        .iter()
        .map(|&leaf| sim.tree.nodes[leaf].sequence[site])
        .filter(|&s| s != unknown)
        .collect();
      states.sort_unstable();
      states.dedup();
      assert!(states.len() >= 2, "column {site} is constant");
    }
    Ok(())
  }

  #[rstest]
  fn fundi_differences_are_confined_to_permutation_targets() -> Result<(), Report> {
    let params = SimulationParams {
      sequence_length: 100,
      fundi_proportion: 0.1,
      fundi_taxon_set: vec!["A".to_owned()],
      ..SimulationParams::default()
    };
    let mut sim = make_sim("(A:0.0,B:0.0);", "JC", params, 105)?;
    sim.prepare_dataset(None)?;
    sim.simulate_seqs(None, None)?;

    let a = leaf_by_name(&sim, "A");
    let b = leaf_by_name(&sim, "B");
    let (seq_a, seq_b) = (&sim.tree.nodes[a].sequence, &sim.tree.nodes[b].sequence);

    // with zero-length branches, the sister carries the unpermuted root
    // sequence, so A may differ from B only at permutation targets
    let targets: Vec<usize> = sim.fundi_items.iter().map(|item| item.new_position).collect();
    for site in 0..100 {
      if seq_a[site] != seq_b[site] {
        assert!(targets.contains(&site), "unexpected difference at site {site}");
      }
    }
    Ok(())
  }

  #[rstest]
  fn ancestral_sequence_seeds_the_root_and_gets_padded() -> Result<(), Report> {
    let params = SimulationParams {
      sequence_length: 100,
      ..SimulationParams::default()
    };
    let mut sim = make_sim("(A:0.1,B:0.1);", "JC", params, 106)?;

    let ancestral: Vec<State> = (0..40).map(|i| (i % 4) as State).collect();
    sim.prepare_dataset(Some(&ancestral))?;

    let root_seq = &sim.tree.nodes[sim.tree.root].sequence;
    assert_eq!(root_seq.len(), 100);
    assert_eq!(&root_seq[..40], &ancestral[..]);
    Ok(())
  }

  #[rstest]
  fn unrooted_trees_are_grafted_before_traversal() -> Result<(), Report> {
    let params = SimulationParams {
      sequence_length: 200,
      ..SimulationParams::default()
    };
    let mut sim = make_sim("(A:0.1,B:0.1,C:0.1);", "JC", params, 107)?;
    sim.prepare_dataset(None)?;
    sim.simulate_seqs(None, None)?;

    assert!(sim.tree.rooted);
    for name in ["A", "B", "C"] {
      let leaf = leaf_by_name(&sim, name);
      assert_eq!(sim.tree.nodes[leaf].sequence.len(), 200, "leaf {name} length");
    }
    Ok(())
  }

  #[rstest]
  fn streaming_callback_sees_leaves_in_traversal_order() -> Result<(), Report> {
    let params = SimulationParams {
      sequence_length: 50,
      ..SimulationParams::default()
    };
    let mut sim = make_sim("((A:0.1,B:0.1):0.1,C:0.1);", "JC", params, 108)?;
    sim.prepare_dataset(None)?;

    let mut names: Vec<String> = vec![];
    let mut on_seq = |name: &str, states: &[State]| -> Result<(), Report> {
      assert_eq!(states.len(), 50);
      names.push(name.to_owned());
      Ok(())
    };
    sim.simulate_seqs(Some(&mut on_seq), None)?;

    assert_eq!(names, vec!["A", "B", "C"]);
    Ok(())
  }
}
