use crate::alphabet::alphabet::State;
use crate::constants::ROOT_NAME;
use crate::genome::insertion::InsertionId;
use indexmap::IndexMap;

pub type NodeId = usize;

/// Half-edge of the undirected tree topology: the target node plus edge
/// metadata. Every edge is stored twice, once per endpoint.
#[derive(Clone, Debug, Default)]
pub struct EdgeTo {
  pub target: NodeId,
  pub length: f64,
  pub attrs: IndexMap<String, String>,
}

/// Node of the phylogeny. Topology is an undirected neighbor list; traversal
/// passes the incoming neighbor ("dad") explicitly to orient itself.
#[derive(Clone, Debug, Default)]
pub struct PhyloNode {
  pub name: String,
  pub neighbors: Vec<EdgeTo>,
  pub sequence: Vec<State>,
  pub num_gaps: usize,
  pub num_children_done: usize,
  pub parent: Option<NodeId>,
  /// Position of this node on the insertion timeline: the last insertion
  /// recorded before the node stopped evolving
  pub insertion_pos: Option<InsertionId>,
}

/// Arena-allocated phylogenetic tree. Nodes are addressed by index; edges
/// store target indices, so the node-to-neighbor cycle of the topology never
/// turns into ownership cycles.
#[derive(Clone, Debug)]
pub struct PhyloTree {
  pub nodes: Vec<PhyloNode>,
  pub root: NodeId,
  pub rooted: bool,
  pub leaf_num: usize,
}

impl PhyloTree {
  pub fn new() -> Self {
    Self {
      nodes: vec![],
      root: 0,
      rooted: false,
      leaf_num: 0,
    }
  }

  pub fn add_node(&mut self, name: impl Into<String>) -> NodeId {
    let id = self.nodes.len();
    self.nodes.push(PhyloNode {
      name: name.into(),
      ..PhyloNode::default()
    });
    id
  }

  pub fn connect(&mut self, a: NodeId, b: NodeId, length: f64, attrs: IndexMap<String, String>) {
    self.nodes[a].neighbors.push(EdgeTo {
      target: b,
      length,
      attrs: attrs.clone(),
    });
    self.nodes[b].neighbors.push(EdgeTo { target: a, length, attrs });
  }

  #[inline]
  pub fn is_leaf(&self, id: NodeId) -> bool {
    self.nodes[id].neighbors.len() <= 1
  }

  /// Neighbors of `node` excluding the one it was entered from
  pub fn children(&self, node: NodeId, dad: Option<NodeId>) -> Vec<usize> {
    self.nodes[node]
      .neighbors
      .iter()
      .enumerate()
      .filter(|(_, edge)| Some(edge.target) != dad)
      .map(|(i, _)| i)
      .collect()
  }

  /// Leaves that appear in the output alignment (the grafted root is skipped)
  pub fn output_leaves(&self) -> Vec<NodeId> {
    let mut leaves = vec![];
    self.visit_dfs(|tree, node, _| {
      if tree.is_leaf(node) && tree.nodes[node].name != ROOT_NAME {
        leaves.push(node);
      }
    });
    leaves
  }

  pub fn max_name_len(&self) -> usize {
    self
      .output_leaves()
      .into_iter()
      .map(|id| self.nodes[id].name.len())
      .max()
      .unwrap_or(0)
  }

  /// Depth-first traversal from the root with an explicit stack, visiting
  /// `(tree, node, dad)` in preorder
  pub fn visit_dfs(&self, mut visit: impl FnMut(&Self, NodeId, Option<NodeId>)) {
    let mut stack: Vec<(NodeId, Option<NodeId>)> = vec![(self.root, None)];
    while let Some((node, dad)) = stack.pop() {
      visit(self, node, dad);
      for edge_index in self.children(node, dad).into_iter().rev() {
        let child = self.nodes[node].neighbors[edge_index].target;
        stack.push((child, Some(node)));
      }
    }
  }

  /// Grafts a terminal root onto an unrooted tree: a new node named
  /// `__root__` attached with a zero-length edge to the multifurcating
  /// center. Simulation then starts at the grafted node; every original
  /// branch keeps its length.
  pub fn graft_root(&mut self) {
    if self.rooted || self.nodes.is_empty() {
      return;
    }

    let anchor = self.root;
    let new_root = self.add_node(ROOT_NAME);
    self.connect(new_root, anchor, 0.0, IndexMap::new());
    self.root = new_root;
    self.rooted = true;
    self.leaf_num += 1;
  }

  /// Clears all per-run state so the same topology can host another dataset
  pub fn reset_run_state(&mut self) {
    for node in &mut self.nodes {
      node.sequence = vec![];
      node.num_gaps = 0;
      node.num_children_done = 0;
      node.parent = None;
      node.insertion_pos = None;
    }
  }
}

impl Default for PhyloTree {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::nwk::read_nwk_str;
  use eyre::Report;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn grafts_root_onto_unrooted_tree() -> Result<(), Report> {
    let mut tree = read_nwk_str("(A:0.1,B:0.2,C:0.3);")?;
    assert!(!tree.rooted);
    let num_nodes = tree.nodes.len();

    tree.graft_root();
    assert!(tree.rooted);
    assert_eq!(tree.nodes.len(), num_nodes + 1);
    assert_eq!(tree.nodes[tree.root].name, ROOT_NAME);
    assert_eq!(tree.nodes[tree.root].neighbors.len(), 1);
    assert_eq!(tree.nodes[tree.root].neighbors[0].length, 0.0);
    Ok(())
  }

  #[rstest]
  fn dfs_visits_every_node_once() -> Result<(), Report> {
    let tree = read_nwk_str("((A:0.1,B:0.2):0.05,(C:0.3,D:0.4):0.06);")?;
    let mut visited = vec![];
    tree.visit_dfs(|_, node, _| visited.push(node));
    assert_eq!(visited.len(), tree.nodes.len());

    let mut sorted = visited.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), visited.len());
    Ok(())
  }

  #[rstest]
  fn output_leaves_follow_dfs_order() -> Result<(), Report> {
    let tree = read_nwk_str("((A:0.1,B:0.2):0.05,(C:0.3,D:0.4):0.06);")?;
    let names: Vec<&str> = tree
      .output_leaves()
      .into_iter()
      .map(|id| tree.nodes[id].name.as_str())
      .collect();
    assert_eq!(names, vec!["A", "B", "C", "D"]);
    Ok(())
  }
}
