use crate::tree::tree::NodeId;

pub type InsertionId = usize;

/// One recorded insertion event. `position` is expressed in the sequence
/// coordinates that were current when the event occurred.
#[derive(Clone, Debug)]
pub struct Insertion {
  pub position: usize,
  pub length: usize,
  /// True iff the insertion occurred at the sequence tail
  pub appended: bool,
  pub next: Option<InsertionId>,
  /// Leaves that stopped evolving between this event and the next one. Weak
  /// back-references: the tree arena owns the nodes.
  pub phylo_nodes: Vec<NodeId>,
}

/// Append-only timeline of insertion events, stored as an arena-backed singly
/// linked list. The head is a zero-length sentinel so that leaves which froze
/// before any insertion have a place to attach.
#[derive(Clone, Debug)]
pub struct InsertionLog {
  arena: Vec<Insertion>,
  tail: InsertionId,
}

impl InsertionLog {
  pub fn new() -> Self {
    let sentinel = Insertion {
      position: 0,
      length: 0,
      appended: false,
      next: None,
      phylo_nodes: vec![],
    };
    Self {
      arena: vec![sentinel],
      tail: 0,
    }
  }

  #[inline]
  pub fn head(&self) -> InsertionId {
    0
  }

  #[inline]
  pub fn tail(&self) -> InsertionId {
    self.tail
  }

  #[inline]
  pub fn get(&self, id: InsertionId) -> &Insertion {
    &self.arena[id]
  }

  #[inline]
  pub fn get_mut(&mut self, id: InsertionId) -> &mut Insertion {
    &mut self.arena[id]
  }

  /// Records a new insertion event at the tail of the timeline
  pub fn push(&mut self, position: usize, length: usize, appended: bool) -> InsertionId {
    let id = self.arena.len();
    self.arena.push(Insertion {
      position,
      length,
      appended,
      next: None,
      phylo_nodes: vec![],
    });
    self.arena[self.tail].next = Some(id);
    self.tail = id;
    id
  }

  /// Attaches a frozen leaf to the insertion it stopped evolving at
  pub fn attach_leaf(&mut self, id: InsertionId, node: NodeId) {
    self.arena[id].phylo_nodes.push(node);
  }

  /// Events strictly after `from`, in timeline order
  pub fn iter_after(&self, from: InsertionId) -> impl Iterator<Item = InsertionId> + '_ {
    let mut cursor = self.arena[from].next;
    std::iter::from_fn(move || {
      let id = cursor?;
      cursor = self.arena[id].next;
      Some(id)
    })
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.arena.len() - 1
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for InsertionLog {
  fn default() -> Self {
    Self::new()
  }
}
