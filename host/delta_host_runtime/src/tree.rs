use crate::error::ProtocolError;
use crate::protocol::{Block, DeltaChange, Element};

/// Which run produced a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStamp {
    pub script_run_id: String,
    pub fragment_id: Option<String>,
    pub active_script_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementNode {
    pub element: Element,
    pub stamp: NodeStamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockNode {
    pub block: Block,
    pub children: Vec<AppNode>,
    pub stamp: NodeStamp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppNode {
    Element(ElementNode),
    Block(BlockNode),
}

impl AppNode {
    pub fn from_change(change: &DeltaChange, stamp: NodeStamp) -> Self {
        match change {
            DeltaChange::NewElement { element } => AppNode::Element(ElementNode {
                element: element.clone(),
                stamp,
            }),
            DeltaChange::AddBlock { block } => AppNode::Block(BlockNode {
                block: block.clone(),
                children: Vec::new(),
                stamp,
            }),
        }
    }

    pub fn stamp(&self) -> &NodeStamp {
        match self {
            AppNode::Element(node) => &node.stamp,
            AppNode::Block(node) => &node.stamp,
        }
    }

    pub fn subtree_len(&self) -> usize {
        match self {
            AppNode::Element(_) => 1,
            AppNode::Block(node) => 1 + node.children.iter().map(AppNode::subtree_len).sum::<usize>(),
        }
    }
}

/// The fixed top-level containers. The first component of every delta
/// path picks one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootContainer {
    Main,
    Sidebar,
    Event,
    Bottom,
}

impl RootContainer {
    pub const ALL: [RootContainer; 4] = [
        RootContainer::Main,
        RootContainer::Sidebar,
        RootContainer::Event,
        RootContainer::Bottom,
    ];

    pub fn index(self) -> usize {
        match self {
            RootContainer::Main => 0,
            RootContainer::Sidebar => 1,
            RootContainer::Event => 2,
            RootContainer::Bottom => 3,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }
}

/// The client-held UI. The containers themselves are never stamped, never
/// stale and never removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementTree {
    containers: [Vec<AppNode>; 4],
}

impl ElementTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a node built from `change` at `path`, replacing (and dropping
    /// the subtree of) whatever was there. An index one past the last child
    /// appends. Every block above the written node takes on its run id, so a
    /// sweep of the current run never drops a block holding fresh children.
    pub fn apply_delta(
        &mut self,
        path: &[u32],
        change: &DeltaChange,
        stamp: NodeStamp,
    ) -> Result<(), ProtocolError> {
        let script_run_id = stamp.script_run_id.clone();
        let (siblings, index) = self.slot_mut(path)?;
        let node = AppNode::from_change(change, stamp);

        match index.cmp(&siblings.len()) {
            std::cmp::Ordering::Less => siblings[index] = node,
            std::cmp::Ordering::Equal => siblings.push(node),
            std::cmp::Ordering::Greater => {
                return Err(ProtocolError::invalid_path(
                    path,
                    format!("index {index} skips past {} existing children", siblings.len()),
                ));
            }
        }

        self.restamp_ancestors(path, &script_run_id);
        Ok(())
    }

    pub fn get(&self, path: &[u32]) -> Option<&AppNode> {
        let (&container, rest) = path.split_first()?;
        let mut siblings = self.container(RootContainer::from_index(container)?);
        let (&last, ancestors) = rest.split_last()?;

        for &index in ancestors {
            match siblings.get(index as usize)? {
                AppNode::Block(block) => siblings = block.children.as_slice(),
                AppNode::Element(_) => return None,
            }
        }

        siblings.get(last as usize)
    }

    pub fn container(&self, container: RootContainer) -> &[AppNode] {
        &self.containers[container.index()]
    }

    /// Depth-first over every leaf, main container first. Each call starts
    /// a fresh traversal.
    pub fn elements(&self) -> Elements<'_> {
        Elements(self.leaves())
    }

    /// Like [`ElementTree::elements`], but yields the stamped nodes.
    pub fn leaves(&self) -> Leaves<'_> {
        Leaves {
            stack: self.containers.iter().rev().map(|nodes| nodes.iter()).collect(),
        }
    }

    /// Removes every node matching `is_stale`, subtree included. Children
    /// are examined before their parent. Returns the number of nodes removed.
    pub fn prune_stale<F>(&mut self, is_stale: F) -> usize
    where
        F: Fn(&AppNode) -> bool,
    {
        self.containers
            .iter_mut()
            .map(|children| prune_children(children, &is_stale))
            .sum()
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.node_count();
        for children in &mut self.containers {
            children.clear();
        }
        removed
    }

    pub fn node_count(&self) -> usize {
        self.containers
            .iter()
            .flatten()
            .map(AppNode::subtree_len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.iter().all(Vec::is_empty)
    }

    fn slot_mut(&mut self, path: &[u32]) -> Result<(&mut Vec<AppNode>, usize), ProtocolError> {
        let Some((&container, rest)) = path.split_first() else {
            return Err(ProtocolError::invalid_path(path, "empty path"));
        };
        let Some((&last, ancestors)) = rest.split_last() else {
            return Err(ProtocolError::invalid_path(
                path,
                "path must address a child of a top-level container",
            ));
        };
        let Some(container) = RootContainer::from_index(container) else {
            return Err(ProtocolError::invalid_path(
                path,
                format!("unknown top-level container {container}"),
            ));
        };

        let mut siblings = &mut self.containers[container.index()];
        for &index in ancestors {
            siblings = match siblings.get_mut(index as usize) {
                Some(AppNode::Block(block)) => &mut block.children,
                Some(AppNode::Element(_)) => {
                    return Err(ProtocolError::invalid_path(
                        path,
                        format!("index {index} is an element, not a block"),
                    ));
                }
                None => {
                    return Err(ProtocolError::invalid_path(
                        path,
                        format!("no block at index {index}"),
                    ));
                }
            };
        }

        Ok((siblings, last as usize))
    }

    /// Only called once `path` is known to be valid.
    fn restamp_ancestors(&mut self, path: &[u32], script_run_id: &str) {
        let Some((&container, rest)) = path.split_first() else {
            return;
        };
        let Some((_, ancestors)) = rest.split_last() else {
            return;
        };
        let Some(container) = RootContainer::from_index(container) else {
            return;
        };

        let mut siblings = &mut self.containers[container.index()];
        for &index in ancestors {
            let Some(AppNode::Block(block)) = siblings.get_mut(index as usize) else {
                return;
            };
            if block.stamp.script_run_id != script_run_id {
                block.stamp.script_run_id = script_run_id.to_string();
            }
            siblings = &mut block.children;
        }
    }
}

fn prune_children<F>(children: &mut Vec<AppNode>, is_stale: &F) -> usize
where
    F: Fn(&AppNode) -> bool,
{
    let mut removed = 0;
    children.retain_mut(|child| {
        if let AppNode::Block(block) = child {
            removed += prune_children(&mut block.children, is_stale);
        }

        if is_stale(child) {
            removed += child.subtree_len();
            false
        } else {
            true
        }
    });
    removed
}

pub struct Leaves<'a> {
    stack: Vec<std::slice::Iter<'a, AppNode>>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = &'a ElementNode;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let siblings = self.stack.last_mut()?;
            match siblings.next() {
                Some(AppNode::Element(node)) => return Some(node),
                Some(AppNode::Block(node)) => self.stack.push(node.children.iter()),
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

pub struct Elements<'a>(Leaves<'a>);

impl<'a> Iterator for Elements<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|node| &node.element)
    }
}
