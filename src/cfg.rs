//! The control-flow graph: an arena of instruction and selector nodes
//! discovered lazily as execution visits new addresses, with divergence
//! handling for self-modifying code.

use std::collections::HashMap;
use std::fmt;

use log::{debug, trace};

use crate::error::{ParseError, VmFault};
use crate::field::Signature;
use crate::inst::ParsedInstruction;
use crate::mem::MemoryPort;
use crate::parser::Parser;
use crate::state::SegmentedAddress;

/// Stable arena index of a CFG node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Successor classification on instruction-node edges.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum EdgeKind {
    FallThrough,
    Taken,
    Return,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EdgeKind::FallThrough => write!(f, "fall"),
            EdgeKind::Taken => write!(f, "taken"),
            EdgeKind::Return => write!(f, "ret"),
        }
    }
}

/// A node wrapping one parsed instruction plus its outgoing edges.
///
/// Edges are unique per kind: re-recording a kind with a different target
/// replaces the previous edge.
#[derive(Debug)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct InstructionNode {
    inst: ParsedInstruction,
    edges: Vec<(EdgeKind, NodeId)>,
}

impl InstructionNode {
    pub fn inst(&self) -> &ParsedInstruction {
        &self.inst
    }

    pub fn successor(&self, kind: EdgeKind) -> Option<NodeId> {
        self.edges
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, id)| *id)
    }

    pub fn edges(&self) -> &[(EdgeKind, NodeId)] {
        &self.edges
    }

    fn set_edge(&mut self, kind: EdgeKind, target: NodeId) {
        if let Some(slot) = self.edges.iter_mut().find(|(k, _)| *k == kind) {
            slot.1 = target;
        } else {
            self.edges.push((kind, target));
        }
    }
}

/// SMC divergence point: routes to the first candidate whose signature
/// matches current memory, in insertion order.
#[derive(Debug)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct SelectorNode {
    address: u32,
    candidates: Vec<NodeId>,
}

/// Historical name for the selector interposed at return targets.
pub type DiscriminatedNode = SelectorNode;

impl SelectorNode {
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Candidate node ids in insertion order.
    pub fn candidates(&self) -> &[NodeId] {
        &self.candidates
    }
}

/// Either kind of node. Selectors never carry semantics; they only route.
#[derive(Debug)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum CfgNode {
    Instruction(InstructionNode),
    Selector(SelectorNode),
}

impl CfgNode {
    pub fn as_instruction(&self) -> Option<&InstructionNode> {
        match self {
            CfgNode::Instruction(n) => Some(n),
            CfgNode::Selector(_) => None,
        }
    }

    pub fn as_selector(&self) -> Option<&SelectorNode> {
        match self {
            CfgNode::Selector(s) => Some(s),
            CfgNode::Instruction(_) => None,
        }
    }
}

/// A fetch that could not produce an executable node.
#[derive(Debug)]
pub enum FetchError {
    /// The bytes at the address do not parse; the loop turns this into #UD.
    Parse(ParseError),
    /// Graph consistency failure; fatal.
    Fault(VmFault),
}

impl From<ParseError> for FetchError {
    fn from(e: ParseError) -> Self {
        FetchError::Parse(e)
    }
}

impl From<VmFault> for FetchError {
    fn from(e: VmFault) -> Self {
        FetchError::Fault(e)
    }
}

/// The arena of discovered nodes plus the live-node index per address.
///
/// Nodes are created on first visit, mutated only to add edges or to be
/// put behind a selector, and never destroyed during a run.
pub struct NodeStore {
    nodes: Vec<CfgNode>,
    live: HashMap<u32, NodeId>,
    parser: Parser,
}

impl NodeStore {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            live: HashMap::new(),
            parser: Parser::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &CfgNode {
        &self.nodes[id.index()]
    }

    /// The node currently live at a linear address, if any.
    pub fn live_at(&self, linear: u32) -> Option<NodeId> {
        self.live.get(&linear).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &CfgNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    /// Every `(source, kind, target)` edge in the graph.
    pub fn edges(&self) -> Vec<(NodeId, EdgeKind, NodeId)> {
        let mut out = Vec::new();
        for (id, node) in self.iter() {
            if let CfgNode::Instruction(n) = node {
                for (kind, target) in &n.edges {
                    out.push((id, *kind, *target));
                }
            }
        }
        out
    }

    fn push_instruction(&mut self, inst: ParsedInstruction) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        debug!("cfg: node {id} at {} is `{}`", inst.address(), inst.disassemble());
        self.nodes.push(CfgNode::Instruction(InstructionNode {
            inst,
            edges: Vec::new(),
        }));
        id
    }

    /// Fetches the executable instruction node for `addr`, parsing new
    /// memory, reusing the live node, or routing through (and growing)
    /// a selector as needed. Always returns an instruction node.
    pub fn fetch<M: MemoryPort + ?Sized>(
        &mut self,
        mem: &M,
        addr: SegmentedAddress,
    ) -> Result<NodeId, FetchError> {
        let linear = addr.linear();
        let Some(live) = self.live_at(linear) else {
            let inst = self.parser.parse(mem, addr)?;
            let id = self.push_instruction(inst);
            self.live.insert(linear, id);
            return Ok(id);
        };

        match &self.nodes[live.index()] {
            CfgNode::Instruction(node) => {
                if node.inst.signature().matches_memory(mem, linear) {
                    trace!("cfg: live node {live} still matches at {addr}");
                    return Ok(live);
                }
                self.diverge(mem, addr, live)
            }
            CfgNode::Selector(_) => self.route_selector(mem, addr, live),
        }
    }

    /// First divergence at an address: interpose a selector over the
    /// formerly-live node and the freshly parsed variant.
    fn diverge<M: MemoryPort + ?Sized>(
        &mut self,
        mem: &M,
        addr: SegmentedAddress,
        old_live: NodeId,
    ) -> Result<NodeId, FetchError> {
        let linear = addr.linear();
        let fresh = self.parser.parse(mem, addr)?;
        debug!(
            "cfg: divergence at {addr}: memory now parses as `{}`",
            fresh.disassemble()
        );

        let mut candidates = vec![old_live];
        let chosen = match self.find_candidate(&candidates, &fresh.signature()) {
            Some(existing) => existing,
            None => {
                let id = self.push_instruction(fresh);
                candidates.push(id);
                id
            }
        };

        let selector = NodeId(self.nodes.len() as u32);
        self.nodes.push(CfgNode::Selector(SelectorNode {
            address: linear,
            candidates,
        }));
        self.live.insert(linear, selector);
        debug!("cfg: selector {selector} interposed at {addr}");
        Ok(chosen)
    }

    /// A selector is live at the address: pick the first matching
    /// candidate, admitting a freshly parsed one on a miss.
    fn route_selector<M: MemoryPort + ?Sized>(
        &mut self,
        mem: &M,
        addr: SegmentedAddress,
        selector: NodeId,
    ) -> Result<NodeId, FetchError> {
        let linear = addr.linear();
        let candidates = match &self.nodes[selector.index()] {
            CfgNode::Selector(s) => s.candidates.clone(),
            CfgNode::Instruction(_) => {
                return Err(VmFault::CorruptedGraph(format!(
                    "live node {selector} at {linear:#07x} is not a selector"
                ))
                .into())
            }
        };

        for id in &candidates {
            if self.signature_of(*id).matches_memory(mem, linear) {
                trace!("cfg: selector {selector} routes to {id} at {addr}");
                return Ok(*id);
            }
        }

        // No known variant covers the current bytes: parse and admit one.
        let fresh = self.parser.parse(mem, addr)?;
        let sig = fresh.signature();
        if !sig.matches_memory(mem, linear) {
            return Err(VmFault::NoMatchingCandidate {
                address: linear,
                candidates: candidates.len(),
            }
            .into());
        }
        let id = match self.find_candidate(&candidates, &sig) {
            Some(existing) => existing,
            None => {
                let id = self.push_instruction(fresh);
                if let CfgNode::Selector(s) = &mut self.nodes[selector.index()] {
                    s.candidates.push(id);
                }
                debug!("cfg: selector {selector} grew candidate {id} at {addr}");
                id
            }
        };
        Ok(id)
    }

    fn signature_of(&self, id: NodeId) -> Signature {
        match &self.nodes[id.index()] {
            CfgNode::Instruction(n) => n.inst.signature(),
            CfgNode::Selector(_) => Signature::empty(),
        }
    }

    /// A candidate already carrying exactly this signature.
    fn find_candidate(&self, candidates: &[NodeId], sig: &Signature) -> Option<NodeId> {
        candidates
            .iter()
            .copied()
            .find(|id| self.signature_of(*id) == *sig)
    }

    /// Records `from --kind--> to`, replacing a previous target of the
    /// same kind.
    pub fn record_edge(&mut self, from: NodeId, kind: EdgeKind, to: NodeId) {
        if let CfgNode::Instruction(n) = &mut self.nodes[from.index()] {
            n.set_edge(kind, to);
        }
    }

    /// Locks a node's value fields to observed memory after an execution,
    /// extending its signature over the full footprint. Skipped for nodes
    /// behind a selector: their address is known-divergent and wildcard
    /// immediates are what lets future rewrites reuse them.
    pub fn finalize_fields<M: MemoryPort + ?Sized>(&mut self, mem: &M, id: NodeId) {
        let behind_selector = {
            let CfgNode::Instruction(n) = &self.nodes[id.index()] else {
                return;
            };
            self.live_at(n.inst.address().linear()) != Some(id)
        };
        if behind_selector {
            return;
        }
        if let CfgNode::Instruction(n) = &mut self.nodes[id.index()] {
            for field in n.inst.fields_mut() {
                field.finalize(mem);
            }
        }
    }
}

impl Default for NodeStore {
    fn default() -> Self {
        NodeStore::new()
    }
}

impl fmt::Display for NodeStore {
    /// Text dump of nodes and edges for analysis tooling.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (id, node) in self.iter() {
            match node {
                CfgNode::Instruction(n) => {
                    write!(
                        f,
                        "{id} [{}] `{}` <{}>",
                        n.inst.address(),
                        n.inst.disassemble(),
                        n.inst.signature()
                    )?;
                    for (kind, target) in &n.edges {
                        write!(f, " {kind}->{target}")?;
                    }
                }
                CfgNode::Selector(s) => {
                    write!(f, "{id} [{:#07x}] selector", s.address)?;
                    for c in &s.candidates {
                        write!(f, " ?{c}")?;
                    }
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
