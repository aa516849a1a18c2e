//! Arena holding the nodes and links of one shader.
use glam::Vec3;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::node::{NodeKind, NodeRole};
use crate::graph::socket::{InputRef, OutputRef, ShaderInput, ShaderOutput, SocketValue};
use crate::graph::variant::VariantSet;
use crate::graph::NodeId;

/// A node instance: its kind plus the concrete sockets derived from that kind.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub inputs: Vec<ShaderInput>,
    pub outputs: Vec<ShaderOutput>,
}

impl ShaderNode {
    /// Creates an unlinked node with the kind's default socket values.
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        let inputs = kind
            .input_decls()
            .into_iter()
            .map(|decl| ShaderInput {
                name: decl.name.to_string(),
                ty: decl.ty,
                value: decl.default,
                link: None,
                skip: VariantSet::empty(),
            })
            .collect();
        let outputs = kind
            .output_decls()
            .into_iter()
            .map(|decl| ShaderOutput {
                name: decl.name.to_string(),
                ty: decl.ty,
                links: Vec::new(),
            })
            .collect();
        Self {
            id,
            kind,
            inputs,
            outputs,
        }
    }

    #[inline]
    pub fn role(&self) -> NodeRole {
        self.kind.role()
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|i| i.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|o| o.name == name)
    }

    pub fn input(&self, name: &str) -> Option<&ShaderInput> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&ShaderOutput> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Whether the named input has a link, ignoring per-variant skip flags.
    pub fn is_linked(&self, name: &str) -> bool {
        self.input(name).is_some_and(|i| i.link.is_some())
    }

    fn check_layout(&self) -> Result<()> {
        let inputs = self.kind.input_decls();
        let outputs = self.kind.output_decls();
        let inputs_match = inputs.len() == self.inputs.len()
            && inputs
                .iter()
                .zip(&self.inputs)
                .all(|(d, i)| d.name == i.name && d.ty == i.ty && i.value.fits(i.ty));
        let outputs_match = outputs.len() == self.outputs.len()
            && outputs
                .iter()
                .zip(&self.outputs)
                .all(|(d, o)| d.name == o.name && d.ty == o.ty);
        if inputs_match && outputs_match {
            Ok(())
        } else {
            Err(Error::Graph(format!(
                "node {} does not have the socket layout of a {} node",
                self.id,
                self.kind.name()
            )))
        }
    }
}

/// The node network of one shader.
///
/// Node ids are dense (`0..len`) but nodes may be stored in any order; lookups go through an
/// id index so compilation never depends on storage order. The graph's output is its unique
/// [`NodeKind::Output`] node.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "Vec<ShaderNode>", into = "Vec<ShaderNode>")
)]
#[derive(Clone, Debug)]
pub struct ShaderGraph {
    nodes: Vec<ShaderNode>,
    index: Vec<usize>,
    output: Option<NodeId>,
}

impl Default for ShaderGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderGraph {
    /// Creates a graph holding only an output node with id 0.
    pub fn new() -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            index: Vec::new(),
            output: None,
        };
        graph.add(NodeKind::Output);
        graph
    }

    /// Builds a graph from externally constructed nodes, validating ids, socket layouts and
    /// link symmetry. Nodes may be given in any order.
    pub fn from_nodes(nodes: Vec<ShaderNode>) -> Result<Self> {
        let mut index = vec![usize::MAX; nodes.len()];
        for (pos, node) in nodes.iter().enumerate() {
            let slot = index.get_mut(node.id.index()).ok_or_else(|| {
                Error::Graph(format!(
                    "node id {} out of range for {} nodes",
                    node.id,
                    nodes.len()
                ))
            })?;
            if *slot != usize::MAX {
                return Err(Error::Graph(format!("duplicate node id {}", node.id)));
            }
            *slot = pos;
        }

        let mut output = None;
        for node in &nodes {
            node.check_layout()?;
            if node.role() == NodeRole::Output {
                if output.is_some() {
                    return Err(Error::Graph("graph has more than one output node".into()));
                }
                output = Some(node.id);
            }
        }

        let graph = Self {
            nodes,
            index,
            output,
        };
        graph.check_links()?;
        Ok(graph)
    }

    fn check_links(&self) -> Result<()> {
        for node in &self.nodes {
            for (socket, input) in node.inputs.iter().enumerate() {
                let Some(link) = input.link else { continue };
                let producer = self.node(link.node).ok_or_else(|| {
                    Error::Graph(format!("node {} links from missing node {}", node.id, link.node))
                })?;
                let output = producer.outputs.get(link.socket).ok_or_else(|| {
                    Error::Graph(format!(
                        "node {} links from missing output {} of node {}",
                        node.id, link.socket, link.node
                    ))
                })?;
                if !output.ty.links_to(input.ty) {
                    return Err(Error::Graph(format!(
                        "cannot link {:?} output '{}' into {:?} input '{}' of node {}",
                        output.ty, output.name, input.ty, input.name, node.id
                    )));
                }
                let back = InputRef {
                    node: node.id,
                    socket,
                };
                if !output.links.contains(&back) {
                    return Err(Error::Graph(format!(
                        "output '{}' of node {} does not list its consumer {}",
                        output.name, link.node, node.id
                    )));
                }
            }
            for (socket, output) in node.outputs.iter().enumerate() {
                let here = OutputRef {
                    node: node.id,
                    socket,
                };
                for consumer in &output.links {
                    let linked = self
                        .node(consumer.node)
                        .and_then(|n| n.inputs.get(consumer.socket))
                        .is_some_and(|i| i.link == Some(here));
                    if !linked {
                        return Err(Error::Graph(format!(
                            "output '{}' of node {} lists a consumer that does not link back",
                            output.name, node.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Adds a node and returns its id, rejecting a second output node like [`Self::from_nodes`].
    pub fn try_add(&mut self, kind: NodeKind) -> Result<NodeId> {
        if kind.role() == NodeRole::Output && self.output.is_some() {
            return Err(Error::Graph("graph has more than one output node".into()));
        }
        Ok(self.push_node(kind))
    }

    /// Adds a node and returns its id.
    ///
    /// The graph holds at most one output node. Use [`Self::try_add`] when `kind` may be
    /// [`NodeKind::Output`].
    pub fn add(&mut self, kind: NodeKind) -> NodeId {
        debug_assert!(
            kind.role() != NodeRole::Output || self.output.is_none(),
            "graph already has an output node"
        );
        self.push_node(kind)
    }

    fn push_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        if kind.role() == NodeRole::Output && self.output.is_none() {
            self.output = Some(id);
        }
        self.index.push(self.nodes.len());
        self.nodes.push(ShaderNode::new(id, kind));
        id
    }

    /// Links output `output` of `from` into input `input` of `to`, replacing any previous link
    /// on that input.
    pub fn connect(&mut self, from: NodeId, output: &str, to: NodeId, input: &str) -> Result<()> {
        let producer = self.node_or_err(from)?;
        let out_socket = producer
            .output_index(output)
            .ok_or_else(|| unknown_socket(from, output))?;
        let out_ty = producer.outputs[out_socket].ty;
        let consumer = self.node_or_err(to)?;
        let in_socket = consumer
            .input_index(input)
            .ok_or_else(|| unknown_socket(to, input))?;
        let in_ty = consumer.inputs[in_socket].ty;
        if !out_ty.links_to(in_ty) {
            return Err(Error::Graph(format!(
                "cannot link {out_ty:?} output '{output}' of node {from} into {in_ty:?} input '{input}' of node {to}"
            )));
        }

        self.unlink(to, in_socket);
        let src = OutputRef {
            node: from,
            socket: out_socket,
        };
        self.node_mut(to)?.inputs[in_socket].link = Some(src);
        self.node_mut(from)?.outputs[out_socket]
            .links
            .push(InputRef {
                node: to,
                socket: in_socket,
            });
        Ok(())
    }

    /// Removes the link feeding input `input` of `to`, if any.
    pub fn disconnect(&mut self, to: NodeId, input: &str) -> Result<()> {
        let socket = self
            .node_or_err(to)?
            .input_index(input)
            .ok_or_else(|| unknown_socket(to, input))?;
        self.unlink(to, socket);
        Ok(())
    }

    fn unlink(&mut self, to: NodeId, socket: usize) {
        let Some(pos) = self.position(to) else { return };
        let Some(src) = self.nodes[pos].inputs[socket].link.take() else {
            return;
        };
        if let Some(src_pos) = self.position(src.node) {
            let links = &mut self.nodes[src_pos].outputs[src.socket].links;
            links.retain(|c| !(c.node == to && c.socket == socket));
        }
    }

    /// Sets the constant of an input.
    pub fn set_value(&mut self, node: NodeId, input: &str, value: SocketValue) -> Result<()> {
        let target = self.input_mut(node, input)?;
        if !value.fits(target.ty) {
            return Err(Error::Graph(format!(
                "value {value:?} does not fit {:?} input '{input}' of node {node}",
                target.ty
            )));
        }
        target.value = value;
        Ok(())
    }

    pub fn set_float(&mut self, node: NodeId, input: &str, value: f32) -> Result<()> {
        self.set_value(node, input, SocketValue::Float(value))
    }

    pub fn set_vector(&mut self, node: NodeId, input: &str, value: Vec3) -> Result<()> {
        self.set_value(node, input, SocketValue::Vector(value))
    }

    pub fn set_int(&mut self, node: NodeId, input: &str, value: i32) -> Result<()> {
        self.set_value(node, input, SocketValue::Int(value))
    }

    /// Marks an input as unlinked in the given variants.
    pub fn skip_input(&mut self, node: NodeId, input: &str, variants: VariantSet) -> Result<()> {
        self.input_mut(node, input)?.skip |= variants;
        Ok(())
    }

    fn input_mut(&mut self, node: NodeId, input: &str) -> Result<&mut ShaderInput> {
        self.node_mut(node)?
            .inputs
            .iter_mut()
            .find(|i| i.name == input)
            .ok_or_else(|| unknown_socket(node, input))
    }

    #[inline]
    fn position(&self, id: NodeId) -> Option<usize> {
        self.index.get(id.index()).copied()
    }

    pub fn node(&self, id: NodeId) -> Option<&ShaderNode> {
        self.position(id).map(|pos| &self.nodes[pos])
    }

    fn node_or_err(&self, id: NodeId) -> Result<&ShaderNode> {
        self.node(id)
            .ok_or_else(|| Error::Graph(format!("unknown node {id}")))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut ShaderNode> {
        match self.position(id) {
            Some(pos) => Ok(&mut self.nodes[pos]),
            None => Err(Error::Graph(format!("unknown node {id}"))),
        }
    }

    /// Node lookup for ids known to belong to this graph.
    #[inline]
    pub(crate) fn get(&self, id: NodeId) -> &ShaderNode {
        &self.nodes[self.index[id.index()]]
    }

    /// Nodes in ascending id order.
    pub fn nodes_by_id(&self) -> impl Iterator<Item = &ShaderNode> + '_ {
        self.index.iter().map(move |&pos| &self.nodes[pos])
    }

    /// Nodes in storage order.
    pub fn nodes(&self) -> &[ShaderNode] {
        &self.nodes
    }

    pub fn output(&self) -> Option<&ShaderNode> {
        self.output.map(|id| self.get(id))
    }

    pub fn output_id(&self) -> Option<NodeId> {
        self.output
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn into_nodes(self) -> Vec<ShaderNode> {
        self.nodes
    }
}

fn unknown_socket(node: NodeId, socket: &str) -> Error {
    Error::UnknownSocket {
        node,
        socket: socket.to_string(),
    }
}

impl TryFrom<Vec<ShaderNode>> for ShaderGraph {
    type Error = Error;

    fn try_from(nodes: Vec<ShaderNode>) -> Result<Self> {
        Self::from_nodes(nodes)
    }
}

impl From<ShaderGraph> for Vec<ShaderNode> {
    fn from(graph: ShaderGraph) -> Self {
        graph.into_nodes()
    }
}
