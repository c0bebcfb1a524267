//! In-memory devicetree: a node arena with the orderings and identifiers
//! the generator derives from it

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;

use crate::error::DtsParseError;

pub type NodeId = usize;

/// Unresolved reference as written in the source, `&label` or `&{/path}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefTarget {
    Label(String),
    Path(String),
}

/// One 32-bit entry of a `< ... >` cell list
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cell {
    Num(u32),
    /// Reference as parsed; rewritten to [`Cell::Phandle`] on resolve
    Ref(RefTarget),
    Phandle(NodeId),
}

/// One comma-separated piece of a property value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Piece {
    Cells(Vec<Cell>),
    Str(String),
    Bytes(Vec<u8>),
    /// Bare `&label` outside a cell list; rewritten to [`Piece::PathRef`]
    Ref(RefTarget),
    PathRef(NodeId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub pieces: Vec<Piece>,
}

#[derive(Debug)]
pub struct Node {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    labels: Vec<String>,
    props: Vec<Property>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn properties(&self) -> &[Property] {
        &self.props
    }
}

/// A parsed, merged devicetree
///
/// Nodes live in an arena; deleted nodes keep their slot but are detached
/// from the tree, so every traversal starts at the root.
#[derive(Debug)]
pub struct Devicetree {
    nodes: Vec<Node>,
    memreserve: Vec<(u64, u64)>,
}

impl Devicetree {
    pub(crate) fn new() -> Self {
        Self {
            nodes: vec![Node {
                name: String::new(),
                parent: None,
                children: Vec::new(),
                labels: Vec::new(),
                props: Vec::new(),
            }],
            memreserve: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Absolute path of a node, `/` for the root
    pub fn path(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut cur = Some(id);
        while let Some(node) = cur {
            segments.push(self.nodes[node].name.as_str());
            cur = self.nodes[node].parent;
        }
        segments.reverse();
        if segments.len() == 1 {
            "/".to_owned()
        } else {
            segments.join("/")
        }
    }

    pub fn first_label(&self, id: NodeId) -> Option<&str> {
        self.nodes[id].labels.first().map(String::as_str)
    }

    /// `status` property, defaulting to `"okay"` when absent
    pub fn status(&self, id: NodeId) -> &str {
        self.string_prop(id, "status").unwrap_or("okay")
    }

    /// Numeric unit address, the hex `@<addr>` suffix of the node name
    pub fn unit_addr(&self, id: NodeId) -> Option<u64> {
        let (_, addr) = self.nodes[id].name.split_once('@')?;
        u64::from_str_radix(addr, 16).ok()
    }

    pub fn prop(&self, id: NodeId, name: &str) -> Option<&Property> {
        self.nodes[id].props.iter().find(|prop| prop.name == name)
    }

    /// First string piece of a property
    pub fn string_prop(&self, id: NodeId, name: &str) -> Option<&str> {
        self.prop(id, name)?.pieces.iter().find_map(|piece| match piece {
            Piece::Str(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// First cell of a property, when it is a plain number
    pub fn u32_prop(&self, id: NodeId, name: &str) -> Option<u32> {
        match self.cells(id, name)?.first() {
            Some(Cell::Num(value)) => Some(*value),
            _ => None,
        }
    }

    /// All cells of a property, concatenated across `< ... >` groups
    pub fn cells(&self, id: NodeId, name: &str) -> Option<Vec<Cell>> {
        let prop = self.prop(id, name)?;
        Some(
            prop.pieces
                .iter()
                .filter_map(|piece| match piece {
                    Piece::Cells(cells) => Some(cells.iter().cloned()),
                    _ => None,
                })
                .flatten()
                .collect(),
        )
    }

    /// Every string of the node's `compatible` property
    pub fn compatibles(&self, id: NodeId) -> Vec<&str> {
        self.prop(id, "compatible")
            .map(|prop| {
                prop.pieces
                    .iter()
                    .filter_map(|piece| match piece {
                        Piece::Str(s) => Some(s.as_str()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live node ids in document order (pre-order, children in insertion
    /// order)
    pub fn live_ids(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            out.push(id);
            // Push in reverse so the first child is visited first
            stack.extend(self.nodes[id].children.iter().rev());
        }
        out
    }

    /// Topological rank per node: a node's parent and every node it
    /// references by phandle rank before it. Ties resolve to document
    /// order, so the assignment is deterministic.
    pub fn dependency_ordinals(&self) -> Vec<usize> {
        let order = self.live_ids();
        let doc_index: HashMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        // dependency -> dependents
        let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut indegree: HashMap<NodeId, usize> =
            order.iter().map(|&id| (id, 0)).collect();
        for &id in &order {
            let mut deps: HashSet<NodeId> = HashSet::new();
            if let Some(parent) = self.nodes[id].parent {
                deps.insert(parent);
            }
            for prop in &self.nodes[id].props {
                for piece in &prop.pieces {
                    match piece {
                        Piece::Cells(cells) => {
                            for cell in cells {
                                if let Cell::Phandle(target) = cell {
                                    deps.insert(*target);
                                }
                            }
                        }
                        Piece::PathRef(target) => {
                            deps.insert(*target);
                        }
                        _ => {}
                    }
                }
            }
            deps.remove(&id);
            for dep in deps {
                dependents.entry(dep).or_default().push(id);
                *indegree.get_mut(&id).unwrap() += 1;
            }
        }

        let mut ordinals = vec![usize::MAX; self.nodes.len()];
        let mut ready: Vec<NodeId> = order
            .iter()
            .copied()
            .filter(|id| indegree[id] == 0)
            .collect();
        let mut next = 0;
        while !ready.is_empty() {
            let pick = ready
                .iter()
                .enumerate()
                .min_by_key(|(_, id)| doc_index[*id])
                .map(|(i, _)| i)
                .unwrap();
            let id = ready.swap_remove(pick);
            ordinals[id] = next;
            next += 1;
            for &dependent in dependents.get(&id).map(Vec::as_slice).unwrap_or_default() {
                let count = indegree.get_mut(&dependent).unwrap();
                *count -= 1;
                if *count == 0 {
                    ready.push(dependent);
                }
            }
        }
        if next < order.len() {
            warn!("devicetree contains a phandle dependency cycle");
            for &id in &order {
                if ordinals[id] == usize::MAX {
                    ordinals[id] = next;
                    next += 1;
                }
            }
        }
        ordinals
    }

    /// Live node ids sorted by (dependency ordinal, path, first label)
    pub fn global_order(&self) -> Vec<NodeId> {
        let ordinals = self.dependency_ordinals();
        let mut ids = self.live_ids();
        ids.sort_by_cached_key(|&id| {
            (
                ordinals[id],
                self.path(id),
                self.first_label(id).unwrap_or_default().to_owned(),
            )
        });
        ids
    }

    /// Nodes carrying `compat`, enabled instances first
    ///
    /// Within the enabled and disabled groups the document order is kept,
    /// so instance numbers stay intuitive without promising cross-build
    /// stability.
    pub fn compat_instances(&self, compat: &str) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .live_ids()
            .into_iter()
            .filter(|&id| self.compatibles(id).contains(&compat))
            .collect();
        ids.sort_by_key(|&id| usize::from(self.status(id) != "okay"));
        ids
    }

    /// Node path identifier: `/` maps to `N`, `/foo/bar@123` to
    /// `N_S_foo_S_bar_123`
    pub fn z_path_id(&self, id: NodeId) -> String {
        let mut components = vec!["N".to_owned()];
        if self.nodes[id].parent.is_some() {
            components.extend(
                self.path(id)
                    .split('/')
                    .skip(1)
                    .map(|segment| format!("S_{}", str2ident(segment))),
            );
        }
        components.join("_")
    }

    /// `(id, z_path_id)` pairs in ascending dependency-ordinal order, so an
    /// identifier is always assigned after the identifiers it may refer to
    pub fn path_identifiers(&self) -> Vec<(NodeId, String)> {
        let ordinals = self.dependency_ordinals();
        let mut ids = self.live_ids();
        ids.sort_by_key(|&id| ordinals[id]);
        ids.into_iter().map(|id| (id, self.z_path_id(id))).collect()
    }

    // Tree construction, used by the parser

    pub(crate) fn add_child(&mut self, parent: NodeId, name: &str) -> NodeId {
        if let Some(&existing) = self.nodes[parent]
            .children
            .iter()
            .find(|&&child| self.nodes[child].name == name)
        {
            return existing;
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_owned(),
            parent: Some(parent),
            children: Vec::new(),
            labels: Vec::new(),
            props: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }

    pub(crate) fn add_label(&mut self, id: NodeId, label: String) {
        if !self.nodes[id].labels.contains(&label) {
            self.nodes[id].labels.push(label);
        }
    }

    pub(crate) fn set_prop(&mut self, id: NodeId, name: String, pieces: Vec<Piece>) {
        match self.nodes[id].props.iter_mut().find(|prop| prop.name == name) {
            Some(prop) => prop.pieces = pieces,
            None => self.nodes[id].props.push(Property { name, pieces }),
        }
    }

    pub(crate) fn delete_prop(&mut self, id: NodeId, name: &str) {
        let props = &mut self.nodes[id].props;
        match props.iter().position(|prop| prop.name == name) {
            Some(pos) => {
                props.remove(pos);
            }
            None => warn!(
                "/delete-property/ {name} in {}: no such property",
                self.path(id)
            ),
        }
    }

    pub(crate) fn delete_child(&mut self, parent: NodeId, name: &str) {
        let child = self.nodes[parent]
            .children
            .iter()
            .position(|&child| self.nodes[child].name == name);
        match child {
            Some(pos) => {
                self.nodes[parent].children.remove(pos);
            }
            None => warn!(
                "/delete-node/ {name} in {}: no such node",
                self.path(parent)
            ),
        }
    }

    pub(crate) fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent {
            self.nodes[parent].children.retain(|&child| child != id);
        }
    }

    pub(crate) fn add_memreserve(&mut self, address: u64, size: u64) {
        self.memreserve.push((address, size));
    }

    pub fn find_label(&self, label: &str) -> Option<NodeId> {
        self.live_ids()
            .into_iter()
            .find(|&id| self.nodes[id].labels.iter().any(|l| l == label))
    }

    pub fn find_by_path(&self, path: &str) -> Option<NodeId> {
        if path == "/" {
            return Some(self.root());
        }
        let mut cur = self.root();
        for segment in path.split('/').skip(1) {
            cur = *self.nodes[cur]
                .children
                .iter()
                .find(|&&child| self.nodes[child].name == segment)?;
        }
        Some(cur)
    }

    pub(crate) fn resolve_target(&self, target: &RefTarget) -> Result<NodeId, DtsParseError> {
        match target {
            RefTarget::Label(label) => self
                .find_label(label)
                .ok_or_else(|| DtsParseError::UnknownLabel(label.clone())),
            RefTarget::Path(path) => self
                .find_by_path(path)
                .ok_or_else(|| DtsParseError::UnknownPath(path.clone())),
        }
    }

    /// Rewrite every reference in every property to its target node
    pub(crate) fn resolve_refs(&mut self) -> Result<(), DtsParseError> {
        let ids = self.live_ids();
        for id in ids {
            for prop_idx in 0..self.nodes[id].props.len() {
                for piece_idx in 0..self.nodes[id].props[prop_idx].pieces.len() {
                    let resolved = match &self.nodes[id].props[prop_idx].pieces[piece_idx] {
                        Piece::Ref(target) => Some(Piece::PathRef(self.resolve_target(target)?)),
                        Piece::Cells(cells) => {
                            let mut out = Vec::with_capacity(cells.len());
                            let mut changed = false;
                            for cell in cells.clone() {
                                out.push(match cell {
                                    Cell::Ref(target) => {
                                        changed = true;
                                        Cell::Phandle(self.resolve_target(&target)?)
                                    }
                                    other => other,
                                });
                            }
                            changed.then_some(Piece::Cells(out))
                        }
                        _ => None,
                    };
                    if let Some(piece) = resolved {
                        self.nodes[id].props[prop_idx].pieces[piece_idx] = piece;
                    }
                }
            }
        }
        Ok(())
    }

    /// Merged tree re-serialized as DTS source, a debugging aid
    pub fn to_source(&self) -> String {
        let mut out = String::from("/dts-v1/;\n\n");
        for (address, size) in &self.memreserve {
            let _ = writeln!(out, "/memreserve/ {address:#x} {size:#x};");
        }
        out.push_str("/ {\n");
        for prop in &self.nodes[self.root()].props {
            self.write_prop(&mut out, prop, 1);
        }
        for &child in &self.nodes[self.root()].children {
            self.write_node(&mut out, child, 1);
        }
        out.push_str("};\n");
        out
    }

    fn write_node(&self, out: &mut String, id: NodeId, depth: usize) {
        let indent = "\t".repeat(depth);
        let node = &self.nodes[id];
        out.push_str(&indent);
        for label in &node.labels {
            let _ = write!(out, "{label}: ");
        }
        let _ = writeln!(out, "{} {{", node.name);
        for prop in &node.props {
            self.write_prop(out, prop, depth + 1);
        }
        for &child in &node.children {
            self.write_node(out, child, depth + 1);
        }
        let _ = writeln!(out, "{indent}}};");
    }

    fn write_prop(&self, out: &mut String, prop: &Property, depth: usize) {
        let indent = "\t".repeat(depth);
        if prop.pieces.is_empty() {
            let _ = writeln!(out, "{indent}{};", prop.name);
            return;
        }
        let _ = write!(out, "{indent}{} = ", prop.name);
        for (idx, piece) in prop.pieces.iter().enumerate() {
            if idx > 0 {
                out.push_str(", ");
            }
            match piece {
                Piece::Cells(cells) => {
                    out.push('<');
                    for (cell_idx, cell) in cells.iter().enumerate() {
                        if cell_idx > 0 {
                            out.push(' ');
                        }
                        match cell {
                            Cell::Num(value) => {
                                let _ = write!(out, "{value:#x}");
                            }
                            Cell::Phandle(target) => self.write_ref(out, *target),
                            Cell::Ref(target) => write_raw_ref(out, target),
                        }
                    }
                    out.push('>');
                }
                Piece::Str(s) => {
                    let _ = write!(out, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""));
                }
                Piece::Bytes(bytes) => {
                    out.push('[');
                    for (byte_idx, byte) in bytes.iter().enumerate() {
                        if byte_idx > 0 {
                            out.push(' ');
                        }
                        let _ = write!(out, "{byte:02x}");
                    }
                    out.push(']');
                }
                Piece::PathRef(target) => self.write_ref(out, *target),
                Piece::Ref(target) => write_raw_ref(out, target),
            }
        }
        out.push_str(";\n");
    }

    fn write_ref(&self, out: &mut String, target: NodeId) {
        match self.first_label(target) {
            Some(label) => {
                let _ = write!(out, "&{label}");
            }
            None => {
                let _ = write!(out, "&{{{}}}", self.path(target));
            }
        }
    }
}

fn write_raw_ref(out: &mut String, target: &RefTarget) {
    match target {
        RefTarget::Label(label) => {
            let _ = write!(out, "&{label}");
        }
        RefTarget::Path(path) => {
            let _ = write!(out, "&{{{path}}}");
        }
    }
}

lazy_static! {
    static ref IDENT_CHARS: Regex = Regex::new("[-,.@/+]").unwrap();
}

/// Converts `s` to a form suitable for (part of) an identifier
fn str2ident(s: &str) -> String {
    IDENT_CHARS.replace_all(&s.to_lowercase(), "_").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Devicetree {
        let mut dt = Devicetree::new();
        let root = dt.root();
        let foo = dt.add_child(root, "foo");
        let bar = dt.add_child(foo, "bar@123");
        dt.add_label(bar, "barlbl".to_owned());
        dt
    }

    #[test]
    fn z_path_id_follows_the_path() {
        let dt = sample_tree();
        assert_eq!(dt.z_path_id(0), "N");
        assert_eq!(dt.z_path_id(1), "N_S_foo");
        assert_eq!(dt.z_path_id(2), "N_S_foo_S_bar_123");
    }

    #[test]
    fn status_defaults_to_okay() {
        let mut dt = sample_tree();
        assert_eq!(dt.status(1), "okay");
        dt.set_prop(1, "status".to_owned(), vec![Piece::Str("disabled".to_owned())]);
        assert_eq!(dt.status(1), "disabled");
    }

    #[test]
    fn unit_addr_parses_hex_suffix() {
        let dt = sample_tree();
        assert_eq!(dt.unit_addr(2), Some(0x123));
        assert_eq!(dt.unit_addr(1), None);
    }

    #[test]
    fn parent_ranks_before_child() {
        let dt = sample_tree();
        let ordinals = dt.dependency_ordinals();
        assert!(ordinals[0] < ordinals[1]);
        assert!(ordinals[1] < ordinals[2]);
    }

    #[test]
    fn phandle_target_ranks_before_referer() {
        let mut dt = Devicetree::new();
        let root = dt.root();
        // `first` references `second`, so `second` must rank before it
        // despite coming first in document order
        let first = dt.add_child(root, "first");
        let second = dt.add_child(root, "second");
        dt.set_prop(
            first,
            "link".to_owned(),
            vec![Piece::Cells(vec![Cell::Phandle(second)])],
        );
        let ordinals = dt.dependency_ordinals();
        assert!(ordinals[second] < ordinals[first]);
    }

    #[test]
    fn enabled_instances_sort_first() {
        let mut dt = Devicetree::new();
        let root = dt.root();
        let disabled = dt.add_child(root, "sensor@0");
        let enabled = dt.add_child(root, "sensor@1");
        for id in [disabled, enabled] {
            dt.set_prop(
                id,
                "compatible".to_owned(),
                vec![Piece::Str("acme,imu".to_owned())],
            );
        }
        dt.set_prop(
            disabled,
            "status".to_owned(),
            vec![Piece::Str("disabled".to_owned())],
        );
        assert_eq!(dt.compat_instances("acme,imu"), vec![enabled, disabled]);
    }

    #[test]
    fn global_order_is_deterministic() {
        let dt = sample_tree();
        assert_eq!(dt.global_order(), dt.global_order());
    }

    #[test]
    fn identifiers_are_assigned_dependencies_first() {
        let dt = sample_tree();
        let ids = dt.path_identifiers();
        assert_eq!(
            ids.iter().map(|(_, id)| id.as_str()).collect::<Vec<_>>(),
            ["N", "N_S_foo", "N_S_foo_S_bar_123"]
        );
    }

    #[test]
    fn source_dump_round_trips_structure() {
        let mut dt = sample_tree();
        dt.set_prop(
            2,
            "reg".to_owned(),
            vec![Piece::Cells(vec![Cell::Num(0x123), Cell::Num(4)])],
        );
        let source = dt.to_source();
        assert!(source.starts_with("/dts-v1/;"));
        assert!(source.contains("barlbl: bar@123 {"));
        assert!(source.contains("reg = <0x123 0x4>;"));
    }
}
