//! ServiceHierarchy - ServiceRecord の arena（所有ツリー + 依存 DAG）
//!
//! # 2 種類のリンク
//! - **所有（ownership）**: parent → children。木構造で、子の親は 1 つだけ
//! - **依存（dependency）**: a → b は「a は b の完了を待つ」。DAG
//!
//! 所有ツリーと依存 DAG は別々に保持する。異なる親への付け替えは
//! `HierarchyConflict` で拒否する。
//!
//! ノードは `NodeIndex` で参照するので、まだ id の無い（未保存の）
//! レコードも扱える。

use crate::domain::dependency::DependencyGraph;
use crate::domain::errors::{ServiceError, ServiceResult};
use crate::domain::ids::ServiceId;
use crate::domain::record::ServiceRecord;
use std::collections::{HashMap, HashSet};

/// Position of a record inside a `ServiceHierarchy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

impl NodeIndex {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
struct Node {
    record: ServiceRecord,
    parent: Option<NodeIndex>,
    children: Vec<NodeIndex>,
    dependencies: Vec<NodeIndex>,
    /// children と dependencies を追加順に並べたもの（pre-order の走査順）
    links: Vec<NodeIndex>,
}

impl Node {
    fn new(record: ServiceRecord) -> Self {
        Self {
            record,
            parent: None,
            children: Vec::new(),
            dependencies: Vec::new(),
            links: Vec::new(),
        }
    }

    fn link(&mut self, other: NodeIndex) {
        if !self.links.contains(&other) {
            self.links.push(other);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceHierarchy {
    nodes: Vec<Node>,
    root: NodeIndex,
    focus: NodeIndex,
}

impl ServiceHierarchy {
    pub fn new(root: ServiceRecord) -> Self {
        Self {
            nodes: vec![Node::new(root)],
            root: NodeIndex(0),
            focus: NodeIndex(0),
        }
    }

    /// Rebuilds the arena from flat storage.
    ///
    /// `members` are linked to their stored `parentServiceId` first, then to
    /// their `dependenciesIds`, both in id order. Ids that point outside the
    /// hierarchy are ignored.
    pub fn relink(root: ServiceRecord, mut members: Vec<ServiceRecord>) -> ServiceResult<Self> {
        let root_id = root.require_id()?;
        members.retain(|r| r.id != Some(root_id));
        members.sort_by_key(|r| r.id);

        let mut hierarchy = Self::new(root);
        let mut by_id: HashMap<ServiceId, NodeIndex> = HashMap::new();
        by_id.insert(root_id, hierarchy.root);
        for record in members {
            let id = record.require_id()?;
            let idx = hierarchy.push(record);
            by_id.insert(id, idx);
        }

        for idx in hierarchy.node_indices() {
            let parent = hierarchy.nodes[idx.0]
                .record
                .parent_service_id
                .and_then(|p| by_id.get(&p).copied());
            if let Some(parent) = parent
                && parent != idx
            {
                hierarchy.attach(idx, parent);
            }
        }
        for idx in hierarchy.node_indices() {
            let deps: Vec<NodeIndex> = hierarchy.nodes[idx.0]
                .record
                .dependencies_ids
                .iter()
                .filter_map(|d| by_id.get(d).copied())
                .collect();
            for dep in deps {
                hierarchy.link_dependency(idx, dep);
            }
        }
        Ok(hierarchy)
    }

    fn push(&mut self, record: ServiceRecord) -> NodeIndex {
        self.nodes.push(Node::new(record));
        NodeIndex(self.nodes.len() - 1)
    }

    fn attach(&mut self, child: NodeIndex, parent: NodeIndex) {
        self.nodes[child.0].parent = Some(parent);
        let p = &mut self.nodes[parent.0];
        if !p.children.contains(&child) {
            p.children.push(child);
        }
        p.link(child);
    }

    fn link_dependency(&mut self, node: NodeIndex, dependency: NodeIndex) {
        let n = &mut self.nodes[node.0];
        if !n.dependencies.contains(&dependency) {
            n.dependencies.push(dependency);
        }
        n.link(dependency);
    }

    fn check(&self, idx: NodeIndex) -> ServiceResult<()> {
        if idx.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(ServiceError::validation(format!(
                "node {} is not part of this hierarchy",
                idx.0
            )))
        }
    }

    /// Human readable label: the id when persisted, otherwise `name#new-<index>`.
    pub fn label(&self, idx: NodeIndex) -> String {
        let record = &self.nodes[idx.0].record;
        match record.id {
            Some(id) => id.to_string(),
            None => format!("{}#new-{}", record.name, idx.0),
        }
    }

    // ========================================
    // Structure edits
    // ========================================

    /// Adds `record` as an owned child of `parent`.
    ///
    /// A record already owned by someone else (stored `parentServiceId`) is a
    /// `HierarchyConflict` and leaves the arena unchanged.
    pub fn add_child(&mut self, parent: NodeIndex, record: ServiceRecord) -> ServiceResult<NodeIndex> {
        self.check(parent)?;
        let child = self.push(record);
        if let Err(e) = self.set_parent(child, parent) {
            self.nodes.pop();
            return Err(e);
        }
        Ok(child)
    }

    /// Adds a record that is linked only through dependencies.
    pub fn add_detached(&mut self, record: ServiceRecord) -> NodeIndex {
        self.push(record)
    }

    /// Assigns `parent` as owner of `child`.
    ///
    /// Re-assigning the same parent is a no-op; a different parent is a
    /// `HierarchyConflict`.
    pub fn set_parent(&mut self, child: NodeIndex, parent: NodeIndex) -> ServiceResult<()> {
        self.check(child)?;
        self.check(parent)?;
        if child == parent {
            return Err(ServiceError::validation(format!(
                "{} cannot own itself",
                self.label(child)
            )));
        }
        if child == self.root {
            return Err(ServiceError::validation(format!(
                "hierarchy root {} cannot be re-parented",
                self.label(child)
            )));
        }
        match self.owner_of(child) {
            Some(OwnerRef::Node(p)) if p == parent => {
                self.attach(child, parent);
                return Ok(());
            }
            Some(existing) => {
                return Err(ServiceError::HierarchyConflict {
                    child: self.label(child),
                    existing: self.owner_label(existing),
                    requested: self.label(parent),
                });
            }
            None => {}
        }
        if self.is_ancestor(child, parent) {
            return Err(ServiceError::validation(format!(
                "{} is an ancestor of {}",
                self.label(child),
                self.label(parent)
            )));
        }
        self.attach(child, parent);
        Ok(())
    }

    /// Current owner: the in-arena parent, else the stored `parentServiceId`.
    fn owner_of(&self, child: NodeIndex) -> Option<OwnerRef> {
        if let Some(p) = self.nodes[child.0].parent {
            return Some(OwnerRef::Node(p));
        }
        self.nodes[child.0]
            .record
            .parent_service_id
            .map(|id| match self.find_by_id(id) {
                Some(p) => OwnerRef::Node(p),
                None => OwnerRef::Stored(id),
            })
    }

    fn owner_label(&self, existing: OwnerRef) -> String {
        match existing {
            OwnerRef::Node(p) => self.label(p),
            OwnerRef::Stored(id) => id.to_string(),
        }
    }

    fn is_ancestor(&self, candidate: NodeIndex, node: NodeIndex) -> bool {
        let mut current = self.nodes[node.0].parent;
        while let Some(p) = current {
            if p == candidate {
                return true;
            }
            current = self.nodes[p.0].parent;
        }
        false
    }

    /// `a` depends on `b`.
    ///
    /// If `b` has no owner yet it is adopted by `a` (first dependent wins).
    pub fn add_dependency(&mut self, a: NodeIndex, b: NodeIndex) -> ServiceResult<()> {
        self.check(a)?;
        self.check(b)?;
        if a == b {
            return Err(ServiceError::validation(format!(
                "{} cannot depend on itself",
                self.label(a)
            )));
        }
        self.link_dependency(a, b);
        if b != self.root && self.owner_of(b).is_none() && !self.is_ancestor(b, a) {
            self.attach(b, a);
        }
        Ok(())
    }

    // ========================================
    // Queries
    // ========================================

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn focus(&self) -> NodeIndex {
        self.focus
    }

    pub fn set_focus(&mut self, idx: NodeIndex) -> ServiceResult<()> {
        self.check(idx)?;
        self.focus = idx;
        Ok(())
    }

    pub fn focused_record(&self) -> &ServiceRecord {
        &self.nodes[self.focus.0].record
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_indices(&self) -> Vec<NodeIndex> {
        (0..self.nodes.len()).map(NodeIndex).collect()
    }

    pub fn record(&self, idx: NodeIndex) -> &ServiceRecord {
        &self.nodes[idx.0].record
    }

    pub fn record_mut(&mut self, idx: NodeIndex) -> &mut ServiceRecord {
        &mut self.nodes[idx.0].record
    }

    pub fn parent(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.nodes[idx.0].parent
    }

    pub fn children(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.nodes[idx.0].children
    }

    pub fn dependencies(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.nodes[idx.0].dependencies
    }

    pub fn find_by_id(&self, id: ServiceId) -> Option<NodeIndex> {
        self.nodes
            .iter()
            .position(|n| n.record.id == Some(id))
            .map(NodeIndex)
    }

    /// Pre-order from the root: a node first, then its links in insertion order.
    /// Every node reachable from the root appears exactly once.
    pub fn preorder(&self) -> Vec<NodeIndex> {
        let mut order = self.preorder_from(self.root);
        // detached nodes that nothing links to yet
        let visited: HashSet<NodeIndex> = order.iter().copied().collect();
        order.extend(self.node_indices().into_iter().filter(|i| !visited.contains(i)));
        order
    }

    /// Pre-order of everything reachable from `start` through links.
    pub fn preorder_from(&self, start: NodeIndex) -> Vec<NodeIndex> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        if start.0 >= self.nodes.len() {
            return order;
        }
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            if !visited.insert(idx) {
                continue;
            }
            order.push(idx);
            for &next in self.nodes[idx.0].links.iter().rev() {
                if !visited.contains(&next) {
                    stack.push(next);
                }
            }
        }
        order
    }

    /// Ownership order: every parent comes before its children.
    pub fn owners_first(&self) -> Vec<NodeIndex> {
        let mut order: Vec<NodeIndex> = self
            .node_indices()
            .into_iter()
            .filter(|i| self.nodes[i.0].parent.is_none())
            .collect();
        let mut next = 0;
        while next < order.len() {
            let idx = order[next];
            order.extend(self.nodes[idx.0].children.iter().copied());
            next += 1;
        }
        order
    }

    pub fn iter_preorder(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.preorder().into_iter().map(|idx| &self.nodes[idx.0].record)
    }

    /// Dependency edges as a graph keyed by node index.
    pub fn dependency_graph(&self) -> DependencyGraph<NodeIndex> {
        let mut graph = DependencyGraph::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for &dep in &node.dependencies {
                graph.add_dependency(NodeIndex(i), dep);
            }
        }
        graph
    }

    /// Fails with `DependencyCycle` if the dependency edges contain a cycle.
    pub fn check_acyclic(&self) -> ServiceResult<()> {
        match self.dependency_graph().detect_cycle() {
            Some(cycle) => {
                let path: Vec<String> = cycle.iter().map(|idx| self.label(*idx)).collect();
                Err(ServiceError::DependencyCycle(path.join(" -> ")))
            }
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OwnerRef {
    Node(NodeIndex),
    Stored(ServiceId),
}
