use std::collections::{BTreeMap, VecDeque};

use anyhow::{bail, Result};

use crate::manifest::{Manifest, Node};

/// Traversal view over a manifest's node tree.
///
/// Nodes never hold references to each other; all edges are name
/// lookups resolved here. Orderings are breadth-first from the roots
/// with manifest document order as the tie-break, which yields a
/// topological order (parents strictly before children).
pub struct ManifestGraph<'a> {
    manifest: &'a Manifest,
    children: BTreeMap<&'a str, Vec<&'a str>>,
    depths: BTreeMap<&'a str, usize>,
}

impl<'a> ManifestGraph<'a> {
    pub fn build(manifest: &'a Manifest) -> Result<Self> {
        let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for node in &manifest.nodes {
            if let Some(parent) = node.parent.as_deref() {
                children.entry(parent).or_default().push(&node.name);
            }
        }

        let mut depths = BTreeMap::new();
        let mut queue: VecDeque<(&str, usize)> = manifest
            .nodes
            .iter()
            .filter(|n| n.is_root())
            .map(|n| (n.name.as_str(), 0))
            .collect();
        while let Some((name, depth)) = queue.pop_front() {
            depths.insert(name, depth);
            for child in children.get(name).into_iter().flatten() {
                queue.push_back((*child, depth + 1));
            }
        }

        if depths.len() != manifest.nodes.len() {
            bail!("Manifest graph is not a forest (unreachable nodes present)");
        }

        Ok(Self {
            manifest,
            children,
            depths,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        self.manifest
    }

    pub fn node(&self, name: &str) -> Option<&'a Node> {
        self.manifest.node(name)
    }

    pub fn depth(&self, name: &str) -> usize {
        self.depths.get(name).copied().unwrap_or(0)
    }

    /// Direct children of a node, in document order.
    pub fn children(&self, name: &str) -> &[&'a str] {
        self.children.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_children(&self, name: &str) -> bool {
        !self.children(name).is_empty()
    }

    /// Nodes in creation order: parents before children, siblings in
    /// document order.
    pub fn create_order(&self) -> Vec<&'a Node> {
        let mut ordered = Vec::with_capacity(self.manifest.nodes.len());
        let mut queue: VecDeque<&str> = self
            .manifest
            .nodes
            .iter()
            .filter(|n| n.is_root())
            .map(|n| n.name.as_str())
            .collect();
        while let Some(name) = queue.pop_front() {
            if let Some(node) = self.node(name) {
                ordered.push(node);
            }
            queue.extend(self.children(name).iter().copied());
        }
        ordered
    }

    /// Nodes in destruction order: the exact reverse of creation.
    pub fn destroy_order(&self) -> Vec<&'a Node> {
        let mut ordered = self.create_order();
        ordered.reverse();
        ordered
    }

    /// All transitive descendants of a node, in creation order.
    pub fn descendants(&self, name: &str) -> Vec<&'a Node> {
        let mut found = Vec::new();
        let mut queue: VecDeque<&str> = self.children(name).iter().copied().collect();
        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.node(current) {
                found.push(node);
            }
            queue.extend(self.children(current).iter().copied());
        }
        found
    }

    /// Extract the subtree under a parent as a standalone manifest.
    ///
    /// The parent's direct children become roots (their parent
    /// reference cleared); deeper descendants keep their references.
    /// Settings are inherited verbatim; the derived name keeps state
    /// files distinct between the outer and delegated runs.
    pub fn extract_subtree(&self, parent: &str) -> Result<Manifest> {
        if self.node(parent).is_none() {
            bail!("Cannot extract subtree: unknown node '{}'", parent);
        }
        let descendants = self.descendants(parent);
        if descendants.is_empty() {
            bail!("Node '{}' has no descendants to extract", parent);
        }

        let nodes = descendants
            .into_iter()
            .map(|node| {
                let mut node = node.clone();
                if node.parent.as_deref() == Some(parent) {
                    node.parent = None;
                }
                node
            })
            .collect();

        Ok(Manifest {
            schema_version: self.manifest.schema_version,
            name: format!("{}@{}", self.manifest.name, parent),
            description: self.manifest.description.clone(),
            settings: self.manifest.settings.clone(),
            nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_manifest() -> Manifest {
        Manifest::from_yaml(
            r#"
schema_version: 2
name: lab
nodes:
  - {name: root, type: pve, vmid: 99011}
  - {name: edge, type: vm, vmid: 99021, parent: root}
  - {name: inner, type: pve, vmid: 99031, parent: root}
  - {name: deep, type: vm, vmid: 99041, parent: inner}
  - {name: lone, type: vm, vmid: 99051}
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_create_order_parents_first() {
        let manifest = tree_manifest();
        let graph = ManifestGraph::build(&manifest).unwrap();
        let order: Vec<&str> = graph.create_order().iter().map(|n| n.name.as_str()).collect();

        for (parent, child) in [("root", "edge"), ("root", "inner"), ("inner", "deep")] {
            let pi = order.iter().position(|n| *n == parent).unwrap();
            let ci = order.iter().position(|n| *n == child).unwrap();
            assert!(pi < ci, "{} must come before {}", parent, child);
        }
        // Roots lead in document order.
        assert_eq!(order[0], "root");
        assert_eq!(order[1], "lone");
    }

    #[test]
    fn test_destroy_order_is_reverse() {
        let manifest = tree_manifest();
        let graph = ManifestGraph::build(&manifest).unwrap();
        let mut create: Vec<&str> = graph.create_order().iter().map(|n| n.name.as_str()).collect();
        let destroy: Vec<&str> = graph.destroy_order().iter().map(|n| n.name.as_str()).collect();
        create.reverse();
        assert_eq!(create, destroy);
    }

    #[test]
    fn test_depths() {
        let manifest = tree_manifest();
        let graph = ManifestGraph::build(&manifest).unwrap();
        assert_eq!(graph.depth("root"), 0);
        assert_eq!(graph.depth("lone"), 0);
        assert_eq!(graph.depth("edge"), 1);
        assert_eq!(graph.depth("deep"), 2);
    }

    #[test]
    fn test_descendants_transitive() {
        let manifest = tree_manifest();
        let graph = ManifestGraph::build(&manifest).unwrap();
        let names: Vec<&str> = graph
            .descendants("root")
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(names, vec!["edge", "inner", "deep"]);
        assert!(graph.descendants("lone").is_empty());
    }

    #[test]
    fn test_extract_subtree() {
        let manifest = tree_manifest();
        let graph = ManifestGraph::build(&manifest).unwrap();
        let subtree = graph.extract_subtree("root").unwrap();

        assert_eq!(subtree.name, "lab@root");
        assert_eq!(subtree.nodes.len(), 3);
        // Direct children become roots; deeper references survive.
        assert!(subtree.node("edge").unwrap().is_root());
        assert!(subtree.node("inner").unwrap().is_root());
        assert_eq!(subtree.node("deep").unwrap().parent.as_deref(), Some("inner"));
        // Settings inherited verbatim.
        assert_eq!(subtree.settings, manifest.settings);
        subtree.validate().unwrap();
    }

    #[test]
    fn test_extract_subtree_fingerprint_stable() {
        let manifest = tree_manifest();
        let graph = ManifestGraph::build(&manifest).unwrap();
        let a = graph.extract_subtree("root").unwrap().fingerprint();
        let b = graph.extract_subtree("root").unwrap().fingerprint();
        assert_eq!(a, b);
    }

    #[test]
    fn test_extract_subtree_leaf_fails() {
        let manifest = tree_manifest();
        let graph = ManifestGraph::build(&manifest).unwrap();
        assert!(graph.extract_subtree("edge").is_err());
        assert!(graph.extract_subtree("ghost").is_err());
    }
}
