use crate::binio;
use crate::error::{Error, Result};
use crate::Label;
use hashbrown::HashMap;
use log::info;
use rand::prelude::*;
use rand::rngs::StdRng;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// One node of the label tree. Parent and children are arena indices into
/// [`Tree::nodes`]; the tree owns all nodes, nodes never own each other.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub index: usize,
    /// Set for leaves only.
    pub label: Option<Label>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// A label tree: `label_count()` labels at the leaves of `node_count()` nodes.
///
/// Immutable once built or loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    nodes: Vec<TreeNode>,
    root: usize,
    leaves: HashMap<Label, usize>,
}

impl Tree {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn label_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn node(&self, index: usize) -> &TreeNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.iter()
    }

    /// Arena index of the leaf carrying `label`.
    pub fn leaf(&self, label: Label) -> Option<usize> {
        self.leaves.get(&label).copied()
    }

    /// Build a complete tree of the given arity over `label_count` labels.
    ///
    /// Node i > 0 hangs under node (i-1)/arity; the last `label_count` indices
    /// are the leaves. In-order construction assigns label j to the j-th leaf,
    /// randomized construction assigns a uniform permutation of the labels.
    pub fn build_complete(
        label_count: usize,
        arity: usize,
        randomize: bool,
        rng: &mut StdRng,
    ) -> Tree {
        assert!(label_count > 0);
        let k = label_count;

        let (arity, t) = if arity > 2 {
            let a = (arity as f64).powf(((k as f64).ln() / (arity as f64).ln()).floor());
            let b = k as f64 - a;
            let c = (b / (arity as f64 - 1.0)).ceil();
            let d = (arity as f64 * a - 1.0) / (arity as f64 - 1.0);
            let e = k as f64 - (a - c);
            (arity, (e + d) as usize)
        } else {
            (2, 2 * k - 1)
        };

        // leaf cutoff: nodes at and above this index carry labels
        let ti = t - k;

        let mut labels_order: Vec<Label> = (0..k as Label).collect();
        if randomize {
            labels_order.shuffle(rng);
        }

        let mut nodes = Vec::with_capacity(t);
        let mut leaves = HashMap::with_capacity(k);
        for i in 0..t {
            let label = if i >= ti {
                let label = labels_order[i - ti];
                leaves.insert(label, i);
                Some(label)
            } else {
                None
            };
            let parent = if i > 0 { Some((i - 1) / arity) } else { None };
            nodes.push(TreeNode {
                index: i,
                label,
                parent,
                children: Vec::new(),
            });
            if let Some(p) = parent {
                nodes[p].children.push(i);
            }
        }

        info!(
            "Built complete tree: {} nodes, {} leaves, arity {}",
            t, k, arity
        );
        Tree {
            nodes,
            root: 0,
            leaves,
        }
    }

    /// Load a user-supplied structure file: a `k t` header line followed by
    /// `t - 1` edges `parent child label`, where a row with parent -1
    /// designates `child` as the root instead of adding an edge.
    pub fn load_structure<P: AsRef<Path>>(path: P) -> Result<Tree> {
        let path = path.as_ref();
        info!("Loading tree structure from {}", path.display());

        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();

        let malformed = |line: &str| Error::Data(format!("malformed tree line: {:?}", line));

        let (k, t) = {
            let header = lines
                .next()
                .ok_or_else(|| Error::Data("empty tree structure file".to_owned()))??;
            let mut iter = header.split_whitespace().map(str::parse::<usize>);
            match (iter.next(), iter.next()) {
                (Some(Ok(k)), Some(Ok(t))) if k >= 1 && t >= k => (k, t),
                _ => return Err(malformed(&header)),
            }
        };

        let mut nodes: Vec<TreeNode> = (0..t)
            .map(|i| TreeNode {
                index: i,
                label: None,
                parent: None,
                children: Vec::new(),
            })
            .collect();
        let mut leaves = HashMap::with_capacity(k);
        let mut root = None;

        let mut edges = 0;
        while edges < t - 1 {
            let line = lines
                .next()
                .ok_or_else(|| Error::Data("tree structure file ends early".to_owned()))??;
            let mut iter = line.split_whitespace().map(str::parse::<i64>);
            let (parent, child, label) = match (iter.next(), iter.next(), iter.next()) {
                (Some(Ok(p)), Some(Ok(c)), Some(Ok(l))) => (p, c, l),
                _ => return Err(malformed(&line)),
            };

            let child = child as usize;
            if child >= t {
                return Err(malformed(&line));
            }
            if parent == -1 {
                if root.replace(child).is_some() {
                    return Err(Error::Data("tree structure designates two roots".to_owned()));
                }
                continue;
            }

            let parent = parent as usize;
            if parent >= t {
                return Err(malformed(&line));
            }
            nodes[parent].children.push(child);
            nodes[child].parent = Some(parent);
            if label >= 0 {
                nodes[child].label = Some(label as Label);
                leaves.insert(label as Label, child);
            }
            edges += 1;
        }

        let tree = Tree {
            nodes,
            root: root.unwrap_or(0),
            leaves,
        };
        tree.check_invariants(k, t)?;

        info!(
            "  Nodes: {}, leaves: {}",
            tree.node_count(),
            tree.label_count()
        );
        Ok(tree)
    }

    fn check_invariants(&self, k: usize, t: usize) -> Result<()> {
        if self.nodes.len() != t {
            return Err(Error::Data(format!(
                "tree declares {} nodes but has {}",
                t,
                self.nodes.len()
            )));
        }
        if self.leaves.len() != k {
            return Err(Error::Data(format!(
                "tree declares {} leaves but has {}",
                k,
                self.leaves.len()
            )));
        }
        if self.nodes[self.root].parent.is_some() {
            return Err(Error::Data("tree root has a parent".to_owned()));
        }
        if self.leaves.keys().any(|&label| label as usize >= k) {
            return Err(Error::Data(format!(
                "leaf labels are not dense in 0..{}",
                k
            )));
        }
        Ok(())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.save(&mut out)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Tree> {
        let mut input = BufReader::new(File::open(path)?);
        Self::load(&mut input)
    }

    /// Binary layout: k, t, t x (index, label), root index, t x parent index,
    /// with -1 standing in for "no label" and "no parent".
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        binio::write_i32(out, self.label_count() as i32)?;
        binio::write_i32(out, self.node_count() as i32)?;
        for node in &self.nodes {
            binio::write_i32(out, node.index as i32)?;
            binio::write_i32(out, node.label.map_or(-1, |l| l as i32))?;
        }
        binio::write_i32(out, self.root as i32)?;
        for node in &self.nodes {
            binio::write_i32(out, node.parent.map_or(-1, |p| p as i32))?;
        }
        Ok(())
    }

    pub fn load<R: Read>(input: &mut R) -> Result<Tree> {
        let k = binio::read_i32(input)?;
        let t = binio::read_i32(input)?;
        if k < 0 || t < k {
            return Err(Error::Model(format!("bad tree header: k {}, t {}", k, t)));
        }
        let (k, t) = (k as usize, t as usize);

        let mut nodes = Vec::with_capacity(t);
        let mut leaves = HashMap::with_capacity(k);
        for i in 0..t {
            let index = binio::read_i32(input)? as usize;
            let label = binio::read_i32(input)?;
            let label = if label >= 0 {
                leaves.insert(label as Label, i);
                Some(label as Label)
            } else {
                None
            };
            nodes.push(TreeNode {
                index,
                label,
                parent: None,
                children: Vec::new(),
            });
        }

        let root = binio::read_i32(input)? as usize;
        if root >= t {
            return Err(Error::Model(format!("root index {} out of range", root)));
        }
        for i in 0..t {
            let parent = binio::read_i32(input)?;
            if parent >= 0 {
                let parent = parent as usize;
                if parent >= t {
                    return Err(Error::Model(format!("parent index {} out of range", parent)));
                }
                nodes[parent].children.push(i);
                nodes[i].parent = Some(parent);
            }
        }

        let tree = Tree { nodes, root, leaves };
        tree.check_invariants(k, t)?;
        Ok(tree)
    }
}
