/// Tree structure for biogeographic inference.
///
/// Represents a rooted phylogenetic tree with branch lengths.
/// Nodes are indexed 0..n_nodes, with tips first, then internal nodes.

use std::collections::{HashMap, HashSet};

use crate::error::{BioGeoError, Result};

#[derive(Debug, Clone)]
pub struct Tree {
    pub n_nodes: usize,
    pub n_tips: usize,
    pub parent_indices: Vec<i32>,
    pub branch_lengths: Vec<f64>,
    pub children: Vec<Vec<usize>>,
    pub tip_indices: Vec<usize>,
    pub root_index: usize,
    pub tip_name_to_idx: HashMap<String, usize>,
    /// Node labels; tips always have one, internal nodes only if the input named them.
    pub labels: Vec<Option<String>>,
}

/// Node of the intermediate parse arena.
struct ParsedNode {
    label: Option<String>,
    length: f64,
    children: Vec<usize>,
}

impl Tree {
    /// Build tree from structure arrays.
    ///
    /// # Arguments
    /// * `parent_indices` - Parent index for each node (-1 for root)
    /// * `branch_lengths` - Branch length for each node
    /// * `n_tips` - Number of tip nodes
    pub fn from_structure(
        parent_indices: Vec<i32>,
        branch_lengths: Vec<f64>,
        n_tips: usize,
    ) -> Result<Self> {
        let n_nodes = parent_indices.len();

        if branch_lengths.len() != n_nodes {
            return Err(BioGeoError::invalid(
                "parent_indices and branch_lengths must have same length",
            ));
        }
        if n_tips > n_nodes {
            return Err(BioGeoError::invalid("more tips than nodes"));
        }

        let mut children = vec![Vec::new(); n_nodes];
        for (child_idx, &parent_idx) in parent_indices.iter().enumerate() {
            if parent_idx >= 0 {
                let parent = parent_idx as usize;
                if parent >= n_nodes || parent == child_idx {
                    return Err(BioGeoError::invalid(format!(
                        "node {} has invalid parent {}",
                        child_idx, parent_idx
                    )));
                }
                children[parent].push(child_idx);
            }
        }

        let mut roots = parent_indices.iter().enumerate().filter(|&(_, &p)| p < 0);
        let root_index = roots
            .next()
            .map(|(i, _)| i)
            .ok_or_else(|| BioGeoError::invalid("No root node found (no node with parent_idx == -1)"))?;
        if roots.next().is_some() {
            return Err(BioGeoError::invalid("more than one root node"));
        }

        // Tip indices are first n_tips nodes
        let tip_indices: Vec<usize> = (0..n_tips).collect();
        if let Some(t) = tip_indices.iter().find(|&&t| !children[t].is_empty()) {
            return Err(BioGeoError::invalid(format!("tip {} has children", t)));
        }

        let labels: Vec<Option<String>> = (0..n_nodes)
            .map(|i| (i < n_tips).then(|| format!("t{}", i)))
            .collect();
        let tip_name_to_idx = (0..n_tips).map(|i| (format!("t{}", i), i)).collect();

        let tree = Tree {
            n_nodes,
            n_tips,
            parent_indices,
            branch_lengths,
            children,
            tip_indices,
            root_index,
            tip_name_to_idx,
            labels,
        };
        if tree.post_order().len() != n_nodes {
            return Err(BioGeoError::invalid("tree is not connected"));
        }
        Ok(tree)
    }

    /// Parse a Newick string.
    ///
    /// Tips are numbered in the order of `taxon_names`; with an empty list they
    /// are numbered in order of appearance. Internal nodes follow in post-order,
    /// so the root is the last node.
    pub fn from_newick(newick: &str, taxon_names: &[String]) -> Result<Self> {
        let mut parser = NewickParser::new(newick);
        let mut arena = Vec::new();
        let root = parser.parse_clade(&mut arena)?;
        parser.skip_ws();
        if parser.peek() == Some(b';') {
            parser.pos += 1;
        }
        parser.skip_ws();
        if parser.pos != parser.bytes.len() {
            return Err(BioGeoError::tree_parse(parser.pos, "trailing characters"));
        }

        // arena post-order
        let mut order = Vec::with_capacity(arena.len());
        let mut stack = vec![(root, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
            } else {
                stack.push((node, true));
                for &c in arena[node].children.iter().rev() {
                    stack.push((c, false));
                }
            }
        }

        let tips_in_order: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&n| arena[n].children.is_empty())
            .collect();
        let n_tips = tips_in_order.len();
        let n_nodes = arena.len();

        let mut new_index = vec![usize::MAX; n_nodes];
        if taxon_names.is_empty() {
            for (i, &n) in tips_in_order.iter().enumerate() {
                new_index[n] = i;
            }
        } else {
            if taxon_names.len() != n_tips {
                return Err(BioGeoError::invalid(format!(
                    "tree has {} tips but {} taxon names were given",
                    n_tips,
                    taxon_names.len()
                )));
            }
            let position: HashMap<&str, usize> = taxon_names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.as_str(), i))
                .collect();
            let mut taken = vec![false; n_tips];
            for &n in &tips_in_order {
                let label = arena[n].label.as_deref().unwrap_or("");
                let &i = position
                    .get(label)
                    .ok_or_else(|| BioGeoError::UnknownNode(label.to_string()))?;
                if taken[i] {
                    return Err(BioGeoError::invalid(format!("duplicate tip {}", label)));
                }
                taken[i] = true;
                new_index[n] = i;
            }
        }
        let mut next_internal = n_tips;
        for &n in &order {
            if !arena[n].children.is_empty() {
                new_index[n] = next_internal;
                next_internal += 1;
            }
        }

        let mut parent_indices = vec![-1i32; n_nodes];
        let mut branch_lengths = vec![0.0; n_nodes];
        let mut children = vec![Vec::new(); n_nodes];
        let mut labels = vec![None; n_nodes];
        for (old, node) in arena.into_iter().enumerate() {
            let idx = new_index[old];
            branch_lengths[idx] = node.length;
            labels[idx] = node.label;
            children[idx] = node.children.iter().map(|&c| new_index[c]).collect();
        }
        for (p, kids) in children.iter().enumerate() {
            for &c in kids {
                parent_indices[c] = p as i32;
            }
        }
        let mut tip_name_to_idx = HashMap::new();
        for (i, label) in labels.iter().enumerate().take(n_tips) {
            let name = label
                .clone()
                .ok_or_else(|| BioGeoError::invalid(format!("tip {} has no label", i)))?;
            if tip_name_to_idx.insert(name.clone(), i).is_some() {
                return Err(BioGeoError::invalid(format!("duplicate tip {}", name)));
            }
        }

        Ok(Tree {
            n_nodes,
            n_tips,
            parent_indices,
            branch_lengths,
            children,
            tip_indices: (0..n_tips).collect(),
            root_index: new_index[root],
            tip_name_to_idx,
            labels,
        })
    }

    /// Get post-order traversal of nodes (tips to root).
    pub fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.n_nodes);
        let mut stack = vec![(self.root_index, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            stack.push((node, true));
            for &child in self.children[node].iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }

    /// Get pre-order traversal of nodes (root to tips).
    pub fn pre_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.n_nodes);
        let mut stack = vec![self.root_index];
        while let Some(node) = stack.pop() {
            order.push(node);
            for &child in self.children[node].iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    pub fn is_tip(&self, node: usize) -> bool {
        self.children[node].is_empty()
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        let p = self.parent_indices[node];
        (p >= 0).then_some(p as usize)
    }

    /// Every internal node has exactly two children.
    pub fn is_binary(&self) -> bool {
        self.children.iter().all(|c| c.is_empty() || c.len() == 2)
    }

    /// Raise every branch shorter than `min_length` to `min_length`.
    pub fn clamp_branch_lengths(&mut self, min_length: f64) {
        for (i, bl) in self.branch_lengths.iter_mut().enumerate() {
            if i != self.root_index && *bl < min_length {
                *bl = min_length;
            }
        }
    }

    /// Distance from the root to each node.
    pub fn depths(&self) -> Vec<f64> {
        let mut depth = vec![0.0; self.n_nodes];
        for node in self.pre_order() {
            if let Some(p) = self.parent(node) {
                depth[node] = depth[p] + self.branch_lengths[node];
            }
        }
        depth
    }

    /// Age of each node: distance below the deepest tip subtracted from its depth.
    ///
    /// Ultrametric trees get tip heights of zero.
    pub fn heights(&self) -> Vec<f64> {
        let depth = self.depths();
        let max_depth = self
            .tip_indices
            .iter()
            .map(|&t| depth[t])
            .fold(0.0, f64::max);
        depth.iter().map(|d| (max_depth - d).max(0.0)).collect()
    }

    pub fn tip_index(&self, name: &str) -> Result<usize> {
        self.tip_name_to_idx
            .get(name)
            .copied()
            .ok_or_else(|| BioGeoError::UnknownNode(name.to_string()))
    }

    /// Most recent common ancestor of the named tips.
    pub fn mrca(&self, names: &[&str]) -> Result<usize> {
        let tips: Vec<usize> = names
            .iter()
            .map(|n| self.tip_index(n))
            .collect::<Result<_>>()?;
        let first = *tips
            .first()
            .ok_or_else(|| BioGeoError::invalid("mrca needs at least one tip"))?;

        let ancestors_of = |mut node: usize| {
            let mut path = vec![node];
            while let Some(p) = self.parent(node) {
                path.push(p);
                node = p;
            }
            path
        };
        let first_path = ancestors_of(first);
        let others: Vec<HashSet<usize>> = tips[1..]
            .iter()
            .map(|&t| ancestors_of(t).into_iter().collect())
            .collect();
        first_path
            .into_iter()
            .find(|n| others.iter().all(|set| set.contains(n)))
            .ok_or_else(|| BioGeoError::invalid("tips share no common ancestor"))
    }

    /// Tip names below a node.
    pub fn tip_names_below(&self, node: usize) -> Vec<String> {
        let mut names = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if self.is_tip(n) {
                if let Some(l) = &self.labels[n] {
                    names.push(l.clone());
                }
            } else {
                stack.extend(self.children[n].iter().rev());
            }
        }
        names
    }
}

struct NewickParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> NewickParser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// Skip whitespace and `[...]` comments.
    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.pos += 1;
            } else if c == b'[' {
                while let Some(c) = self.peek() {
                    self.pos += 1;
                    if c == b']' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn parse_clade(&mut self, arena: &mut Vec<ParsedNode>) -> Result<usize> {
        self.skip_ws();
        let mut children = Vec::new();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                children.push(self.parse_clade(arena)?);
                self.skip_ws();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(BioGeoError::tree_parse(self.pos, "expected ',' or ')'")),
                }
            }
        }
        let label = self.parse_label()?;
        if children.is_empty() && label.is_none() {
            return Err(BioGeoError::tree_parse(self.pos, "tip without a label"));
        }
        let length = self.parse_length()?;
        arena.push(ParsedNode {
            label,
            length,
            children,
        });
        Ok(arena.len() - 1)
    }

    fn parse_label(&mut self) -> Result<Option<String>> {
        self.skip_ws();
        if self.peek() == Some(b'\'') {
            self.pos += 1;
            let start = self.pos;
            while let Some(c) = self.peek() {
                if c == b'\'' {
                    let label = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
                    self.pos += 1;
                    return Ok(Some(label));
                }
                self.pos += 1;
            }
            return Err(BioGeoError::tree_parse(start, "unterminated quoted label"));
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b'(' | b')' | b',' | b':' | b';' | b'[') || c.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            Ok(None)
        } else {
            Ok(Some(
                String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned(),
            ))
        }
    }

    fn parse_length(&mut self) -> Result<f64> {
        self.skip_ws();
        if self.peek() != Some(b':') {
            return Ok(0.0);
        }
        self.pos += 1;
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, b'.' | b'-' | b'+' | b'e' | b'E') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("");
        text.parse::<f64>()
            .map_err(|_| BioGeoError::tree_parse(start, format!("invalid branch length '{}'", text)))
    }
}
