//! Newick import and export for time trees.
//!
//! Supports the standard Newick grammar:
//! ```text
//! tree     = subtree ';'
//! subtree  = '(' children ')' label | label
//! children = subtree (',' subtree)*
//! label    = name? (':' length)?
//! ```
//!
//! Only rooted, strictly bifurcating trees with named tips are accepted.
//! Node heights are derived from root-to-node distances: the deepest tip
//! sits at height 0 and every other node at `max_depth - depth`, so tips
//! sampled at different times keep their relative ages.

use crate::tree::{Join, NodeId, TimeTree};
use sylva_core::{Result, SylvaError};

/// Parse a Newick string into a [`TimeTree`].
pub fn parse(input: &str) -> Result<TimeTree> {
    let mut parser = Parser::new(input.as_bytes());
    let root = parser.parse_tree()?;
    build(&parser.nodes, root)
}

/// Serialize a [`TimeTree`] to Newick with branch lengths.
pub fn write(tree: &TimeTree) -> String {
    let mut buf = String::new();
    write_subtree(tree, tree.root(), &mut buf);
    buf.push(';');
    buf
}

fn write_subtree(tree: &TimeTree, id: NodeId, buf: &mut String) {
    let children = tree.children(id);
    if !children.is_empty() {
        buf.push('(');
        for (i, &child) in children.iter().enumerate() {
            if i > 0 {
                buf.push(',');
            }
            write_subtree(tree, child, buf);
        }
        buf.push(')');
    }
    if let Some(name) = tree.taxon_name(id) {
        buf.push_str(name);
    }
    if let Some(len) = tree.branch_length(id) {
        buf.push(':');
        let fixed = format!("{:.10}", len);
        buf.push_str(fixed.trim_end_matches('0').trim_end_matches('.'));
    }
}

#[derive(Debug, Default)]
struct RawNode {
    name: Option<String>,
    length: Option<f64>,
    children: Vec<usize>,
}

fn build(raw: &[RawNode], root: usize) -> Result<TimeTree> {
    // Depths in preorder; every non-root node needs a length.
    let mut depth = vec![0.0f64; raw.len()];
    let mut order = Vec::with_capacity(raw.len());
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        order.push(id);
        for &child in &raw[id].children {
            let len = raw[child].length.ok_or_else(|| {
                SylvaError::Parse(format!(
                    "missing branch length for {}",
                    raw[child].name.as_deref().unwrap_or("internal node")
                ))
            })?;
            depth[child] = depth[id] + len;
            stack.push(child);
        }
    }

    let mut taxa = Vec::new();
    let mut tip_depths = Vec::new();
    let mut tree_id = vec![usize::MAX; raw.len()];
    for (id, node) in raw.iter().enumerate() {
        match node.children.len() {
            0 => {
                let name = node.name.clone().ok_or_else(|| {
                    SylvaError::Parse("every tip needs a taxon name".into())
                })?;
                tree_id[id] = taxa.len();
                taxa.push(name);
                tip_depths.push(depth[id]);
            }
            2 => {}
            k => {
                return Err(SylvaError::Parse(format!(
                    "node with {} children; only strictly bifurcating trees are supported",
                    k
                )))
            }
        }
    }
    let max_depth = tip_depths.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    // Internal nodes in postorder so every join references earlier ids.
    let mut joins = Vec::with_capacity(taxa.len().saturating_sub(1));
    for &id in order.iter().rev() {
        if let [left, right] = raw[id].children[..] {
            tree_id[id] = taxa.len() + joins.len();
            joins.push(Join {
                left: tree_id[left],
                right: tree_id[right],
                height: max_depth - depth[id],
            });
        }
    }

    let tip_heights = tip_depths.iter().map(|d| max_depth - d).collect();
    TimeTree::new(taxa, tip_heights, &joins)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<RawNode>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn parse_tree(&mut self) -> Result<usize> {
        self.skip_whitespace();
        let root = self.parse_subtree()?;
        self.skip_whitespace();
        if self.peek() != Some(b';') {
            return Err(SylvaError::Parse("expected ';' at end of Newick string".into()));
        }
        self.pos += 1;
        Ok(root)
    }

    fn parse_subtree(&mut self) -> Result<usize> {
        self.skip_whitespace();
        let id = self.nodes.len();
        self.nodes.push(RawNode::default());

        if self.peek() == Some(b'(') {
            self.pos += 1; // consume '('
            loop {
                let child = self.parse_subtree()?;
                self.nodes[id].children.push(child);
                self.skip_whitespace();
                if self.peek() == Some(b',') {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            if self.peek() != Some(b')') {
                return Err(SylvaError::Parse("expected ')' in Newick string".into()));
            }
            self.pos += 1; // consume ')'
        }

        self.parse_label(id)?;
        Ok(id)
    }

    fn parse_label(&mut self, id: usize) -> Result<()> {
        self.skip_whitespace();
        let name = self.parse_name();
        if !name.is_empty() {
            self.nodes[id].name = Some(name);
        }
        self.skip_whitespace();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace();
            let len_str = self.parse_float_str();
            if len_str.is_empty() {
                return Err(SylvaError::Parse("expected number after ':'".into()));
            }
            let len: f64 = len_str.parse().map_err(|_| {
                SylvaError::Parse(format!("invalid branch length: '{}'", len_str))
            })?;
            self.nodes[id].length = Some(len);
        }
        Ok(())
    }

    fn parse_name(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b':' | b',' | b')' | b'(' | b';' | b' ' | b'\t' | b'\n' | b'\r' => break,
                _ => self.pos += 1,
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn parse_float_str(&mut self) -> String {
        let start = self.pos;
        while let Some(b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E') = self.peek() {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.peek() {
            self.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cherry() {
        let tree = parse("(A:0.5,B:0.5);").unwrap();
        assert_eq!(tree.tip_count(), 2);
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.height(tree.root()), 0.5);
        assert_eq!(tree.height(0), 0.0);
        assert_eq!(tree.taxon_name(1), Some("B"));
    }

    #[test]
    fn heights_from_depths() {
        let tree = parse("((A:1,B:1):1,(C:0.5,D:0.5):1.5);").unwrap();
        assert_eq!(tree.tip_count(), 4);
        assert!((tree.height(tree.root()) - 2.0).abs() < 1e-12);
        let ab = tree.parent(tree.tip_by_name("A").unwrap()).unwrap();
        let cd = tree.parent(tree.tip_by_name("C").unwrap()).unwrap();
        assert!((tree.height(ab) - 1.0).abs() < 1e-12);
        assert!((tree.height(cd) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn non_contemporaneous_tips() {
        let tree = parse("((A:1,B:0.5):1,C:1.25);").unwrap();
        let b = tree.tip_by_name("B").unwrap();
        let c = tree.tip_by_name("C").unwrap();
        assert!((tree.height(b) - 0.5).abs() < 1e-12);
        assert!((tree.height(c) - 0.75).abs() < 1e-12);
        assert!(tree.is_valid_state());
    }

    #[test]
    fn round_trip_preserves_branch_lengths() {
        let input = "((A:0.1,B:0.1):0.2,C:0.3);";
        let tree = parse(input).unwrap();
        assert_eq!(write(&tree), input);
    }

    #[test]
    fn rejects_multifurcation() {
        assert!(matches!(parse("(A:1,B:1,C:1);"), Err(SylvaError::Parse(_))));
    }

    #[test]
    fn rejects_missing_length() {
        assert!(parse("(A,B:1);").is_err());
    }

    #[test]
    fn rejects_unnamed_tip() {
        assert!(parse("(:1,B:1);").is_err());
    }

    #[test]
    fn rejects_missing_semicolon() {
        assert!(parse("(A:1,B:1)").is_err());
    }

    #[test]
    fn tolerates_whitespace() {
        let tree = parse(" ( A : 1 , B : 1 ) ; ").unwrap();
        assert_eq!(tree.tip_count(), 2);
    }
}
