//! Changegroup container.
//!
//! A changegroup is the wire representation of a set of changesets. The
//! bundle pipeline treats the delta payloads as opaque; what it needs
//! from the container is the revision graph: which nodes are present,
//! which are heads, and whether the set descends from a given node.
//!
//! Layout: `u32-be revision count`, then per revision
//! `node[20] || p1[20] || p2[20] || u32-be delta length || delta bytes`.
//! A null parent is 20 zero bytes. Revisions are ordered parents-first,
//! the way a producer walks its graph.

use std::collections::{HashMap, HashSet};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, ServerError};
use crate::node::{Node, NODE_LEN};

#[derive(Debug, Clone)]
pub struct Revision {
    pub node: Node,
    pub p1: Node,
    pub p2: Node,
    pub delta: Bytes,
}

impl Revision {
    pub fn parents(&self) -> impl Iterator<Item = Node> + '_ {
        [self.p1, self.p2]
            .into_iter()
            .filter(|p| !p.is_null())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Changegroup {
    revisions: Vec<Revision>,
}

impl Changegroup {
    pub fn new(revisions: Vec<Revision>) -> Self {
        Self { revisions }
    }

    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.remaining() < 4 {
            return Err(ServerError::Protocol(
                "changegroup truncated: missing revision count".to_string(),
            ));
        }
        let count = data.get_u32() as usize;
        let mut revisions = Vec::with_capacity(count.min(4096));
        for i in 0..count {
            if data.remaining() < 3 * NODE_LEN + 4 {
                return Err(ServerError::Protocol(format!(
                    "changegroup truncated in revision {}",
                    i
                )));
            }
            let node = Node::from_bytes(&data.copy_to_bytes(NODE_LEN))?;
            let p1 = Node::from_bytes(&data.copy_to_bytes(NODE_LEN))?;
            let p2 = Node::from_bytes(&data.copy_to_bytes(NODE_LEN))?;
            let delta_len = data.get_u32() as usize;
            if data.remaining() < delta_len {
                return Err(ServerError::Protocol(format!(
                    "changegroup truncated: revision {} delta wants {} bytes, {} left",
                    i,
                    delta_len,
                    data.remaining()
                )));
            }
            let delta = data.copy_to_bytes(delta_len);
            revisions.push(Revision { node, p1, p2, delta });
        }
        if data.has_remaining() {
            return Err(ServerError::Protocol(format!(
                "changegroup has {} trailing bytes",
                data.remaining()
            )));
        }
        Ok(Self { revisions })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.revisions.len() as u32);
        for rev in &self.revisions {
            buf.put_slice(rev.node.as_bytes());
            buf.put_slice(rev.p1.as_bytes());
            buf.put_slice(rev.p2.as_bytes());
            buf.put_u32(rev.delta.len() as u32);
            buf.put_slice(&rev.delta);
        }
        buf.freeze()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    /// Nodes in arrival order.
    pub fn nodes(&self) -> Vec<Node> {
        self.revisions.iter().map(|r| r.node).collect()
    }

    pub fn contains(&self, node: Node) -> bool {
        self.revisions.iter().any(|r| r.node == node)
    }

    /// Head revisions: nodes that no other revision in the container
    /// names as a parent. Sorted by hex so callers see a stable order.
    pub fn heads(&self) -> Vec<Node> {
        let mut parents = HashSet::new();
        for rev in &self.revisions {
            for p in rev.parents() {
                parents.insert(p);
            }
        }
        let mut heads: Vec<Node> = self
            .revisions
            .iter()
            .map(|r| r.node)
            .filter(|n| !parents.contains(n))
            .collect();
        heads.sort();
        heads
    }

    /// True when every head of this container is reachable from `base`
    /// through child links, i.e. the pushed set fast-forwards `base`.
    /// `base` must itself be present in the container.
    pub fn descends_from(&self, base: Node) -> bool {
        if !self.contains(base) {
            return false;
        }
        let mut children: HashMap<Node, Vec<Node>> = HashMap::new();
        for rev in &self.revisions {
            for p in rev.parents() {
                children.entry(p).or_default().push(rev.node);
            }
        }
        let mut reachable = HashSet::new();
        let mut queue = vec![base];
        while let Some(node) = queue.pop() {
            if !reachable.insert(node) {
                continue;
            }
            if let Some(kids) = children.get(&node) {
                queue.extend(kids.iter().copied());
            }
        }
        self.heads().iter().all(|h| reachable.contains(h))
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{chain, node};
    use super::*;
    use crate::node::NULL_NODE;

    #[test]
    fn test_parse_roundtrip() {
        let cg = chain(3, None);
        let parsed = Changegroup::parse(cg.encode()).unwrap();
        assert_eq!(parsed.nodes(), cg.nodes());
        assert_eq!(parsed.revisions()[1].p1, node(1));
        assert_eq!(parsed.revisions()[0].delta.as_ref(), b"delta");
    }

    #[test]
    fn test_parse_truncated() {
        let mut bytes = chain(2, None).encode().to_vec();
        bytes.truncate(bytes.len() - 3);
        assert!(Changegroup::parse(Bytes::from(bytes)).is_err());
    }

    #[test]
    fn test_parse_trailing_garbage() {
        let mut bytes = chain(1, None).encode().to_vec();
        bytes.extend_from_slice(b"junk");
        assert!(Changegroup::parse(Bytes::from(bytes)).is_err());
    }

    #[test]
    fn test_linear_chain_single_head() {
        let cg = chain(4, None);
        assert_eq!(cg.heads(), vec![node(4)]);
    }

    #[test]
    fn test_branching_two_heads() {
        // 1 <- 2 and 1 <- 3: two heads.
        let cg = Changegroup::new(vec![
            Revision {
                node: node(1),
                p1: NULL_NODE,
                p2: NULL_NODE,
                delta: Bytes::new(),
            },
            Revision {
                node: node(2),
                p1: node(1),
                p2: NULL_NODE,
                delta: Bytes::new(),
            },
            Revision {
                node: node(3),
                p1: node(1),
                p2: NULL_NODE,
                delta: Bytes::new(),
            },
        ]);
        assert_eq!(cg.heads(), vec![node(2), node(3)]);
    }

    #[test]
    fn test_merge_has_single_head() {
        let cg = Changegroup::new(vec![
            Revision {
                node: node(1),
                p1: NULL_NODE,
                p2: NULL_NODE,
                delta: Bytes::new(),
            },
            Revision {
                node: node(2),
                p1: NULL_NODE,
                p2: NULL_NODE,
                delta: Bytes::new(),
            },
            Revision {
                node: node(3),
                p1: node(1),
                p2: node(2),
                delta: Bytes::new(),
            },
        ]);
        assert_eq!(cg.heads(), vec![node(3)]);
    }

    #[test]
    fn test_descends_from() {
        let cg = chain(3, None);
        assert!(cg.descends_from(node(1)));
        assert!(cg.descends_from(node(3)));
        assert!(!cg.descends_from(node(9)));
    }

    #[test]
    fn test_descends_from_sibling_branch() {
        // 1 <- 2, plus disconnected 5: head 5 unreachable from 2.
        let cg = Changegroup::new(vec![
            Revision {
                node: node(1),
                p1: NULL_NODE,
                p2: NULL_NODE,
                delta: Bytes::new(),
            },
            Revision {
                node: node(2),
                p1: node(1),
                p2: NULL_NODE,
                delta: Bytes::new(),
            },
            Revision {
                node: node(5),
                p1: NULL_NODE,
                p2: NULL_NODE,
                delta: Bytes::new(),
            },
        ]);
        assert!(!cg.descends_from(node(2)));
    }
}
