use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Per-file change sets between two path→digest maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDiff {
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Root digest over `"<path>:<digest>"` entries in path-sorted order.
///
/// Leaves are hashed individually, then combined pairwise level by level;
/// an odd node is promoted unchanged. The empty file set has the empty
/// string as its root, which doubles as the "nothing indexed yet" marker.
pub fn merkle_root(tree: &BTreeMap<String, String>) -> String {
    if tree.is_empty() {
        return String::new();
    }

    let mut level: Vec<[u8; 32]> = tree
        .iter()
        .map(|(path, digest)| sha256_bytes(format!("{path}:{digest}").as_bytes()))
        .collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                let mut joined = [0u8; 64];
                joined[..32].copy_from_slice(&pair[0]);
                joined[32..].copy_from_slice(&pair[1]);
                next.push(sha256_bytes(&joined));
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }

    hex::encode(level[0])
}

/// Three-way diff of the prior (persisted) map against the current tree.
pub fn diff_trees(
    prior: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> TreeDiff {
    let mut diff = TreeDiff::default();

    for (path, digest) in current {
        match prior.get(path) {
            None => {
                diff.added.insert(path.clone());
            }
            Some(prev) if prev != digest => {
                diff.modified.insert(path.clone());
            }
            Some(_) => {}
        }
    }

    for path in prior.keys() {
        if !current.contains_key(path) {
            diff.deleted.insert(path.clone());
        }
    }

    diff
}
