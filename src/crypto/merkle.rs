//! RFC 6962 / RFC 9162 Merkle tree hashing and proofs
//!
//! Inputs are leaf hashes (already prefixed with 0x00). Construction helpers
//! are used by the in-memory backends; the verification functions are what the
//! verifying clients rely on.

use super::hash::{empty_root, rfc6962_node_hash, Hash256};

/// Largest power of two strictly smaller than `n` (n >= 2)
fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k << 1 < n {
        k <<= 1;
    }
    k
}

/// Merkle tree hash of a list of leaf hashes
pub fn root_hash(leaves: &[Hash256]) -> Hash256 {
    match leaves.len() {
        0 => empty_root(),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            rfc6962_node_hash(&root_hash(&leaves[..k]), &root_hash(&leaves[k..]))
        }
    }
}

/// Audit path for the leaf at `index`
///
/// Returns `None` if `index` is out of range.
pub fn inclusion_proof(leaves: &[Hash256], index: usize) -> Option<Vec<Hash256>> {
    if index >= leaves.len() {
        return None;
    }
    Some(audit_path(index, leaves))
}

fn audit_path(m: usize, leaves: &[Hash256]) -> Vec<Hash256> {
    let n = leaves.len();
    if n <= 1 {
        return Vec::new();
    }
    let k = split_point(n);
    if m < k {
        let mut path = audit_path(m, &leaves[..k]);
        path.push(root_hash(&leaves[k..]));
        path
    } else {
        let mut path = audit_path(m - k, &leaves[k..]);
        path.push(root_hash(&leaves[..k]));
        path
    }
}

/// Consistency proof between the first `first_size` leaves and all of `leaves`
pub fn consistency_proof(leaves: &[Hash256], first_size: usize) -> Option<Vec<Hash256>> {
    if first_size > leaves.len() {
        return None;
    }
    if first_size == 0 || first_size == leaves.len() {
        return Some(Vec::new());
    }
    Some(subproof(first_size, leaves, true))
}

fn subproof(m: usize, leaves: &[Hash256], complete: bool) -> Vec<Hash256> {
    let n = leaves.len();
    if m == n {
        return if complete {
            Vec::new()
        } else {
            vec![root_hash(leaves)]
        };
    }
    let k = split_point(n);
    if m <= k {
        let mut proof = subproof(m, &leaves[..k], complete);
        proof.push(root_hash(&leaves[k..]));
        proof
    } else {
        let mut proof = subproof(m - k, &leaves[k..], false);
        proof.push(root_hash(&leaves[..k]));
        proof
    }
}

/// Verify an audit path (RFC 9162 section 2.1.3.2)
pub fn verify_inclusion(
    leaf_hash: &Hash256,
    leaf_index: u64,
    tree_size: u64,
    proof: &[Hash256],
    root: &Hash256,
) -> bool {
    if leaf_index >= tree_size {
        return false;
    }
    let mut fnode = leaf_index;
    let mut snode = tree_size - 1;
    let mut r = *leaf_hash;

    for p in proof {
        if snode == 0 {
            return false;
        }
        if fnode & 1 == 1 || fnode == snode {
            r = rfc6962_node_hash(p, &r);
            if fnode & 1 == 0 {
                while fnode & 1 == 0 && fnode != 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            r = rfc6962_node_hash(&r, p);
        }
        fnode >>= 1;
        snode >>= 1;
    }

    snode == 0 && r == *root
}

/// Verify a consistency proof (RFC 9162 section 2.1.4.2)
pub fn verify_consistency(
    first_size: u64,
    second_size: u64,
    first_root: &Hash256,
    second_root: &Hash256,
    proof: &[Hash256],
) -> bool {
    if first_size > second_size {
        return false;
    }
    if first_size == second_size {
        return proof.is_empty() && first_root == second_root;
    }
    if first_size == 0 {
        return proof.is_empty();
    }

    let mut path: Vec<Hash256> = Vec::with_capacity(proof.len() + 1);
    if first_size.is_power_of_two() {
        path.push(*first_root);
    }
    path.extend_from_slice(proof);
    if path.is_empty() {
        return false;
    }

    let mut fnode = first_size - 1;
    let mut snode = second_size - 1;
    while fnode & 1 == 1 {
        fnode >>= 1;
        snode >>= 1;
    }

    let mut fr = path[0];
    let mut sr = path[0];
    for c in &path[1..] {
        if snode == 0 {
            return false;
        }
        if fnode & 1 == 1 || fnode == snode {
            fr = rfc6962_node_hash(c, &fr);
            sr = rfc6962_node_hash(c, &sr);
            if fnode & 1 == 0 {
                while fnode & 1 == 0 && fnode != 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            sr = rfc6962_node_hash(&sr, c);
        }
        fnode >>= 1;
        snode >>= 1;
    }

    fr == *first_root && sr == *second_root && snode == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::rfc6962_leaf_hash;

    fn leaves(n: usize) -> Vec<Hash256> {
        (0..n)
            .map(|i| rfc6962_leaf_hash(format!("leaf-{i}").as_bytes()))
            .collect()
    }

    #[test]
    fn test_root_of_two_leaves() {
        let l = leaves(2);
        assert_eq!(root_hash(&l), rfc6962_node_hash(&l[0], &l[1]));
    }

    #[test]
    fn test_inclusion_all_sizes() {
        for n in 1..=17 {
            let l = leaves(n);
            let root = root_hash(&l);
            for i in 0..n {
                let proof = inclusion_proof(&l, i).unwrap();
                assert!(
                    verify_inclusion(&l[i], i as u64, n as u64, &proof, &root),
                    "leaf {i} of {n}"
                );
            }
        }
    }

    #[test]
    fn test_inclusion_rejects_wrong_index_and_tamper() {
        let l = leaves(7);
        let root = root_hash(&l);
        let mut proof = inclusion_proof(&l, 3).unwrap();
        assert!(!verify_inclusion(&l[3], 4, 7, &proof, &root));
        assert!(!verify_inclusion(&l[3], 3, 4, &proof, &root));
        proof[0][0] ^= 1;
        assert!(!verify_inclusion(&l[3], 3, 7, &proof, &root));
        assert!(inclusion_proof(&l, 7).is_none());
    }

    #[test]
    fn test_consistency_all_sizes() {
        let all = leaves(20);
        for second in 1..=20 {
            let second_root = root_hash(&all[..second]);
            for first in 0..=second {
                let first_root = root_hash(&all[..first]);
                let proof = consistency_proof(&all[..second], first).unwrap();
                assert!(
                    verify_consistency(
                        first as u64,
                        second as u64,
                        &first_root,
                        &second_root,
                        &proof
                    ),
                    "{first} -> {second}"
                );
            }
        }
    }

    #[test]
    fn test_consistency_rejects_forked_history() {
        let a = leaves(6);
        let mut b = a.clone();
        b[1] = rfc6962_leaf_hash(b"forged");
        let proof = consistency_proof(&b, 3).unwrap();
        assert!(!verify_consistency(
            3,
            6,
            &root_hash(&a[..3]),
            &root_hash(&b),
            &proof
        ));
    }
}
