//! Merkle root over an ordered sequence of hash strings.
//!
//! Position-sensitive: reordering the input changes the root. Odd levels
//! duplicate the last hash rather than carrying it up unpaired, so every
//! level halves cleanly.

use cp_hasher::{hash_string, Hash};

/// Compute the Merkle root of an ordered list of hash strings.
///
/// Empty input yields the empty string; a single hash is its own root.
pub fn merkle_root(hashes: &[String]) -> String {
    if hashes.is_empty() {
        return String::new();
    }
    if hashes.len() == 1 {
        return hashes[0].clone();
    }

    let mut level: Vec<String> = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level.last().unwrap().clone();
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| hash_string(&format!("{}{}", pair[0], pair[1])).as_str().to_string())
            .collect();
    }
    level.remove(0)
}

/// `Hash`-typed convenience wrapper over [`merkle_root`].
pub fn merkle_root_typed(hashes: &[Hash]) -> Option<Hash> {
    if hashes.is_empty() {
        return None;
    }
    let raw: Vec<String> = hashes.iter().map(|h| h.as_str().to_string()).collect();
    Hash::parse(&merkle_root(&raw)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_empty_string() {
        assert_eq!(merkle_root(&[]), "");
    }

    #[test]
    fn single_is_itself() {
        let h = hash_string("a").as_str().to_string();
        assert_eq!(merkle_root(&[h.clone()]), h);
    }

    #[test]
    fn odd_count_duplicates_last() {
        let a = hash_string("a").as_str().to_string();
        let b = hash_string("b").as_str().to_string();
        let c = hash_string("c").as_str().to_string();
        // [a,b,c] -> pairs (a,b) (c,c)
        let root_abc = merkle_root(&[a.clone(), b.clone(), c.clone()]);
        let ab = hash_string(&format!("{a}{b}")).as_str().to_string();
        let cc = hash_string(&format!("{c}{c}")).as_str().to_string();
        let expected = hash_string(&format!("{ab}{cc}")).as_str().to_string();
        assert_eq!(root_abc, expected);
    }

    #[test]
    fn position_sensitive() {
        let a = hash_string("a").as_str().to_string();
        let b = hash_string("b").as_str().to_string();
        assert_ne!(merkle_root(&[a.clone(), b.clone()]), merkle_root(&[b, a]));
    }

    #[test]
    fn deterministic() {
        let hashes: Vec<String> = (0..5).map(|i| hash_string(&i.to_string()).as_str().to_string()).collect();
        assert_eq!(merkle_root(&hashes), merkle_root(&hashes));
    }
}
