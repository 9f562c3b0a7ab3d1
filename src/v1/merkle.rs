use crate::hash::double_sha256;

/// Computes the Merkle root over an ordered list of transaction double
/// hashes. Odd-width levels duplicate their last element before pairing; a
/// single hash therefore pairs with itself. An empty list has no root.
pub fn merkle_root(tx_hashes: &[String]) -> Option<String> {
    if tx_hashes.is_empty() {
        return None;
    }

    let mut level = tx_hashes.to_vec();

    loop {
        if level.len() % 2 == 1 {
            level.push(level[level.len() - 1].clone());
        }

        level = level
            .chunks(2)
            .map(|pair| double_sha256(&format!("{}{}", pair[0], pair[1])))
            .collect();

        if level.len() == 1 {
            return Some(level.remove(0));
        }
    }
}
