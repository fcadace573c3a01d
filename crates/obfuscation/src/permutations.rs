//! Permutation tables mapping a combo index to an ordered function list

use std::sync::LazyLock;

use crate::error::ObfuscationError;
use crate::functions::{FUNCTION_COUNT, ObfuscationFn};

/// Highest supported obfuscation layer
pub const MAX_LAYER: u8 = 4;

/// One table per layer, index 0 holds layer 1
static TABLES: LazyLock<Vec<Vec<Vec<u8>>>> =
    LazyLock::new(|| (1..=MAX_LAYER).map(build_table).collect());

/// All ordered selections of `layer` distinct function indices,
/// in lexicographic order
fn build_table(layer: u8) -> Vec<Vec<u8>> {
    fn extend(current: &mut Vec<u8>, used: &mut [bool; FUNCTION_COUNT], depth: u8, out: &mut Vec<Vec<u8>>) {
        if current.len() == depth as usize {
            out.push(current.clone());
            return;
        }
        for i in 0..FUNCTION_COUNT {
            if used[i] {
                continue;
            }
            used[i] = true;
            current.push(i as u8);
            extend(current, used, depth, out);
            current.pop();
            used[i] = false;
        }
    }

    let mut out = Vec::new();
    extend(&mut Vec::new(), &mut [false; FUNCTION_COUNT], layer, &mut out);
    out
}

fn table(layer: u8) -> Result<&'static [Vec<u8>], ObfuscationError> {
    if layer == 0 || layer > MAX_LAYER {
        return Err(ObfuscationError::InvalidLayer(layer));
    }
    Ok(&TABLES[layer as usize - 1])
}

/// Number of combinations available at a layer
pub fn total_combinations(layer: u8) -> Result<usize, ObfuscationError> {
    table(layer).map(<[_]>::len)
}

/// Ordered function indices for a combo
pub fn function_indices(layer: u8, combo: usize) -> Result<&'static [u8], ObfuscationError> {
    table(layer)?
        .get(combo)
        .map(Vec::as_slice)
        .ok_or(ObfuscationError::ComboOutOfRange { layer, index: combo })
}

/// Ordered functions for a combo
pub fn functions_for(layer: u8, combo: usize) -> Result<Vec<ObfuscationFn>, ObfuscationError> {
    function_indices(layer, combo)?
        .iter()
        .map(|&i| {
            ObfuscationFn::from_index(i).ok_or(ObfuscationError::ComboOutOfRange {
                layer,
                index: combo,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_table_sizes() {
        assert_eq!(total_combinations(1).unwrap(), 11);
        assert_eq!(total_combinations(2).unwrap(), 110);
        assert_eq!(total_combinations(3).unwrap(), 990);
        assert_eq!(total_combinations(4).unwrap(), 7920);
    }

    #[test]
    fn test_invalid_layers() {
        assert_eq!(total_combinations(0), Err(ObfuscationError::InvalidLayer(0)));
        assert_eq!(total_combinations(5), Err(ObfuscationError::InvalidLayer(5)));
    }

    #[test]
    fn test_lexicographic_order() {
        assert_eq!(function_indices(2, 0).unwrap(), &[0, 1]);
        assert_eq!(function_indices(2, 1).unwrap(), &[0, 2]);
        assert_eq!(function_indices(2, 10).unwrap(), &[1, 0]);
        assert_eq!(function_indices(2, 109).unwrap(), &[10, 9]);
        assert_eq!(function_indices(4, 7919).unwrap(), &[10, 9, 8, 7]);
    }

    #[test]
    fn test_entries_are_distinct() {
        let all: HashSet<&[u8]> = (0..7920)
            .map(|c| function_indices(4, c).unwrap())
            .collect();
        assert_eq!(all.len(), 7920);

        for combo in all {
            let unique: HashSet<_> = combo.iter().collect();
            assert_eq!(unique.len(), 4);
        }
    }

    #[test]
    fn test_out_of_range_combo() {
        assert_eq!(
            function_indices(1, 11),
            Err(ObfuscationError::ComboOutOfRange { layer: 1, index: 11 })
        );
    }

    #[test]
    fn test_functions_for() {
        let fns = functions_for(3, 0).unwrap();
        assert_eq!(
            fns,
            vec![
                ObfuscationFn::BitwiseRotationXor,
                ObfuscationFn::SwapNeighbors,
                ObfuscationFn::ReverseBuffer
            ]
        );
    }
}
