//! Slice Assignment
//!
//! Distributes the writing slices of a sink across the source nodes. Every
//! source node runs the same pure function over the same sorted inputs, so
//! the nodes agree on the assignment without talking to each other.
//!
//! ## Algorithm
//!
//! ```text
//! slices_per_node = max(ceil(slices / nodes), min_slices_per_node)
//! start           = index_of(this_node) * slices_per_node
//! assigned        = slices[start .. start + slices_per_node]   (wraps around)
//! ```
//!
//! Example, 3 nodes and 8 slices:
//!
//! ```text
//! node 0 -> [1, 2, 3]
//! node 1 -> [4, 5, 6]
//! node 2 -> [7, 8, 1]
//! ```
//!
//! Raising `min_slices_per_node` above the fair share makes windows overlap:
//! each slice is then written by more than one node, and each node can
//! balance over more slices.

use slicehouse_core::NodeId;

/// Slices this node writes to.
///
/// `all_slices` and `source_nodes` must be sorted. The result is empty if
/// either input is empty or `this_node` is not in `source_nodes`.
pub fn assign_slices<T: Clone>(
    all_slices: &[T],
    source_nodes: &[NodeId],
    this_node: &NodeId,
    min_slices_per_node: usize,
) -> Vec<T> {
    if all_slices.is_empty() || source_nodes.is_empty() {
        return Vec::new();
    }
    let Ok(index) = source_nodes.binary_search(this_node) else {
        return Vec::new();
    };

    let total = all_slices.len();
    let per_node = total
        .div_ceil(source_nodes.len())
        .max(min_slices_per_node)
        .min(total);
    let start = index * per_node;

    (0..per_node)
        .map(|i| all_slices[(start + i) % total].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: usize) -> Vec<NodeId> {
        (1..=n).map(|i| NodeId::new(format!("node-{i}"))).collect()
    }

    fn slices(n: u32) -> Vec<u32> {
        (1..=n).collect()
    }

    #[test]
    fn test_three_nodes_eight_slices() {
        let nodes = nodes(3);
        let all = slices(8);
        assert_eq!(assign_slices(&all, &nodes, &nodes[0], 0), vec![1, 2, 3]);
        assert_eq!(assign_slices(&all, &nodes, &nodes[1], 0), vec![4, 5, 6]);
        assert_eq!(assign_slices(&all, &nodes, &nodes[2], 0), vec![7, 8, 1]);
    }

    #[test]
    fn test_more_nodes_than_slices() {
        let nodes = nodes(4);
        let all = slices(2);
        assert_eq!(assign_slices(&all, &nodes, &nodes[0], 0), vec![1]);
        assert_eq!(assign_slices(&all, &nodes, &nodes[1], 0), vec![2]);
        assert_eq!(assign_slices(&all, &nodes, &nodes[2], 0), vec![1]);
        assert_eq!(assign_slices(&all, &nodes, &nodes[3], 0), vec![2]);
    }

    #[test]
    fn test_min_slices_per_node() {
        let nodes = nodes(2);
        let all = slices(4);
        assert_eq!(assign_slices(&all, &nodes, &nodes[0], 3), vec![1, 2, 3]);
        assert_eq!(assign_slices(&all, &nodes, &nodes[1], 3), vec![4, 1, 2]);
        // never more than all slices
        assert_eq!(assign_slices(&all, &nodes, &nodes[1], 10), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_union_covers_all_slices() {
        let nodes = nodes(3);
        let all = slices(8);
        let mut covered: Vec<u32> = nodes
            .iter()
            .flat_map(|n| assign_slices(&all, &nodes, n, 0))
            .collect();
        covered.sort();
        covered.dedup();
        assert_eq!(covered, all);
    }

    #[test]
    fn test_deterministic() {
        let nodes = nodes(3);
        let all = slices(5);
        assert_eq!(
            assign_slices(&all, &nodes, &nodes[1], 1),
            assign_slices(&all, &nodes, &nodes[1], 1)
        );
    }

    #[test]
    fn test_empty_inputs() {
        let nodes = nodes(2);
        assert!(assign_slices::<u32>(&[], &nodes, &nodes[0], 0).is_empty());
        assert!(assign_slices(&slices(3), &[], &nodes[0], 0).is_empty());
        assert!(assign_slices(&slices(3), &nodes, &NodeId::new("unknown"), 0).is_empty());
    }
}
