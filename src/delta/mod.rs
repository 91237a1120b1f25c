/*
 * Created on Sun Jul 26 2026
*/

//! The delta-chain node model: leaf and inner logical nodes
//! are reconstructed by walking a chain of immutable delta records down
//! to a consolidated base record.
//!
//! Grounded on `engine::idx::mtchm::mod`'s chain-of-patches `Node<C>`
//! (there, a hash-trie branch patched in place by CAS; here, an ordered
//! leaf/inner page patched the same way), generalized from a single
//! hash-trie level to the two node kinds a Bw-Tree needs.

pub(crate) mod inner;
pub(crate) mod leaf;

/// Chains are consolidated once they grow past this many delta records.
/// Bounds the O(depth) chain walk every navigation pays; the source
/// uses 8 for both node kinds, which this keeps as the default.
pub(crate) const DEFAULT_CONSOLIDATE_DEPTH: usize = 8;
