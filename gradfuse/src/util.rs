//! Small shared utilities: topological sorting and the polynomial
//! fingerprint hasher used by the JIT compile cache.

/// Polynomial rolling hash over a stream of words.
///
/// Deterministic across runs (unlike `DefaultHasher` with random keys),
/// which the compile cache relies on for stable fingerprints.
#[derive(Debug, Clone, Copy)]
pub struct FpHash {
    state: u64,
}

const FP_BASE: u64 = 0x0000_0100_0000_01b3;
const FP_SEED: u64 = 0xcbf2_9ce4_8422_2325;

impl FpHash {
    pub fn new() -> FpHash {
        FpHash { state: FP_SEED }
    }

    pub fn push(&mut self, word: u64) {
        self.state = self.state.wrapping_mul(FP_BASE).wrapping_add(word);
    }

    pub fn push_usize(&mut self, word: usize) {
        self.push(word as u64);
    }

    pub fn push_slice(&mut self, words: &[usize]) {
        self.push_usize(words.len());
        for &w in words {
            self.push_usize(w);
        }
    }

    pub fn finish(self) -> u64 {
        self.state
    }
}

impl Default for FpHash {
    fn default() -> Self {
        FpHash::new()
    }
}

/// Dependencies-first ordering of a dag reachable from `roots`.
///
/// `parents(n)` lists the nodes `n` depends on; the result contains every
/// reachable node exactly once, with all of a node's parents before it.
/// Iterative so deep programs cannot overflow the stack.
pub fn topo_sort<F>(roots: &[usize], mut parents: F) -> Vec<usize>
where
    F: FnMut(usize) -> Vec<usize>,
{
    let mut order = Vec::new();
    let mut emitted = std::collections::HashSet::new();
    let mut stack: Vec<(usize, bool)> = roots.iter().rev().map(|&r| (r, false)).collect();
    while let Some((node, expanded)) = stack.pop() {
        if emitted.contains(&node) {
            continue;
        }
        if expanded {
            emitted.insert(node);
            order.push(node);
        } else {
            stack.push((node, true));
            for p in parents(node).into_iter().rev() {
                if !emitted.contains(&p) {
                    stack.push((p, false));
                }
            }
        }
    }
    order
}
