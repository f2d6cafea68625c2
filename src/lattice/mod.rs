//! State-lattice global planning: environment, motion primitives, keyed open
//! set and the anytime repairing search.

pub mod environment;
pub mod heap;
pub mod primitives;
pub mod search;

pub use environment::{LatticeEnvironment, LatticePoint};
pub use heap::{EntryId, INVALID_ID, OpenList, SearchKey};
pub use primitives::{MotionPrimitive, PrimitiveSet};
pub use search::{RepairingSearch, SearchFailure};

/// Cost value treated as unreachable. Large enough to dominate any real path
/// cost while leaving headroom for additions.
pub const INFINITE_COST: u32 = 1_000_000_000;

/// Heap slot marker for entries not in the open list.
pub const NO_HEAP_POS: usize = usize::MAX;

/// One lazily materialized (x, y, heading) lattice state.
///
/// `best_next` is an arena index pointing toward the goal along the best
/// known path, not an owning handle; the environment owns every entry.
#[derive(Clone, Debug)]
pub struct LatticeEntry {
    pub x: i32,
    pub y: i32,
    pub theta: u8,
    /// Cost-so-far estimate (backward search: cost-to-goal)
    pub g: u32,
    /// One-step lookahead value
    pub rhs: u32,
    pub key: SearchKey,
    pub best_next: EntryId,
    /// Environment iteration this entry was last touched in
    pub visited_iteration: u32,
    /// Search iteration this entry was closed in
    pub closed_iteration: u32,
    pub heap_pos: usize,
    pub in_incons: bool,
}

impl LatticeEntry {
    pub fn new(x: i32, y: i32, theta: u8) -> Self {
        Self {
            x,
            y,
            theta,
            g: INFINITE_COST,
            rhs: INFINITE_COST,
            key: SearchKey::INFINITE,
            best_next: heap::INVALID_ID,
            visited_iteration: 0,
            closed_iteration: 0,
            heap_pos: NO_HEAP_POS,
            in_incons: false,
        }
    }

    /// A consistent entry has settled: `g == rhs`.
    pub fn is_consistent(&self) -> bool {
        self.g == self.rhs
    }
}
