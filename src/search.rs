use crate::{block::BlockRef, heap::State, list::BlockList};

/// Strategy used to pick an existing block for a new allocation.
///
/// Every policy looks at the unused span of each block (`capacity - occupied`)
/// and only considers blocks whose span can hold the whole request. They
/// differ in which of those candidates wins:
///
/// ```text
///   request: 100
///
///   +-------+   +--------------+   +--------+
///   |  120  |   |     600      |   |  150   |   <- unused spans
///   +-------+   +--------------+   +--------+
///   first-fit   worst-fit (500)
///   best-fit (20)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Earliest block in arrival order that fits.
    #[default]
    FirstFit,
    /// Block leaving the least unused space behind. Ties go to the earliest.
    BestFit,
    /// Block leaving the most unused space behind. Ties go to the earliest.
    WorstFit,
}

impl Policy {
    /// Parses a policy name. Both `first_fit` and `first-fit` spellings are accepted.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "first_fit" | "first-fit" => Some(Self::FirstFit),
            "best_fit" | "best-fit" => Some(Self::BestFit),
            "worst_fit" | "worst-fit" => Some(Self::WorstFit),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::FirstFit => "first_fit",
            Self::BestFit => "best_fit",
            Self::WorstFit => "worst_fit",
        }
    }

    /// Walks `blocks` and returns the block this policy picks for a request
    /// needing `required` bytes (header included), if any.
    pub(crate) fn select(self, blocks: &BlockList, required: usize) -> Option<BlockRef> {
        let mut candidates = blocks
            .iter()
            .filter(|block| block.free_span() >= required)
            .map(|block| (block.free_span() - required, block));

        match self {
            Self::FirstFit => candidates.next().map(|(_, block)| block),
            Self::BestFit => pick(candidates, |waste, best| waste < best),
            Self::WorstFit => pick(candidates, |waste, worst| waste > worst),
        }
    }
}

/// Keeps the first candidate for which `better` never returns true against a
/// later one. Strict comparisons make the earliest candidate win ties.
fn pick(
    candidates: impl Iterator<Item = (usize, BlockRef)>,
    better: impl Fn(usize, usize) -> bool,
) -> Option<BlockRef> {
    let mut winner: Option<(usize, BlockRef)> = None;

    for (waste, block) in candidates {
        match winner {
            Some((best, _)) if !better(waste, best) => {}
            _ => winner = Some((waste, block)),
        }
    }

    winner.map(|(_, block)| block)
}

/// How [`find_reusable`] placed a request in an existing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reuse {
    /// A free block was taken over whole. `previous` is the id it had.
    InPlace { previous: u64 },
    /// The unused tail of block `parent`, starting `offset` bytes into it,
    /// became a new block.
    Split { parent: u64, offset: usize },
}

/// Tries to serve a request of `required` bytes (header included, already
/// aligned) out of the blocks we already have.
///
/// Returns `None` when nothing fits, which means a new region has to be
/// mapped. Otherwise returns the block now holding the request:
///
/// - If the chosen block is free it is reused in place. Whatever it has beyond
///   `required` stays unused until the block is freed again.
/// - If the chosen block is in use, its unused tail is split off into a new
///   block right after it, and the new block is returned.
///
/// Both outcomes get a fresh id.
pub(crate) fn find_reusable(state: &mut State, required: usize, policy: Policy) -> Option<(BlockRef, Reuse)> {
    let block = policy.select(&state.blocks, required)?;
    let id = state.next_id();

    if block.is_free() {
        let previous = block.id();
        block.set_id(id);
        block.set_occupied(required);

        return Some((block, Reuse::InPlace { previous }));
    }

    // The chosen block keeps its current footprint and the rest of its
    // capacity becomes the new block.
    let tail = unsafe { block.split(id, required) };
    state.blocks.insert_after(block, tail);

    Some((tail, Reuse::Split { parent: block.id(), offset: block.capacity() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{HEADER_SIZE, tests::Scratch};

    #[test]
    fn parse_policy_names() {
        assert_eq!(Some(Policy::FirstFit), Policy::parse("first_fit"));
        assert_eq!(Some(Policy::BestFit), Policy::parse("best-fit"));
        assert_eq!(Some(Policy::WorstFit), Policy::parse(" worst_fit\n"));
        assert_eq!(None, Policy::parse("next_fit"));
        assert_eq!(None, Policy::parse(""));

        for policy in [Policy::FirstFit, Policy::BestFit, Policy::WorstFit] {
            assert_eq!(Some(policy), Policy::parse(policy.name()));
        }
    }

    /// Builds one region with free blocks whose unused spans are the given
    /// sizes, separated by small occupied guard blocks, and a full tail.
    fn layout(scratch: &mut Scratch, spans: &[usize]) -> (State, Vec<BlockRef>) {
        let mut state = State::new();
        let len = scratch.len();
        let first = unsafe { BlockRef::init_region(scratch.base(), state.next_id(), len, spans[0]) };
        state.blocks.push_back(first);

        let mut slots = vec![first];
        let mut last = first;
        for i in 0..spans.len() {
            let guard = unsafe { last.split(state.next_id(), HEADER_SIZE) };
            state.blocks.insert_after(last, guard);
            last = guard;

            if let Some(&span) = spans.get(i + 1) {
                let slot = unsafe { last.split(state.next_id(), span) };
                state.blocks.insert_after(last, slot);
                slots.push(slot);
                last = slot;
            }
        }
        // Nothing left at the tail.
        last.set_occupied(last.capacity());

        for slot in &slots {
            slot.set_occupied(0);
        }

        (state, slots)
    }

    #[test]
    fn empty_list_finds_nothing() {
        let mut state = State::new();

        for policy in [Policy::FirstFit, Policy::BestFit, Policy::WorstFit] {
            assert!(find_reusable(&mut state, HEADER_SIZE, policy).is_none());
        }
    }

    #[test]
    fn nothing_big_enough() {
        let mut scratch = Scratch::new(4096);
        let (mut state, _) = layout(&mut scratch, &[HEADER_SIZE + 16, HEADER_SIZE + 32]);

        for policy in [Policy::FirstFit, Policy::BestFit, Policy::WorstFit] {
            assert!(find_reusable(&mut state, HEADER_SIZE + 40, policy).is_none());
        }
    }

    #[test]
    fn policies_pick_different_slots() {
        let required = HEADER_SIZE + 104;
        let spans = [required + 56, required + 16, required + 504, required + 16];

        for (policy, expected) in [(Policy::FirstFit, 0), (Policy::BestFit, 1), (Policy::WorstFit, 2)] {
            let mut scratch = Scratch::new(4096);
            let (mut state, slots) = layout(&mut scratch, &spans);

            let (block, _) = find_reusable(&mut state, required, policy).unwrap();
            assert!(block == slots[expected], "{policy:?}");
            assert_eq!(required, block.occupied());
            assert_eq!(spans[expected], block.capacity());
        }
    }

    #[test]
    fn worst_fit_accepts_exact_fit() {
        let required = HEADER_SIZE + 64;
        let mut scratch = Scratch::new(2048);
        let (mut state, slots) = layout(&mut scratch, &[required]);

        let (block, reuse) = find_reusable(&mut state, required, Policy::WorstFit).unwrap();
        assert!(block == slots[0]);
        assert!(matches!(reuse, Reuse::InPlace { .. }));
        assert_eq!(0, block.free_span());
    }

    #[test]
    fn occupied_block_is_split() {
        let mut scratch = Scratch::new(4096);
        let mut state = State::new();
        let first = unsafe { BlockRef::init_region(scratch.base(), state.next_id(), 4096, HEADER_SIZE + 8) };
        state.blocks.push_back(first);

        let (tail, reuse) = find_reusable(&mut state, HEADER_SIZE + 16, Policy::FirstFit).unwrap();

        assert_eq!(Reuse::Split { parent: 0, offset: HEADER_SIZE + 8 }, reuse);
        assert_eq!(HEADER_SIZE + 8, first.capacity());
        assert_eq!(4096 - HEADER_SIZE - 8, tail.capacity());
        assert_eq!(HEADER_SIZE + 16, tail.occupied());
        assert!(tail.region() == first);
        assert!(first.next() == Some(tail));
        assert_eq!(1, tail.id());
        assert_eq!(4096, state.blocks.iter().map(|block| block.capacity()).sum::<usize>());
    }

    #[test]
    fn reuse_in_place_gets_fresh_id() {
        let mut scratch = Scratch::new(2048);
        let (mut state, slots) = layout(&mut scratch, &[HEADER_SIZE + 256]);
        let old = slots[0].id();

        let (block, reuse) = find_reusable(&mut state, HEADER_SIZE + 8, Policy::FirstFit).unwrap();

        assert!(block == slots[0]);
        assert!(block.id() > old);
        assert_eq!(Reuse::InPlace { previous: old }, reuse);
        assert_eq!(HEADER_SIZE + 256, block.capacity());
        assert_eq!(HEADER_SIZE + 8, block.occupied());
    }
}
