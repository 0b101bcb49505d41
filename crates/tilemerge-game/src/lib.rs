// SPDX-License-Identifier: CEPL-1.0
//! The 4×4 merge game that feeds the renderer.
//!
//! Cells hold tile exponents (0 is empty). A move slides every tile toward one
//! edge, merges equal neighbours once into `value + 1`, and if anything moved
//! spawns a 1 or a 2 in a random empty cell.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tilemerge_core::{ArenaError, MemFlags, MemTree, NodeId, ScratchArena};
use tilemerge_render::TileGrid;
use tracing::{debug, trace};

pub const SIDE: usize = 4;
pub const CELLS: usize = SIDE * SIDE;
pub const DEFAULT_SEED: u64 = 12;

/// Per-move scratch; the empty-cell list is the only thing that lives here.
const SCRATCH_BYTES: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
    Up,
    Down,
}

impl Direction {
    /// Cell indices of line `n`, starting at the edge tiles slide toward.
    fn line(self, n: usize) -> [usize; SIDE] {
        let mut out = [0; SIDE];
        for (k, slot) in out.iter_mut().enumerate() {
            let (x, y) = match self {
                Direction::Left => (k, n),
                Direction::Right => (SIDE - 1 - k, n),
                Direction::Up => (n, k),
                Direction::Down => (n, SIDE - 1 - k),
            };
            *slot = x + SIDE * y;
        }
        out
    }
}

/// Slides one line toward index 0, merging each pair at most once.
pub fn slide_line(line: [u8; SIDE]) -> [u8; SIDE] {
    let mut out = [0u8; SIDE];
    let mut len = 0;
    let mut can_merge = false;
    for v in line.into_iter().filter(|&v| v != 0) {
        if can_merge && out[len - 1] == v {
            out[len - 1] = v.saturating_add(1);
            can_merge = false;
        } else {
            out[len] = v;
            len += 1;
            can_merge = true;
        }
    }
    out
}

#[derive(Debug)]
pub struct Game {
    cells: [u8; CELLS],
    rng: StdRng,
    scratch: ScratchArena,
    moves: u32,
}

impl Game {
    pub fn new(seed: u64) -> Result<Self, ArenaError> {
        let mut game = Self::with_cells([0; CELLS], seed);
        game.spawn()?;
        debug!(seed, "new game");
        Ok(game)
    }

    /// A board in a given state, without the opening spawn.
    pub fn with_cells(cells: [u8; CELLS], seed: u64) -> Self {
        Self {
            cells,
            rng: StdRng::seed_from_u64(seed),
            scratch: ScratchArena::new(SCRATCH_BYTES),
            moves: 0,
        }
    }

    pub fn cells(&self) -> &[u8; CELLS] {
        &self.cells
    }

    pub fn moves(&self) -> u32 {
        self.moves
    }

    pub fn is_full(&self) -> bool {
        self.cells.iter().all(|&c| c != 0)
    }

    /// Applies one move. Returns whether the board changed (and so whether a
    /// tile was spawned).
    pub fn apply(&mut self, dir: Direction) -> Result<bool, ArenaError> {
        let changed = self.slide(dir);
        if changed {
            self.moves += 1;
            self.spawn()?;
        }
        trace!(?dir, changed, "move");
        Ok(changed)
    }

    fn slide(&mut self, dir: Direction) -> bool {
        let mut changed = false;
        for n in 0..SIDE {
            let idx = dir.line(n);
            let before = idx.map(|i| self.cells[i]);
            let after = slide_line(before);
            if after != before {
                changed = true;
                for (i, v) in idx.into_iter().zip(after) {
                    self.cells[i] = v;
                }
            }
        }
        changed
    }

    /// Puts a 1 or a 2 into a random empty cell. Returns the cell, or `None`
    /// on a full board.
    fn spawn(&mut self) -> Result<Option<usize>, ArenaError> {
        self.scratch.reset();
        let empties = self.scratch.alloc_slice_fill(CELLS, 0u8)?;
        let mut n = 0;
        for (i, &c) in self.cells.iter().enumerate() {
            if c == 0 {
                empties[n] = i as u8;
                n += 1;
            }
        }
        if n == 0 {
            return Ok(None);
        }
        let cell = empties[self.rng.gen_range(0..n)] as usize;
        self.cells[cell] = self.rng.gen_range(1..=2);
        Ok(Some(cell))
    }
}

impl TileGrid for Game {
    fn dims(&self) -> (u32, u32) {
        (SIDE as u32, SIDE as u32)
    }

    fn value(&self, x: u32, y: u32) -> u32 {
        self.cells
            .get(x as usize + SIDE * y as usize)
            .map_or(0, |&v| u32::from(v))
    }
}

/// Allocation records for the game state.
#[derive(Clone, Debug)]
pub struct MemDesc {
    pub tree: MemTree,
    pub root: NodeId,
    raw: Vec<u8>,
}

impl MemDesc {
    /// A game root whose board is carved out of the root allocation and whose
    /// scratch arena is a separate, unpreserved allocation.
    pub fn for_game() -> Self {
        let mut tree = MemTree::new();
        let root = tree.add_root("game", std::mem::size_of::<Game>() + CELLS, MemFlags::empty());
        tree.add_child(root, "board", CELLS, MemFlags::INTERNAL);
        tree.add_child(root, "scratch", SCRATCH_BYTES, MemFlags::TEMP);
        Self {
            tree,
            root,
            raw: vec![0; CELLS],
        }
    }

    pub fn owned_bytes(&self) -> usize {
        self.tree.owned_bytes(self.root)
    }
}

/// The game's memory seen two ways. While `Reserved` the descriptor is the
/// source of truth and the board bytes are all zero; once `Live` the typed
/// game is.
#[derive(Debug)]
pub enum GameMemory {
    Reserved(MemDesc),
    Live { desc: MemDesc, game: Box<Game> },
}

impl GameMemory {
    pub fn reserve() -> Self {
        Self::Reserved(MemDesc::for_game())
    }

    /// Moves from `Reserved` to `Live`. A live record is returned unchanged.
    pub fn init(self, seed: u64) -> Result<Self, ArenaError> {
        match self {
            Self::Reserved(desc) => {
                let game = Box::new(Game::new(seed)?);
                debug!(bytes = desc.owned_bytes(), "game memory live");
                Ok(Self::Live { desc, game })
            }
            live @ Self::Live { .. } => Ok(live),
        }
    }

    pub fn desc(&self) -> &MemDesc {
        match self {
            Self::Reserved(desc) | Self::Live { desc, .. } => desc,
        }
    }

    /// Board bytes, row-major.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Reserved(desc) => desc.raw.as_slice(),
            Self::Live { game, .. } => game.cells().as_slice(),
        }
    }

    pub fn game(&self) -> Option<&Game> {
        match self {
            Self::Live { game, .. } => Some(game.as_ref()),
            Self::Reserved(_) => None,
        }
    }

    pub fn game_mut(&mut self) -> Option<&mut Game> {
        match self {
            Self::Live { game, .. } => Some(game.as_mut()),
            Self::Reserved(_) => None,
        }
    }

    /// Releases every record and returns the labels of the independent
    /// allocations in the order they were freed.
    pub fn release(self) -> Vec<&'static str> {
        let mut desc = match self {
            Self::Reserved(desc) | Self::Live { desc, .. } => desc,
        };
        let order = desc.tree.release(desc.root);
        let labels: Vec<&'static str> = order
            .into_iter()
            .filter_map(|id| desc.tree.get(id).map(|n| n.label))
            .collect();
        debug!(?labels, "game memory released");
        labels
    }
}
