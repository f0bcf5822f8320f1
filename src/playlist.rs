//! Playlist ordering: which item is current and which comes next.
//!
//! Sequential mode cycles `0..n`. Random mode walks a shuffled permutation and
//! replaces it only once it is exhausted; the replacement can be generated ahead
//! of time with [`PlaylistManager::schedule_precompute`] so that wrapping around
//! does not shuffle on the transition path.

use super::model::{DisplayItem, PlayOrder};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use log::{debug, warn};

/// Snapshot of the playlist. `cursor` indexes `permutation` in random mode and the
/// item list directly in sequential mode.
#[derive(Clone, Debug, Default)]
pub struct PlaylistState {
    pub items: Vec<DisplayItem>,
    pub order: PlayOrder,
    pub permutation: Vec<usize>,
    pub cursor: usize,
    pub precomputed_next_permutation: Option<Vec<usize>>,
}

#[derive(Debug)]
pub struct PlaylistManager {
    state: PlaylistState,
    rng: StdRng,
}

impl PlaylistManager {
    /// Builds a playlist over `items`. An empty list yields a playlist with no current
    /// item rather than an error.
    pub fn initialize(items: Vec<DisplayItem>, order: PlayOrder, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut manager = Self {
            state: PlaylistState { items, order, ..Default::default() },
            rng,
        };
        if order == PlayOrder::Random && !manager.is_empty() {
            manager.state.permutation = manager.shuffled(None);
        }
        debug!("Playlist initialized: {} item(s), order {:?}", manager.len(), order);
        manager
    }

    pub fn empty() -> Self {
        Self::initialize(Vec::new(), PlayOrder::Sequential, Some(0))
    }

    pub fn state(&self) -> &PlaylistState {
        &self.state
    }

    pub fn items(&self) -> &[DisplayItem] {
        &self.state.items
    }

    pub fn item(&self, index: usize) -> Option<&DisplayItem> {
        self.state.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.state.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.items.is_empty()
    }

    pub fn order(&self) -> PlayOrder {
        self.state.order
    }

    /// Index of the current item.
    pub fn current(&self) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        match self.state.order {
            PlayOrder::Sequential => Some(self.state.cursor),
            PlayOrder::Random => self.state.permutation.get(self.state.cursor).copied(),
        }
    }

    pub fn position_of(&self, item_id: &str) -> Option<usize> {
        self.state.items.iter().position(|item| item.id == item_id)
    }

    /// Makes `index` the current item without otherwise disturbing the cycle.
    pub fn start_at(&mut self, index: usize) {
        if index >= self.len() {
            return;
        }
        match self.state.order {
            PlayOrder::Sequential => self.state.cursor = index,
            PlayOrder::Random => {
                if let Some(pos) = self.state.permutation.iter().position(|&i| i == index) {
                    let cursor = self.state.cursor;
                    self.state.permutation.swap(pos, cursor);
                }
            }
        }
    }

    /// Index that follows the current one, without committing the advance.
    ///
    /// When the lookahead has to wrap a random permutation, the next permutation is
    /// precomputed here so the later [`advance`](Self::advance) can consume it.
    pub fn peek_next(&mut self) -> Option<usize> {
        let n = self.len();
        if n == 0 {
            return None;
        }
        match self.state.order {
            PlayOrder::Sequential => Some((self.state.cursor + 1) % n),
            PlayOrder::Random => {
                let next = self.state.cursor + 1;
                if next < self.state.permutation.len() {
                    return Some(self.state.permutation[next]);
                }
                self.schedule_precompute();
                self.state.precomputed_next_permutation.as_ref().and_then(|p| p.first().copied())
            }
        }
    }

    /// Commits the advance and returns the new current index.
    pub fn advance(&mut self) -> Option<usize> {
        let n = self.len();
        if n == 0 {
            return None;
        }
        match self.state.order {
            PlayOrder::Sequential => {
                self.state.cursor = (self.state.cursor + 1) % n;
            }
            PlayOrder::Random => {
                let next = self.state.cursor + 1;
                if next < self.state.permutation.len() {
                    self.state.cursor = next;
                } else {
                    let fresh = match self.state.precomputed_next_permutation.take() {
                        Some(p) => p,
                        None => {
                            warn!("Next cycle was not precomputed; shuffling at the transition");
                            let last = self.state.permutation.last().copied();
                            self.shuffled(last)
                        }
                    };
                    self.state.permutation = fresh;
                    self.state.cursor = 0;
                    debug!("Random cycle wrapped: {:?}", self.state.permutation);
                }
            }
        }
        self.current()
    }

    /// Generates the next cycle's permutation ahead of time. Calling it again before the
    /// permutation is consumed keeps the first result.
    pub fn schedule_precompute(&mut self) {
        if self.state.order != PlayOrder::Random || self.is_empty() {
            return;
        }
        if self.state.precomputed_next_permutation.is_some() {
            return;
        }
        let last = self.state.permutation.last().copied();
        let next = self.shuffled(last);
        debug!("Precomputed next random cycle: {:?}", next);
        self.state.precomputed_next_permutation = Some(next);
    }

    /// A fresh permutation of all indices. With more than one item, it never starts with
    /// `avoid_first` so a cycle boundary does not show the same item twice in a row.
    fn shuffled(&mut self, avoid_first: Option<usize>) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..self.len()).collect();
        perm.shuffle(&mut self.rng);
        if perm.len() > 1 && perm.first().copied() == avoid_first {
            perm.swap(0, 1);
        }
        perm
    }
}
