/// Block accounting for one piece currently being downloaded.
///
/// `downloader_count[b]` is the number of outstanding requests for block `b`;
/// `-1` marks a block already received. The piece is complete when every
/// entry is `-1`.
#[derive(Debug)]
pub struct ActivePiece {
    index: u32,
    piece_len: u32,
    block_size: u32,
    downloader_count: Vec<i32>,
    /// Peer slot that delivered each received block, kept for blame when the
    /// assembled piece fails verification.
    contributors: Vec<Option<usize>>,
}

impl ActivePiece {
    pub fn new(index: u32, piece_len: u32, block_size: u32) -> ActivePiece {
        let blocks = ((piece_len + block_size - 1) / block_size) as usize;
        ActivePiece {
            index,
            piece_len,
            block_size,
            downloader_count: vec![0; blocks],
            contributors: vec![None; blocks],
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn num_blocks(&self) -> usize {
        self.downloader_count.len()
    }

    pub fn block_offset(&self, block: usize) -> u32 {
        block as u32 * self.block_size
    }

    /// Byte length of `block`; the final block of a short piece is short.
    pub fn block_len(&self, block: usize) -> u32 {
        (self.piece_len - self.block_offset(block)).min(self.block_size)
    }

    /// Maps a wire offset back to a block index, rejecting misaligned or
    /// out-of-range offsets.
    pub fn block_at(&self, offset: u32) -> Option<usize> {
        if offset % self.block_size != 0 {
            return None;
        }
        let block = (offset / self.block_size) as usize;
        (block < self.num_blocks()).then_some(block)
    }

    /// Picks the next block to request and counts the request.
    ///
    /// Normal mode returns the first block nobody has requested yet. Endgame
    /// duplicates work: it returns the unfinished block with the fewest
    /// outstanding requests, ties broken by lowest index.
    pub fn choose_block(&mut self, endgame: bool) -> Option<usize> {
        if endgame {
            self.choose_block_endgame()
        } else {
            self.choose_block_normal()
        }
    }

    fn choose_block_normal(&mut self) -> Option<usize> {
        let block = self.downloader_count.iter().position(|&c| c == 0)?;
        self.downloader_count[block] += 1;
        Some(block)
    }

    fn choose_block_endgame(&mut self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (block, &count) in self.downloader_count.iter().enumerate() {
            if count >= 0 && best.map_or(true, |b| count < self.downloader_count[b]) {
                best = Some(block);
            }
        }
        if let Some(block) = best {
            self.downloader_count[block] += 1;
        }
        best
    }

    /// Marks `block` received from `slot` and returns how many requests were
    /// outstanding for it (0 means it was never requested, e.g. after a
    /// reset).
    pub fn record_block(&mut self, block: usize, slot: usize) -> i32 {
        let outstanding = self.downloader_count[block];
        self.downloader_count[block] = -1;
        self.contributors[block] = Some(slot);
        outstanding.max(0)
    }

    /// True once `block` has landed; later duplicates (endgame) are dropped
    /// without touching the store, so no two writes ever overlap.
    pub fn block_received(&self, block: usize) -> bool {
        self.downloader_count[block] == -1
    }

    /// Returns one outstanding request, e.g. when the requesting peer drops
    /// before delivering.
    pub fn release(&mut self, block: usize) {
        if self.downloader_count[block] > 0 {
            self.downloader_count[block] -= 1;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.downloader_count.iter().all(|&c| c == -1)
    }

    /// True while some block has no outstanding request at all; once this is
    /// false for every lacked piece the session enters endgame.
    pub fn has_unrequested(&self) -> bool {
        self.downloader_count.iter().any(|&c| c == 0)
    }

    pub fn contributors(&self) -> impl Iterator<Item = usize> + '_ {
        self.contributors.iter().filter_map(|c| *c)
    }

    /// Forgets all progress after a failed verification so every block gets
    /// re-requested.
    pub fn reset(&mut self) {
        for count in &mut self.downloader_count {
            *count = 0;
        }
        for contributor in &mut self.contributors {
            *contributor = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_mode_walks_unrequested_blocks() {
        let mut ap = ActivePiece::new(0, 40, 16);
        assert_eq!(ap.num_blocks(), 3);
        assert_eq!(ap.choose_block(false), Some(0));
        assert_eq!(ap.choose_block(false), Some(1));
        assert_eq!(ap.choose_block(false), Some(2));
        assert_eq!(ap.choose_block(false), None);
        assert!(!ap.has_unrequested());
    }

    #[test]
    fn endgame_prefers_fewest_outstanding_then_lowest_index() {
        let mut ap = ActivePiece::new(0, 48, 16);
        ap.choose_block(false); // block 0 -> 1 outstanding
        ap.choose_block(false); // block 1 -> 1 outstanding
        ap.choose_block(false); // block 2 -> 1 outstanding
        assert_eq!(ap.choose_block(true), Some(0)); // tie on 1, lowest index
        assert_eq!(ap.choose_block(true), Some(1));
        ap.record_block(0, 7);
        ap.record_block(1, 7);
        // only block 2 is unfinished now
        assert_eq!(ap.choose_block(true), Some(2));
    }

    #[test]
    fn record_reports_outstanding_and_completes() {
        let mut ap = ActivePiece::new(3, 20, 16);
        assert_eq!(ap.num_blocks(), 2);
        assert_eq!(ap.block_len(0), 16);
        assert_eq!(ap.block_len(1), 4);
        ap.choose_block(false);
        ap.choose_block(true); // duplicate request on block 0 path
        assert_eq!(ap.record_block(0, 1), 2);
        assert!(!ap.is_complete());
        assert_eq!(ap.record_block(1, 2), 0);
        assert!(ap.is_complete());
        assert_eq!(ap.choose_block(false), None);
        assert_eq!(ap.choose_block(true), None);
        let blamed: Vec<usize> = ap.contributors().collect();
        assert_eq!(blamed, vec![1, 2]);
    }

    #[test]
    fn reset_forgets_requests_and_blame() {
        let mut ap = ActivePiece::new(0, 32, 16);
        ap.choose_block(false);
        ap.record_block(0, 4);
        ap.record_block(1, 4);
        assert!(ap.is_complete());
        ap.reset();
        assert!(!ap.is_complete());
        assert!(ap.has_unrequested());
        assert_eq!(ap.contributors().count(), 0);
    }

    #[test]
    fn block_at_validates_alignment_and_range() {
        let ap = ActivePiece::new(0, 40, 16);
        assert_eq!(ap.block_at(0), Some(0));
        assert_eq!(ap.block_at(16), Some(1));
        assert_eq!(ap.block_at(32), Some(2));
        assert_eq!(ap.block_at(48), None);
        assert_eq!(ap.block_at(5), None);
    }
}
