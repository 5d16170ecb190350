use std::thread;

use crossbeam::channel;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::bitset::Bitset;
use crate::error::{Error, Result};
use crate::store::FileStore;
use crate::task::MetaInfo;

/// Size of one SHA-1 digest in the pieces table.
pub const PIECE_HASH_LEN: usize = 20;

fn num_pieces(total_length: u64, piece_length: u64) -> u64 {
    (total_length + piece_length - 1) / piece_length
}

/// Computes the full SHA-1 table of a store.
///
/// A producer reads pieces in order and fans `(index, data)` jobs out to one
/// hashing worker per core; digests are written back by index, so completion
/// order does not matter. Any read error aborts the computation instead of
/// hashing short data.
pub fn compute_all_sums(
    fs: &dyn FileStore,
    total_length: u64,
    piece_length: u64,
) -> Result<Vec<u8>> {
    let pieces = num_pieces(total_length, piece_length);
    let workers = thread::available_parallelism().map_or(4, |n| n.get());
    let mut sums = vec![0u8; pieces as usize * PIECE_HASH_LEN];

    thread::scope(|scope| {
        let (job_tx, job_rx) = channel::bounded::<(u64, Vec<u8>)>(workers * 2);
        let (sum_tx, sum_rx) = channel::unbounded::<(u64, [u8; PIECE_HASH_LEN])>();

        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let sum_tx = sum_tx.clone();
            scope.spawn(move || {
                for (index, data) in job_rx {
                    let mut hasher = Sha1::new();
                    hasher.update(&data);
                    let _ = sum_tx.send((index, hasher.finalize().into()));
                }
            });
        }
        drop(job_rx);
        drop(sum_tx);

        let producer = scope.spawn(move || -> Result<()> {
            for index in 0..pieces {
                let offset = index * piece_length;
                let len = (total_length - offset).min(piece_length) as usize;
                let mut data = vec![0u8; len];
                fs.read_at(&mut data, offset)?;
                if job_tx.send((index, data)).is_err() {
                    break;
                }
            }
            Ok(())
        });

        for (index, digest) in sum_rx {
            let base = index as usize * PIECE_HASH_LEN;
            sums[base..base + PIECE_HASH_LEN].copy_from_slice(&digest);
        }

        producer.join().expect("hash producer panicked")
    })?;

    Ok(sums)
}

/// Hashes a single piece, e.g. right after its last block is written.
pub fn compute_one_sum(
    fs: &dyn FileStore,
    total_length: u64,
    piece_length: u64,
    index: u32,
) -> Result<[u8; PIECE_HASH_LEN]> {
    let offset = index as u64 * piece_length;
    let len = (total_length - offset).min(piece_length) as usize;
    let mut data = vec![0u8; len];
    fs.read_at(&mut data, offset)?;
    let mut hasher = Sha1::new();
    hasher.update(&data);
    Ok(hasher.finalize().into())
}

/// Verifies piece `index` against its expected digest; a digest that differs
/// comes back as [`Error::HashMismatch`].
pub fn verify_piece(fs: &dyn FileStore, meta: &MetaInfo, index: u32) -> Result<()> {
    let sum = compute_one_sum(fs, meta.total_length, meta.piece_length, index)?;
    if sum != meta.piece_hash(index) {
        return Err(Error::HashMismatch { index });
    }
    Ok(())
}

/// Re-checks a whole store against the metainfo and returns
/// `(good, bad, have_bits)`; used to seed a session's bitfield at start-up.
pub fn check_pieces(fs: &dyn FileStore, meta: &MetaInfo) -> Result<(usize, usize, Bitset)> {
    let pieces = meta.num_pieces() as usize;
    if meta.pieces.len() != pieces * PIECE_HASH_LEN {
        return Err(Error::InvalidMetaInfo(format!(
            "pieces table is {} bytes, expected {}",
            meta.pieces.len(),
            pieces * PIECE_HASH_LEN
        )));
    }
    let sums = compute_all_sums(fs, meta.total_length, meta.piece_length)?;
    let mut have = Bitset::new(pieces);
    let (mut good, mut bad) = (0, 0);
    for i in 0..pieces {
        let base = i * PIECE_HASH_LEN;
        if sums[base..base + PIECE_HASH_LEN] == meta.pieces[base..base + PIECE_HASH_LEN] {
            good += 1;
            have.set(i);
        } else {
            bad += 1;
        }
    }
    debug!(good, bad, "piece re-check finished");
    Ok((good, bad, have))
}
