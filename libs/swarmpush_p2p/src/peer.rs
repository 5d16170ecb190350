use std::collections::HashSet;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::bitset::Bitset;
use crate::error::{Error, Result};
use crate::session::SessionEvent;
use crate::wire::{Handshake, Message, PeerCodec};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Depth of the per-peer outgoing frame queue. A full queue back-pressures
/// the planner's send phase.
pub(crate) const OUT_QUEUE: usize = 64;

/// Everything the session planner tracks about one connected peer.
///
/// The planner owns these records in a slot arena; the connection's reader
/// and writer tasks know only their slot number and the planner's event
/// channel, so there is no reference cycle to manage.
pub(crate) struct PeerLink {
    pub id: String,
    pub out: mpsc::Sender<Message>,
    pub have: Bitset,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    /// Outstanding requests we sent, as `(piece, begin)` pairs.
    pub in_flight: HashSet<(u32, u32)>,
    /// Verification failures this peer contributed to.
    pub strikes: u32,
    /// Bytes of block payload received since the last choke rotation.
    pub bytes_window: u64,
    pub last_activity: Instant,
    pub sent_bitfield_seen: bool,
}

impl PeerLink {
    pub fn new(id: String, out: mpsc::Sender<Message>, num_pieces: usize) -> PeerLink {
        PeerLink {
            id,
            out,
            have: Bitset::new(num_pieces),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            in_flight: HashSet::new(),
            strikes: 0,
            bytes_window: 0,
            last_activity: Instant::now(),
            sent_bitfield_seen: false,
        }
    }

    /// Number of distinct pieces this peer currently has requests against.
    pub fn active_piece_count(&self) -> usize {
        let mut pieces: Vec<u32> = self.in_flight.iter().map(|&(p, _)| p).collect();
        pieces.sort_unstable();
        pieces.dedup();
        pieces.len()
    }
}

/// Dials a peer and exchanges handshakes, ours first. Returns the stream and
/// the peer's answer for roster validation by the session.
pub(crate) async fn dial(addr: &str, ours: &Handshake) -> Result<(TcpStream, Handshake)> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::protocol(format!("connect to {} timed out", addr)))??;
    ours.write_to(&mut stream).await?;
    let theirs = timeout(HANDSHAKE_TIMEOUT, Handshake::read_from(&mut stream))
        .await
        .map_err(|_| Error::protocol(format!("handshake with {} timed out", addr)))??;
    if theirs.task_id != ours.task_id {
        return Err(Error::protocol(format!(
            "{} answered the handshake for a different task",
            addr
        )));
    }
    Ok((stream, theirs))
}

/// Splits a handshaken stream into its reader and writer halves.
///
/// The reader forwards every decoded frame to the planner and reports the
/// close reason; the writer drains the bounded outgoing queue, batching
/// whatever is immediately available into one flush. Both halves end when
/// the planner drops its side of the channels.
pub(crate) fn spawn_io(
    stream: TcpStream,
    slot: usize,
    codec: PeerCodec,
    events: mpsc::Sender<SessionEvent>,
) -> mpsc::Sender<Message> {
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUT_QUEUE);
    let (mut sink, mut frames) = Framed::new(stream, codec).split();

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.feed(msg).await.is_err() {
                break;
            }
            while let Ok(more) = out_rx.try_recv() {
                if sink.feed(more).await.is_err() {
                    return;
                }
            }
            if sink.flush().await.is_err() {
                break;
            }
        }
        // the planner dropping its sender lands here; shut the socket so the
        // remote side sees the connection go away promptly
        let _ = sink.close().await;
        trace!(slot, "peer writer done");
    });

    tokio::spawn(async move {
        loop {
            match frames.next().await {
                Some(Ok(msg)) => {
                    if events
                        .send(SessionEvent::FromPeer { slot, msg })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Some(Err(err)) => {
                    debug!(slot, %err, "peer connection failed");
                    let _ = events
                        .send(SessionEvent::PeerClosed {
                            slot,
                            reason: Some(err.to_string()),
                        })
                        .await;
                    return;
                }
                None => {
                    let _ = events
                        .send(SessionEvent::PeerClosed { slot, reason: None })
                        .await;
                    return;
                }
            }
        }
    });

    out_tx
}
