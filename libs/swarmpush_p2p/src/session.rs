use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bitset::Bitset;
use crate::error::{Error, Result};
use crate::hasher;
use crate::peer::{self, PeerLink};
use crate::piece::ActivePiece;
use crate::store::{DiskStore, FileStore};
use crate::task::{DispatchTask, MetaInfo, Role, StartTask, StatusReport};
use crate::wire::{Handshake, Message, PeerCodec};

pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;
pub const DEFAULT_PIPELINE_DEPTH: usize = 16;
pub const DEFAULT_MAX_ACTIVE_PER_PEER: usize = 4;

/// Verification failures a peer may contribute to before it is dropped and
/// barred for the rest of the task.
const STRIKE_LIMIT: u32 = 3;

/// Unchoke slots kept by rate ranking, plus one optimistic slot.
const UNCHOKE_SLOTS: usize = 3;
const ROTATE_EVERY_TICKS: u64 = 10;
const KEEPALIVE_EVERY_TICKS: u64 = 30;
const IDLE_PEER_CUTOFF: Duration = Duration::from_secs(120);

const DIAL_ATTEMPTS: u32 = 3;
const DIAL_COOLDOWN: Duration = Duration::from_secs(2);
const STOP_DEADLINE: Duration = Duration::from_secs(5);
const REPORT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Node-wide knobs shared by every session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's peer id on the wire; the orchestrator hands it out in
    /// address books.
    pub peer_id: String,
    /// Where agent sessions materialize dispatched files.
    pub downloads_dir: Option<PathBuf>,
    pub block_size: u32,
    /// Outstanding request ceiling per peer.
    pub pipeline_depth: usize,
    /// Distinct in-progress pieces a single peer may be asked for.
    pub max_active_per_peer: usize,
    /// Fleet-shared management credentials, used for status report posts.
    pub username: String,
    pub password: String,
}

impl EngineConfig {
    pub fn new(peer_id: impl Into<String>) -> EngineConfig {
        EngineConfig {
            peer_id: peer_id.into(),
            downloads_dir: None,
            block_size: DEFAULT_BLOCK_SIZE,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            max_active_per_peer: DEFAULT_MAX_ACTIVE_PER_PEER,
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Where a session's status reports go.
pub enum ReportSink {
    /// POST to the server's management endpoint (the normal agent path).
    Http {
        endpoint: String,
        username: String,
        password: String,
    },
    /// Hand reports to an in-process consumer (the server's own seeder
    /// session and tests).
    Channel(mpsc::Sender<StatusReport>),
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Verified,
    Peering,
    Exchanging,
    Done,
    Cancelled,
    Failed,
}

impl SessionState {
    fn terminal(self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Cancelled | SessionState::Failed
        )
    }
}

/// Snapshot answered to a Query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProgress {
    pub state: SessionState,
    pub percent: f32,
    pub have_pieces: usize,
    pub num_pieces: usize,
    pub peers: usize,
    /// Blocks this session served to other peers.
    pub served_blocks: u64,
}

pub(crate) enum SessionEvent {
    Start(StartTask),
    Stop(oneshot::Sender<()>),
    /// A handshaken connection, either accepted by the shared listener or
    /// dialed by this session.
    Connected { stream: TcpStream, peer_id: String },
    FromPeer { slot: usize, msg: Message },
    PeerClosed { slot: usize, reason: Option<String> },
    Verified { piece: u32, outcome: VerifyOutcome },
    Query(oneshot::Sender<SessionProgress>),
}

pub(crate) enum VerifyOutcome {
    Match,
    Mismatch,
    Error(String),
}

#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub task_id: String,
    tx: mpsc::Sender<SessionEvent>,
}

impl SessionHandle {
    pub async fn start(&self, st: StartTask) -> Result<()> {
        self.send(SessionEvent::Start(st)).await
    }

    /// Stops the session and waits for the planner to drain, bounded by the
    /// stop deadline; a hung planner is abandoned rather than waited on.
    pub async fn stop(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(SessionEvent::Stop(ack_tx)).await?;
        let _ = timeout(STOP_DEADLINE, ack_rx).await;
        Ok(())
    }

    pub async fn connected(&self, stream: TcpStream, peer_id: String) -> Result<()> {
        self.send(SessionEvent::Connected { stream, peer_id }).await
    }

    pub async fn query(&self) -> Result<SessionProgress> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionEvent::Query(tx)).await?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    async fn send(&self, ev: SessionEvent) -> Result<()> {
        self.tx.send(ev).await.map_err(|_| Error::Shutdown)
    }
}

/// Spawns the planner task for one dispatched task and returns its handle.
///
/// Server-role sessions open the source files read-only and re-check every
/// piece to seed their bitfield; agent sessions pre-allocate the output files
/// under the downloads root and start empty.
pub(crate) fn spawn(
    dispatch: DispatchTask,
    cfg: Arc<EngineConfig>,
    sink: Option<ReportSink>,
) -> Result<SessionHandle> {
    dispatch.meta_info.validate()?;

    let sink = sink.unwrap_or_else(|| match dispatch.self_role {
        Role::Agent => ReportSink::Http {
            endpoint: format!("http://{}/api/v1/server/tasks/status", dispatch.server),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        },
        Role::Server => ReportSink::Disabled,
    });

    let store: Arc<dyn FileStore> = match dispatch.self_role {
        Role::Server => Arc::new(DiskStore::open(&dispatch.meta_info.files)?),
        Role::Agent => {
            let root = cfg.downloads_dir.as_ref().ok_or_else(|| {
                Error::InvalidMetaInfo("agent has no downloads_dir configured".into())
            })?;
            Arc::new(DiskStore::allocate(root, &dispatch.meta_info.files)?)
        }
    };

    let (tx, rx) = mpsc::channel(256);
    let meta = Arc::new(dispatch.meta_info);
    let num_pieces = meta.num_pieces() as usize;
    let reporter = Reporter::new(sink, dispatch.task_id.clone(), cfg.peer_id.clone());
    let planner = Planner {
        task_id: dispatch.task_id.clone(),
        role: dispatch.self_role,
        roster: dispatch.peers,
        meta,
        cfg,
        store,
        have: Bitset::new(num_pieces),
        availability: vec![0; num_pieces],
        active: HashMap::new(),
        links: HashMap::new(),
        next_slot: 0,
        banned: Vec::new(),
        addresses: HashMap::new(),
        state: SessionState::Created,
        endgame: false,
        served_blocks: 0,
        ticks: 0,
        reporter,
        events_tx: tx.clone(),
    };
    let task_id = dispatch.task_id;
    tokio::spawn(planner.run(rx));
    Ok(SessionHandle { task_id, tx })
}

struct Planner {
    task_id: String,
    role: Role,
    roster: Vec<String>,
    meta: Arc<MetaInfo>,
    cfg: Arc<EngineConfig>,
    store: Arc<dyn FileStore>,
    have: Bitset,
    /// How many connected peers claim each piece; drives rarest-first.
    availability: Vec<u32>,
    active: HashMap<u32, ActivePiece>,
    /// Slot arena. Slots are never reused, so a late event from a closed
    /// connection cannot be misattributed.
    links: HashMap<usize, PeerLink>,
    next_slot: usize,
    banned: Vec<String>,
    addresses: HashMap<String, String>,
    state: SessionState,
    endgame: bool,
    served_blocks: u64,
    ticks: u64,
    reporter: Reporter,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl Planner {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionEvent>) {
        self.initial_check().await;

        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                ev = rx.recv() => {
                    let Some(ev) = ev else { break };
                    if let ControlFlow::Break(()) = self.handle_event(ev).await {
                        break;
                    }
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }
        debug!(task = %self.task_id, "session planner stopped");
    }

    /// Created → Verified: seed the bitfield. The server re-checks its source
    /// files and must come out clean; an agent starts from zero.
    async fn initial_check(&mut self) {
        match self.role {
            Role::Server => {
                let store = self.store.clone();
                let meta = self.meta.clone();
                let checked =
                    tokio::task::spawn_blocking(move || hasher::check_pieces(&*store, &meta)).await;
                match checked {
                    Ok(Ok((good, 0, have))) => {
                        info!(task = %self.task_id, pieces = good, "source verified, seeding");
                        self.have = have;
                        self.state = SessionState::Verified;
                        self.reporter.publish(100.0, true, false, None).await;
                    }
                    Ok(Ok((_, bad, _))) => {
                        self.fail(format!("{} source pieces failed re-check", bad))
                            .await;
                    }
                    Ok(Err(err)) => self.fail(err.to_string()).await,
                    Err(err) => self.fail(err.to_string()).await,
                }
            }
            Role::Agent => self.state = SessionState::Verified,
        }
    }

    async fn handle_event(&mut self, ev: SessionEvent) -> ControlFlow<()> {
        match ev {
            SessionEvent::Start(st) => self.on_start(st),
            SessionEvent::Stop(ack) => {
                self.close_all_peers();
                if !self.state.terminal() {
                    self.state = SessionState::Cancelled;
                }
                info!(task = %self.task_id, "session stopped");
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
            SessionEvent::Connected { stream, peer_id } => self.register_peer(stream, peer_id),
            SessionEvent::FromPeer { slot, msg } => self.on_message(slot, msg).await,
            SessionEvent::PeerClosed { slot, reason } => {
                if self.links.contains_key(&slot) {
                    debug!(task = %self.task_id, slot, ?reason, "peer connection closed");
                    self.drop_peer(slot);
                }
            }
            SessionEvent::Verified { piece, outcome } => self.on_verified(piece, outcome).await,
            SessionEvent::Query(tx) => {
                let _ = tx.send(self.progress());
                return ControlFlow::Continue(());
            }
        }
        self.replan().await;
        ControlFlow::Continue(())
    }

    fn progress(&self) -> SessionProgress {
        SessionProgress {
            state: self.state,
            percent: self.percent(),
            have_pieces: self.have.count_set(),
            num_pieces: self.meta.num_pieces() as usize,
            peers: self.links.len(),
            served_blocks: self.served_blocks,
        }
    }

    fn percent(&self) -> f32 {
        self.have.count_set() as f32 * 100.0 / self.meta.num_pieces() as f32
    }

    /// Verified → Peering: dial every peer in the address book whose id sorts
    /// greater than ours; the rest will dial us. The deterministic tie break
    /// prevents double connections.
    fn on_start(&mut self, st: StartTask) {
        if !matches!(self.state, SessionState::Created | SessionState::Verified) {
            return;
        }
        self.addresses = st.addresses;
        self.state = SessionState::Peering;
        for (peer_id, addr) in &self.addresses {
            if *peer_id <= self.cfg.peer_id {
                continue;
            }
            let ours = Handshake::new(&self.task_id, &self.cfg.peer_id);
            let events = self.events_tx.clone();
            let peer_id = peer_id.clone();
            let addr = addr.clone();
            let task_id = self.task_id.clone();
            tokio::spawn(async move {
                for attempt in 1..=DIAL_ATTEMPTS {
                    match peer::dial(&addr, &ours).await {
                        Ok((stream, theirs)) => {
                            if theirs.peer_id != peer_id {
                                warn!(task = %task_id, %addr, claimed = %theirs.peer_id,
                                      "peer answered with an id not in the address book");
                                return;
                            }
                            let _ = events
                                .send(SessionEvent::Connected {
                                    stream,
                                    peer_id: theirs.peer_id,
                                })
                                .await;
                            return;
                        }
                        Err(err) => {
                            debug!(task = %task_id, %addr, attempt, %err, "dial failed");
                            tokio::time::sleep(DIAL_COOLDOWN).await;
                        }
                    }
                }
                warn!(task = %task_id, %addr, "giving up dialing, waiting for an inbound connection");
            });
        }
    }

    fn known_peer(&self, peer_id: &str) -> bool {
        self.addresses.contains_key(peer_id) || self.roster.iter().any(|p| p == peer_id)
    }

    fn register_peer(&mut self, stream: TcpStream, peer_id: String) {
        if self.state.terminal() && self.state != SessionState::Done {
            return;
        }
        if peer_id == self.cfg.peer_id || !self.known_peer(&peer_id) {
            warn!(task = %self.task_id, peer = %peer_id, "rejecting peer outside the task roster");
            return;
        }
        if self.banned.contains(&peer_id) {
            warn!(task = %self.task_id, peer = %peer_id, "rejecting barred peer");
            return;
        }
        if self.links.values().any(|l| l.id == peer_id) {
            debug!(task = %self.task_id, peer = %peer_id, "duplicate connection dropped");
            return;
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        let codec = PeerCodec::new(PeerCodec::max_payload_for(
            self.cfg.block_size,
            self.meta.num_pieces(),
        ));
        let out = peer::spawn_io(stream, slot, codec, self.events_tx.clone());
        let mut link = PeerLink::new(peer_id, out, self.meta.num_pieces() as usize);

        // The first frame is always our bitfield. Seeders service everyone,
        // so the server unchokes on sight; agents hand out unchokes from the
        // rotation.
        let _ = link.out.try_send(Message::Bitfield {
            bits: Bytes::copy_from_slice(self.have.as_bytes()),
        });
        if self.role == Role::Server {
            link.am_choking = false;
            let _ = link.out.try_send(Message::Unchoke);
        }
        info!(task = %self.task_id, peer = %link.id, slot, "peer registered");
        self.links.insert(slot, link);
    }

    async fn on_message(&mut self, slot: usize, msg: Message) {
        if !self.links.contains_key(&slot) {
            return;
        }
        self.links
            .get_mut(&slot)
            .expect("slot checked above")
            .last_activity = Instant::now();
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                let link = self.links.get_mut(&slot).expect("slot checked above");
                link.peer_choking = true;
                let dropped: Vec<(u32, u32)> = link.in_flight.drain().collect();
                for (piece, begin) in dropped {
                    self.release_block(piece, begin);
                }
            }
            Message::Unchoke => {
                self.links
                    .get_mut(&slot)
                    .expect("slot checked above")
                    .peer_choking = false;
            }
            Message::Interested => {
                let open_slot = self.unchoked_count() < UNCHOKE_SLOTS;
                let serve_now = self.role == Role::Server || open_slot;
                let link = self.links.get_mut(&slot).expect("slot checked above");
                link.peer_interested = true;
                // serve eagerly while slots are free; the rotation settles
                // the rest
                if link.am_choking && serve_now {
                    link.am_choking = false;
                    let _ = link.out.try_send(Message::Unchoke);
                }
            }
            Message::NotInterested => {
                self.links
                    .get_mut(&slot)
                    .expect("slot checked above")
                    .peer_interested = false;
            }
            Message::Have { piece } => {
                if piece >= self.meta.num_pieces() {
                    self.protocol_violation(slot, "HAVE for an out-of-range piece");
                    return;
                }
                let link = self.links.get_mut(&slot).expect("slot checked above");
                if !link.have.test(piece as usize) {
                    link.have.set(piece as usize);
                    self.availability[piece as usize] += 1;
                }
            }
            Message::Bitfield { bits } => {
                if self.links[&slot].sent_bitfield_seen {
                    self.protocol_violation(slot, "BITFIELD repeated mid-stream");
                    return;
                }
                let bitset = match Bitset::from_bytes(&bits, self.meta.num_pieces() as usize) {
                    Ok(b) => b,
                    Err(err) => {
                        self.protocol_violation(slot, &err.to_string());
                        return;
                    }
                };
                let link = self.links.get_mut(&slot).expect("slot checked above");
                link.sent_bitfield_seen = true;
                link.have = bitset;
                let mut useful = false;
                for i in 0..self.meta.num_pieces() as usize {
                    if link.have.test(i) {
                        self.availability[i] += 1;
                        if !self.have.test(i) {
                            useful = true;
                        }
                    }
                }
                if self.state == SessionState::Peering && (useful || self.have.all_set()) {
                    self.state = SessionState::Exchanging;
                }
            }
            Message::Request {
                piece,
                begin,
                length,
            } => self.serve_block(slot, piece, begin, length).await,
            Message::Piece { piece, begin, data } => self.on_block(slot, piece, begin, data).await,
            Message::Cancel { piece, begin, .. } => {
                // blocks are served the moment the request is read, so there
                // is nothing left to withdraw
                debug!(task = %self.task_id, slot, piece, begin, "late CANCEL ignored");
            }
        }
    }

    fn unchoked_count(&self) -> usize {
        self.links.values().filter(|l| !l.am_choking).count()
    }

    /// A REQUEST is answered inline: validate the block coordinates, read
    /// them from the store and queue the PIECE frame.
    async fn serve_block(&mut self, slot: usize, piece: u32, begin: u32, length: u32) {
        let aligned = piece < self.meta.num_pieces()
            && begin % self.cfg.block_size == 0
            && begin < self.meta.piece_len(piece);
        if !aligned {
            self.protocol_violation(slot, "REQUEST outside the piece layout");
            return;
        }
        // requests must ask for whole blocks exactly as the layout cuts them
        let expected = (self.meta.piece_len(piece) - begin).min(self.cfg.block_size);
        if length != expected {
            self.protocol_violation(slot, "REQUEST length does not match the block layout");
            return;
        }
        if !self.have.test(piece as usize) {
            self.protocol_violation(slot, "REQUEST for a piece this node never claimed");
            return;
        }
        let out = match self.links.get(&slot) {
            Some(link) if !link.am_choking => link.out.clone(),
            Some(_) => {
                debug!(task = %self.task_id, slot, "request from a choked peer ignored");
                return;
            }
            None => return,
        };
        let offset = piece as u64 * self.meta.piece_length + begin as u64;
        let mut data = vec![0u8; length as usize];
        if let Err(err) = self.store.read_at(&mut data, offset) {
            // a seeder that cannot read its own store cannot finish the task
            let msg = err.to_string();
            self.fail(msg).await;
            return;
        }
        self.served_blocks += 1;
        let _ = out
            .send(Message::Piece {
                piece,
                begin,
                data: data.into(),
            })
            .await;
    }

    /// The block write path: store the bytes, account for them, verify the
    /// piece once its last block lands.
    async fn on_block(&mut self, slot: usize, piece: u32, begin: u32, data: Bytes) {
        {
            let link = self.links.get_mut(&slot).expect("caller checked the slot");
            if !link.in_flight.remove(&(piece, begin)) {
                // never asked this peer for it, or a cancelled endgame duplicate
                debug!(task = %self.task_id, slot, piece, begin, "unsolicited block dropped");
                return;
            }
            link.bytes_window += data.len() as u64;
        }

        let (block, expected_len, already_received) = {
            let Some(ap) = self.active.get(&piece) else {
                return; // piece already verified or reset away
            };
            match ap.block_at(begin) {
                Some(block) => (block, ap.block_len(block), ap.block_received(block)),
                None => {
                    self.protocol_violation(slot, "PIECE with a misaligned offset");
                    return;
                }
            }
        };
        if data.len() as u32 != expected_len {
            self.protocol_violation(slot, "PIECE with a mismatched block length");
            return;
        }
        if already_received {
            return; // endgame duplicate; the first writer won
        }

        let offset = piece as u64 * self.meta.piece_length + begin as u64;
        if let Err(err) = self.store.write_at(&data, offset) {
            let msg = err.to_string();
            self.fail(msg).await;
            return;
        }
        let ap = self.active.get_mut(&piece).expect("still active");
        ap.record_block(block, slot);
        let complete = ap.is_complete();

        if self.endgame {
            let dupes: Vec<usize> = self
                .links
                .iter()
                .filter(|&(&s, l)| s != slot && l.in_flight.contains(&(piece, begin)))
                .map(|(s, _)| *s)
                .collect();
            for other in dupes {
                let link = self.links.get_mut(&other).expect("just listed");
                link.in_flight.remove(&(piece, begin));
                let _ = link.out.try_send(Message::Cancel {
                    piece,
                    begin,
                    length: expected_len,
                });
            }
        }

        if complete {
            let store = self.store.clone();
            let meta = self.meta.clone();
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                let outcome = match tokio::task::spawn_blocking(move || {
                    hasher::verify_piece(&*store, &meta, piece)
                })
                .await
                {
                    Ok(Ok(())) => VerifyOutcome::Match,
                    Ok(Err(Error::HashMismatch { .. })) => VerifyOutcome::Mismatch,
                    Ok(Err(err)) => VerifyOutcome::Error(err.to_string()),
                    Err(err) => VerifyOutcome::Error(err.to_string()),
                };
                let _ = tx.send(SessionEvent::Verified { piece, outcome }).await;
            });
        }
    }

    async fn on_verified(&mut self, piece: u32, outcome: VerifyOutcome) {
        let Some(mut ap) = self.active.remove(&piece) else {
            return;
        };
        match outcome {
            VerifyOutcome::Match => {
                // the bit flips before any HAVE goes out, so a remote peer
                // can never request a piece we merely promised
                self.have.set(piece as usize);
                let have: Vec<(usize, Message)> = self
                    .links
                    .keys()
                    .map(|&slot| (slot, Message::Have { piece }))
                    .collect();
                self.send_all(have).await;
                debug!(task = %self.task_id, piece, "piece verified");
                if self.have.all_set() {
                    self.state = SessionState::Done;
                    info!(task = %self.task_id, "download complete, staying to seed");
                    self.reporter.publish(100.0, true, false, None).await;
                } else {
                    self.reporter
                        .publish(self.percent(), false, false, None)
                        .await;
                }
            }
            VerifyOutcome::Mismatch => {
                warn!(task = %self.task_id, piece, "piece failed verification, re-planning");
                let blamed: Vec<usize> = ap.contributors().collect();
                for slot in blamed {
                    let Some(link) = self.links.get_mut(&slot) else {
                        continue;
                    };
                    link.strikes += 1;
                    if link.strikes >= STRIKE_LIMIT {
                        let id = link.id.clone();
                        warn!(task = %self.task_id, peer = %id, "served too many corrupt pieces, disconnecting");
                        self.banned.push(id);
                        self.drop_peer(slot);
                    }
                }
                ap.reset();
                self.active.insert(piece, ap);
            }
            VerifyOutcome::Error(err) => self.fail(err).await,
        }
    }

    fn protocol_violation(&mut self, slot: usize, what: &str) {
        if let Some(link) = self.links.get(&slot) {
            warn!(task = %self.task_id, peer = %link.id, slot, what, "protocol violation, closing peer");
            self.banned.push(link.id.clone());
        }
        self.drop_peer(slot);
    }

    /// Unregisters a peer: availability and outstanding requests roll back so
    /// the planner can hand the work to someone else.
    fn drop_peer(&mut self, slot: usize) {
        let Some(link) = self.links.remove(&slot) else {
            return;
        };
        for i in 0..self.meta.num_pieces() as usize {
            if link.have.test(i) {
                self.availability[i] = self.availability[i].saturating_sub(1);
            }
        }
        for (piece, begin) in link.in_flight {
            self.release_block(piece, begin);
        }
        // dropping `link.out` ends the writer task, which closes the socket
    }

    fn release_block(&mut self, piece: u32, begin: u32) {
        if let Some(ap) = self.active.get_mut(&piece) {
            if let Some(block) = ap.block_at(begin) {
                ap.release(block);
            }
        }
    }

    fn close_all_peers(&mut self) {
        let slots: Vec<usize> = self.links.keys().copied().collect();
        for slot in slots {
            self.drop_peer(slot);
        }
    }

    async fn fail(&mut self, error: String) {
        if self.state.terminal() {
            return;
        }
        warn!(task = %self.task_id, %error, "session failed");
        self.close_all_peers();
        self.state = SessionState::Failed;
        self.reporter
            .publish(self.percent(), false, true, Some(error))
            .await;
    }

    async fn on_tick(&mut self) {
        if self.state.terminal() && self.state != SessionState::Done {
            return;
        }
        self.ticks += 1;
        let mut out: Vec<(usize, Message)> = Vec::new();

        if self.ticks % KEEPALIVE_EVERY_TICKS == 0 {
            out.extend(self.links.keys().map(|&slot| (slot, Message::KeepAlive)));
        }
        let stale: Vec<usize> = self
            .links
            .iter()
            .filter(|(_, l)| l.last_activity.elapsed() > IDLE_PEER_CUTOFF)
            .map(|(&s, _)| s)
            .collect();
        for slot in stale {
            debug!(task = %self.task_id, slot, "dropping idle peer");
            self.drop_peer(slot);
        }
        if self.role == Role::Agent && self.ticks % ROTATE_EVERY_TICKS == 0 {
            out.extend(self.rotate_unchoke());
        }
        self.send_all(out).await;

        self.reporter
            .publish(
                self.percent(),
                self.state == SessionState::Done,
                false,
                None,
            )
            .await;
        self.replan().await;
    }

    /// Fixed-set unchoke policy: the highest receive rates of the last window
    /// keep their slots, one randomly chosen straggler gets the optimistic
    /// slot, everyone else is choked.
    fn rotate_unchoke(&mut self) -> Vec<(usize, Message)> {
        let mut ranked: Vec<(u64, usize)> = self
            .links
            .iter()
            .filter(|(_, l)| l.peer_interested)
            .map(|(&s, l)| (l.bytes_window, s))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut keep: Vec<usize> = ranked.iter().take(UNCHOKE_SLOTS).map(|&(_, s)| s).collect();
        let rest: Vec<usize> = ranked.iter().skip(UNCHOKE_SLOTS).map(|&(_, s)| s).collect();
        if let Some(&lucky) = rest.choose(&mut rand::thread_rng()) {
            keep.push(lucky);
        }

        let mut out = Vec::new();
        let slots: Vec<usize> = self.links.keys().copied().collect();
        for slot in slots {
            let link = self.links.get_mut(&slot).expect("just listed");
            let wanted = keep.contains(&slot);
            if wanted && link.am_choking {
                link.am_choking = false;
                out.push((slot, Message::Unchoke));
            } else if !wanted && !link.am_choking && link.peer_interested {
                link.am_choking = true;
                out.push((slot, Message::Choke));
            }
            link.bytes_window = 0;
        }
        out
    }

    /// Re-plans interest and the request pipeline after any state change.
    async fn replan(&mut self) {
        if self.state.terminal() && self.state != SessionState::Done {
            return;
        }
        let out = self.plan();
        self.send_all(out).await;
    }

    async fn send_all(&mut self, out: Vec<(usize, Message)>) {
        for (slot, msg) in out {
            if let Some(link) = self.links.get(&slot) {
                // a full queue back-pressures the planner right here
                if link.out.send(msg).await.is_err() {
                    // writer gone; the reader's close event cleans up
                }
            }
        }
    }

    fn plan(&mut self) -> Vec<(usize, Message)> {
        let mut out = Vec::new();
        let num = self.meta.num_pieces() as usize;
        let mut slots: Vec<usize> = self.links.keys().copied().collect();
        slots.sort_unstable();

        // interest follows from whether the peer holds anything we lack
        for &slot in &slots {
            let useful = {
                let link = &self.links[&slot];
                (0..num).any(|i| !self.have.test(i) && link.have.test(i))
            };
            let link = self.links.get_mut(&slot).expect("just listed");
            if useful != link.am_interested {
                link.am_interested = useful;
                out.push((
                    slot,
                    if useful {
                        Message::Interested
                    } else {
                        Message::NotInterested
                    },
                ));
            }
        }

        if self.have.all_set()
            || !matches!(
                self.state,
                SessionState::Peering | SessionState::Exchanging
            )
        {
            return out;
        }

        self.endgame = self.endgame_reached();
        let endgame = self.endgame;

        let mut active_indices: Vec<u32> = self.active.keys().copied().collect();
        active_indices.sort_unstable();

        for &slot in &slots {
            loop {
                let (eligible, budget, piece_count) = {
                    let link = &self.links[&slot];
                    (
                        link.am_interested && !link.peer_choking,
                        self.cfg.pipeline_depth.saturating_sub(link.in_flight.len()),
                        link.active_piece_count(),
                    )
                };
                if !eligible || budget == 0 {
                    break;
                }

                let mut choice: Option<(u32, usize)> = None;
                for &p in &active_indices {
                    let (has, joins_new) = {
                        let link = &self.links[&slot];
                        (
                            link.have.test(p as usize),
                            !link.in_flight.iter().any(|&(ip, _)| ip == p),
                        )
                    };
                    if !has || (joins_new && piece_count >= self.cfg.max_active_per_peer) {
                        continue;
                    }
                    let Some(ap) = self.active.get_mut(&p) else {
                        continue;
                    };
                    if let Some(b) = ap.choose_block(endgame) {
                        let begin = ap.block_offset(b);
                        if self.links[&slot].in_flight.contains(&(p, begin)) {
                            ap.release(b);
                            continue; // endgame picked a block this peer already carries
                        }
                        choice = Some((p, b));
                        break;
                    }
                }

                if choice.is_none() && piece_count < self.cfg.max_active_per_peer {
                    if let Some(p) = self.pick_rarest_for(slot) {
                        let mut ap =
                            ActivePiece::new(p, self.meta.piece_len(p), self.cfg.block_size);
                        let b = ap.choose_block(false).expect("fresh piece has free blocks");
                        self.active.insert(p, ap);
                        active_indices.push(p);
                        active_indices.sort_unstable();
                        choice = Some((p, b));
                    }
                }

                let Some((p, b)) = choice else { break };
                let (begin, length) = {
                    let ap = &self.active[&p];
                    (ap.block_offset(b), ap.block_len(b))
                };
                let link = self.links.get_mut(&slot).expect("just listed");
                link.in_flight.insert((p, begin));
                out.push((
                    slot,
                    Message::Request {
                        piece: p,
                        begin,
                        length,
                    },
                ));
            }
        }
        out
    }

    /// Endgame begins exactly when every piece we still lack has at least
    /// one request in flight, i.e. no unrequested block remains session-wide.
    fn endgame_reached(&self) -> bool {
        let lacked = self.meta.num_pieces() as usize - self.have.count_set();
        if lacked == 0 {
            return false;
        }
        self.active.len() == lacked && self.active.values().all(|ap| !ap.has_unrequested())
    }

    /// Rarest-first over the pieces this peer can supply; ties break to the
    /// lowest index.
    fn pick_rarest_for(&self, slot: usize) -> Option<u32> {
        let link = &self.links[&slot];
        let mut best: Option<(u32, u32)> = None;
        for i in 0..self.meta.num_pieces() as usize {
            if self.have.test(i) || self.active.contains_key(&(i as u32)) || !link.have.test(i) {
                continue;
            }
            let avail = self.availability[i];
            if best.map_or(true, |(b, _)| avail < b) {
                best = Some((avail, i as u32));
            }
        }
        best.map(|(_, p)| p)
    }
}

struct Reporter {
    sink: ReportSink,
    task_id: String,
    peer_id: String,
    client: Option<reqwest::Client>,
    last_sent: Option<Instant>,
    last_percent: f32,
    terminal_sent: bool,
}

impl Reporter {
    fn new(sink: ReportSink, task_id: String, peer_id: String) -> Reporter {
        let client = match &sink {
            ReportSink::Http { .. } => reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .ok(),
            _ => None,
        };
        Reporter {
            sink,
            task_id,
            peer_id,
            client,
            last_sent: None,
            last_percent: 0.0,
            terminal_sent: false,
        }
    }

    /// Posts a report, rate limited to one per second unless the percentage
    /// moved a whole point or the session reached a terminal state. Exactly
    /// one terminal report is ever sent.
    async fn publish(&mut self, percent: f32, finished: bool, failed: bool, error: Option<String>) {
        if self.terminal_sent {
            return;
        }
        let terminal = finished || failed;
        if !terminal {
            let moved = (percent - self.last_percent).abs() >= 1.0;
            let due = self
                .last_sent
                .map_or(percent > 0.0, |t| t.elapsed() >= REPORT_MIN_INTERVAL);
            // quiet until the first byte lands, then a once-a-second
            // heartbeat that doubles as the orchestrator's liveness signal
            if !moved && !due {
                return;
            }
        }
        let report = StatusReport {
            task_id: self.task_id.clone(),
            peer_id: self.peer_id.clone(),
            percent_complete: percent,
            finished,
            failed,
            error,
        };
        match &self.sink {
            ReportSink::Disabled => {}
            ReportSink::Channel(tx) => {
                let _ = tx.send(report).await;
            }
            ReportSink::Http {
                endpoint,
                username,
                password,
            } => {
                if let Some(client) = &self.client {
                    let sent = client
                        .post(endpoint)
                        .basic_auth(username, Some(password))
                        .json(&report)
                        .send()
                        .await;
                    if let Err(err) = sent {
                        warn!(task = %self.task_id, %err, "status report not delivered");
                    }
                }
            }
        }
        self.last_sent = Some(Instant::now());
        self.last_percent = percent;
        self.terminal_sent = terminal;
    }
}
