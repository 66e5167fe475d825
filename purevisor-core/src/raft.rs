//! Raft consensus: leader election and log replication for cluster state.
//!
//! Classic Raft over a bounded in-memory log. The node is driven from the
//! outside: `tick` with a millisecond clock for timeouts/heartbeats and
//! `receive` for every incoming message. Outbound messages go through the
//! [`RaftTransport`] capability; committed entries are handed to
//! [`RaftApply`] in strict index order on every node, leader and follower
//! alike, so all replicas converge.
//!
//! Wire format (little-endian): header `{type: u32, from_node: u32,
//! term: u64, length: u32}` followed by the per-type body; AppendEntries
//! carries `{index: u64, term: u64, kind: u32, data_len: u32, data}` per
//! entry. Send failures are silent at the protocol level; a peer that
//! missed traffic is caught up by `next_index` backtracking.

use alloc::vec::Vec;

use crate::{log, log_warn};

pub const ELECTION_MIN_MS: u64 = 300;
pub const ELECTION_MAX_MS: u64 = 500;
pub const HEARTBEAT_MS: u64 = 150;

/// Bounded in-memory log capacity.
pub const LOG_CAPACITY: usize = 1024;

/// Most entries carried by one AppendEntries message.
const MAX_ENTRIES_PER_MSG: usize = 32;

/// Log entry kinds.
pub const LOG_NOOP: u32 = 0;
pub const LOG_WRITE: u32 = 1;

const MSG_VOTE_REQ: u32 = 1;
const MSG_VOTE_RESP: u32 = 2;
const MSG_APPEND_REQ: u32 = 3;
const MSG_APPEND_RESP: u32 = 4;
#[allow(dead_code)]
const MSG_SNAPSHOT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftError {
    NotLeader,
    LogFull,
    PeerTableFull,
    BadMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: u32,
    pub data: Vec<u8>,
}

/// Decoded protocol messages (header fields carried separately).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftMessage {
    VoteRequest {
        last_log_index: u64,
        last_log_term: u64,
    },
    VoteResponse {
        granted: bool,
    },
    AppendRequest {
        prev_log_index: u64,
        prev_log_term: u64,
        leader_commit: u64,
        entries: Vec<LogEntry>,
    },
    AppendResponse {
        success: bool,
        match_index: u64,
    },
}

/// Outbound message delivery. Failures are invisible to the protocol.
pub trait RaftTransport {
    fn send(&mut self, to: u32, bytes: &[u8]);
}

/// Committed-entry sink, invoked in strict index order.
pub trait RaftApply {
    fn apply(&mut self, entry: &LogEntry);
}

/// Discards everything; useful for elections-only tests.
pub struct NullApply;

impl RaftApply for NullApply {
    fn apply(&mut self, _entry: &LogEntry) {}
}

#[derive(Debug, Clone, Copy)]
pub struct Peer {
    pub id: u32,
    pub active: bool,
    pub next_index: u64,
    pub match_index: u64,
}

/// Deterministic xorshift64 for election jitter; the caller seeds it (the
/// boot path uses the TSC).
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

// ---------------------------------------------------------------------
// Wire codec
// ---------------------------------------------------------------------

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u32(&mut self) -> Result<u32, RaftError> {
        let b = self
            .buf
            .get(self.pos..self.pos + 4)
            .ok_or(RaftError::BadMessage)?;
        self.pos += 4;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, RaftError> {
        let b = self
            .buf
            .get(self.pos..self.pos + 8)
            .ok_or(RaftError::BadMessage)?;
        self.pos += 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], RaftError> {
        let b = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or(RaftError::BadMessage)?;
        self.pos += len;
        Ok(b)
    }
}

/// Encode a message with its header.
pub fn encode_message(from: u32, term: u64, msg: &RaftMessage) -> Vec<u8> {
    let mut body = Vec::new();
    let msg_type = match msg {
        RaftMessage::VoteRequest {
            last_log_index,
            last_log_term,
        } => {
            put_u64(&mut body, *last_log_index);
            put_u64(&mut body, *last_log_term);
            MSG_VOTE_REQ
        }
        RaftMessage::VoteResponse { granted } => {
            put_u32(&mut body, *granted as u32);
            MSG_VOTE_RESP
        }
        RaftMessage::AppendRequest {
            prev_log_index,
            prev_log_term,
            leader_commit,
            entries,
        } => {
            put_u64(&mut body, *prev_log_index);
            put_u64(&mut body, *prev_log_term);
            put_u64(&mut body, *leader_commit);
            put_u32(&mut body, entries.len() as u32);
            for e in entries {
                put_u64(&mut body, e.index);
                put_u64(&mut body, e.term);
                put_u32(&mut body, e.kind);
                put_u32(&mut body, e.data.len() as u32);
                body.extend_from_slice(&e.data);
            }
            MSG_APPEND_REQ
        }
        RaftMessage::AppendResponse {
            success,
            match_index,
        } => {
            put_u32(&mut body, *success as u32);
            put_u64(&mut body, *match_index);
            MSG_APPEND_RESP
        }
    };
    let mut out = Vec::with_capacity(20 + body.len());
    put_u32(&mut out, msg_type);
    put_u32(&mut out, from);
    put_u64(&mut out, term);
    put_u32(&mut out, body.len() as u32);
    out.extend_from_slice(&body);
    out
}

/// Decode a framed message; returns `(from_node, term, message)`.
pub fn decode_message(bytes: &[u8]) -> Result<(u32, u64, RaftMessage), RaftError> {
    let mut r = Reader { buf: bytes, pos: 0 };
    let msg_type = r.u32()?;
    let from = r.u32()?;
    let term = r.u64()?;
    let length = r.u32()? as usize;
    if bytes.len() < 20 + length {
        return Err(RaftError::BadMessage);
    }
    let msg = match msg_type {
        MSG_VOTE_REQ => RaftMessage::VoteRequest {
            last_log_index: r.u64()?,
            last_log_term: r.u64()?,
        },
        MSG_VOTE_RESP => RaftMessage::VoteResponse {
            granted: r.u32()? != 0,
        },
        MSG_APPEND_REQ => {
            let prev_log_index = r.u64()?;
            let prev_log_term = r.u64()?;
            let leader_commit = r.u64()?;
            let count = r.u32()? as usize;
            let mut entries = Vec::with_capacity(count.min(MAX_ENTRIES_PER_MSG));
            for _ in 0..count {
                let index = r.u64()?;
                let term = r.u64()?;
                let kind = r.u32()?;
                let data_len = r.u32()? as usize;
                let data = r.bytes(data_len)?.to_vec();
                entries.push(LogEntry {
                    index,
                    term,
                    kind,
                    data,
                });
            }
            RaftMessage::AppendRequest {
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            }
        }
        MSG_APPEND_RESP => RaftMessage::AppendResponse {
            success: r.u32()? != 0,
            match_index: r.u64()?,
        },
        _ => return Err(RaftError::BadMessage),
    };
    Ok((from, term, msg))
}

// ---------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------

/// One Raft participant.
pub struct RaftNode {
    pub id: u32,
    role: RaftRole,
    current_term: u64,
    voted_for: Option<u32>,
    /// Entries with indices `1..=last_index()`; no compaction.
    entries: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    peers: Vec<Peer>,
    leader_id: Option<u32>,
    votes_received: u32,
    election_timeout: u64,
    last_heartbeat_ms: u64,
    last_heartbeat_sent_ms: u64,
    rng: XorShift,
}

impl RaftNode {
    pub fn new(id: u32, seed: u64) -> Self {
        let mut rng = XorShift(seed | 1);
        let election_timeout = ELECTION_MIN_MS + rng.next() % (ELECTION_MAX_MS - ELECTION_MIN_MS);
        log!("raft[{}]: initialized", id);
        RaftNode {
            id,
            role: RaftRole::Follower,
            current_term: 0,
            voted_for: None,
            entries: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            peers: Vec::new(),
            leader_id: None,
            votes_received: 0,
            election_timeout,
            last_heartbeat_ms: 0,
            last_heartbeat_sent_ms: 0,
            rng,
        }
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn leader_id(&self) -> Option<u32> {
        self.leader_id
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    fn last_log_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Voting members including this node.
    fn cluster_size(&self) -> u32 {
        1 + self.peers.iter().filter(|p| p.active).count() as u32
    }

    fn majority(&self) -> u32 {
        self.cluster_size() / 2 + 1
    }

    pub fn add_peer(&mut self, id: u32) -> Result<(), RaftError> {
        if id == self.id || self.peers.iter().any(|p| p.id == id) {
            return Err(RaftError::BadMessage);
        }
        self.peers.push(Peer {
            id,
            active: true,
            next_index: self.last_index() + 1,
            match_index: 0,
        });
        log!("raft[{}]: added peer {}", self.id, id);
        Ok(())
    }

    pub fn remove_peer(&mut self, id: u32) {
        if let Some(p) = self.peers.iter_mut().find(|p| p.id == id) {
            p.active = false;
        }
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    fn append_entry(&mut self, term: u64, kind: u32, data: &[u8]) -> Result<u64, RaftError> {
        if self.entries.len() >= LOG_CAPACITY {
            return Err(RaftError::LogFull);
        }
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            index,
            term,
            kind,
            data: data.to_vec(),
        });
        Ok(index)
    }

    /// Submit a client command. Only the leader accepts; commitment
    /// happens via replication.
    pub fn submit(&mut self, kind: u32, data: &[u8]) -> Result<u64, RaftError> {
        if self.role != RaftRole::Leader {
            return Err(RaftError::NotLeader);
        }
        self.append_entry(self.current_term, kind, data)
    }

    fn become_follower(&mut self, term: u64) {
        self.role = RaftRole::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.votes_received = 0;
        log!("raft[{}]: became follower (term {})", self.id, term);
    }

    fn become_candidate(&mut self, now_ms: u64, tx: &mut dyn RaftTransport) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.votes_received = 1;
        self.election_timeout =
            ELECTION_MIN_MS + self.rng.next() % (ELECTION_MAX_MS - ELECTION_MIN_MS);
        self.last_heartbeat_ms = now_ms;
        log!(
            "raft[{}]: became candidate (term {})",
            self.id,
            self.current_term
        );

        let req = RaftMessage::VoteRequest {
            last_log_index: self.last_index(),
            last_log_term: self.last_log_term(),
        };
        let bytes = encode_message(self.id, self.current_term, &req);
        for peer in self.peers.iter().filter(|p| p.active) {
            tx.send(peer.id, &bytes);
        }

        // A single-node cluster elects itself immediately.
        if self.votes_received >= self.majority() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);
        let last = self.last_index();
        for peer in self.peers.iter_mut() {
            peer.next_index = last + 1;
            peer.match_index = 0;
        }
        // No-op entry commits everything from earlier terms (Figure 8).
        let term = self.current_term;
        let _ = self.append_entry(term, LOG_NOOP, &[]);
        log!(
            "raft[{}]: became leader (term {})",
            self.id,
            self.current_term
        );
    }

    /// Advance timers: apply committed entries, send heartbeats when
    /// leading, start elections when the leader has gone quiet.
    pub fn tick(&mut self, now_ms: u64, tx: &mut dyn RaftTransport, apply: &mut dyn RaftApply) {
        self.apply_committed(apply);

        if self.role == RaftRole::Leader {
            if now_ms.saturating_sub(self.last_heartbeat_sent_ms) >= HEARTBEAT_MS {
                self.last_heartbeat_sent_ms = now_ms;
                self.replicate_to_peers(tx);
            }
        } else if now_ms.saturating_sub(self.last_heartbeat_ms) >= self.election_timeout {
            self.become_candidate(now_ms, tx);
        }
    }

    fn apply_committed(&mut self, apply: &mut dyn RaftApply) {
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            if let Some(entry) = self.entry(self.last_applied) {
                apply.apply(entry);
            }
        }
    }

    /// Send AppendEntries (possibly empty) to every active peer, shaped by
    /// that peer's `next_index`.
    fn replicate_to_peers(&mut self, tx: &mut dyn RaftTransport) {
        let last = self.last_index();
        let peer_ids: Vec<(u32, u64)> = self
            .peers
            .iter()
            .filter(|p| p.active)
            .map(|p| (p.id, p.next_index))
            .collect();
        for (peer_id, next_index) in peer_ids {
            let prev_log_index = next_index.saturating_sub(1);
            let prev_log_term = self.entry(prev_log_index).map(|e| e.term).unwrap_or(0);
            let mut entries = Vec::new();
            let mut idx = next_index;
            while idx <= last && entries.len() < MAX_ENTRIES_PER_MSG {
                if let Some(e) = self.entry(idx) {
                    entries.push(e.clone());
                }
                idx += 1;
            }
            let msg = RaftMessage::AppendRequest {
                prev_log_index,
                prev_log_term,
                leader_commit: self.commit_index,
                entries,
            };
            let bytes = encode_message(self.id, self.current_term, &msg);
            tx.send(peer_id, &bytes);
        }
    }

    /// Feed one incoming wire message into the state machine.
    pub fn receive(
        &mut self,
        bytes: &[u8],
        now_ms: u64,
        tx: &mut dyn RaftTransport,
        apply: &mut dyn RaftApply,
    ) -> Result<(), RaftError> {
        let (from, term, msg) = decode_message(bytes)?;
        match msg {
            RaftMessage::VoteRequest {
                last_log_index,
                last_log_term,
            } => self.on_vote_request(from, term, last_log_index, last_log_term, now_ms, tx),
            RaftMessage::VoteResponse { granted } => self.on_vote_response(from, term, granted),
            RaftMessage::AppendRequest {
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            } => self.on_append_request(
                from,
                term,
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
                now_ms,
                tx,
                apply,
            ),
            RaftMessage::AppendResponse {
                success,
                match_index,
            } => self.on_append_response(from, term, success, match_index),
        }
        Ok(())
    }

    fn on_vote_request(
        &mut self,
        from: u32,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
        now_ms: u64,
        tx: &mut dyn RaftTransport,
    ) {
        if term > self.current_term {
            self.become_follower(term);
        }

        let mut granted = false;
        if term >= self.current_term
            && (self.voted_for.is_none() || self.voted_for == Some(from))
        {
            let ours = self.last_log_term();
            let up_to_date = last_log_term > ours
                || (last_log_term == ours && last_log_index >= self.last_index());
            if up_to_date {
                granted = true;
                self.voted_for = Some(from);
                self.last_heartbeat_ms = now_ms;
            }
        }

        let resp = RaftMessage::VoteResponse { granted };
        tx.send(from, &encode_message(self.id, self.current_term, &resp));
    }

    fn on_vote_response(&mut self, _from: u32, term: u64, granted: bool) {
        if term > self.current_term {
            self.become_follower(term);
            return;
        }
        if self.role != RaftRole::Candidate || term != self.current_term {
            return;
        }
        if granted {
            self.votes_received += 1;
            if self.votes_received >= self.majority() {
                self.become_leader();
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_append_request(
        &mut self,
        from: u32,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        leader_commit: u64,
        new_entries: Vec<LogEntry>,
        now_ms: u64,
        tx: &mut dyn RaftTransport,
        apply: &mut dyn RaftApply,
    ) {
        if term > self.current_term {
            self.become_follower(term);
        }

        let mut success = false;
        let mut match_index = 0;

        if term >= self.current_term {
            self.leader_id = Some(from);
            self.last_heartbeat_ms = now_ms;
            if self.role == RaftRole::Candidate {
                self.become_follower(term);
            }

            // Log consistency: our entry at prev_log_index must carry
            // prev_log_term.
            let consistent = if prev_log_index == 0 {
                true
            } else {
                self.entry(prev_log_index)
                    .map(|e| e.term == prev_log_term)
                    .unwrap_or(false)
            };

            if consistent {
                for e in &new_entries {
                    let existing_term = self.entry(e.index).map(|x| x.term);
                    match existing_term {
                        Some(term) if term == e.term => {}
                        Some(_) => {
                            // Conflicting suffix: truncate, then append.
                            self.entries.truncate(e.index as usize - 1);
                            self.entries.push(e.clone());
                        }
                        None => {
                            if self.entries.len() < LOG_CAPACITY {
                                self.entries.push(e.clone());
                            }
                        }
                    }
                }
                success = true;
                match_index = prev_log_index + new_entries.len() as u64;

                if leader_commit > self.commit_index {
                    self.commit_index = leader_commit.min(self.last_index());
                    self.apply_committed(apply);
                }
            }
        }

        let resp = RaftMessage::AppendResponse {
            success,
            match_index,
        };
        tx.send(from, &encode_message(self.id, self.current_term, &resp));
    }

    fn on_append_response(&mut self, from: u32, term: u64, success: bool, match_index: u64) {
        if term > self.current_term {
            self.become_follower(term);
            return;
        }
        if self.role != RaftRole::Leader {
            return;
        }
        let Some(peer) = self.peers.iter_mut().find(|p| p.id == from) else {
            log_warn!("raft[{}]: append response from unknown node {}", self.id, from);
            return;
        };
        if success {
            peer.match_index = match_index;
            peer.next_index = match_index + 1;
            self.advance_commit_index();
        } else if peer.next_index > 1 {
            peer.next_index -= 1;
        }
    }

    /// Figure 8 rule: only entries of the current term commit by counting;
    /// earlier terms commit transitively.
    fn advance_commit_index(&mut self) {
        let majority = self.majority();
        for n in (self.commit_index + 1)..=self.last_index() {
            let replicas =
                1 + self.peers.iter().filter(|p| p.match_index >= n).count() as u32;
            let term_ok = self.entry(n).map(|e| e.term == self.current_term).unwrap_or(false);
            if replicas >= majority && term_ok {
                self.commit_index = n;
            }
        }
    }
}
