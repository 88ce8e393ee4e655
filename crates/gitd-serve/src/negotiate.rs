//! The upload (fetch) state machine.
//!
//! ```text
//! ADVERTISE ──▶ RECV_WANTS ──▶ NEGOTIATE ──▶ SEND_PACK ──▶ DONE
//!                    │                │
//!                    ▼                ▼
//!              EMPTY_WANTS       CLIENT_ABORT
//! ```
//!
//! One [`UploadPack`] value serves one RPC over a caller-provided byte pair;
//! it owns its walk and flag set for exactly that long.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use gitd_hash::ObjectId;
use gitd_object::ObjectType;
use gitd_store::{ObjectStore, RefRecord, Repository};
use gitd_utils::cancel::CancelToken;
use gitd_utils::progress::Progress;
use gitd_walk::{flags, RevWalk, WalkError};

use crate::capability::{self, AckMode};
use crate::pktline::{strip_newline, PktLine, PktLineReader, PktLineWriter};
use crate::policy::{PolicyContext, WantPolicy};
use crate::request::{parse_upload_request, FetchRequest};
use crate::sendpack::{discover_reuse_packs, plan_pack, write_pack, PlanOptions};
use crate::sideband::{SidebandMode, SidebandWriter};
use crate::ServeError;

/// Upload-pack configuration.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub policy: WantPolicy,
    /// Bidirectional transports advertise at connection open and loop
    /// negotiation rounds; stateless RPC callers drive those pieces
    /// themselves via [`UploadPack::advertise_refs`].
    pub bidirectional: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            policy: WantPolicy::default(),
            bidirectional: true,
        }
    }
}

/// Server side of one fetch RPC.
pub struct UploadPack<'a, R> {
    store: &'a ObjectStore<R>,
    options: UploadOptions,
    cancel: CancelToken,
}

/// Clone-able writer: lets the side-band progress channel share the RPC
/// output with the pack stream. Single-threaded use keeps frames whole.
struct SharedWrite<W>(Arc<Mutex<W>>);

impl<W> Clone for SharedWrite<W> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<W: Write> Write for SharedWrite<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

impl<'a, R: Repository> UploadPack<'a, R> {
    pub fn new(store: &'a ObjectStore<R>) -> Self {
        Self::with_options(store, UploadOptions::default())
    }

    pub(crate) fn store(&self) -> &'a ObjectStore<R> {
        self.store
    }

    pub(crate) fn options(&self) -> &UploadOptions {
        &self.options
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn with_options(store: &'a ObjectStore<R>, options: UploadOptions) -> Self {
        Self {
            store,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Install a cancellation token polled between negotiation rounds.
    pub fn set_cancel(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    /// Serve one fetch RPC over the given byte pair.
    ///
    /// Peer-attributable failures are reported as a final `ERR` packet
    /// before the error is returned.
    pub fn run<I: Read, O: Write + Send>(
        &self,
        input: I,
        output: O,
    ) -> Result<(), ServeError> {
        let shared = SharedWrite(Arc::new(Mutex::new(output)));
        let mut reader = PktLineReader::new(input);
        let mut writer = PktLineWriter::new(shared.clone());

        match self.serve(&mut reader, &mut writer, &shared) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(msg) = err.wire_message() {
                    let _ = writer.write_error(&msg);
                    let _ = writer.flush();
                }
                Err(err)
            }
        }
    }

    fn serve<I: Read, O: Write + Send>(
        &self,
        reader: &mut PktLineReader<I>,
        writer: &mut PktLineWriter<SharedWrite<O>>,
        shared: &SharedWrite<O>,
    ) -> Result<(), ServeError> {
        let refs = self.store.repository().ref_database()?;

        // ADVERTISE: at connection open on bidirectional transports only.
        if self.options.bidirectional {
            self.advertise_refs(writer, &refs)?;
        }

        // RECV_WANTS
        let request = parse_upload_request(reader)?;
        if request.wants.is_empty() {
            // EMPTY_WANTS: request completes with no pack.
            return Ok(());
        }

        let mut walk = RevWalk::new(self.store);
        let ctx = policy_context(&refs);
        for want in &request.wants {
            self.options.policy.validate(want, &ctx, &mut walk)?;
            walk.set_flag(want, flags::WANT);
        }

        // Shallow exchange comes before haves when any deepen option is
        // present.
        let mut shallow_cut: HashSet<ObjectId> = HashSet::new();
        if request.depth.is_some()
            || request.deepen_since.is_some()
            || !request.deepen_not.is_empty()
        {
            shallow_cut = self.shallow_exchange(writer, &mut walk, &request, &refs)?;
        }

        // NEGOTIATE
        let common = self.negotiate(reader, writer, &mut walk, &request)?;

        // SEND_PACK
        self.send_pack(writer, shared, &request, &common, shallow_cut, &refs)
    }

    /// Write the v0/v1 ref advertisement, capabilities on the first line.
    pub fn advertise_refs<W: Write>(
        &self,
        writer: &mut PktLineWriter<W>,
        refs: &[RefRecord],
    ) -> Result<(), ServeError> {
        let caps = capability::advertised(self.options.policy);

        if refs.is_empty() {
            writer.write_text(&format!("{} capabilities^{{}}\0{caps}", ObjectId::NULL))?;
        } else {
            for (i, record) in refs.iter().enumerate() {
                if i == 0 {
                    writer.write_text(&format!("{} {}\0{caps}", record.target, record.name))?;
                } else {
                    writer.write_text(&format!("{} {}", record.target, record.name))?;
                }
                if let Some(peeled) = record.peeled {
                    writer.write_text(&format!("{peeled} {}^{{}}", record.name))?;
                }
            }
        }
        writer.write_flush()?;
        writer.flush()
    }

    /// Depth negotiation: send `shallow`/`unshallow` lines and a flush,
    /// returning the new shallow cut the pack walk must respect.
    fn shallow_exchange<W: Write>(
        &self,
        writer: &mut PktLineWriter<W>,
        walk: &mut RevWalk<'_, R>,
        request: &FetchRequest,
        refs: &[RefRecord],
    ) -> Result<HashSet<ObjectId>, ServeError> {
        let client_shallow: HashSet<ObjectId> = request.client_shallow.iter().copied().collect();

        // Which commits sit on the new cut.
        let mut boundary: Vec<ObjectId> = Vec::new();
        let mut covered: HashSet<ObjectId> = HashSet::new();

        if let Some(depth) = request.depth {
            for entry in walk.depth_walk(&request.wants, depth)? {
                covered.insert(entry.oid);
                if entry.boundary {
                    boundary.push(entry.oid);
                }
            }
        } else if let Some(since) = request.deepen_since {
            self.cut_by(walk, &request.wants, &mut covered, &mut boundary, |meta| {
                meta.commit_time >= since
            })?;
        } else {
            // deepen-not: exclude everything reachable from the named refs.
            let mut excluded: HashSet<ObjectId> = HashSet::new();
            for name in &request.deepen_not {
                let Some(record) = refs.iter().find(|r| r.name == *name) else {
                    return Err(ServeError::Protocol(format!(
                        "deepen-not ref {name} not found"
                    )));
                };
                let (kind, peeled) = walk.peel(&record.target)?;
                if kind == ObjectType::Commit {
                    collect_ancestors(walk, &peeled, &mut excluded)?;
                }
            }
            self.cut_excluding(walk, &request.wants, &excluded, &mut covered, &mut boundary)?;
        }

        for oid in &boundary {
            if !client_shallow.contains(oid) {
                writer.write_text(&format!("shallow {oid}"))?;
            }
        }
        // Previously shallow commits that are now interior get unshallowed.
        for oid in &client_shallow {
            if covered.contains(oid) && !boundary.contains(oid) {
                writer.write_text(&format!("unshallow {oid}"))?;
            }
        }
        writer.write_flush()?;
        writer.flush()?;

        // The walk assumes the client's new shallow set from here on.
        let mut cut: HashSet<ObjectId> = boundary.into_iter().collect();
        for oid in client_shallow {
            if !covered.contains(&oid) {
                cut.insert(oid);
            }
        }
        Ok(cut)
    }

    /// Walk from the wants, keeping commits while `keep` holds; commits
    /// whose parents fail the predicate become boundary.
    fn cut_by(
        &self,
        walk: &mut RevWalk<'_, R>,
        wants: &[ObjectId],
        covered: &mut HashSet<ObjectId>,
        boundary: &mut Vec<ObjectId>,
        keep: impl Fn(&gitd_walk::CommitMeta) -> bool,
    ) -> Result<(), ServeError> {
        let mut stack: Vec<ObjectId> = Vec::new();
        for want in wants {
            let (kind, peeled) = walk.peel(want)?;
            if kind == ObjectType::Commit {
                stack.push(peeled);
            }
        }

        while let Some(oid) = stack.pop() {
            if !covered.insert(oid) {
                continue;
            }
            let meta = walk.parse_commit(&oid)?;
            let mut cut_here = false;
            for parent in &meta.parents {
                match walk.parse_commit(parent) {
                    Ok(parent_meta) => {
                        if keep(&parent_meta) {
                            stack.push(*parent);
                        } else {
                            cut_here = true;
                        }
                    }
                    Err(WalkError::MissingObject(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if cut_here {
                boundary.push(oid);
            }
        }
        Ok(())
    }

    fn cut_excluding(
        &self,
        walk: &mut RevWalk<'_, R>,
        wants: &[ObjectId],
        excluded: &HashSet<ObjectId>,
        covered: &mut HashSet<ObjectId>,
        boundary: &mut Vec<ObjectId>,
    ) -> Result<(), ServeError> {
        let mut stack: Vec<ObjectId> = Vec::new();
        for want in wants {
            let (kind, peeled) = walk.peel(want)?;
            if kind == ObjectType::Commit && !excluded.contains(&peeled) {
                stack.push(peeled);
            }
        }

        while let Some(oid) = stack.pop() {
            if !covered.insert(oid) {
                continue;
            }
            let meta = walk.parse_commit(&oid)?;
            let mut cut_here = false;
            for parent in &meta.parents {
                if excluded.contains(parent) {
                    cut_here = true;
                } else if walk.parse_commit(parent).is_ok() {
                    stack.push(*parent);
                }
            }
            if cut_here {
                boundary.push(oid);
            }
        }
        Ok(())
    }

    /// The have/ACK/NAK loop. Returns the common base once the client says
    /// `done` (or `no-done` short-circuits).
    fn negotiate<I: Read, W: Write>(
        &self,
        reader: &mut PktLineReader<I>,
        writer: &mut PktLineWriter<W>,
        walk: &mut RevWalk<'_, R>,
        request: &FetchRequest,
    ) -> Result<Vec<ObjectId>, ServeError> {
        let ack = request.caps.ack_mode;
        walk.carry(flags::PEER_HAS);

        // Wants that peel to commits drive the give-up test; other wants
        // are satisfied by direct inclusion.
        let mut commit_wants: Vec<ObjectId> = Vec::new();
        for want in &request.wants {
            if let Ok((ObjectType::Commit, peeled)) = walk.peel(want) {
                commit_wants.push(peeled);
            }
        }

        let mut common: Vec<ObjectId> = Vec::new();
        let mut last_common: Option<ObjectId> = None;
        let mut oldest_have = i64::MAX;
        let mut sent_ready = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ServeError::Cancelled);
            }

            // One round: haves until flush, or done.
            let mut done = false;
            loop {
                match reader.read_pkt()? {
                    PktLine::Flush => break,
                    PktLine::Data(data) => {
                        let line =
                            String::from_utf8_lossy(strip_newline(&data)).into_owned();
                        if line == "done" {
                            done = true;
                            break;
                        }
                        let Some(hex) = line.strip_prefix("have ") else {
                            return Err(ServeError::Protocol(format!(
                                "unexpected line during negotiation: {line:?}"
                            )));
                        };
                        let oid = ObjectId::from_hex(hex).map_err(|_| {
                            ServeError::Protocol(format!("invalid object id in {line:?}"))
                        })?;

                        match self.match_have(walk, &oid)? {
                            Some(commit_time) => {
                                oldest_have = oldest_have.min(commit_time);
                                walk.set_flag(&oid, flags::COMMON);
                                common.push(oid);
                                last_common = Some(oid);
                                match ack {
                                    AckMode::Off => {
                                        if common.len() == 1 {
                                            writer.write_text(&format!("ACK {oid}"))?;
                                        }
                                    }
                                    AckMode::Continue => {
                                        writer.write_text(&format!("ACK {oid} continue"))?;
                                    }
                                    AckMode::Detailed => {
                                        writer.write_text(&format!("ACK {oid} common"))?;
                                    }
                                }
                            }
                            // Objects we do not have are skipped silently.
                            None => {}
                        }
                    }
                    PktLine::Delimiter | PktLine::ResponseEnd => {
                        return Err(ServeError::Protocol(
                            "unexpected v2 framing during negotiation".into(),
                        ));
                    }
                }
            }

            if done {
                match last_common {
                    Some(last) => writer.write_text(&format!("ACK {last}"))?,
                    None => writer.write_text("NAK")?,
                }
                writer.flush()?;
                return Ok(common);
            }

            // End of round: can we already prove every want is covered?
            let satisfied = !common.is_empty()
                && walk.all_reach_flagged(&commit_wants, flags::PEER_HAS, oldest_have)?;
            if satisfied {
                for want in &commit_wants {
                    walk.set_flag(want, flags::SATISFIED);
                }
                if ack == AckMode::Detailed && !sent_ready {
                    if let Some(last) = last_common {
                        writer.write_text(&format!("ACK {last} ready"))?;
                        // Assigned once; a later round finding it set again
                        // is a no-op.
                        sent_ready = true;
                    }
                }
                if request.caps.no_done && sent_ready {
                    // The ready ack ended negotiation; the client is already
                    // waiting for pack data.
                    writer.flush()?;
                    return Ok(common);
                }
            }

            if common.is_empty() || ack != AckMode::Off {
                writer.write_text("NAK")?;
            }
            writer.flush()?;

            if !self.options.bidirectional {
                // Stateless RPC: one round per request; the transport
                // replays state on the next call.
                return Ok(common);
            }
        }
    }

    /// Does the server have this `have`? Returns the commit time for
    /// commit-ish objects, marking `PEER_HAS` across ancestors.
    pub(crate) fn match_have(
        &self,
        walk: &mut RevWalk<'_, R>,
        oid: &ObjectId,
    ) -> Result<Option<i64>, ServeError> {
        use gitd_walk::Parsed;

        match walk.parse_any(oid) {
            Ok(Parsed::Commit(meta)) => {
                if !walk.has_flag(oid, flags::PEER_HAS) {
                    walk.mark_with_ancestors(oid, flags::PEER_HAS)?;
                }
                Ok(Some(meta.commit_time))
            }
            Ok(Parsed::Tag { .. }) => {
                let (kind, peeled) = walk.peel(oid)?;
                if kind == ObjectType::Commit {
                    self.match_have(walk, &peeled)
                } else {
                    Ok(None)
                }
            }
            // Non-commit haves carry no negotiation signal.
            Ok(_) => Ok(None),
            Err(WalkError::MissingObject(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// SEND_PACK: plan the object set and stream the pack, side-band
    /// wrapped when negotiated.
    fn send_pack<O: Write + Send>(
        &self,
        writer: &mut PktLineWriter<SharedWrite<O>>,
        shared: &SharedWrite<O>,
        request: &FetchRequest,
        common: &[ObjectId],
        shallow_cut: HashSet<ObjectId>,
        refs: &[RefRecord],
    ) -> Result<(), ServeError> {
        if self.cancel.is_cancelled() {
            return Err(ServeError::Cancelled);
        }

        let mode = SidebandMode::select(&request.caps);
        let plan = plan_pack(
            self.store,
            &request.wants,
            common,
            refs,
            &PlanOptions {
                filter: request.filter,
                include_tag: request.caps.include_tag,
                shallow_cut,
            },
        )?;
        let reuse = discover_reuse_packs(self.store);

        // Progress rides channel 2, through its own clone of the output.
        let mut progress = if mode != SidebandMode::None && !request.caps.no_progress {
            let channel = shared.clone();
            let mut p = Progress::with_callback(
                "Writing objects",
                Some(plan.len() as u64),
                Box::new(move |line| {
                    let mut writer = PktLineWriter::new(channel.clone());
                    let mut mux = SidebandWriter::new(&mut writer, mode);
                    let _ = mux.write_progress(line);
                }),
            );
            p.enable_throughput();
            Some(p)
        } else {
            None
        };

        let outcome = {
            let mut mux = SidebandWriter::new(writer, mode);
            let result = write_pack(self.store, &plan, &reuse, &mut mux, |done| {
                if let Some(p) = progress.as_mut() {
                    p.update(done as u64);
                }
            });
            match result {
                Ok(outcome) => {
                    if let Some(p) = progress.take() {
                        p.finish();
                    }
                    mux.finish()?;
                    outcome
                }
                Err(err) => {
                    // A fatal mid-pack failure goes out on channel 3.
                    let _ = mux.write_fatal(&err.to_string());
                    let _ = mux.finish();
                    return Err(err);
                }
            }
        };

        debug_assert_eq!(outcome.num_objects as usize, plan.len());
        Ok(())
    }
}

/// Build the policy view of the advertised refs.
fn policy_context(refs: &[RefRecord]) -> PolicyContext {
    let mut advertised: HashSet<ObjectId> = HashSet::new();
    let mut tips: HashSet<ObjectId> = HashSet::new();
    for record in refs {
        advertised.insert(record.target);
        tips.insert(record.target);
        if let Some(peeled) = record.peeled {
            advertised.insert(peeled);
        }
    }
    PolicyContext { advertised, tips }
}

/// Every ancestor of `start`, `start` included.
fn collect_ancestors<R: Repository>(
    walk: &mut RevWalk<'_, R>,
    start: &ObjectId,
    out: &mut HashSet<ObjectId>,
) -> Result<(), ServeError> {
    let mut stack = vec![*start];
    while let Some(oid) = stack.pop() {
        if !out.insert(oid) {
            continue;
        }
        match walk.parse_commit(&oid) {
            Ok(meta) => stack.extend(meta.parents),
            Err(WalkError::MissingObject(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
