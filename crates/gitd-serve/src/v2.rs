//! Protocol v2 session loop.
//!
//! v2 replaces the up-front ref advertisement with a capability listing and
//! a command loop: the client issues `ls-refs` and `fetch` commands, each
//! framed as `command=<name>`, capability lines, a delimiter, arguments, and
//! a flush. The negotiation core is the v0/v1 one; only the framing and the
//! response sectioning differ.

use std::collections::HashSet;
use std::io::{Read, Write};

use gitd_hash::ObjectId;
use gitd_object::ObjectType;
use gitd_store::{RefRecord, Repository};
use gitd_walk::{flags, RevWalk};

use crate::capability::AGENT;
use crate::negotiate::UploadPack;
use crate::pktline::{strip_newline, PktLine, PktLineReader, PktLineWriter};
use crate::policy::PolicyContext;
use crate::request::parse_fetch_args;
use crate::sendpack::{discover_reuse_packs, plan_pack, write_pack, PlanOptions};
use crate::sideband::{SidebandMode, SidebandWriter};
use crate::ServeError;

/// One parsed v2 command frame.
struct CommandFrame {
    name: String,
    /// Argument lines (after the delimiter, up to the flush).
    args: Vec<Vec<u8>>,
}

impl<R: Repository> UploadPack<'_, R> {
    /// Serve a protocol v2 session: capability advertisement, then the
    /// command loop until the client flushes it closed.
    pub fn run_v2<I: Read, O: Write + Send>(
        &self,
        input: I,
        output: O,
    ) -> Result<(), ServeError> {
        let mut reader = PktLineReader::new(input);
        let mut writer = PktLineWriter::new(output);

        match self.serve_v2(&mut reader, &mut writer) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(msg) = err.wire_message() {
                    // v2 spells fatal errors as `error <text>`.
                    let _ = writer.write_text(&format!("error {msg}"));
                    let _ = writer.flush();
                }
                Err(err)
            }
        }
    }

    fn serve_v2<I: Read, O: Write>(
        &self,
        reader: &mut PktLineReader<I>,
        writer: &mut PktLineWriter<O>,
    ) -> Result<(), ServeError> {
        self.advertise_v2(writer)?;

        loop {
            let frame = match self.read_command(reader)? {
                Some(frame) => frame,
                // A flush instead of a command ends the session.
                None => return Ok(()),
            };

            match frame.name.as_str() {
                "ls-refs" => self.ls_refs(writer, &frame.args)?,
                "fetch" => self.fetch_v2(writer, &frame.args)?,
                other => {
                    return Err(ServeError::Protocol(format!(
                        "unknown command {other:?}"
                    )));
                }
            }
        }
    }

    /// The v2 capability listing.
    fn advertise_v2<O: Write>(&self, writer: &mut PktLineWriter<O>) -> Result<(), ServeError> {
        writer.write_text("version 2")?;
        writer.write_text(&format!("agent={AGENT}"))?;
        writer.write_text("ls-refs")?;
        writer.write_text("fetch=shallow filter")?;
        writer.write_flush()?;
        writer.flush()
    }

    /// Read `command=<name>`, skip capability lines to the delimiter, then
    /// collect argument lines to the flush. `None` on a bare flush.
    fn read_command<I: Read>(
        &self,
        reader: &mut PktLineReader<I>,
    ) -> Result<Option<CommandFrame>, ServeError> {
        let name = match reader.read_pkt() {
            Ok(PktLine::Data(data)) => {
                let line = String::from_utf8_lossy(strip_newline(&data)).into_owned();
                match line.strip_prefix("command=") {
                    Some(name) => name.to_string(),
                    None => {
                        return Err(ServeError::Protocol(format!(
                            "expected command, got {line:?}"
                        )));
                    }
                }
            }
            Ok(PktLine::Flush) | Err(ServeError::ClientAbort) => return Ok(None),
            Ok(_) => {
                return Err(ServeError::Protocol("expected command frame".into()));
            }
            Err(e) => return Err(e),
        };

        // Capability lines (agent=..., object-format=...) up to the
        // delimiter; a flush here means a command with no arguments.
        let mut args = Vec::new();
        loop {
            match reader.read_pkt()? {
                PktLine::Delimiter => break,
                PktLine::Flush => return Ok(Some(CommandFrame { name, args })),
                PktLine::Data(_) => {}
                PktLine::ResponseEnd => {
                    return Err(ServeError::Protocol("unexpected response-end".into()));
                }
            }
        }
        loop {
            match reader.read_pkt()? {
                PktLine::Flush => break,
                PktLine::Data(data) => args.push(data),
                _ => return Err(ServeError::Protocol("unexpected framing in arguments".into())),
            }
        }
        Ok(Some(CommandFrame { name, args }))
    }

    /// `ls-refs`: list refs, honoring `ref-prefix` and `peel` arguments.
    fn ls_refs<O: Write>(
        &self,
        writer: &mut PktLineWriter<O>,
        args: &[Vec<u8>],
    ) -> Result<(), ServeError> {
        let mut prefixes: Vec<String> = Vec::new();
        let mut peel = false;
        for raw in args {
            let line = String::from_utf8_lossy(strip_newline(raw)).into_owned();
            if let Some(prefix) = line.strip_prefix("ref-prefix ") {
                prefixes.push(prefix.to_string());
            } else if line == "peel" {
                peel = true;
            }
            // symrefs and unknown arguments: nothing to add here.
        }

        let refs = self.store().repository().ref_database()?;
        for record in &refs {
            let name = String::from_utf8_lossy(&record.name).into_owned();
            if !prefixes.is_empty() && !prefixes.iter().any(|p| name.starts_with(p.as_str())) {
                continue;
            }
            match (peel, record.peeled) {
                (true, Some(peeled)) => {
                    writer.write_text(&format!(
                        "{} {name} peeled:{peeled}",
                        record.target
                    ))?;
                }
                _ => writer.write_text(&format!("{} {name}", record.target))?,
            }
        }
        writer.write_flush()?;
        writer.flush()
    }

    /// `fetch`: acknowledgments, optional shallow-info and wanted-refs
    /// sections, then the packfile, ending with response-end.
    fn fetch_v2<O: Write>(
        &self,
        writer: &mut PktLineWriter<O>,
        args: &[Vec<u8>],
    ) -> Result<(), ServeError> {
        if self.cancelled() {
            return Err(ServeError::Cancelled);
        }

        let mut request = parse_fetch_args(args)?;
        let refs = self.store().repository().ref_database()?;

        // want-ref names resolve against the live refs.
        let mut wanted_refs: Vec<(ObjectId, String)> = Vec::new();
        for name in &request.want_refs {
            let Some(record) = refs.iter().find(|r| r.name == *name) else {
                return Err(ServeError::Protocol(format!("unknown ref {name}")));
            };
            wanted_refs.push((
                record.target,
                String::from_utf8_lossy(&record.name).into_owned(),
            ));
            request.wants.push(record.target);
        }

        if request.wants.is_empty() {
            return Err(ServeError::Protocol("fetch without wants".into()));
        }

        let mut walk = RevWalk::new(self.store());
        let ctx = policy_context_v2(&refs);
        for want in &request.wants {
            self.options().policy.validate(want, &ctx, &mut walk)?;
            walk.set_flag(want, flags::WANT);
        }
        walk.carry(flags::PEER_HAS);

        // Process haves against the store.
        let mut common: Vec<ObjectId> = Vec::new();
        let mut oldest_have = i64::MAX;
        for have in &request.haves {
            if let Some(commit_time) = self.match_have(&mut walk, have)? {
                oldest_have = oldest_have.min(commit_time);
                walk.set_flag(have, flags::COMMON);
                common.push(*have);
            }
        }

        let mut commit_wants: Vec<ObjectId> = Vec::new();
        for want in &request.wants {
            if let Ok((ObjectType::Commit, peeled)) = walk.peel(want) {
                commit_wants.push(peeled);
            }
        }
        let ready = !common.is_empty()
            && walk.all_reach_flagged(&commit_wants, flags::PEER_HAS, oldest_have)?;

        // Acknowledgments are only reported while the client keeps
        // negotiating.
        if !request.done {
            writer.write_text("acknowledgments")?;
            if common.is_empty() {
                writer.write_text("NAK")?;
            } else {
                for oid in &common {
                    writer.write_text(&format!("ACK {oid}"))?;
                }
            }
            if ready {
                writer.write_text("ready")?;
            }
            if !ready {
                // Negotiation continues on the client's next request.
                writer.write_response_end()?;
                writer.flush()?;
                return Ok(());
            }
            writer.write_delimiter()?;
        }

        // Shallow handling mirrors v0; sections replace the inline lines.
        let mut shallow_cut: HashSet<ObjectId> = HashSet::new();
        if let Some(depth) = request.depth {
            let client_shallow: HashSet<ObjectId> =
                request.client_shallow.iter().copied().collect();
            writer.write_text("shallow-info")?;
            let mut covered: HashSet<ObjectId> = HashSet::new();
            let mut boundary: Vec<ObjectId> = Vec::new();
            for entry in walk.depth_walk(&request.wants, depth)? {
                covered.insert(entry.oid);
                if entry.boundary {
                    boundary.push(entry.oid);
                }
            }
            for oid in &boundary {
                if !client_shallow.contains(oid) {
                    writer.write_text(&format!("shallow {oid}"))?;
                }
            }
            for oid in &client_shallow {
                if covered.contains(oid) && !boundary.contains(oid) {
                    writer.write_text(&format!("unshallow {oid}"))?;
                }
            }
            writer.write_delimiter()?;
            shallow_cut = boundary.into_iter().collect();
        }

        if !wanted_refs.is_empty() {
            writer.write_text("wanted-refs")?;
            for (oid, name) in &wanted_refs {
                writer.write_text(&format!("{oid} {name}"))?;
            }
            writer.write_delimiter()?;
        }

        // Packfile section: always side-band framed in v2.
        writer.write_text("packfile")?;
        let plan = plan_pack(
            self.store(),
            &request.wants,
            &common,
            &refs,
            &PlanOptions {
                filter: request.filter,
                include_tag: request.caps.include_tag,
                shallow_cut,
            },
        )?;
        let reuse = discover_reuse_packs(self.store());
        {
            let mut mux = SidebandWriter::new(writer, SidebandMode::Band64k);
            match write_pack(self.store(), &plan, &reuse, &mut mux, |_| {}) {
                Ok(_) => {}
                Err(err) => {
                    let _ = mux.write_fatal(&err.to_string());
                    return Err(err);
                }
            }
        }
        writer.write_flush()?;
        writer.write_response_end()?;
        writer.flush()
    }
}

fn policy_context_v2(refs: &[RefRecord]) -> PolicyContext {
    let mut advertised = HashSet::new();
    let mut tips = HashSet::new();
    for record in refs {
        advertised.insert(record.target);
        tips.insert(record.target);
        if let Some(peeled) = record.peeled {
            advertised.insert(peeled);
        }
    }
    PolicyContext { advertised, tips }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiate::UploadOptions;
    use crate::policy::WantPolicy;
    use gitd_object::commit::format_commit;
    use gitd_object::Tree;
    use gitd_store::{MemoryRepository, ObjectStore};
    use std::io::Cursor;

    fn small_repo() -> (tempfile::TempDir, ObjectStore<MemoryRepository>, Vec<ObjectId>) {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = MemoryRepository::new(dir.path());
        let tree = repo.insert(ObjectType::Tree, &Tree::default().serialize());
        let c0 = repo.insert(
            ObjectType::Commit,
            &format_commit(&tree, &[], "V <v@e>", 1_700_000_000, "one\n"),
        );
        let c1 = repo.insert(
            ObjectType::Commit,
            &format_commit(&tree, &[c0], "V <v@e>", 1_700_000_010, "two\n"),
        );
        repo.insert_ref("refs/heads/main", c1);
        (dir, ObjectStore::new(repo), vec![c0, c1])
    }

    fn v2_session(
        store: &ObjectStore<MemoryRepository>,
        script: impl FnOnce(&mut PktLineWriter<&mut Vec<u8>>),
    ) -> Vec<u8> {
        let mut input = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut input);
            script(&mut writer);
        }
        let upload = UploadPack::with_options(
            store,
            UploadOptions {
                policy: WantPolicy::Advertised,
                bidirectional: true,
            },
        );
        let mut output = Vec::new();
        upload.run_v2(Cursor::new(input), &mut output).unwrap();
        output
    }

    fn lines_of(output: &[u8]) -> Vec<String> {
        let mut reader = PktLineReader::new(Cursor::new(output.to_vec()));
        let mut lines = Vec::new();
        loop {
            match reader.read_pkt() {
                Ok(PktLine::Data(data)) => lines.push(
                    String::from_utf8_lossy(strip_newline(&data)).into_owned(),
                ),
                Ok(PktLine::Flush) => lines.push("<flush>".into()),
                Ok(PktLine::Delimiter) => lines.push("<delim>".into()),
                Ok(PktLine::ResponseEnd) => lines.push("<end>".into()),
                Err(_) => break,
            }
        }
        lines
    }

    #[test]
    fn capability_listing_comes_first() {
        let (_dir, store, _) = small_repo();
        let output = v2_session(&store, |w| {
            w.write_flush().unwrap();
        });
        let lines = lines_of(&output);
        assert_eq!(lines[0], "version 2");
        assert!(lines.iter().any(|l| l.starts_with("agent=")));
        assert!(lines.iter().any(|l| l == "ls-refs"));
        assert!(lines.iter().any(|l| l.starts_with("fetch=")));
    }

    #[test]
    fn ls_refs_lists_and_filters() {
        let (_dir, store, commits) = small_repo();
        let output = v2_session(&store, |w| {
            w.write_text("command=ls-refs").unwrap();
            w.write_delimiter().unwrap();
            w.write_text("ref-prefix refs/heads/").unwrap();
            w.write_flush().unwrap();
            w.write_flush().unwrap();
        });
        let lines = lines_of(&output);
        assert!(lines
            .iter()
            .any(|l| *l == format!("{} refs/heads/main", commits[1])));
    }

    #[test]
    fn fetch_with_done_sends_packfile_section() {
        let (_dir, store, commits) = small_repo();
        let output = v2_session(&store, |w| {
            w.write_text("command=fetch").unwrap();
            w.write_delimiter().unwrap();
            w.write_text(&format!("want {}", commits[1])).unwrap();
            w.write_text("done").unwrap();
            w.write_flush().unwrap();
            w.write_flush().unwrap();
        });
        let lines = lines_of(&output);
        // done skips acknowledgments entirely.
        assert!(!lines.iter().any(|l| l == "acknowledgments"));
        assert!(lines.iter().any(|l| l == "packfile"));
        assert!(lines.iter().any(|l| l == "<end>"));
    }

    #[test]
    fn fetch_without_done_acknowledges_and_waits() {
        let (_dir, store, commits) = small_repo();
        let ghost = ObjectId::from_hex("00000000000000000000000000000000000000cc").unwrap();
        let output = v2_session(&store, |w| {
            w.write_text("command=fetch").unwrap();
            w.write_delimiter().unwrap();
            w.write_text(&format!("want {}", commits[1])).unwrap();
            w.write_text(&format!("have {ghost}")).unwrap();
            w.write_flush().unwrap();
            w.write_flush().unwrap();
        });
        let lines = lines_of(&output);
        assert!(lines.iter().any(|l| l == "acknowledgments"));
        assert!(lines.iter().any(|l| l == "NAK"));
        assert!(!lines.iter().any(|l| l == "packfile"));
    }

    #[test]
    fn fetch_with_common_have_reports_ready() {
        let (_dir, store, commits) = small_repo();
        let output = v2_session(&store, |w| {
            w.write_text("command=fetch").unwrap();
            w.write_delimiter().unwrap();
            w.write_text(&format!("want {}", commits[1])).unwrap();
            w.write_text(&format!("have {}", commits[0])).unwrap();
            w.write_flush().unwrap();
            w.write_flush().unwrap();
        });
        let lines = lines_of(&output);
        assert!(lines.iter().any(|l| *l == format!("ACK {}", commits[0])));
        assert!(lines.iter().any(|l| l == "ready"));
        assert!(lines.iter().any(|l| l == "packfile"));
    }

    #[test]
    fn want_ref_resolves_and_reports() {
        let (_dir, store, commits) = small_repo();
        let output = v2_session(&store, |w| {
            w.write_text("command=fetch").unwrap();
            w.write_delimiter().unwrap();
            w.write_text("want-ref refs/heads/main").unwrap();
            w.write_text("done").unwrap();
            w.write_flush().unwrap();
            w.write_flush().unwrap();
        });
        let lines = lines_of(&output);
        assert!(lines.iter().any(|l| l == "wanted-refs"));
        assert!(lines
            .iter()
            .any(|l| *l == format!("{} refs/heads/main", commits[1])));
        assert!(lines.iter().any(|l| l == "packfile"));
    }
}
