//! Fetch request parsing, protocol v0/v1 and v2.
//!
//! Both wire dialects fill the same [`FetchRequest`]; which parser runs is
//! the transport's choice. A connection that mixes dialects (v1 wants plus
//! a v2 `command=fetch`) is rejected outright.

use std::io::Read;

use bstr::BString;
use gitd_hash::ObjectId;

use crate::capability::ClientCaps;
use crate::pktline::{PktLine, PktLineReader};
use crate::ServeError;

/// Blob filter specs accepted on a `filter` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobFilter {
    /// `blob:none`: no blobs at all.
    NoBlobs,
    /// `blob:limit=<n>`: only blobs of at most `n` bytes.
    Limit(u64),
}

impl BlobFilter {
    /// Parse a filter spec string.
    pub fn parse(spec: &str) -> Result<Self, ServeError> {
        if spec == "blob:none" {
            return Ok(BlobFilter::NoBlobs);
        }
        if let Some(limit) = spec.strip_prefix("blob:limit=") {
            let n: u64 = limit
                .parse()
                .map_err(|_| ServeError::Protocol(format!("invalid filter spec {spec:?}")))?;
            return Ok(BlobFilter::Limit(n));
        }
        Err(ServeError::Protocol(format!(
            "unsupported filter spec {spec:?}"
        )))
    }

    /// Does a blob of `size` bytes pass this filter?
    pub fn admits(&self, size: u64) -> bool {
        match self {
            BlobFilter::NoBlobs => false,
            BlobFilter::Limit(n) => size <= *n,
        }
    }
}

/// One fetch request, shared by the v0/v1 and v2 parsers.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub wants: Vec<ObjectId>,
    /// v2 `want-ref` names, resolved by the caller against its refs.
    pub want_refs: Vec<BString>,
    /// v2 only: haves arrive as arguments rather than as a separate phase.
    pub haves: Vec<ObjectId>,
    /// Commits the client already has shallow.
    pub client_shallow: Vec<ObjectId>,
    /// `deepen <n>`.
    pub depth: Option<u32>,
    /// `deepen-since <ts>`.
    pub deepen_since: Option<i64>,
    /// `deepen-not <ref>` entries.
    pub deepen_not: Vec<BString>,
    pub deepen_relative: bool,
    pub filter: Option<BlobFilter>,
    /// v2 only: client is done negotiating.
    pub done: bool,
    pub caps: ClientCaps,
}

impl FetchRequest {
    /// RECV_WANTS validation shared by both dialects.
    fn validate(&self) -> Result<(), ServeError> {
        let deepen_kinds = [
            self.depth.is_some(),
            self.deepen_since.is_some(),
            !self.deepen_not.is_empty(),
        ]
        .iter()
        .filter(|&&b| b)
        .count();
        if deepen_kinds > 1 {
            return Err(ServeError::Protocol(
                "deepen, deepen-since and deepen-not are mutually exclusive".into(),
            ));
        }
        if self.depth == Some(0) {
            return Err(ServeError::Protocol("deepen depth must be positive".into()));
        }
        Ok(())
    }
}

fn parse_oid(hex: &str, line: &str) -> Result<ObjectId, ServeError> {
    ObjectId::from_hex(hex)
        .map_err(|_| ServeError::Protocol(format!("invalid object id in {line:?}")))
}

/// Parse the v0/v1 want section: `want`/`shallow`/`deepen*`/`filter` lines
/// up to the terminating flush. Capabilities ride on the first want line.
pub fn parse_upload_request<R: Read>(
    reader: &mut PktLineReader<R>,
) -> Result<FetchRequest, ServeError> {
    let mut request = FetchRequest::default();
    let mut first_want = true;
    let mut filter_seen = false;

    loop {
        let line = match reader.read_pkt()? {
            PktLine::Flush => break,
            PktLine::Data(data) => {
                String::from_utf8_lossy(crate::pktline::strip_newline(&data)).into_owned()
            }
            PktLine::Delimiter | PktLine::ResponseEnd => {
                return Err(ServeError::Protocol(
                    "unexpected v2 framing in want section".into(),
                ));
            }
        };

        if let Some(rest) = line.strip_prefix("want ") {
            let (hex, caps) = match rest.split_once(' ') {
                Some((hex, caps)) => (hex, Some(caps)),
                None => (rest, None),
            };
            request.wants.push(parse_oid(hex, &line)?);
            if first_want {
                if let Some(caps) = caps {
                    request.caps = ClientCaps::parse(caps);
                }
                first_want = false;
            }
            // Capability options on any later want line are ignored; only
            // the first want speaks for the request.
        } else if let Some(hex) = line.strip_prefix("shallow ") {
            request.client_shallow.push(parse_oid(hex, &line)?);
        } else if let Some(n) = line.strip_prefix("deepen ") {
            let depth: u32 = n
                .parse()
                .map_err(|_| ServeError::Protocol(format!("invalid deepen {n:?}")))?;
            request.depth = Some(depth);
        } else if let Some(ts) = line.strip_prefix("deepen-since ") {
            let since: i64 = ts
                .parse()
                .map_err(|_| ServeError::Protocol(format!("invalid deepen-since {ts:?}")))?;
            request.deepen_since = Some(since);
        } else if let Some(name) = line.strip_prefix("deepen-not ") {
            request.deepen_not.push(BString::from(name));
        } else if line == "deepen-relative" {
            request.deepen_relative = true;
        } else if let Some(spec) = line.strip_prefix("filter ") {
            if filter_seen {
                return Err(ServeError::Protocol("duplicate filter line".into()));
            }
            filter_seen = true;
            request.filter = Some(BlobFilter::parse(spec)?);
        } else if line.starts_with("command=") {
            // A v2 command on a v1 connection is undefined upstream; we
            // refuse it.
            return Err(ServeError::Protocol(
                "protocol v2 command on a v1 connection".into(),
            ));
        } else {
            return Err(ServeError::Protocol(format!(
                "unexpected line in want section: {line:?}"
            )));
        }
    }

    request.validate()?;
    Ok(request)
}

/// Parse v2 `command=fetch` argument lines (already split out of the
/// request framing by the transport).
pub fn parse_fetch_args(lines: &[Vec<u8>]) -> Result<FetchRequest, ServeError> {
    let mut request = FetchRequest::default();
    let mut filter_seen = false;

    for raw in lines {
        let line = String::from_utf8_lossy(crate::pktline::strip_newline(raw)).into_owned();

        if let Some(hex) = line.strip_prefix("want ") {
            request.wants.push(parse_oid(hex, &line)?);
        } else if let Some(name) = line.strip_prefix("want-ref ") {
            request.want_refs.push(BString::from(name));
        } else if let Some(hex) = line.strip_prefix("have ") {
            request.haves.push(parse_oid(hex, &line)?);
        } else if line == "done" {
            request.done = true;
        } else if line == "thin-pack" {
            request.caps.thin_pack = true;
        } else if line == "no-progress" {
            request.caps.no_progress = true;
        } else if line == "include-tag" {
            request.caps.include_tag = true;
        } else if line == "ofs-delta" {
            request.caps.ofs_delta = true;
        } else if let Some(hex) = line.strip_prefix("shallow ") {
            request.client_shallow.push(parse_oid(hex, &line)?);
        } else if let Some(n) = line.strip_prefix("deepen ") {
            request.depth = Some(
                n.parse()
                    .map_err(|_| ServeError::Protocol(format!("invalid deepen {n:?}")))?,
            );
        } else if let Some(ts) = line.strip_prefix("deepen-since ") {
            request.deepen_since = Some(
                ts.parse()
                    .map_err(|_| ServeError::Protocol(format!("invalid deepen-since {ts:?}")))?,
            );
        } else if let Some(name) = line.strip_prefix("deepen-not ") {
            request.deepen_not.push(BString::from(name));
        } else if line == "deepen-relative" {
            request.deepen_relative = true;
        } else if let Some(spec) = line.strip_prefix("filter ") {
            if filter_seen {
                return Err(ServeError::Protocol("duplicate filter line".into()));
            }
            filter_seen = true;
            request.filter = Some(BlobFilter::parse(spec)?);
        } else if line == "wait-for-done" || line == "sideband-all" || line.starts_with("packfile-uris")
        {
            // Recognized v2 keys with no v0 counterpart; accepted and left
            // to the session driver.
        } else {
            // Unknown argument keys are ignored by contract.
        }
    }

    request.validate()?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::AckMode;
    use crate::pktline::PktLineWriter;
    use std::io::Cursor;

    const ID_A: &str = "95d09f2b10159347eece71399a7e2e907ea3df4f";
    const ID_B: &str = "0000000000000000000000000000000000000001";

    fn request_from(lines: &[&str]) -> Result<FetchRequest, ServeError> {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            for line in lines {
                writer.write_text(line).unwrap();
            }
            writer.write_flush().unwrap();
        }
        let mut reader = PktLineReader::new(Cursor::new(buf));
        parse_upload_request(&mut reader)
    }

    #[test]
    fn wants_with_capabilities_on_first_line() {
        let request = request_from(&[
            &format!("want {ID_A} multi_ack_detailed side-band-64k thin-pack"),
            &format!("want {ID_B}"),
        ])
        .unwrap();

        assert_eq!(request.wants.len(), 2);
        assert_eq!(request.caps.ack_mode, AckMode::Detailed);
        assert!(request.caps.side_band_64k);
        assert!(request.caps.thin_pack);
    }

    #[test]
    fn empty_want_section() {
        let request = request_from(&[]).unwrap();
        assert!(request.wants.is_empty());
    }

    #[test]
    fn shallow_and_deepen() {
        let request = request_from(&[
            &format!("want {ID_A}"),
            &format!("shallow {ID_B}"),
            "deepen 3",
        ])
        .unwrap();
        assert_eq!(request.client_shallow.len(), 1);
        assert_eq!(request.depth, Some(3));
    }

    #[test]
    fn deepen_variants_are_mutually_exclusive() {
        let err = request_from(&[
            &format!("want {ID_A}"),
            "deepen 3",
            "deepen-since 1700000000",
        ])
        .unwrap_err();
        assert!(matches!(err, ServeError::Protocol(_)));

        let err = request_from(&[
            &format!("want {ID_A}"),
            "deepen 3",
            "deepen-not refs/heads/old",
        ])
        .unwrap_err();
        assert!(matches!(err, ServeError::Protocol(_)));
    }

    #[test]
    fn filter_specs() {
        let request =
            request_from(&[&format!("want {ID_A} filter"), "filter blob:none"]).unwrap();
        assert_eq!(request.filter, Some(BlobFilter::NoBlobs));

        let request =
            request_from(&[&format!("want {ID_A} filter"), "filter blob:limit=1024"]).unwrap();
        assert_eq!(request.filter, Some(BlobFilter::Limit(1024)));
        assert!(request.filter.unwrap().admits(1024));
        assert!(!request.filter.unwrap().admits(1025));
    }

    #[test]
    fn duplicate_filter_rejected() {
        let err = request_from(&[
            &format!("want {ID_A} filter"),
            "filter blob:none",
            "filter blob:limit=1",
        ])
        .unwrap_err();
        assert!(matches!(err, ServeError::Protocol(_)));
    }

    #[test]
    fn bad_filter_spec_rejected() {
        for spec in ["filter tree:0", "filter blob:limit=-3", "filter blob:max"] {
            let err = request_from(&[&format!("want {ID_A}"), spec]).unwrap_err();
            assert!(matches!(err, ServeError::Protocol(_)), "spec {spec:?}");
        }
    }

    #[test]
    fn malformed_want_rejected() {
        let err = request_from(&["want zzz"]).unwrap_err();
        assert!(matches!(err, ServeError::Protocol(_)));
    }

    #[test]
    fn v2_command_on_v1_connection_rejected() {
        let err = request_from(&[&format!("want {ID_A}"), "command=fetch"]).unwrap_err();
        assert!(matches!(err, ServeError::Protocol(_)));
    }

    #[test]
    fn v2_fetch_args() {
        let lines: Vec<Vec<u8>> = [
            format!("want {ID_A}"),
            format!("have {ID_B}"),
            "thin-pack".to_string(),
            "ofs-delta".to_string(),
            "include-tag".to_string(),
            "filter blob:limit=512".to_string(),
            "done".to_string(),
            "unknown-key=whatever".to_string(),
        ]
        .iter()
        .map(|s| s.as_bytes().to_vec())
        .collect();

        let request = parse_fetch_args(&lines).unwrap();
        assert_eq!(request.wants.len(), 1);
        assert_eq!(request.haves.len(), 1);
        assert!(request.done);
        assert!(request.caps.thin_pack);
        assert!(request.caps.ofs_delta);
        assert!(request.caps.include_tag);
        assert_eq!(request.filter, Some(BlobFilter::Limit(512)));
    }

    #[test]
    fn v2_want_ref_collected() {
        let lines = vec![b"want-ref refs/heads/main".to_vec()];
        let request = parse_fetch_args(&lines).unwrap();
        assert_eq!(request.want_refs, vec![BString::from("refs/heads/main")]);
    }
}
