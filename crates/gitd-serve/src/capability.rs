//! Capability advertisement and client-side capability parsing.
//!
//! The recognized identifier set is closed: unknown capabilities received
//! from a client are ignored, and nothing outside this list is ever sent.

use crate::policy::WantPolicy;

/// Agent string advertised to peers.
pub const AGENT: &str = "gitd/0.2";

/// The multi-ack flavor a client negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Single `ACK <id>` on the first common object.
    #[default]
    Off,
    /// `ACK <id> continue` per common object.
    Continue,
    /// `ACK <id> common|ready` status per object.
    Detailed,
}

/// Capabilities requested by the client on its first want line.
#[derive(Debug, Clone, Default)]
pub struct ClientCaps {
    pub ack_mode: AckMode,
    pub no_done: bool,
    pub thin_pack: bool,
    pub side_band: bool,
    pub side_band_64k: bool,
    pub ofs_delta: bool,
    pub shallow: bool,
    pub no_progress: bool,
    pub include_tag: bool,
    pub filter: bool,
    pub agent: Option<String>,
}

impl ClientCaps {
    /// Parse the space-separated capability list from a first want line.
    /// Unknown identifiers are ignored.
    pub fn parse(caps: &str) -> Self {
        let mut out = Self::default();
        for cap in caps.split_whitespace() {
            match cap {
                "multi_ack" => {
                    if out.ack_mode == AckMode::Off {
                        out.ack_mode = AckMode::Continue;
                    }
                }
                "multi_ack_detailed" => out.ack_mode = AckMode::Detailed,
                "no-done" => out.no_done = true,
                "thin-pack" => out.thin_pack = true,
                "side-band" => out.side_band = true,
                "side-band-64k" => out.side_band_64k = true,
                "ofs-delta" => out.ofs_delta = true,
                "shallow" => out.shallow = true,
                "no-progress" => out.no_progress = true,
                "include-tag" => out.include_tag = true,
                "filter" => out.filter = true,
                _ => {
                    if let Some(agent) = cap.strip_prefix("agent=") {
                        out.agent = Some(agent.to_string());
                    }
                    // Everything else: ignored by contract.
                }
            }
        }
        out
    }
}

/// The capability list advertised on the first ref line (v0/v1).
///
/// The `allow-*-sha1-in-want` entries track the active want policy.
pub fn advertised(policy: WantPolicy) -> String {
    let mut caps = vec![
        "multi_ack",
        "multi_ack_detailed",
        "no-done",
        "thin-pack",
        "side-band",
        "side-band-64k",
        "ofs-delta",
        "shallow",
        "no-progress",
        "include-tag",
        "filter",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect::<Vec<_>>();

    if policy.allows_tip_sha1() {
        caps.push("allow-tip-sha1-in-want".to_owned());
    }
    if policy.allows_reachable_sha1() {
        caps.push("allow-reachable-sha1-in-want".to_owned());
    }
    caps.push(format!("agent={AGENT}"));
    caps.join(" ")
}
