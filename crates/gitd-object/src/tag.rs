use bstr::{BStr, BString};
use gitd_hash::ObjectId;

use crate::{Ident, ObjectError, ObjectType};

/// A parsed annotated tag object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// OID of the tagged object.
    pub target: ObjectId,
    /// Type of the tagged object.
    pub target_type: ObjectType,
    /// Tag name.
    pub tag_name: BString,
    /// Tagger identity and timestamp (absent on some historical tags).
    pub tagger: Option<Ident>,
    /// Tag message.
    pub message: BString,
}

impl Tag {
    /// Parse tag content from raw bytes (no loose-object header).
    pub fn parse(content: &[u8]) -> Result<Self, ObjectError> {
        let mut target: Option<ObjectId> = None;
        let mut target_type: Option<ObjectType> = None;
        let mut tag_name: Option<BString> = None;
        let mut tagger: Option<Ident> = None;

        let data = content;
        let mut pos = 0;

        loop {
            if pos >= data.len() {
                break;
            }
            if data[pos] == b'\n' {
                pos += 1;
                break;
            }

            let line_end = data[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| p + pos)
                .unwrap_or(data.len());
            let line = &data[pos..line_end];
            pos = line_end + 1;

            if line.first() == Some(&b' ') {
                continue;
            }

            if let Some(space_pos) = line.iter().position(|&b| b == b' ') {
                let key = &line[..space_pos];
                let value = &line[space_pos + 1..];

                match key {
                    b"object" => {
                        let hex = std::str::from_utf8(value).map_err(|_| {
                            ObjectError::InvalidHeader("non-UTF8 target OID".into())
                        })?;
                        target = Some(ObjectId::from_hex(hex)?);
                    }
                    b"type" => {
                        target_type = Some(ObjectType::from_bytes(value)?);
                    }
                    b"tag" => {
                        tag_name = Some(BString::from(value));
                    }
                    b"tagger" => {
                        tagger = Some(Ident::parse(BStr::new(value))?);
                    }
                    _ => {}
                }
            }
        }

        let message = BString::from(&data[pos.min(data.len())..]);

        Ok(Self {
            target: target.ok_or(ObjectError::MissingTagField { field: "object" })?,
            target_type: target_type.ok_or(ObjectError::MissingTagField { field: "type" })?,
            tag_name: tag_name.ok_or(ObjectError::MissingTagField { field: "tag" })?,
            tagger,
            message,
        })
    }
}

/// Render tag content in canonical format, for fixtures and tests.
pub fn format_tag(
    target: &ObjectId,
    target_type: ObjectType,
    name: &str,
    who: &str,
    timestamp: i64,
    message: &str,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("object {}\n", target).as_bytes());
    out.extend_from_slice(format!("type {}\n", target_type).as_bytes());
    out.extend_from_slice(format!("tag {}\n", name).as_bytes());
    out.extend_from_slice(format!("tagger {} {} +0000\n", who, timestamp).as_bytes());
    out.push(b'\n');
    out.extend_from_slice(message.as_bytes());
    out
}
