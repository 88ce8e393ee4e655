//! Author/committer/tagger identity lines.

use bstr::{BStr, BString, ByteSlice};

use crate::ObjectError;

/// An identity line: `Name <email> <epoch-seconds> <tz>`.
///
/// Only the timestamp is interpreted; the identity text is kept as raw bytes
/// because names and emails are not guaranteed UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    /// `Name <email>` portion, uninterpreted.
    pub who: BString,
    /// Seconds since the epoch.
    pub timestamp: i64,
    /// Timezone text as written (e.g. `+0200`).
    pub tz: BString,
}

impl Ident {
    /// Parse `Name <email> 1234567890 +0000`.
    pub fn parse(line: &BStr) -> Result<Self, ObjectError> {
        // The timestamp and tz are the last two space-separated fields; the
        // email may itself contain spaces inside the angle brackets.
        let close = line.rfind_byte(b'>').ok_or_else(|| {
            ObjectError::InvalidSignature(format!("no '>' in {:?}", line))
        })?;

        let who = BString::from(&line[..=close]);
        let rest = line[close + 1..].trim_start();

        let mut fields = rest.splitn_str(2, b" ");
        let ts_bytes = fields.next().unwrap_or_default();
        let tz_bytes = fields.next().unwrap_or_default();

        let ts_str = std::str::from_utf8(ts_bytes)
            .map_err(|_| ObjectError::InvalidSignature("non-UTF8 timestamp".into()))?;
        let timestamp: i64 = ts_str
            .parse()
            .map_err(|_| ObjectError::InvalidSignature(format!("bad timestamp {ts_str:?}")))?;

        Ok(Self {
            who,
            timestamp,
            tz: BString::from(tz_bytes),
        })
    }
}
