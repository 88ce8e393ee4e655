//! Pkt-line protocol framing.
//!
//! Every packet carries a 4-hex-digit length prefix that counts itself.
//! Sentinel lengths:
//! - `0000`: flush packet (end of section)
//! - `0001`: delimiter packet (v2 only)
//! - `0002`: response-end packet (v2 only)

use std::io::{Read, Write};

use crate::ServeError;

/// Maximum data per packet (65520 - 4 = 65516).
pub const MAX_PKT_DATA_LEN: usize = 65516;

/// Packet variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Normal data line.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// Delimiter packet (0001).
    Delimiter,
    /// Response-end packet (0002).
    ResponseEnd,
}

/// Pkt-line reader.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read one pkt-line.
    pub fn read_pkt(&mut self) -> Result<PktLine, ServeError> {
        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ServeError::ClientAbort
            } else {
                ServeError::Io(e)
            }
        })?;

        let len_str = std::str::from_utf8(&len_buf).map_err(|_| {
            ServeError::InvalidPktLine(format!("invalid pkt-line length bytes: {len_buf:?}"))
        })?;
        let len = u16::from_str_radix(len_str, 16).map_err(|_| {
            ServeError::InvalidPktLine(format!("invalid pkt-line length: {len_str:?}"))
        })?;

        match len {
            0 => Ok(PktLine::Flush),
            1 => Ok(PktLine::Delimiter),
            2 => Ok(PktLine::ResponseEnd),
            3 => Err(ServeError::InvalidPktLine(
                "pkt-line length 3 is invalid (minimum data packet is 4)".into(),
            )),
            _ => {
                let data_len = (len as usize) - 4;
                if data_len > MAX_PKT_DATA_LEN {
                    return Err(ServeError::InvalidPktLine(format!(
                        "pkt-line too long: {data_len} bytes"
                    )));
                }
                let mut data = vec![0u8; data_len];
                self.reader.read_exact(&mut data)?;
                Ok(PktLine::Data(data))
            }
        }
    }

    /// Read one data line as text, stripped of its trailing newline.
    /// Returns `None` on a flush packet.
    pub fn read_text_line(&mut self) -> Result<Option<String>, ServeError> {
        match self.read_pkt()? {
            PktLine::Data(data) => {
                let stripped = strip_newline(&data);
                Ok(Some(String::from_utf8_lossy(stripped).into_owned()))
            }
            PktLine::Flush | PktLine::Delimiter | PktLine::ResponseEnd => Ok(None),
        }
    }

    /// Read all data lines until a flush packet.
    pub fn read_until_flush(&mut self) -> Result<Vec<Vec<u8>>, ServeError> {
        let mut lines = Vec::new();
        while let PktLine::Data(data) = self.read_pkt()? {
            lines.push(data);
        }
        Ok(lines)
    }
}

/// Pkt-line writer.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Write a data packet.
    pub fn write_line(&mut self, data: &[u8]) -> Result<(), ServeError> {
        if data.len() > MAX_PKT_DATA_LEN {
            return Err(ServeError::InvalidPktLine(format!(
                "data too long for pkt-line: {} bytes (max {})",
                data.len(),
                MAX_PKT_DATA_LEN
            )));
        }

        let len = (data.len() + 4) as u16;
        write!(self.writer, "{:04x}", len)?;
        self.writer.write_all(data)?;
        Ok(())
    }

    /// Write a text line (appends \n if not present).
    pub fn write_text(&mut self, text: &str) -> Result<(), ServeError> {
        if text.ends_with('\n') {
            self.write_line(text.as_bytes())
        } else {
            let mut data = text.as_bytes().to_vec();
            data.push(b'\n');
            self.write_line(&data)
        }
    }

    /// Write a fatal `ERR` packet. The message carries no trailing newline;
    /// it is the last thing the peer sees.
    pub fn write_error(&mut self, text: &str) -> Result<(), ServeError> {
        self.write_line(format!("ERR {text}").as_bytes())
    }

    /// Write a flush packet (0000).
    pub fn write_flush(&mut self) -> Result<(), ServeError> {
        self.writer.write_all(b"0000")?;
        Ok(())
    }

    /// Write a delimiter packet (0001, v2 only).
    pub fn write_delimiter(&mut self) -> Result<(), ServeError> {
        self.writer.write_all(b"0001")?;
        Ok(())
    }

    /// Write a response-end packet (0002, v2 only).
    pub fn write_response_end(&mut self) -> Result<(), ServeError> {
        self.writer.write_all(b"0002")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ServeError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Drop one trailing newline, if present.
pub fn strip_newline(data: &[u8]) -> &[u8] {
    if data.last() == Some(&b'\n') {
        &data[..data.len() - 1]
    } else {
        data
    }
}
