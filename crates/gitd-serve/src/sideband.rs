//! Server-side side-band multiplexing.
//!
//! When the client asked for `side-band` / `side-band-64k`, the pack stream,
//! progress text, and fatal errors share the connection, each pkt-line
//! framed with a leading channel byte:
//! - channel 1: pack data
//! - channel 2: progress text
//! - channel 3: fatal error, the last thing sent

use std::io::Write;

use crate::capability::ClientCaps;
use crate::pktline::PktLineWriter;
use crate::ServeError;

/// Which multiplexing the client negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SidebandMode {
    /// Raw pack bytes, no multiplexing.
    #[default]
    None,
    /// `side-band`: 1000-byte packets.
    Band,
    /// `side-band-64k`: full-size packets.
    Band64k,
}

impl SidebandMode {
    /// Pick the best mode the client offered.
    pub fn select(caps: &ClientCaps) -> Self {
        if caps.side_band_64k {
            SidebandMode::Band64k
        } else if caps.side_band {
            SidebandMode::Band
        } else {
            SidebandMode::None
        }
    }

    /// Maximum data bytes per frame, after the channel byte.
    fn max_data(&self) -> usize {
        match self {
            // 1000-byte packet: 4 length + 1 channel byte leaves 995.
            SidebandMode::Band => 995,
            SidebandMode::Band64k => crate::pktline::MAX_PKT_DATA_LEN - 1,
            SidebandMode::None => usize::MAX,
        }
    }
}

/// Multiplexes one fetch response onto a pkt-line writer.
pub struct SidebandWriter<'a, W> {
    writer: &'a mut PktLineWriter<W>,
    mode: SidebandMode,
}

impl<'a, W: Write> SidebandWriter<'a, W> {
    pub fn new(writer: &'a mut PktLineWriter<W>, mode: SidebandMode) -> Self {
        Self { writer, mode }
    }

    /// Send pack bytes on channel 1 (or raw when unmuxed).
    pub fn write_pack_data(&mut self, data: &[u8]) -> Result<(), ServeError> {
        if self.mode == SidebandMode::None {
            self.writer.inner_mut().write_all(data)?;
            return Ok(());
        }
        self.write_band(1, data)
    }

    /// Send progress text on channel 2. Silently dropped when unmuxed:
    /// without side-band there is nowhere to put it.
    pub fn write_progress(&mut self, text: &[u8]) -> Result<(), ServeError> {
        if self.mode == SidebandMode::None {
            return Ok(());
        }
        self.write_band(2, text)
    }

    /// Send a fatal error on channel 3.
    pub fn write_fatal(&mut self, text: &str) -> Result<(), ServeError> {
        if self.mode == SidebandMode::None {
            return Ok(());
        }
        self.write_band(3, text.as_bytes())
    }

    /// Terminate the response with a flush packet (muxed mode only).
    pub fn finish(&mut self) -> Result<(), ServeError> {
        if self.mode != SidebandMode::None {
            self.writer.write_flush()?;
        }
        self.writer.flush()
    }

    fn write_band(&mut self, channel: u8, data: &[u8]) -> Result<(), ServeError> {
        for chunk in data.chunks(self.mode.max_data().max(1)) {
            let mut pkt = Vec::with_capacity(1 + chunk.len());
            pkt.push(channel);
            pkt.extend_from_slice(chunk);
            self.writer.write_line(&pkt)?;
        }
        Ok(())
    }
}

impl<W: Write> Write for SidebandWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_pack_data(buf)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer
            .flush()
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}
