//! Line-oriented command transport
//!
//! Bench instruments speak ASCII: a command is a line, a reply is a line. This module frames
//! commands and replies over any byte stream, in practice a VISA session on the GPIB bus.
use std::io::{Read, Write};

use crate::error::{Error, Result};

pub struct LineInstrument<T> {
    name: String,
    write_termination: &'static str,
    io_handle: T,
    read_buf: Vec<u8>,
}

impl<T: Read + Write> LineInstrument<T> {
    pub fn with(name: impl Into<String>, write_termination: &'static str, io_handle: T) -> Self {
        Self {
            name: name.into(),
            write_termination,
            io_handle,
            read_buf: Vec::with_capacity(128),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub(crate) fn io_handle(&self) -> &T {
        &self.io_handle
    }

    pub fn write_line(&mut self, command: &str) -> Result<()> {
        tracing::trace!(instrument = %self.name, command, "write");
        let framed = format!("{command}{}", self.write_termination);
        self.io_handle
            .write_all(framed.as_bytes())
            .and_then(|()| self.io_handle.flush())
            .map_err(|e| Error::instrument(&self.name, e))
    }

    /// Drops the first `n` bytes from the read buffer
    fn drop_first(&mut self, n: usize) {
        if n >= self.read_buf.len() {
            self.read_buf.clear();
        } else {
            self.read_buf.drain(..n);
        }
    }

    fn find_line_ending(&self) -> Option<usize> {
        self.read_buf.iter().position(|&byte| byte == b'\n')
    }

    /// Read one reply line, without its `CR LF` / `LF` terminator
    pub fn read_line(&mut self) -> Result<String> {
        let mut chunk = [0u8; 128];
        let end = loop {
            if let Some(end) = self.find_line_ending() {
                break end;
            }
            let n = self
                .io_handle
                .read(&mut chunk)
                .map_err(|e| Error::instrument(&self.name, e))?;
            if n == 0 {
                return Err(Error::instrument(&self.name, "connection closed"));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        };

        let line = String::from_utf8_lossy(&self.read_buf[..end])
            .trim_end_matches('\r')
            .to_owned();
        self.drop_first(end + 1);
        tracing::trace!(instrument = %self.name, reply = %line, "read");
        Ok(line)
    }

    pub fn query(&mut self, command: &str) -> Result<String> {
        self.write_line(command)?;
        self.read_line()
    }
}

#[cfg(feature = "visa")]
impl LineInstrument<visa_rs::Instrument> {
    /// Open the VISA resource `resource`, for example `GPIB0::25::INSTR`
    ///
    /// The session lives only as long as `rm`.
    ///
    /// # Errors
    /// A malformed resource string, or a resource that cannot be opened. There is no retry.
    pub fn open_visa(
        rm: &visa_rs::DefaultRM,
        name: &str,
        resource: &str,
        write_termination: &'static str,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        use visa_rs::prelude::*;

        let resource_id =
            std::ffi::CString::new(resource).map_err(|e| Error::instrument(name, e))?;
        let session = rm
            .open(&resource_id.into(), AccessMode::NO_LOCK, timeout)
            .map_err(|e| Error::instrument(name, e))?;
        tracing::info!(instrument = name, resource, "opened");
        Ok(Self::with(name, write_termination, session))
    }
}

/// A stream that replays canned replies and records everything written to it
#[cfg(test)]
pub(crate) struct ScriptedStream {
    replies: std::io::Cursor<Vec<u8>>,
    pub(crate) written: Vec<u8>,
}

#[cfg(test)]
impl ScriptedStream {
    pub(crate) fn new(replies: &[u8]) -> Self {
        Self {
            replies: std::io::Cursor::new(replies.to_vec()),
            written: Vec::new(),
        }
    }
}

#[cfg(test)]
impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.replies.read(buf)
    }
}

#[cfg(test)]
impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
