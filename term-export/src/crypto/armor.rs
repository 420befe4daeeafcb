//! ASCII armor: base64 lines between BEGIN/END markers.

use std::io::{self, Write};

use base64::{engine::general_purpose::STANDARD, write::EncoderWriter, Engine as _};

use crate::error::{ExportError, Result};

pub const ARMOR_BEGIN: &str = "-----BEGIN TERM EXPORT MESSAGE-----";
pub const ARMOR_END: &str = "-----END TERM EXPORT MESSAGE-----";

const LINE_WIDTH: usize = 64;

/// Inserts a newline every `width` bytes written.
struct LineWrap<W: Write> {
    inner: W,
    width: usize,
    column: usize,
}

impl<W: Write> Write for LineWrap<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            if self.column == self.width {
                self.inner.write_all(b"\n")?;
                self.column = 0;
            }
            let take = rest.len().min(self.width - self.column);
            self.inner.write_all(&rest[..take])?;
            self.column += take;
            rest = &rest[take..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streams bytes out as armored text.
pub struct ArmorWriter<W: Write> {
    encoder: EncoderWriter<'static, base64::engine::GeneralPurpose, LineWrap<W>>,
}

impl<W: Write> ArmorWriter<W> {
    pub fn new(mut inner: W) -> io::Result<Self> {
        inner.write_all(ARMOR_BEGIN.as_bytes())?;
        inner.write_all(b"\n")?;
        let wrap = LineWrap {
            inner,
            width: LINE_WIDTH,
            column: 0,
        };
        Ok(Self {
            encoder: EncoderWriter::new(wrap, &STANDARD),
        })
    }

    /// Flushes the last base64 quantum and writes the END marker.
    pub fn finish(mut self) -> io::Result<W> {
        let wrap = self.encoder.finish()?;
        let mut inner = wrap.inner;
        if wrap.column > 0 {
            inner.write_all(b"\n")?;
        }
        inner.write_all(ARMOR_END.as_bytes())?;
        inner.write_all(b"\n")?;
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for ArmorWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

/// Whether `prefix` starts an armored message.
pub fn is_armored(prefix: &[u8]) -> bool {
    prefix.starts_with(b"-----BEGIN ")
}

/// Decodes an armored message back to binary.
pub fn dearmor(text: &str) -> Result<Vec<u8>> {
    let mut lines = text.lines().map(str::trim);
    match lines.next() {
        Some(ARMOR_BEGIN) => {}
        _ => {
            return Err(ExportError::Encryption(
                "armored message is missing its BEGIN line".to_string(),
            ))
        }
    }

    let mut body = String::new();
    let mut closed = false;
    for line in lines {
        if line == ARMOR_END {
            closed = true;
            break;
        }
        body.push_str(line);
    }
    if !closed {
        return Err(ExportError::Encryption(
            "armored message is missing its END line".to_string(),
        ));
    }

    STANDARD
        .decode(body)
        .map_err(|e| ExportError::Encryption(format!("invalid armor: {e}")))
}
