//! Unified request encoding and reply frame decoding

use bytes::{BufMut, Bytes, BytesMut};

use super::reply::Reply;
use crate::error::{RedshardError, RedshardResult};

const CRLF: &[u8] = b"\r\n";

/// Encoder/decoder for the unified request protocol
pub struct WireCodec;

/// A frame header borrowed from the input buffer
enum Frame<'a> {
    Error(&'a [u8]),
    Status(&'a [u8]),
    Integer(i64),
    Bulk(Option<&'a [u8]>),
    Multibulk(Option<usize>),
}

impl WireCodec {
    /// Encode a command into a standalone request frame
    pub fn encode<A: AsRef<[u8]>>(command: &str, args: &[A]) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, command, args);
        buf.freeze()
    }

    /// Append a request frame for `command args...` to `buf`
    ///
    /// `*<argc>\r\n` followed by `$<len>\r\n<bytes>\r\n` for the command name
    /// and each argument.
    pub fn encode_into<A: AsRef<[u8]>>(buf: &mut BytesMut, command: &str, args: &[A]) {
        buf.put_u8(b'*');
        buf.extend_from_slice((args.len() + 1).to_string().as_bytes());
        buf.put_slice(CRLF);
        Self::encode_bulk(buf, command.as_bytes());
        for arg in args {
            Self::encode_bulk(buf, arg.as_ref());
        }
    }

    fn encode_bulk(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u8(b'$');
        buf.extend_from_slice(data.len().to_string().as_bytes());
        buf.put_slice(CRLF);
        buf.extend_from_slice(data);
        buf.put_slice(CRLF);
    }

    /// Decode exactly one flat reply frame starting at `cursor`
    ///
    /// Returns `Ok(None)` without moving the cursor when the frame is not
    /// complete yet. A multibulk frame decodes to its child count only.
    pub fn decode_next(buf: &[u8], cursor: &mut usize) -> RedshardResult<Option<Reply>> {
        let Some((frame, next)) = Self::scan(buf, *cursor)? else {
            return Ok(None);
        };

        let reply = match frame {
            Frame::Error(data) => Reply::Error(Bytes::copy_from_slice(data)),
            Frame::Status(data) => Reply::Status(Bytes::copy_from_slice(data)),
            Frame::Integer(n) => Reply::Integer(n),
            Frame::Bulk(Some(data)) => Reply::Bulk(Bytes::copy_from_slice(data)),
            Frame::Bulk(None) => Reply::BulkNil,
            Frame::Multibulk(Some(count)) => Reply::Multibulk(count),
            Frame::Multibulk(None) => Reply::MultibulkNil,
        };

        *cursor = next;
        Ok(Some(reply))
    }

    /// Length of the complete top-level reply at `start`, children included
    ///
    /// Returns `Ok(None)` if any part of the reply is still missing.
    pub fn frame_len(buf: &[u8], start: usize) -> RedshardResult<Option<usize>> {
        let mut pos = start;
        let mut owed = 1usize;

        while owed > 0 {
            let Some((next, children)) = Self::skip_frame(buf, pos)? else {
                return Ok(None);
            };
            owed = Self::owed_after(owed, children)?;
            pos = next;
        }

        Ok(Some(pos - start))
    }

    /// Skip one flat frame at `start`, returning the offset after it and the
    /// number of children it announces
    pub(crate) fn skip_frame(buf: &[u8], start: usize) -> RedshardResult<Option<(usize, usize)>> {
        Ok(Self::scan(buf, start)?.map(|(frame, next)| match frame {
            Frame::Multibulk(Some(count)) => (next, count),
            _ => (next, 0),
        }))
    }

    /// Frames still owed after consuming one that announced `children`
    pub(crate) fn owed_after(owed: usize, children: usize) -> RedshardResult<usize> {
        (owed - 1).checked_add(children).ok_or_else(|| {
            RedshardError::protocol(format!(
                "Nested multibulk counts overflow: {} + {}",
                owed - 1,
                children
            ))
        })
    }

    fn scan(buf: &[u8], start: usize) -> RedshardResult<Option<(Frame<'_>, usize)>> {
        let Some(&marker) = buf.get(start) else {
            return Ok(None);
        };

        if !matches!(marker, b'-' | b'+' | b':' | b'$' | b'*') {
            return Err(RedshardError::protocol(format!(
                "Unknown reply type marker: 0x{:02x}",
                marker
            )));
        }

        let Some((line, after_line)) = Self::read_line(buf, start + 1) else {
            return Ok(None);
        };

        match marker {
            b'-' => Ok(Some((Frame::Error(line), after_line))),
            b'+' => Ok(Some((Frame::Status(line), after_line))),
            b':' => Ok(Some((Frame::Integer(Self::parse_int(line)?), after_line))),
            b'$' => {
                let size = Self::parse_int(line)?;
                if size == -1 {
                    return Ok(Some((Frame::Bulk(None), after_line)));
                }
                if size < 0 {
                    return Err(RedshardError::protocol(format!(
                        "Invalid bulk length: {}",
                        size
                    )));
                }

                let end = after_line + size as usize;
                // Not enough data for the payload + \r\n yet
                if buf.len() < end + CRLF.len() {
                    return Ok(None);
                }
                if &buf[end..end + CRLF.len()] != CRLF {
                    return Err(RedshardError::protocol(
                        "Missing \\r\\n after bulk payload",
                    ));
                }

                Ok(Some((
                    Frame::Bulk(Some(&buf[after_line..end])),
                    end + CRLF.len(),
                )))
            }
            _ => {
                let count = Self::parse_int(line)?;
                if count == -1 {
                    return Ok(Some((Frame::Multibulk(None), after_line)));
                }
                if count < 0 {
                    return Err(RedshardError::protocol(format!(
                        "Invalid multibulk count: {}",
                        count
                    )));
                }
                let count = usize::try_from(count).map_err(|_| {
                    RedshardError::protocol(format!("Multibulk count too large: {}", count))
                })?;
                Ok(Some((Frame::Multibulk(Some(count)), after_line)))
            }
        }
    }

    /// Find the line starting at `start`; returns it without its \r\n plus
    /// the offset right after the terminator
    fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
        let rest = buf.get(start..)?;
        let idx = rest.windows(2).position(|w| w == CRLF)?;
        Some((&rest[..idx], start + idx + CRLF.len()))
    }

    fn parse_int(line: &[u8]) -> RedshardResult<i64> {
        btoi::btoi::<i64>(line).map_err(|_| {
            RedshardError::protocol(format!(
                "Invalid integer: {}",
                String::from_utf8_lossy(line)
            ))
        })
    }
}
