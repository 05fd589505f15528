//! Command batches
//!
//! A batch collects encoded commands, is submitted to an executor exactly
//! once, and then hands out the replies in the order the commands were
//! written.

use bytes::BytesMut;

use crate::error::{RedshardError, RedshardResult};
use crate::protocol::{Reply, WireCodec};

const READ_CHUNK: usize = 16 * 1024;

/// Pipeline of pending commands plus a decode cursor over their replies
#[derive(Debug, Default)]
pub struct Batch {
    /// Encoded commands not yet flushed to a socket
    outgoing: BytesMut,
    /// Commands written over the batch's lifetime
    commands: usize,
    /// Raw reply bytes received so far
    incoming: BytesMut,
    /// Scan position in `incoming`, possibly inside a partial reply
    scan_pos: usize,
    /// Frames still missing from the partial reply at `scan_pos`
    scan_owed: usize,
    /// Complete top-level replies received
    received: usize,
    /// Decode position of the next pull
    cursor: usize,
    /// Top-level replies handed out
    pulled: usize,
    /// Multibulk children still to be pulled
    owed_children: usize,
    /// Transport or protocol failure from the last execution
    failure: Option<RedshardError>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append pre-encoded request bytes holding `command_count` commands
    pub fn write_raw(&mut self, data: &[u8], command_count: usize) -> &mut Self {
        self.outgoing.extend_from_slice(data);
        self.commands += command_count;
        self
    }

    /// Encode and append one command
    pub fn write_command<A: AsRef<[u8]>>(&mut self, command: &str, args: &[A]) -> &mut Self {
        WireCodec::encode_into(&mut self.outgoing, command, args);
        self.commands += 1;
        self
    }

    pub fn get<K: AsRef<[u8]>>(&mut self, key: K) -> &mut Self {
        self.write_command("GET", &[key.as_ref()])
    }

    /// `SET key value`, or `SETEX key seconds value` when a non-zero expiry
    /// is given
    pub fn set<K, V>(&mut self, key: K, value: V, expire_secs: Option<u64>) -> &mut Self
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        // Zero means no expiry, as servers reject `SETEX key 0`
        match expire_secs.filter(|&secs| secs > 0) {
            Some(secs) => {
                let secs = secs.to_string();
                self.write_command("SETEX", &[key.as_ref(), secs.as_bytes(), value.as_ref()])
            }
            None => self.write_command("SET", &[key.as_ref(), value.as_ref()]),
        }
    }

    pub fn mget<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> &mut Self {
        self.write_command("MGET", keys)
    }

    /// Pull the next reply; error frames surface as [`RedshardError::Remote`]
    pub fn next_reply(&mut self) -> RedshardResult<Reply> {
        match self.next_raw_reply()? {
            Reply::Error(message) => Err(RedshardError::remote(&message)),
            reply => Ok(reply),
        }
    }

    /// Pull the next reply, returning error frames as values
    ///
    /// Multibulk children count as owed pulls of their parent command.
    /// Pulling past the last written command fails with `BatchExhausted`;
    /// pulling a reply that never arrived fails with the recorded transport
    /// failure, or with `Timeout` if there is none.
    pub fn next_raw_reply(&mut self) -> RedshardResult<Reply> {
        if self.owed_children == 0 {
            if self.pulled >= self.commands {
                return Err(RedshardError::BatchExhausted {
                    written: self.commands,
                });
            }
            if self.pulled >= self.received {
                return Err(self.missing_reply_error());
            }
        }

        let reply = WireCodec::decode_next(&self.incoming, &mut self.cursor)?
            .ok_or_else(|| RedshardError::protocol("reply truncated inside a complete frame"))?;

        if self.owed_children == 0 {
            self.pulled += 1;
        } else {
            self.owed_children -= 1;
        }
        self.owed_children += reply.child_count();

        Ok(reply)
    }

    fn missing_reply_error(&self) -> RedshardError {
        match &self.failure {
            Some(failure) => failure.clone(),
            None => RedshardError::timeout(format!(
                "reply {} of {} not received",
                self.pulled + 1,
                self.commands
            )),
        }
    }

    pub fn commands_written(&self) -> usize {
        self.commands
    }

    pub fn replies_received(&self) -> usize {
        self.received
    }

    /// Every written command has a complete reply
    pub fn is_complete(&self) -> bool {
        self.received >= self.commands
    }

    pub fn failure(&self) -> Option<&RedshardError> {
        self.failure.as_ref()
    }

    pub(crate) fn pending_bytes(&self) -> &[u8] {
        &self.outgoing
    }

    pub(crate) fn mark_flushed(&mut self) {
        self.outgoing.clear();
    }

    pub(crate) fn receive_buffer(&mut self) -> &mut BytesMut {
        if self.incoming.capacity() - self.incoming.len() < READ_CHUNK / 4 {
            self.incoming.reserve(READ_CHUNK);
        }
        &mut self.incoming
    }

    /// Count the complete replies that arrived since the last scan
    ///
    /// Resumes inside a partially received multibulk instead of rescanning
    /// it from its header.
    pub(crate) fn scan_received(&mut self) -> RedshardResult<()> {
        while self.received < self.commands {
            if self.scan_owed == 0 {
                self.scan_owed = 1;
            }
            let Some((next, children)) = WireCodec::skip_frame(&self.incoming, self.scan_pos)?
            else {
                break;
            };
            self.scan_pos = next;
            self.scan_owed = WireCodec::owed_after(self.scan_owed, children)?;
            if self.scan_owed == 0 {
                self.received += 1;
            }
        }
        Ok(())
    }

    pub(crate) fn record_failure(&mut self, failure: RedshardError) {
        self.failure = Some(failure);
    }
}
