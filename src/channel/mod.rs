//! Buffered, access-controlled channels over raw transports.
//!
//! A [`Channel`] wraps one [`ChannelIO`] and adds line sending, incremental
//! expect-matching against [`BoundedPattern`]s, prompt detection, death-string
//! monitoring, a write blacklist for control characters, and single-owner
//! access arbitration (`borrow()`/`take()`).

mod buffer;
mod interactive;
mod io;
mod pattern;
mod pty;
mod serial;
mod ssh;

pub(crate) use interactive::local_termsize;
pub use io::{ChannelIO, NullChannelIO, READ_CHUNK_SIZE};
pub use pattern::{BoundedPattern, ExpectMatch};
pub use pty::PtyChannelIO;
pub use serial::SerialChannelIO;
pub use ssh::{SshAuth, SshChannelIO};

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use memchr::memchr;

use crate::error::{ChannelError, Result};

use buffer::ReceiveBuffer;

/// Control characters known to mess up the state of a POSIX shell.
///
/// ETX, EOT, XON, DC2, XOFF, DC4, NAK, SYN, ETB, SUB, FS and DEL.
pub const POSIX_WRITE_BLACKLIST: &[u8] = &[
    0x03, 0x04, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x1a, 0x1c, 0x7f,
];

struct ChannelInner {
    io: Box<dyn ChannelIO>,
    buf: ReceiveBuffer,
    prompt: Option<BoundedPattern>,
    /// Registered death patterns, keyed by registration token so guards can
    /// unregister their own pattern in any drop order.
    death_patterns: Vec<(u64, BoundedPattern)>,
    next_death_token: u64,
    write_blacklist: Vec<u8>,
}

/// Shared access bookkeeping for all handles over one transport.
struct AccessState {
    taken: Cell<bool>,
    borrow_depth: Cell<u32>,
}

enum HandleKind {
    /// Owns the transport; closes it on drop unless taken.
    Root,
    /// A borrow delegate; restores the parent on drop.
    Borrow,
}

/// The buffered, access-controlled wrapper around one transport.
pub struct Channel {
    inner: Rc<RefCell<ChannelInner>>,
    access: Rc<AccessState>,
    level: u32,
    kind: HandleKind,
}

impl Channel {
    /// Wrap a raw transport in a new root channel.
    pub fn new(io: Box<dyn ChannelIO>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ChannelInner {
                io,
                buf: ReceiveBuffer::new(),
                prompt: None,
                death_patterns: Vec::new(),
                next_death_token: 0,
                write_blacklist: Vec::new(),
            })),
            access: Rc::new(AccessState {
                taken: Cell::new(false),
                borrow_depth: Cell::new(0),
            }),
            level: 0,
            kind: HandleKind::Root,
        }
    }

    /// A new channel with the POSIX shell control-character blacklist.
    pub fn new_posix(io: Box<dyn ChannelIO>) -> Self {
        let ch = Self::new(io);
        ch.inner.borrow_mut().write_blacklist = POSIX_WRITE_BLACKLIST.to_vec();
        ch
    }

    fn check_access(&self) -> Result<()> {
        if self.access.taken.get() {
            return Err(ChannelError::Taken.into());
        }
        if self.access.borrow_depth.get() != self.level {
            return Err(ChannelError::Borrowed.into());
        }
        Ok(())
    }

    fn inner(&self) -> Result<std::cell::RefMut<'_, ChannelInner>> {
        self.check_access()?;
        Ok(self.inner.borrow_mut())
    }

    /// Replace the set of bytes which may not be written verbatim.
    pub fn set_write_blacklist(&self, blacklist: &[u8]) -> Result<()> {
        self.inner()?.write_blacklist = blacklist.to_vec();
        Ok(())
    }

    /// Write raw bytes, refusing any blacklisted byte.
    pub fn send(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let mut inner = self.inner()?;
        let data = data.as_ref();
        if let Some(&bad) = data.iter().find(|b| inner.write_blacklist.contains(b)) {
            return Err(ChannelError::IllegalData(bad).into());
        }
        inner.io.write_all(data)?;
        Ok(())
    }

    /// Write raw bytes, bypassing the blacklist. The explicit override for
    /// deliberate control sequences.
    pub fn send_raw(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.inner()?.io.write_all(data.as_ref())?;
        Ok(())
    }

    /// Send `text` followed by the line terminator.
    ///
    /// With `read_back`, first drain and discard the terminal echo of exactly
    /// the line just written, as a best-effort sync point before collecting
    /// output.
    pub fn sendline(&self, text: impl AsRef<[u8]>, read_back: bool) -> Result<()> {
        let text = text.as_ref();
        {
            let mut inner = self.inner()?;
            if let Some(&bad) = text.iter().find(|b| inner.write_blacklist.contains(b)) {
                return Err(ChannelError::IllegalData(bad).into());
            }
            let mut line = Vec::with_capacity(text.len() + 1);
            line.extend_from_slice(text);
            line.push(b'\n');
            inner.io.write_all(&line)?;
        }
        if read_back && !text.is_empty() {
            // Consume the echoed command and its line terminator.
            self.expect(&[BoundedPattern::literal(text)], None)?;
            self.expect(&[BoundedPattern::literal(b"\n")], None)?;
        }
        Ok(())
    }

    /// Send a single control byte (e.g. `sendcontrol('c')` for ETX),
    /// bypassing the blacklist.
    pub fn sendcontrol(&self, letter: char) -> Result<()> {
        let byte = (letter.to_ascii_uppercase() as u8) ^ 0x40;
        self.send_raw([byte])
    }

    /// Send the interrupt character (Ctrl-C).
    pub fn sendintr(&self) -> Result<()> {
        self.sendcontrol('c')
    }

    /// Read up to `max` bytes, draining buffered bytes first.
    pub fn read(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut inner = self.inner()?;
        if !inner.buf.is_empty() {
            return Ok(inner.buf.consume(max));
        }
        let chunk = inner.io.read(max.min(READ_CHUNK_SIZE), timeout)?;
        Ok(chunk)
    }

    /// Read one decoded line (CRLF-normalized, terminator included).
    pub fn readline(&self, timeout: Option<Duration>) -> Result<String> {
        let mut inner = self.inner()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(pos) = memchr(b'\n', inner.buf.as_slice()) {
                let line = inner.buf.consume(pos + 1);
                return Ok(decode(&line));
            }
            let remaining = remaining_time(deadline, timeout)?;
            let chunk = inner.io.read(READ_CHUNK_SIZE, remaining)?;
            inner.buf.extend(&chunk);
        }
    }

    /// Collect everything that arrives until the deadline expires.
    pub fn read_until_timeout(&self, duration: Duration) -> Result<Vec<u8>> {
        let mut inner = self.inner()?;
        let deadline = Instant::now() + duration;
        let mut collected = inner.buf.take_all();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(collected);
            }
            match inner.io.read(READ_CHUNK_SIZE, Some(deadline - now)) {
                Ok(chunk) => collected.extend_from_slice(&chunk),
                Err(ChannelError::Timeout(_)) => return Ok(collected),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Incrementally read and scan for the first satisfied pattern.
    ///
    /// Reads bounded chunks, appending to the receive buffer, and after every
    /// chunk re-scans the unconsumed tail against every candidate. Only the
    /// tail that a bounded pattern could still span is re-scanned, so the
    /// total work is amortized linear in bytes received.
    ///
    /// Tie-break between simultaneously satisfied patterns: earliest match
    /// position wins, list order breaks ties at equal positions. A registered
    /// death pattern matching at or before the winning position fails the
    /// call with [`ChannelError::DeathString`] instead.
    ///
    /// On timeout the receive buffer is left intact so the caller may retry.
    pub fn expect(
        &self,
        patterns: &[BoundedPattern],
        timeout: Option<Duration>,
    ) -> Result<ExpectMatch> {
        let mut inner = self.inner()?;
        inner.expect(patterns, timeout)
    }

    /// Read everything up to the prompt, consuming through the prompt match.
    ///
    /// Returns the pre-prompt bytes decoded as text with CRLF line endings
    /// normalized. Uses the channel's configured prompt when `prompt` is
    /// `None`.
    pub fn read_until_prompt(
        &self,
        prompt: Option<&BoundedPattern>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let pattern = match prompt {
            Some(p) => p.clone(),
            None => self
                .inner()?
                .prompt
                .clone()
                .ok_or(ChannelError::Unsupported("no prompt configured"))?,
        };
        let m = self.expect(std::slice::from_ref(&pattern), timeout)?;
        Ok(decode(&m.before))
    }

    /// Configure the prompt used by [`read_until_prompt`](Self::read_until_prompt).
    pub fn set_prompt(&self, prompt: Option<BoundedPattern>) -> Result<()> {
        self.inner()?.prompt = prompt;
        Ok(())
    }

    pub fn prompt(&self) -> Result<Option<BoundedPattern>> {
        Ok(self.inner()?.prompt.clone())
    }

    /// Register a death pattern for the duration of the returned guard.
    ///
    /// While registered, any `expect`/read observing the pattern fails with
    /// [`ChannelError::DeathString`] even if the caller was waiting for
    /// something else.
    pub fn with_death_string(&self, pattern: BoundedPattern) -> Result<DeathStringGuard> {
        let token = {
            let mut inner = self.inner()?;
            let token = inner.next_death_token;
            inner.next_death_token += 1;
            inner.death_patterns.push((token, pattern));
            token
        };
        Ok(DeathStringGuard {
            inner: self.inner.clone(),
            token,
        })
    }

    /// Best-effort resize of the remote terminal.
    pub fn resize(&self, columns: u16, lines: u16) -> Result<()> {
        self.inner()?.io.resize(columns, lines)?;
        Ok(())
    }

    /// Whether the underlying transport has ended.
    pub fn is_closed(&self) -> Result<bool> {
        Ok(self.inner()?.io.is_closed())
    }

    /// Close the underlying transport.
    pub fn close(&self) -> Result<()> {
        self.inner()?.io.close()?;
        Ok(())
    }

    /// Temporarily delegate exclusive access to a borrower.
    ///
    /// While the returned guard is alive, every operation on this channel
    /// fails with [`ChannelError::Borrowed`]. Borrows nest; only the
    /// innermost active borrower may operate. Dropping the guard returns
    /// control to the parent.
    pub fn borrow(&self) -> Result<ChannelBorrow> {
        self.check_access()?;
        self.access.borrow_depth.set(self.level + 1);
        Ok(ChannelBorrow {
            ch: Channel {
                inner: self.inner.clone(),
                access: self.access.clone(),
                level: self.level + 1,
                kind: HandleKind::Borrow,
            },
        })
    }

    /// Permanently transfer the transport to a new owner.
    ///
    /// Every existing handle over this channel becomes inert and fails with
    /// [`ChannelError::Taken`] from now on. The returned channel owns the
    /// same transport and receive buffer; no in-flight bytes are lost.
    pub fn take(&self) -> Result<Channel> {
        self.check_access()?;
        self.access.taken.set(true);
        debug!("channel taken by a new owner");
        Ok(Channel {
            inner: self.inner.clone(),
            access: Rc::new(AccessState {
                taken: Cell::new(false),
                borrow_depth: Cell::new(0),
            }),
            level: 0,
            kind: HandleKind::Root,
        })
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        match self.kind {
            HandleKind::Borrow => {
                if !self.access.taken.get() && self.access.borrow_depth.get() == self.level {
                    self.access.borrow_depth.set(self.level - 1);
                }
            }
            HandleKind::Root => {
                if !self.access.taken.get() {
                    let mut inner = self.inner.borrow_mut();
                    if !inner.io.is_closed() {
                        if let Err(e) = inner.io.close() {
                            warn!("failed to close channel transport: {e}");
                        }
                    }
                }
            }
        }
    }
}

/// Scoped delegate produced by [`Channel::borrow`].
pub struct ChannelBorrow {
    ch: Channel,
}

impl std::ops::Deref for ChannelBorrow {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.ch
    }
}

/// Scoped death-pattern registration; unregisters its own pattern on drop,
/// regardless of the order guards are dropped in.
pub struct DeathStringGuard {
    inner: Rc<RefCell<ChannelInner>>,
    token: u64,
}

impl Drop for DeathStringGuard {
    fn drop(&mut self) {
        self.inner
            .borrow_mut()
            .death_patterns
            .retain(|(token, _)| *token != self.token);
    }
}

impl ChannelInner {
    fn expect(
        &mut self,
        patterns: &[BoundedPattern],
        timeout: Option<Duration>,
    ) -> Result<ExpectMatch> {
        let max_len = patterns
            .iter()
            .chain(self.death_patterns.iter().map(|(_, p)| p))
            .map(BoundedPattern::max_len)
            .max()
            .unwrap_or(1);

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut scan_from = 0usize;

        loop {
            let death_hit = self
                .buf
                .find_earliest(self.death_patterns.iter().map(|(_, p)| p), scan_from);
            let hit = self.buf.find_earliest(patterns, scan_from);

            // A death pattern at or before the winning position overrides the
            // ordinary match.
            if let Some(d) = death_hit {
                if hit.is_none_or(|h| d.start <= h.start) {
                    self.buf.discard(d.start);
                    let matched = self.buf.consume(d.end - d.start);
                    debug!(
                        "death string observed: {:?}",
                        String::from_utf8_lossy(&matched)
                    );
                    return Err(ChannelError::DeathString(matched).into());
                }
            }

            if let Some(h) = hit {
                let before = self.buf.consume(h.start);
                let tail_groups = patterns[h.index].captures_at_match(self.buf.as_slice());
                let matched = self.buf.consume(h.end - h.start);
                trace!(
                    "expect matched pattern {} ({:?}) after {} bytes",
                    h.index,
                    patterns[h.index].as_str(),
                    before.len()
                );
                return Ok(ExpectMatch {
                    index: h.index,
                    before,
                    matched,
                    groups: tail_groups,
                });
            }

            let remaining = remaining_time(deadline, timeout)?;
            let prev_len = self.buf.len();
            let chunk = self.io.read(READ_CHUNK_SIZE, remaining)?;
            self.buf.extend(&chunk);
            // A match ending in the new bytes starts at most max_len - 1
            // bytes before the old end; everything earlier was already
            // scanned against these candidates.
            scan_from = prev_len.saturating_sub(max_len - 1);
        }
    }
}

/// Time left before `deadline`, or a timeout error when it has passed.
fn remaining_time(deadline: Option<Instant>, total: Option<Duration>) -> Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                Err(ChannelError::Timeout(total.unwrap_or_default()).into())
            } else {
                Ok(Some(d - now))
            }
        }
    }
}

/// Decode transport bytes as text, normalizing CRLF line endings.
fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace("\r\n", "\n")
}
