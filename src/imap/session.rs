//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Quillmap.
//
// Quillmap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Quillmap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Quillmap. If not, see <http://www.gnu.org/licenses/>.

//! The per-connection protocol loop.
//!
//! A `Session` owns one connection's `RequestParser` and `CommandThrottle`
//! and drives them from a `Transport`. Everything it produces is written to
//! the transport in the order the commands arrived. Commands themselves are
//! carried out by a `Dispatcher`; the session only gates them (request rate
//! limits, repeat throttling, per-account serialisation) and keeps the
//! selected folder's snapshot paged in or out of the `FolderCaches`.

use std::collections::HashSet;
use std::io::{self, BufWriter, Read, Write};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::account_lock::{AccountLockGuard, AccountLocks};
use super::command::Command;
use super::dispatch::Dispatcher;
use super::literal::LiteralStore;
use super::rate_limit::RequestRateLimits;
use super::request_parser::{ParserLimits, Poll, RequestParser};
use super::throttle::CommandThrottle;
use crate::folder_cache::{FolderCaches, FolderKey, FolderSnapshot, Partition};
use crate::support::error::{Error, TaggedError, ThrottleReason};
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SystemConfig;

const READ_BUFFER_SIZE: usize = 65536;

/// What a single read from the transport produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    /// Nothing arrived within the transport's tick interval.
    Idle,
    Eof,
}

/// The byte stream of one connection.
pub trait Transport {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;
    /// Write one response line. The line ending is added here.
    fn write_line(&mut self, line: &str) -> io::Result<()>;
    /// Write a `+` continuation line and flush.
    fn send_continuation(&mut self, text: &str) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// A `Transport` over a blocking reader and writer, such as the two halves
/// of a `TcpStream` with a read timeout set.
///
/// Reads which time out are reported as `Idle`.
pub struct StreamTransport<R, W: Write> {
    read: R,
    write: BufWriter<W>,
}

impl<R: Read, W: Write> StreamTransport<R, W> {
    pub fn new(read: R, write: W) -> Self {
        StreamTransport {
            read,
            write: BufWriter::new(write),
        }
    }
}

impl<R: Read, W: Write> Transport for StreamTransport<R, W> {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        loop {
            match self.read.read(buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(e) if io::ErrorKind::Interrupted == e.kind() => continue,
                Err(e)
                    if io::ErrorKind::WouldBlock == e.kind()
                        || io::ErrorKind::TimedOut == e.kind() =>
                {
                    return Ok(ReadOutcome::Idle)
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.write.write_all(line.as_bytes())?;
        self.write.write_all(b"\r\n")
    }

    fn send_continuation(&mut self, text: &str) -> io::Result<()> {
        write!(self.write, "+ {}\r\n", text)?;
        self.write.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write.flush()
    }
}

/// The process-wide state every session shares.
#[derive(Clone)]
pub struct SessionServices {
    pub config: Arc<SystemConfig>,
    pub locks: Arc<AccountLocks>,
    pub rates: Arc<RequestRateLimits>,
    pub caches: FolderCaches,
    pub literals: LiteralStore,
}

impl SessionServices {
    /// Build the shared state described by `config`, opening (and sweeping)
    /// the folder cache.
    pub fn from_config(config: SystemConfig) -> Result<Self, Error> {
        let caches = FolderCaches::from_config(&config.cache)?;
        let locks = Arc::new(AccountLocks::new(
            Duration::from_millis(config.throttle.account_lock_timeout_ms),
            Duration::from_secs(config.throttle.account_lock_idle_expiry_secs),
        ));
        let spool_dir = if config.limits.spool_dir.as_os_str().is_empty() {
            None
        } else {
            Some(config.limits.spool_dir.clone())
        };
        let literals = LiteralStore::new(
            spool_dir,
            config.limits.spool_threshold,
            config.limits.max_literal_size,
        );

        Ok(SessionServices {
            rates: Arc::new(RequestRateLimits::new(&config.throttle)),
            config: Arc::new(config),
            locks,
            caches,
            literals,
        })
    }
}

struct Selected {
    key: FolderKey,
    /// `None` while paged out to the active partition.
    snapshot: Option<FolderSnapshot>,
    /// Whether the snapshot was changed without the key being changed.
    modified: bool,
}

/// The outcome of bringing a paged-out folder back into memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageIn {
    /// Nothing was paged out.
    Resident,
    Restored,
    /// The snapshot was no longer cached; the folder has been deselected.
    Lost,
}

/// The connection state visible to the dispatcher.
pub struct SessionContext {
    peer: String,
    pub log_prefix: LogPrefix,
    caches: FolderCaches,
    account: Option<String>,
    selected: Option<Selected>,
    logged_out: bool,
}

impl SessionContext {
    pub fn new(peer: String, caches: FolderCaches) -> Self {
        SessionContext {
            log_prefix: LogPrefix::new(peer.clone()),
            peer,
            caches,
            account: None,
            selected: None,
            logged_out: false,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Record that the connection is now authenticated as `account`.
    pub fn authenticate(&mut self, account: String) {
        self.log_prefix.set_user(account.clone());
        info!("{} Authenticated", self.log_prefix);
        self.account = Some(account);
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    /// Select the folder identified by `key`, deselecting any other.
    ///
    /// The snapshot is taken from the caches if available, and otherwise
    /// built by `build`.
    pub fn select_folder(
        &mut self,
        key: FolderKey,
        build: impl FnOnce() -> FolderSnapshot,
    ) -> &FolderSnapshot {
        self.deselect_folder();

        let snapshot = match self.caches.load(&key) {
            Some(snapshot) => {
                debug!("{} Restored {} from cache", self.log_prefix, key);
                snapshot
            }
            None => build(),
        };

        self.log_prefix.set_mailbox(Some(key.mailbox.clone()));
        self.selected
            .insert(Selected {
                key,
                snapshot: None,
                modified: false,
            })
            .snapshot
            .insert(snapshot)
    }

    /// Deselect the current folder, if any, storing its snapshot in the
    /// inactive partition for the next session to select it.
    pub fn deselect_folder(&mut self) {
        if PageIn::Lost == self.restore() {
            return;
        }

        if let Some(selected) = self.selected.take() {
            if let Some(ref snapshot) = selected.snapshot {
                // Cache entries are never overwritten in place
                if selected.modified {
                    self.caches.invalidate(&selected.key);
                }
                self.caches
                    .store(Partition::Inactive, &selected.key, snapshot);
            }
            self.log_prefix.set_mailbox(None);
        }
    }

    /// Write the selected folder's snapshot to the active partition and drop
    /// it from memory. Returns whether anything was paged out.
    pub fn page_out(&mut self) -> bool {
        let selected = match self.selected {
            Some(ref mut selected) => selected,
            None => return false,
        };

        match selected.snapshot.take() {
            Some(snapshot) => {
                if selected.modified {
                    self.caches.invalidate(&selected.key);
                }
                self.caches
                    .store(Partition::Active, &selected.key, &snapshot);
                debug!("{} Paged out {}", self.log_prefix, selected.key);
                true
            }
            None => false,
        }
    }

    /// Bring the selected folder's snapshot back into memory if it was paged
    /// out.
    ///
    /// The entry is removed from the active partition, so the next page-out
    /// writes the snapshot as it is then.
    pub fn restore(&mut self) -> PageIn {
        let selected = match self.selected {
            Some(ref mut selected) if selected.snapshot.is_none() => selected,
            _ => return PageIn::Resident,
        };

        match self.caches.take(Partition::Active, &selected.key) {
            Some(snapshot) => {
                debug!("{} Paged in {}", self.log_prefix, selected.key);
                selected.snapshot = Some(snapshot);
                PageIn::Restored
            }
            None => {
                warn!(
                    "{} Paged-out state of {} was lost",
                    self.log_prefix, selected.key
                );
                self.selected = None;
                self.log_prefix.set_mailbox(None);
                PageIn::Lost
            }
        }
    }

    pub fn selected_key(&self) -> Option<&FolderKey> {
        self.selected.as_ref().map(|s| &s.key)
    }

    pub fn snapshot(&self) -> Option<&FolderSnapshot> {
        self.selected.as_ref().and_then(|s| s.snapshot.as_ref())
    }

    /// Access the snapshot for modification.
    ///
    /// After changing it, the caller should give the selection a new
    /// discriminator with `set_discriminator`. If it does not, the entry
    /// cached under the old key is replaced when the folder is deselected.
    pub fn snapshot_mut(&mut self) -> Option<&mut FolderSnapshot> {
        let selected = self.selected.as_mut()?;
        let snapshot = selected.snapshot.as_mut()?;
        selected.modified = true;
        Some(snapshot)
    }

    /// Change the discriminator of the selected folder's key, typically
    /// after the snapshot changed. Returns false if nothing is selected.
    pub fn set_discriminator(
        &mut self,
        discriminator: impl Into<String>,
    ) -> bool {
        match self.selected {
            Some(ref mut selected) => {
                selected.key.discriminator = discriminator.into();
                selected.modified = false;
                true
            }
            None => false,
        }
    }

    pub fn is_paged_out(&self) -> bool {
        self.selected
            .as_ref()
            .map_or(false, |s| s.snapshot.is_none())
    }

    pub fn logout(&mut self) {
        self.logged_out = true;
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out
    }
}

pub struct Session<T, D> {
    transport: T,
    dispatcher: D,
    parser: RequestParser,
    throttle: CommandThrottle,
    throttle_exempt: bool,
    peer_ip: Option<IpAddr>,
    services: SessionServices,
    expensive: HashSet<String>,
    ctx: SessionContext,

    consecutive_errors: u32,
    last_activity: Instant,
    said_bye: bool,
}

impl<T: Transport, D: Dispatcher> Session<T, D> {
    pub fn new(
        transport: T,
        dispatcher: D,
        services: SessionServices,
        peer: String,
        peer_ip: Option<IpAddr>,
    ) -> Self {
        let config = &services.config;
        let parser = RequestParser::new(
            services.literals.clone(),
            ParserLimits {
                max_request_size: config.limits.max_request_size,
                max_line_length: config.limits.max_line_length,
            },
        );
        let throttle = CommandThrottle::new(&config.throttle);
        let throttle_exempt =
            peer_ip.map_or(false, |ip| throttle.is_exempt(ip));
        let expensive = config
            .throttle
            .expensive_commands
            .iter()
            .map(|v| v.to_ascii_uppercase())
            .collect();
        let ctx = SessionContext::new(peer, services.caches.clone());

        Session {
            transport,
            dispatcher,
            parser,
            throttle,
            throttle_exempt,
            peer_ip,
            services,
            expensive,
            ctx,
            consecutive_errors: 0,
            last_activity: Instant::now(),
            said_bye: false,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Run the session until the client logs out, the connection closes or
    /// fails, or the session gives up on the client.
    ///
    /// Whichever way it ends, any partial command is discarded (including
    /// spooled literals) and the selected folder is written back to the
    /// caches.
    pub fn run(&mut self) -> Result<(), Error> {
        info!("{} Connection established", self.ctx.log_prefix);
        let result = self.run_loop();

        self.parser.abort();
        self.ctx.deselect_folder();
        match result {
            Ok(()) => info!("{} Connection closed", self.ctx.log_prefix),
            Err(ref e) => {
                warn!("{} Connection terminated: {}", self.ctx.log_prefix, e)
            }
        }
        result
    }

    fn run_loop(&mut self) -> Result<(), Error> {
        let greeting = format!("* OK {}", self.services.config.server.greeting);
        self.transport.write_line(&greeting)?;
        self.transport.flush()?;

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        while !self.said_bye && !self.ctx.is_logged_out() {
            match self.parser.poll() {
                Poll::NeedInput => {
                    self.transport.flush()?;
                    let want = self.parser.wanted().min(buf.len());
                    match self.transport.read_chunk(&mut buf[..want])? {
                        ReadOutcome::Data(n) => {
                            self.last_activity = Instant::now();
                            self.parser.feed(&buf[..n]);
                        }
                        ReadOutcome::Idle => self.on_idle()?,
                        ReadOutcome::Eof => {
                            return if self.parser.is_between_commands() {
                                Ok(())
                            } else {
                                Err(Error::ConnectionTerminated)
                            };
                        }
                    }
                }

                Poll::Continuation => {
                    self.transport.send_continuation("Ready for literal data")?
                }

                Poll::Rejected(error) => {
                    info!(
                        "{} Rejected command: {}",
                        self.ctx.log_prefix, error.error
                    );
                    self.transport.write_line(&error.response_line())?;
                    self.count_result(false)?;
                }

                Poll::Command(command) => self.handle_command(command)?,
            }
        }

        self.transport.flush()?;
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> Result<(), Error> {
        debug!("{} >> {}", self.ctx.log_prefix, command);

        if PageIn::Lost == self.ctx.restore() {
            self.transport
                .write_line("* OK [CLOSED] Mailbox state was lost")?;
        }

        if !self.throttle_exempt {
            if let Err(error) =
                self.services.rates.check(self.ctx.account(), self.peer_ip)
            {
                let error = TaggedError::new(Some(command.tag.clone()), error);
                self.transport.write_line(&error.response_line())?;
                return self.count_result(false);
            }
        }

        if !self.throttle_exempt && self.throttle.should_throttle(&command) {
            warn!(
                "{} Throttling repeated {}",
                self.ctx.log_prefix,
                command.full_verb()
            );
            let error = TaggedError::new(
                Some(command.tag.clone()),
                Error::Throttled(ThrottleReason::RepeatedCommand(
                    command.verb.clone(),
                )),
            );
            self.transport.write_line(&error.response_line())?;
            return self.count_result(false);
        }

        let _guard = match self.take_account_lock(&command) {
            Ok(guard) => guard,
            Err(error) => {
                let error = TaggedError::new(Some(command.tag.clone()), error);
                self.transport.write_line(&error.response_line())?;
                return self.count_result(false);
            }
        };

        let tag = command.tag.clone();
        let lines = self.dispatcher.dispatch(command, &mut self.ctx);
        let failed = lines.last().map_or(false, |line| {
            line.strip_prefix(tag.as_str())
                .map_or(false, |rest| {
                    rest.starts_with(" NO") || rest.starts_with(" BAD")
                })
        });

        for line in &lines {
            self.transport.write_line(line)?;
        }
        self.count_result(!failed)
    }

    fn take_account_lock(
        &self,
        command: &Command,
    ) -> Result<Option<AccountLockGuard>, Error> {
        if !self.services.config.throttle.serialize_expensive
            || !self.expensive.contains(&command.verb)
        {
            return Ok(None);
        }

        let account = match self.ctx.account() {
            Some(account) => account,
            None => return Ok(None),
        };
        let guard = self.services.locks.acquire(account)?;
        debug!(
            "{} Holding lock of {} for {}",
            self.ctx.log_prefix,
            guard.account(),
            command.verb
        );
        Ok(Some(guard))
    }

    /// Track runs of failed commands, saying BYE once the configured limit is
    /// reached.
    fn count_result(&mut self, ok: bool) -> Result<(), Error> {
        if ok {
            self.consecutive_errors = 0;
            return Ok(());
        }

        self.consecutive_errors += 1;
        let limit = self.services.config.session.max_consecutive_errors;
        if limit > 0 && self.consecutive_errors >= limit {
            warn!(
                "{} Closing after {} consecutive errors",
                self.ctx.log_prefix, self.consecutive_errors
            );
            self.say_bye("Too many consecutive errors")?;
        }
        Ok(())
    }

    fn on_idle(&mut self) -> Result<(), Error> {
        let idle = self.last_activity.elapsed();
        let config = &self.services.config.session;

        if config.idle_timeout_secs > 0
            && idle >= Duration::from_secs(config.idle_timeout_secs)
        {
            info!("{} Idle timeout", self.ctx.log_prefix);
            return self.say_bye("Idle timeout");
        }

        if config.page_out_after_secs > 0
            && idle >= Duration::from_secs(config.page_out_after_secs)
        {
            self.ctx.page_out();
        }

        Ok(())
    }

    fn say_bye(&mut self, text: &str) -> Result<(), Error> {
        self.transport.write_line(&format!("* BYE {}", text))?;
        self.transport.flush()?;
        self.said_bye = true;
        Ok(())
    }
}
