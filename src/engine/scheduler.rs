//! Cooperative scheduler
//!
//! The [`Scheduler`] owns the command queue and drives it from a single
//! thread. Each turn it registers new sockets with a mio poll, polls once
//! with a timeout bounded by the nearest pending deadline, then walks the
//! queue exactly once: every eligible command runs one `execute` step and
//! goes to the back of the queue if it is still pending.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::{Rc, Weak};
use std::time::Duration;

use mio::{Events, Poll, Token};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::command::{Command, CommandId, CommandStatus, Cuid, Wait};
use super::stats::TransferStats;
use crate::cli::Config;
use crate::error::{Result, TransferError};
use crate::net::Connection;

/// Longest a single poll may block
const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Engine state visible to commands while they execute
#[derive(Debug)]
pub struct EngineContext {
    config: Rc<Config>,
    next_id: u64,
    spawned: Vec<Box<dyn Command>>,
    stats: TransferStats,
    halt: bool,
}

impl EngineContext {
    /// Create a context; command ids start at 1
    pub fn new(config: Rc<Config>) -> Self {
        Self {
            config,
            next_id: 1,
            spawned: Vec::new(),
            stats: TransferStats::new(),
            halt: false,
        }
    }

    /// Issue the next process-unique command id
    pub fn next_command_id(&mut self) -> CommandId {
        let id = CommandId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Append a new command to the queue after the current pass
    pub fn push_command(&mut self, command: Box<dyn Command>) {
        trace!("{} - Queued {}", command.cuid(), command.name());
        self.spawned.push(command);
    }

    /// Commands pushed since the last drain
    pub fn spawned(&self) -> &[Box<dyn Command>] {
        &self.spawned
    }

    pub(crate) fn take_spawned(&mut self) -> Vec<Box<dyn Command>> {
        std::mem::take(&mut self.spawned)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_handle(&self) -> Rc<Config> {
        self.config.clone()
    }

    /// Aggregate upload speed in bytes per second
    pub fn upload_speed(&self) -> u64 {
        self.stats.upload_speed()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut TransferStats {
        &mut self.stats
    }

    /// Stop the run loop after the current turn
    pub fn request_halt(&mut self) {
        self.halt = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halt
    }
}

/// A session aborted by a fatal configuration error
#[derive(Debug)]
pub struct SessionFailure {
    pub cuid: Cuid,
    pub command: &'static str,
    pub error: TransferError,
}

/// Single-threaded cooperative command scheduler
pub struct Scheduler {
    ctx: EngineContext,
    queue: VecDeque<Box<dyn Command>>,
    poll: Poll,
    events: Events,
    sockets: HashMap<Token, Weak<RefCell<Connection>>>,
    next_token: usize,
    failures: Vec<SessionFailure>,
}

impl Scheduler {
    /// Create a scheduler with an empty queue
    pub fn new(config: Config) -> Result<Self> {
        let poll = Poll::new()
            .map_err(|e| TransferError::network_error("Failed to create readiness poll", e))?;
        Ok(Self {
            ctx: EngineContext::new(Rc::new(config)),
            queue: VecDeque::new(),
            poll,
            events: Events::with_capacity(256),
            sockets: HashMap::new(),
            next_token: 0,
            failures: Vec::new(),
        })
    }

    /// Append a command to the back of the queue
    pub fn push(&mut self, command: Box<dyn Command>) {
        self.queue.push_back(command);
    }

    /// Issue the next process-unique command id
    pub fn next_command_id(&mut self) -> CommandId {
        self.ctx.next_command_id()
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut EngineContext {
        &mut self.ctx
    }

    /// Number of queued commands
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Names of the queued commands, front to back
    pub fn queued_names(&self) -> Vec<&'static str> {
        self.queue.iter().map(|c| c.name()).collect()
    }

    /// Sessions aborted by fatal configuration errors
    pub fn failures(&self) -> &[SessionFailure] {
        &self.failures
    }

    /// Run turns until the queue is empty or a command requested a halt
    pub fn run(&mut self) -> Result<()> {
        debug!("Scheduler started with {} commands", self.queue.len());
        while !self.queue.is_empty() && !self.ctx.is_halted() {
            self.run_once()?;
        }
        debug!("Scheduler stopped, {} commands left", self.queue.len());
        Ok(())
    }

    /// Run one turn: poll once, then give every eligible command one step
    pub fn run_once(&mut self) -> Result<()> {
        self.enqueue_spawned();
        let waits: Vec<Wait> = self.queue.iter().map(|c| c.wait()).collect();
        self.register_sockets(&waits)?;

        let now = Instant::now();
        let upload_speed = self.ctx.upload_speed();
        let timeout = if waits.iter().any(|w| w.is_ready(now, upload_speed)) {
            Duration::ZERO
        } else {
            waits
                .iter()
                .filter_map(|w| w.deadline)
                .min()
                .map(|d| d.saturating_duration_since(now))
                .unwrap_or(MAX_POLL_TIMEOUT)
                .min(MAX_POLL_TIMEOUT)
        };
        self.poll_sockets(timeout)?;

        let mut remaining = self.queue.len();
        while remaining > 0 {
            let Some(mut command) = self.queue.pop_front() else {
                break;
            };
            remaining -= 1;

            if !command.wait().is_ready(Instant::now(), self.ctx.upload_speed()) {
                self.queue.push_back(command);
                continue;
            }

            match command.execute(&mut self.ctx) {
                Ok(CommandStatus::Pending) => self.queue.push_back(command),
                Ok(CommandStatus::Finished) => {
                    trace!("{} - {} finished", command.cuid(), command.name());
                }
                Err(e) => {
                    remaining -= self.abort(command, e, remaining);
                }
            }
            self.enqueue_spawned();
        }
        Ok(())
    }

    fn enqueue_spawned(&mut self) {
        self.queue.extend(self.ctx.take_spawned());
    }

    /// Run the abort hook of a failed command; session-fatal errors take
    /// every command sharing its cuid down too. Returns how many of the
    /// not-yet-visited commands of this pass were removed.
    fn abort(&mut self, mut command: Box<dyn Command>, err: TransferError, remaining: usize) -> usize {
        let cuid = command.cuid();
        if !err.is_session_fatal() {
            warn!("{} - {} aborted: {}", cuid, command.name(), err);
            command.on_abort(&mut self.ctx, &err);
            return 0;
        }

        error!("{} - {} failed, aborting session: {}", cuid, command.name(), err);
        command.on_abort(&mut self.ctx, &err);

        let mut removed_unvisited = 0;
        let mut kept = VecDeque::with_capacity(self.queue.len());
        let mut siblings = Vec::new();
        for (index, queued) in self.queue.drain(..).enumerate() {
            if queued.cuid() == cuid {
                if index < remaining {
                    removed_unvisited += 1;
                }
                siblings.push(queued);
            } else {
                kept.push_back(queued);
            }
        }
        self.queue = kept;

        let (same_session, others): (Vec<_>, Vec<_>) = self
            .ctx
            .take_spawned()
            .into_iter()
            .partition(|c| c.cuid() == cuid);
        self.ctx.spawned = others;
        siblings.extend(same_session);

        for mut sibling in siblings {
            debug!("{} - Aborting {} with its session", cuid, sibling.name());
            sibling.on_abort(&mut self.ctx, &err);
        }

        self.failures.push(SessionFailure {
            cuid,
            command: command.name(),
            error: err,
        });
        removed_unvisited
    }

    fn register_sockets(&mut self, waits: &[Wait]) -> Result<()> {
        for socket in waits.iter().filter_map(|w| w.socket.as_ref()) {
            let mut conn = socket.borrow_mut();
            if !conn.needs_registration() {
                continue;
            }
            let token = Token(self.next_token);
            self.next_token += 1;
            conn.register(self.poll.registry(), token)
                .map_err(|e| TransferError::network_error("Failed to register socket", e))?;
            trace!("Registered socket {:?} as {:?}", conn.peer_addr(), token);
            self.sockets.insert(token, Rc::downgrade(socket));
        }
        Ok(())
    }

    /// Runs even with nothing registered: the poll is also the turn's sleep.
    fn poll_sockets(&mut self, timeout: Duration) -> Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(TransferError::network_error("Readiness poll failed", e)),
        }

        for event in self.events.iter() {
            let Some(socket) = self.sockets.get(&event.token()).and_then(Weak::upgrade) else {
                continue;
            };
            let failed = event.is_error();
            socket.borrow_mut().mark_ready(
                event.is_readable() || event.is_read_closed() || failed,
                event.is_writable() || event.is_write_closed() || failed,
            );
        }
        self.sockets.retain(|_, socket| socket.strong_count() > 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingCommand {
        id: CommandId,
        cuid: Cuid,
        runs_left: usize,
        log: Rc<RefCell<Vec<u64>>>,
        aborts: Rc<RefCell<Vec<u64>>>,
        fail_with: Option<fn() -> TransferError>,
    }

    impl CountingCommand {
        fn boxed(
            ctx: &mut EngineContext,
            cuid: u64,
            runs: usize,
            log: &Rc<RefCell<Vec<u64>>>,
            aborts: &Rc<RefCell<Vec<u64>>>,
        ) -> Box<dyn Command> {
            Box::new(Self {
                id: ctx.next_command_id(),
                cuid: Cuid(cuid),
                runs_left: runs,
                log: log.clone(),
                aborts: aborts.clone(),
                fail_with: None,
            })
        }
    }

    impl Command for CountingCommand {
        fn id(&self) -> CommandId {
            self.id
        }

        fn cuid(&self) -> Cuid {
            self.cuid
        }

        fn name(&self) -> &'static str {
            "CountingCommand"
        }

        fn execute(&mut self, _ctx: &mut EngineContext) -> Result<CommandStatus> {
            self.log.borrow_mut().push(self.cuid.0);
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            self.runs_left -= 1;
            if self.runs_left == 0 {
                Ok(CommandStatus::Finished)
            } else {
                Ok(CommandStatus::Pending)
            }
        }

        fn on_abort(&mut self, _ctx: &mut EngineContext, _error: &TransferError) {
            self.aborts.borrow_mut().push(self.cuid.0);
        }
    }

    fn bad_frame() -> TransferError {
        TransferError::protocol_error("bad frame")
    }

    fn unsupported_scheme() -> TransferError {
        TransferError::unsupported_protocol("gopher")
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(Config::default()).unwrap()
    }

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let mut sched = scheduler();
        let a = sched.next_command_id();
        let b = sched.next_command_id();
        assert!(b > a);
    }

    #[test]
    fn test_round_robin_order() {
        let mut sched = scheduler();
        let log = Rc::new(RefCell::new(Vec::new()));
        let aborts = Rc::new(RefCell::new(Vec::new()));
        let a = CountingCommand::boxed(sched.context_mut(), 1, 2, &log, &aborts);
        let b = CountingCommand::boxed(sched.context_mut(), 2, 1, &log, &aborts);
        let c = CountingCommand::boxed(sched.context_mut(), 3, 2, &log, &aborts);
        sched.push(a);
        sched.push(b);
        sched.push(c);

        sched.run_once().unwrap();
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert_eq!(sched.pending(), 2);

        sched.run().unwrap();
        assert_eq!(*log.borrow(), vec![1, 2, 3, 1, 3]);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_abort_runs_hook_and_drops_command() {
        let mut sched = scheduler();
        let log = Rc::new(RefCell::new(Vec::new()));
        let aborts = Rc::new(RefCell::new(Vec::new()));
        let failing = CountingCommand {
            id: sched.next_command_id(),
            cuid: Cuid(9),
            runs_left: 5,
            log: log.clone(),
            aborts: aborts.clone(),
            fail_with: Some(bad_frame),
        };
        sched.push(Box::new(failing));
        let other = CountingCommand::boxed(sched.context_mut(), 9, 2, &log, &aborts);
        sched.push(other);

        sched.run_once().unwrap();
        assert_eq!(*aborts.borrow(), vec![9]);
        assert_eq!(sched.pending(), 1);
        assert!(sched.failures().is_empty());
    }

    #[test]
    fn test_session_fatal_error_aborts_siblings() {
        let mut sched = scheduler();
        let log = Rc::new(RefCell::new(Vec::new()));
        let aborts = Rc::new(RefCell::new(Vec::new()));
        let failing = CountingCommand {
            id: sched.next_command_id(),
            cuid: Cuid(4),
            runs_left: 1,
            log: log.clone(),
            aborts: aborts.clone(),
            fail_with: Some(unsupported_scheme),
        };
        sched.push(Box::new(failing));
        let sibling = CountingCommand::boxed(sched.context_mut(), 4, 3, &log, &aborts);
        let stranger = CountingCommand::boxed(sched.context_mut(), 5, 1, &log, &aborts);
        sched.push(sibling);
        sched.push(stranger);

        sched.run_once().unwrap();
        assert_eq!(*log.borrow(), vec![4, 5]);
        assert_eq!(*aborts.borrow(), vec![4, 4]);
        assert_eq!(sched.pending(), 0);
        assert_eq!(sched.failures().len(), 1);
        assert_eq!(sched.failures()[0].cuid, Cuid(4));
    }

    struct Sleeper {
        id: CommandId,
        until: Instant,
        ran: Rc<RefCell<bool>>,
    }

    impl Command for Sleeper {
        fn id(&self) -> CommandId {
            self.id
        }
        fn cuid(&self) -> Cuid {
            Cuid(1)
        }
        fn name(&self) -> &'static str {
            "Sleeper"
        }
        fn wait(&self) -> Wait {
            Wait::until(self.until)
        }
        fn execute(&mut self, _ctx: &mut EngineContext) -> Result<CommandStatus> {
            *self.ran.borrow_mut() = true;
            Ok(CommandStatus::Finished)
        }
    }

    #[test]
    fn test_turn_sleeps_until_deadline_without_sockets() {
        let mut sched = scheduler();
        let ran = Rc::new(RefCell::new(false));
        let id = sched.next_command_id();
        let started = std::time::Instant::now();
        sched.push(Box::new(Sleeper {
            id,
            until: Instant::now() + Duration::from_millis(200),
            ran: ran.clone(),
        }));

        let mut turns = 0;
        while sched.pending() > 0 {
            sched.run_once().unwrap();
            turns += 1;
            assert!(turns <= 3, "scheduler spun {} turns before the deadline", turns);
        }
        assert!(*ran.borrow());
        assert!(started.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_gates_execution() {
        let mut sched = scheduler();
        let ran = Rc::new(RefCell::new(false));
        let id = sched.next_command_id();
        sched.push(Box::new(Sleeper {
            id,
            until: Instant::now() + Duration::from_secs(30),
            ran: ran.clone(),
        }));

        sched.run_once().unwrap();
        assert!(!*ran.borrow());
        assert_eq!(sched.pending(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        sched.run_once().unwrap();
        assert!(*ran.borrow());
        assert_eq!(sched.pending(), 0);
    }
}
