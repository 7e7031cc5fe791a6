//! Commands
//!
//! A [`Command`] is one resumable unit of work. The scheduler calls
//! [`Command::execute`] once per turn while the command's [`Wait`] condition
//! is met; the command does a bounded slice of work and reports whether it is
//! finished or must run again.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use super::{Checkpoint, EngineContext};
use crate::error::{Result, TransferError};
use crate::net::SocketHandle;

/// Process-unique command id, issued by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

/// Session id shared by the commands cooperating on one transfer or peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cuid(pub u64);

impl fmt::Display for Cuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CUID#{}", self.0)
    }
}

/// Outcome of one `execute` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Done; the scheduler drops the command
    Finished,
    /// Re-enqueue at the back of the queue
    Pending,
}

/// What a pending command is waiting for.
///
/// The command becomes eligible when any armed condition holds: its socket
/// is ready for the requested direction, its deadline passed, or the upload
/// gate is open. A wait with nothing armed is always eligible.
#[derive(Debug, Clone, Default)]
pub struct Wait {
    pub socket: Option<SocketHandle>,
    pub read: bool,
    pub write: bool,
    pub deadline: Option<Instant>,
    /// Upload limit in bytes per second; 0 opens the gate unconditionally
    pub upload_limit: Option<u64>,
}

impl Wait {
    /// Run on the next turn
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Run once `deadline` passes
    pub fn until(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    fn watching(&self) -> bool {
        self.socket.is_some() && (self.read || self.write)
    }

    /// Whether the command may run now
    pub fn is_ready(&self, now: Instant, upload_speed: u64) -> bool {
        if let Some(limit) = self.upload_limit {
            if limit == 0 || upload_speed <= limit {
                return true;
            }
        }
        if let Some(socket) = self.socket.as_ref().filter(|_| self.watching()) {
            let socket = socket.borrow();
            if (self.read && socket.is_readable()) || (self.write && socket.is_writable()) {
                return true;
            }
        }
        if let Some(deadline) = self.deadline {
            if now >= deadline {
                return true;
            }
        }
        !self.watching() && self.deadline.is_none() && self.upload_limit.is_none()
    }
}

/// Socket interest plus timeout bookkeeping shared by I/O commands
#[derive(Debug)]
pub struct SocketWatch {
    socket: SocketHandle,
    read: bool,
    write: bool,
    timeout: Duration,
    checkpoint: Checkpoint,
}

impl SocketWatch {
    /// Watch `socket` for readability with the given timeout
    pub fn new(socket: SocketHandle, timeout: Duration) -> Self {
        Self {
            socket,
            read: true,
            write: false,
            timeout,
            checkpoint: Checkpoint::new(),
        }
    }

    pub fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    pub fn set_read(&mut self, enabled: bool) {
        self.read = enabled;
    }

    pub fn set_write(&mut self, enabled: bool) {
        self.write = enabled;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_watching_read(&self) -> bool {
        self.read
    }

    pub fn is_watching_write(&self) -> bool {
        self.write
    }

    /// The socket is ready for an armed direction, or nothing is armed
    pub fn is_ready(&self) -> bool {
        if !self.read && !self.write {
            return true;
        }
        let socket = self.socket.borrow();
        (self.read && socket.is_readable()) || (self.write && socket.is_writable())
    }

    /// Restart the timeout window
    pub fn touch(&mut self) {
        self.checkpoint.reset();
    }

    /// Fail with a timeout once the window ran out without readiness
    pub fn check_timeout(&self, context: &str) -> Result<()> {
        if self.checkpoint.elapsed_for(self.timeout) {
            return Err(TransferError::timeout(context.to_string()));
        }
        Ok(())
    }

    /// Scheduler wait condition for this watch
    pub fn wait(&self, upload_limit: Option<u64>) -> Wait {
        Wait {
            socket: Some(self.socket.clone()),
            read: self.read,
            write: self.write,
            deadline: Some(self.checkpoint.deadline(self.timeout)),
            upload_limit,
        }
    }
}

/// A resumable unit of work driven by the scheduler
pub trait Command {
    /// Process-unique id
    fn id(&self) -> CommandId;

    /// Session id
    fn cuid(&self) -> Cuid;

    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Condition under which the scheduler runs this command next
    fn wait(&self) -> Wait {
        Wait::immediate()
    }

    /// Perform one bounded slice of work
    fn execute(&mut self, ctx: &mut EngineContext) -> Result<CommandStatus>;

    /// Release resources after `execute` failed; runs before the command is dropped
    fn on_abort(&mut self, _ctx: &mut EngineContext, _error: &TransferError) {}
}

impl fmt::Debug for dyn Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.cuid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Connection;

    #[test]
    fn test_immediate_wait_is_ready() {
        assert!(Wait::immediate().is_ready(Instant::now(), 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wait() {
        let wait = Wait::until(Instant::now() + Duration::from_secs(2));
        assert!(!wait.is_ready(Instant::now(), 0));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(wait.is_ready(Instant::now(), 0));
    }

    #[test]
    fn test_socket_wait_follows_readiness() {
        let (a, mut b) = Connection::pipe_pair(16);
        let a = a.into_handle();
        let wait = Wait {
            socket: Some(a.clone()),
            read: true,
            ..Wait::default()
        };
        assert!(!wait.is_ready(Instant::now(), 0));
        b.send(b"x").unwrap();
        assert!(wait.is_ready(Instant::now(), 0));
    }

    #[test]
    fn test_upload_gate() {
        let wait = Wait {
            upload_limit: Some(1_000),
            ..Wait::default()
        };
        assert!(wait.is_ready(Instant::now(), 500));
        assert!(!wait.is_ready(Instant::now(), 5_000));

        let unlimited = Wait {
            upload_limit: Some(0),
            ..Wait::default()
        };
        assert!(unlimited.is_ready(Instant::now(), u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_watch_timeout() {
        let (a, _b) = Connection::pipe_pair(16);
        let watch = SocketWatch::new(a.into_handle(), Duration::from_secs(3));
        assert!(!watch.is_ready());
        assert!(watch.check_timeout("read").is_ok());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(matches!(
            watch.check_timeout("read"),
            Err(TransferError::Timeout { .. })
        ));
    }

    #[test]
    fn test_cuid_display() {
        assert_eq!(Cuid(7).to_string(), "CUID#7");
    }
}
