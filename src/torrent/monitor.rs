//! Download progress monitor
//!
//! [`DownloadMonitorCommand`] wakes up once a second, logs a progress summary
//! every few seconds and stops the engine when the download completed and
//! we are not seeding.

use std::time::Duration;

use tracing::info;

use crate::engine::{Checkpoint, Command, CommandId, CommandStatus, Cuid, EngineContext, Wait};
use crate::error::Result;
use crate::torrent::TorrentHandle;

const CHECK_INTERVAL: Duration = Duration::from_secs(1);
const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);

/// Format bytes to a human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format a byte rate
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

/// Periodic progress logging and completion detection
pub struct DownloadMonitorCommand {
    id: CommandId,
    cuid: Cuid,
    torrent: TorrentHandle,
    tick: Checkpoint,
    summary: Checkpoint,
    announced_complete: bool,
}

impl DownloadMonitorCommand {
    pub fn new(id: CommandId, cuid: Cuid, torrent: TorrentHandle) -> Self {
        Self {
            id,
            cuid,
            torrent,
            tick: Checkpoint::new(),
            summary: Checkpoint::new(),
            announced_complete: false,
        }
    }

    fn log_summary(&self, ctx: &EngineContext) {
        let torrent = self.torrent.borrow();
        let completed = torrent.completed_length();
        let total = torrent.total_length().max(1);
        info!(
            "Progress {}/{} ({:.1}%), down {} up {}, {} active peers",
            format_bytes(completed),
            format_bytes(torrent.total_length()),
            completed as f64 * 100.0 / total as f64,
            format_speed(ctx.stats().download_speed()),
            format_speed(ctx.stats().upload_speed()),
            torrent.active_peers().len()
        );
    }
}

impl Command for DownloadMonitorCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "DownloadMonitorCommand"
    }

    fn wait(&self) -> Wait {
        Wait::until(self.tick.deadline(CHECK_INTERVAL))
    }

    fn execute(&mut self, ctx: &mut EngineContext) -> Result<CommandStatus> {
        if !self.tick.elapsed_for(CHECK_INTERVAL) {
            return Ok(CommandStatus::Pending);
        }
        self.tick.reset();

        if self.summary.elapsed_for(SUMMARY_INTERVAL) {
            self.summary.reset();
            self.log_summary(ctx);
        }

        let complete = self.torrent.borrow().download_complete();
        if complete && !self.announced_complete {
            self.announced_complete = true;
            info!(
                "Download complete: {} downloaded, {} uploaded",
                format_bytes(ctx.stats().downloaded()),
                format_bytes(ctx.stats().uploaded())
            );
        }
        if complete && !ctx.config().seed {
            ctx.request_halt();
            return Ok(CommandStatus::Finished);
        }
        Ok(CommandStatus::Pending)
    }
}
