//! Choke policy
//!
//! Every `choke_interval` the [`PeerChokeCommand`] ranks the interested,
//! non-snubbing peers by transfer rate (download rate while leeching, upload
//! rate while seeding) and unchokes the fastest ones plus one optimistic
//! pick that rotates every few rounds. The decision is written to each
//! peer's `should_be_choking`; the peer's own command applies it.

use std::rc::Rc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::engine::{Checkpoint, Command, CommandId, CommandStatus, Cuid, EngineContext, Wait};
use crate::error::Result;
use crate::peer::PeerHandle;
use crate::torrent::TorrentHandle;

/// Rounds between optimistic unchoke rotations
pub const OPTIMISTIC_UNCHOKE_ROUNDS: u32 = 3;

/// Periodic unchoke slot assignment
#[derive(Debug)]
pub struct PeerChokeCommand {
    id: CommandId,
    cuid: Cuid,
    torrent: TorrentHandle,
    interval: Duration,
    max_unchoked: usize,
    checkpoint: Checkpoint,
    round: u32,
}

impl PeerChokeCommand {
    pub fn new(
        id: CommandId,
        cuid: Cuid,
        torrent: TorrentHandle,
        interval: Duration,
        max_unchoked: usize,
    ) -> Self {
        Self {
            id,
            cuid,
            torrent,
            interval,
            max_unchoked,
            checkpoint: Checkpoint::new(),
            round: 0,
        }
    }

    /// Run one round over the active peers
    pub fn execute_choking(&mut self) {
        let (peers, seeding) = {
            let torrent = self.torrent.borrow();
            (torrent.active_peers(), torrent.download_complete())
        };

        let rate = |peer: &PeerHandle| {
            let peer = peer.borrow();
            if seeding {
                peer.upload_speed()
            } else {
                peer.download_speed()
            }
        };

        let mut candidates: Vec<&PeerHandle> = peers
            .iter()
            .filter(|p| {
                let peer = p.borrow();
                peer.peer_interested && !peer.snubbing
            })
            .collect();
        candidates.sort_by_key(|p| std::cmp::Reverse(rate(*p)));

        let regular = self.max_unchoked.saturating_sub(1);
        let unchoked: Vec<&PeerHandle> = candidates.iter().take(regular).copied().collect();

        let rotate = self.round % OPTIMISTIC_UNCHOKE_ROUNDS == 0;
        self.round = self.round.wrapping_add(1);
        let current_optimistic = peers
            .iter()
            .find(|p| p.borrow().is_optimistic_unchoke())
            .filter(|p| p.borrow().peer_interested && !unchoked.iter().any(|u| Rc::ptr_eq(*u, *p)));

        let optimistic = if rotate || current_optimistic.is_none() {
            let rest: Vec<&PeerHandle> = candidates.iter().skip(regular).copied().collect();
            rest.choose(&mut rand::thread_rng()).copied()
        } else {
            current_optimistic
        };

        for peer in &peers {
            let is_regular = unchoked.iter().any(|u| Rc::ptr_eq(*u, peer));
            let is_optimistic = optimistic.is_some_and(|o| Rc::ptr_eq(o, peer));
            let mut peer = peer.borrow_mut();
            peer.set_optimistic_unchoke(is_optimistic);
            peer.set_should_be_choking(!(is_regular || is_optimistic));
            peer.request_choke_review();
            trace!(
                "{} - {} should_be_choking={} optimistic={}",
                self.cuid,
                peer.addr,
                peer.should_be_choking(),
                is_optimistic
            );
        }
        debug!(
            "{} - Choke round: {} unchoked of {} active",
            self.cuid,
            unchoked.len() + usize::from(optimistic.is_some()),
            peers.len()
        );
    }
}

impl Command for PeerChokeCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "PeerChokeCommand"
    }

    fn wait(&self) -> Wait {
        Wait::until(self.checkpoint.deadline(self.interval))
    }

    fn execute(&mut self, _ctx: &mut EngineContext) -> Result<CommandStatus> {
        if self.checkpoint.elapsed_for(self.interval) {
            self.checkpoint.reset();
            self.execute_choking();
        }
        Ok(CommandStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::peer::Peer;
    use crate::torrent::{MemoryTorrent, TorrentInfo, TorrentManager};

    fn torrent() -> Rc<RefCell<MemoryTorrent>> {
        let info = TorrentInfo::from_content("c.bin", 16, &[1u8; 64]);
        Rc::new(RefCell::new(MemoryTorrent::new(info, [0u8; 20], 50)))
    }

    fn active_peer(
        torrent: &Rc<RefCell<MemoryTorrent>>,
        last_octet: u8,
        downloaded: u64,
        interested: bool,
    ) -> PeerHandle {
        let mut peer = Peer::new(format!("10.0.0.{}:6881", last_octet).parse().unwrap(), 4);
        peer.peer_interested = interested;
        peer.record_download(downloaded);
        let handle = peer.into_handle();
        torrent.borrow_mut().add_active_peer(&handle);
        handle
    }

    #[test]
    fn test_uninterested_peers_stay_choked() {
        let torrent = torrent();
        let idle = active_peer(&torrent, 1, 0, false);
        let mut command = PeerChokeCommand::new(CommandId(1), Cuid(0), torrent, Duration::from_secs(10), 4);
        command.execute_choking();
        assert!(idle.borrow().should_be_choking());
        assert!(idle.borrow_mut().take_choke_review());
    }

    #[test]
    fn test_unchoke_slots_are_bounded() {
        let torrent = torrent();
        let peers: Vec<PeerHandle> = (1..=6).map(|i| active_peer(&torrent, i, 0, true)).collect();
        let mut command = PeerChokeCommand::new(CommandId(1), Cuid(0), torrent, Duration::from_secs(10), 3);
        command.execute_choking();

        let unchoked = peers.iter().filter(|p| !p.borrow().should_be_choking()).count();
        assert_eq!(unchoked, 3);
        let optimistic = peers.iter().filter(|p| p.borrow().is_optimistic_unchoke()).count();
        assert_eq!(optimistic, 1);
    }

    #[test]
    fn test_snubbing_peer_is_not_unchoked_regularly() {
        let torrent = torrent();
        let snub = active_peer(&torrent, 1, 0, true);
        snub.borrow_mut().snubbing = true;
        let mut command = PeerChokeCommand::new(CommandId(1), Cuid(0), torrent, Duration::from_secs(10), 4);
        command.execute_choking();
        assert!(snub.borrow().should_be_choking());
    }
}
