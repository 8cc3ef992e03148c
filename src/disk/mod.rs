//! The disk task owns every piece buffer and the output files.
//!
//! All piece state mutation is serialised through the task's command
//! channel: sessions push raw blocks in, and the torrent driver hears about
//! verified, committed pieces (or rejected ones) on the alert channel. No
//! other task touches the files.

mod io;

use std::net::SocketAddr;

use tokio::{sync::mpsc, task};

use crate::{
    error::{Error, Result},
    storage_info::StorageInfo,
    BlockInfo, PieceIndex,
};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

/// The commands the disk task accepts.
#[derive(Debug)]
pub(crate) enum Command {
    /// Buffer a downloaded block, and verify and commit its piece if this
    /// was the piece's last missing block.
    WriteBlock {
        block: BlockInfo,
        data: Vec<u8>,
        /// The remote address of the session the block came from, kept as
        /// provenance for hash failures.
        from: SocketAddr,
    },
    /// Stop the disk task. Commands already queued are still processed.
    Shutdown,
}

/// The events the disk task reports to the torrent driver.
#[derive(Debug)]
pub(crate) enum Alert {
    /// A piece passed its hash check and all its bytes are on disk.
    PieceCompleted { index: PieceIndex },
    /// A piece failed its hash check. Its buffer was dropped and all its
    /// blocks need to be downloaded again.
    PieceRejected {
        index: PieceIndex,
        /// The peers whose blocks made up the piece. A single entry means
        /// the sole source is certainly at fault.
        contributors: Vec<SocketAddr>,
    },
    /// A redundant or malformed block was dropped without touching a piece.
    DiscardedBlock { len: u32 },
    /// Writing a committed piece failed. The download cannot make progress.
    WriteFailure(Error),
}

/// A cheap handle used by sessions and the torrent driver to talk to the
/// disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    pub fn write_block(
        &self,
        block: BlockInfo,
        data: Vec<u8>,
        from: SocketAddr,
    ) -> Result<()> {
        self.0
            .send(Command::WriteBlock { block, data, from })
            .map_err(Error::from)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.0.send(Command::Shutdown).map_err(Error::from)
    }
}

/// Creates the torrent's file system structure and starts the disk task.
///
/// This preallocates every file of the torrent to its full length, so
/// resource errors (no space, no permission, already existing download)
/// surface here rather than halfway through the download.
pub(crate) fn spawn(
    info: StorageInfo,
    piece_hashes: Vec<u8>,
) -> Result<(task::JoinHandle<Result<()>>, DiskHandle, AlertReceiver)> {
    log::info!("Spawning disk IO task");
    let (mut disk, cmd_chan, alert_port) = io::Disk::new(info, piece_hashes)?;
    let join_handle = task::spawn(async move { disk.run().await });
    log::info!("Spawned disk IO task");
    Ok((join_handle, DiskHandle(cmd_chan), alert_port))
}
