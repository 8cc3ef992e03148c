use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io,
    net::SocketAddr,
    os::unix::io::AsRawFd,
    sync::{Arc, Mutex},
};

use nix::sys::uio::pwrite;
use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, task};

use super::{
    Alert, AlertReceiver, AlertSender, Command, CommandReceiver, CommandSender,
};
use crate::{
    block_count, block_len,
    error::{Error, Result},
    storage_info::StorageInfo,
    BlockInfo, PieceIndex, Sha1Hash, BLOCK_LEN,
};

/// The entity responsible for buffering downloaded blocks, verifying
/// completed pieces, and writing them to the output files.
pub(super) struct Disk {
    /// The torrent's piece and file geometry.
    info: StorageInfo,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// Handles of all files in torrent, opened and preallocated in advance.
    ///
    /// The commit path runs on the blocking thread pool and locks only the
    /// files the piece overlaps with, hence the mutexes.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// The in-progress pieces, i.e. the write buffer. Entries are created by
    /// a piece's first block and removed when the piece is committed or
    /// rejected.
    pieces: HashMap<PieceIndex, Piece>,
    /// Which pieces have been committed. A block arriving for a committed
    /// piece (endgame stragglers, mostly) must not reopen its buffer.
    committed: Vec<bool>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which the disk task alerts the torrent driver.
    alert_chan: AlertSender,
    /// Disk IO statistics.
    stats: Stats,
}

impl Disk {
    /// Creates the download's directory structure, preallocates its files,
    /// and returns the task along with its channel endpoints.
    pub(super) fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<(Self, CommandSender, AlertReceiver)> {
        debug_assert_eq!(piece_hashes.len(), info.piece_count * 20);

        fs::create_dir_all(&info.download_dir)?;

        let mut files = Vec::with_capacity(info.files.len());
        for file_info in &info.files {
            if let Some(parent) = file_info.path.parent() {
                fs::create_dir_all(parent)?;
            }
            log::debug!(
                "Preallocating {} bytes long file {:?}",
                file_info.len,
                file_info.path
            );
            // refusing an existing file doubles as our "no resume" guard:
            // a partial previous download must not be silently overwritten
            let handle = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&file_info.path)?;
            // a sparse file where the platform supports it
            handle.set_len(file_info.len)?;
            files.push(Mutex::new(TorrentFile {
                info: file_info.clone(),
                handle,
            }));
        }

        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        let piece_count = info.piece_count;
        Ok((
            Self {
                info,
                piece_hashes,
                files: Arc::new(files),
                pieces: HashMap::new(),
                committed: vec![false; piece_count],
                cmd_port,
                alert_chan,
                stats: Stats::default(),
            },
            cmd_chan,
            alert_port,
        ))
    }

    /// Runs the disk event loop until shutdown or an unrecoverable error
    /// occurs (e.g. mpsc channel failure).
    pub(super) async fn run(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::WriteBlock { block, data, from } => {
                    self.write_block(block, data, from).await?;
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk IO event loop");
                    break;
                }
            }
        }
        log::info!(
            "Disk IO done: {} commits, {} wasted bytes, {} write failures",
            self.stats.commit_count,
            self.stats.wasted_byte_count,
            self.stats.write_failure_count
        );
        Ok(())
    }

    /// Buffers a block and, if it completed its piece, verifies and commits
    /// the piece.
    ///
    /// Only channel failures propagate: an invalid or redundant block is
    /// dropped with an alert, an IO failure is reported as an alert, as
    /// neither must kill the disk task.
    async fn write_block(
        &mut self,
        block: BlockInfo,
        data: Vec<u8>,
        from: SocketAddr,
    ) -> Result<()> {
        log::trace!("Saving block {:?} to disk", block);

        let piece_index = block.piece_index;
        let piece_len = match self.info.piece_len(piece_index) {
            Ok(len) => len,
            Err(_) => {
                log::warn!("Dropping block {:?} with invalid piece", block);
                return self.discard(data.len() as u32);
            }
        };
        if self.committed[piece_index] {
            log::debug!("Dropping block {:?} of committed piece", block);
            return self.discard(block.len);
        }

        if !self.pieces.contains_key(&piece_index) {
            let expected_hash = self.piece_hash(piece_index);
            log::debug!(
                "Starting piece {} ({} bytes, expected hash {})",
                piece_index,
                piece_len,
                hex::encode(&expected_hash)
            );
            self.pieces.insert(
                piece_index,
                Piece::new(expected_hash, piece_len),
            );
        }
        // the entry was just inserted if missing
        let piece = self.pieces.get_mut(&piece_index).unwrap();

        match piece.place_block(&block, data) {
            BlockPlacement::Placed => piece.record_contributor(from),
            BlockPlacement::Rejected(why) => {
                log::debug!("Dropping block {:?}: {}", block, why);
                return self.discard(block.len);
            }
        }

        // if the piece has all its blocks we can verify it and either commit
        // it to disk or drop the buffer
        if piece.is_complete() {
            let piece = self.pieces.remove(&piece_index).unwrap();
            let piece_offset = self.info.piece_torrent_offset(piece_index);
            let file_range = self
                .info
                .files_intersecting_piece(piece_index)
                .expect("complete piece has no file range");
            let files = Arc::clone(&self.files);

            // neither hashing nor the file writes may stall the event loop
            let write_result = task::spawn_blocking(move || {
                if !piece.matches_hash() {
                    return Ok((None, piece.contributors));
                }
                let write_count =
                    piece.write(piece_offset, &files[file_range])?;
                Ok((Some(write_count), piece.contributors))
            })
            .await
            // the closure doesn't panic, so until better strategies are
            // devised, unwrap here
            .expect("disk IO write task panicked");

            match write_result {
                Ok((Some(write_count), _)) => {
                    log::info!("Piece {} is valid, committed", piece_index);
                    self.committed[piece_index] = true;
                    self.stats.commit_count += 1;
                    self.stats.written_byte_count += write_count as u64;
                    self.alert_chan
                        .send(Alert::PieceCompleted { index: piece_index })?;
                }
                Ok((None, contributors)) => {
                    log::warn!("Piece {} is NOT valid", piece_index);
                    self.alert_chan.send(Alert::PieceRejected {
                        index: piece_index,
                        contributors,
                    })?;
                }
                Err(e) => {
                    log::error!("Disk write error: {}", e);
                    self.stats.write_failure_count += 1;
                    self.alert_chan
                        .send(Alert::WriteFailure(Error::Io(e)))?;
                }
            }
        }

        Ok(())
    }

    fn discard(&mut self, len: u32) -> Result<()> {
        self.stats.wasted_byte_count += u64::from(len);
        self.alert_chan
            .send(Alert::DiscardedBlock { len })
            .map_err(Error::from)
    }

    fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[index * 20..index * 20 + 20]);
        hash
    }

}

struct TorrentFile {
    info: crate::FileInfo,
    handle: File,
}

impl TorrentFile {
    /// Writes the whole buffer at the given file offset. IO syscalls are not
    /// guaranteed to write the whole input in one go, so this loops until
    /// all bytes have been confirmed written (or an error occurs).
    fn write_slice_at(
        &self,
        mut buf: &[u8],
        mut offset: u64,
    ) -> io::Result<usize> {
        let mut total_write_count = 0;
        while !buf.is_empty() {
            let write_count =
                pwrite(self.handle.as_raw_fd(), buf, offset as i64).map_err(
                    |e| {
                        log::warn!(
                            "File {:?} write error: {}",
                            self.info.path,
                            e
                        );
                        io::Error::new(io::ErrorKind::Other, e)
                    },
                )?;
            if write_count == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "pwrite returned zero",
                ));
            }
            buf = &buf[write_count..];
            offset += write_count as u64;
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }
}

#[derive(Default)]
struct Stats {
    /// The number of pieces verified and written out.
    commit_count: u64,
    /// The number of payload bytes successfully written to disk.
    written_byte_count: u64,
    /// Bytes dropped because they were redundant or invalid.
    wasted_byte_count: u64,
    /// The number of times a commit failed with an IO error.
    write_failure_count: usize,
}

/// Whether a block could be placed into a piece's buffer.
enum BlockPlacement {
    Placed,
    Rejected(&'static str),
}

/// An in-progress piece: a contiguous write buffer plus which of its blocks
/// have already arrived.
struct Piece {
    /// The expected hash of the whole piece.
    expected_hash: Sha1Hash,
    /// The piece's length in bytes.
    len: u32,
    /// The write buffer, allocated when the piece's first block arrives and
    /// freed on commit or rejection.
    buf: Vec<u8>,
    /// Which blocks of the piece have been placed into the buffer.
    block_received: Vec<bool>,
    received_count: usize,
    /// The distinct peers whose blocks fill the buffer.
    contributors: Vec<SocketAddr>,
}

impl Piece {
    fn new(expected_hash: Sha1Hash, len: u32) -> Self {
        Self {
            expected_hash,
            len,
            buf: vec![0; len as usize],
            block_received: vec![false; block_count(len)],
            received_count: 0,
            contributors: Vec::new(),
        }
    }

    /// Copies the block into the buffer after validating its boundaries.
    /// A block that has already arrived is rejected so that a misbehaving
    /// peer cannot overwrite verified-pending data.
    fn place_block(&mut self, block: &BlockInfo, data: Vec<u8>) -> BlockPlacement {
        if block.offset % BLOCK_LEN != 0 {
            return BlockPlacement::Rejected("unaligned block offset");
        }
        let index = (block.offset / BLOCK_LEN) as usize;
        if index >= self.block_received.len() {
            return BlockPlacement::Rejected("block offset past piece end");
        }
        if data.len() as u32 != block_len(self.len, index)
            || data.len() as u32 != block.len
        {
            return BlockPlacement::Rejected("wrong block length");
        }
        if self.block_received[index] {
            return BlockPlacement::Rejected("block already received");
        }

        let offset = block.offset as usize;
        self.buf[offset..offset + data.len()].copy_from_slice(&data);
        self.block_received[index] = true;
        self.received_count += 1;
        BlockPlacement::Placed
    }

    fn record_contributor(&mut self, from: SocketAddr) {
        if !self.contributors.contains(&from) {
            self.contributors.push(from);
        }
    }

    fn is_complete(&self) -> bool {
        self.received_count == self.block_received.len()
    }

    /// Hashes the buffer and compares against the expected piece hash.
    ///
    /// This is CPU heavy and must run on the blocking thread pool, not the
    /// executor.
    fn matches_hash(&self) -> bool {
        debug_assert!(self.is_complete());
        let digest = Sha1::digest(&self.buf);
        log::debug!("Piece hash: {:x}", digest);
        digest.as_slice() == self.expected_hash
    }

    /// Writes the piece buffer to the files it overlaps with, at most one
    /// positional write per file.
    ///
    /// This performs sync IO and must run on the blocking thread pool, not
    /// the executor.
    fn write(
        &self,
        piece_offset: u64,
        files: &[Mutex<TorrentFile>],
    ) -> io::Result<usize> {
        debug_assert!(!files.is_empty());

        let mut total_write_count = 0;
        let mut written = 0u64;
        for file in files {
            // a zero length file takes no piece bytes
            let file = file.lock().expect("file lock poisoned");
            if file.info.len == 0 {
                continue;
            }
            let slice = file
                .info
                .get_slice(piece_offset + written, u64::from(self.len) - written);
            debug_assert!(slice.len > 0);

            let buf =
                &self.buf[written as usize..(written + slice.len) as usize];
            total_write_count += file.write_slice_at(buf, slice.offset)?;
            written += slice.len;
        }
        debug_assert_eq!(written, u64::from(self.len));

        Ok(total_write_count)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::FileInfo;
    use std::path::PathBuf;

    fn storage_info(
        download_dir: PathBuf,
        file_lens: &[u64],
        piece_len: u32,
    ) -> StorageInfo {
        let mut files = Vec::new();
        let mut torrent_offset = 0;
        for (i, len) in file_lens.iter().enumerate() {
            files.push(FileInfo {
                path: download_dir.join(format!("f{}", i)),
                len: *len,
                torrent_offset,
            });
            torrent_offset += len;
        }
        let download_len = torrent_offset;
        let piece_count =
            ((download_len + u64::from(piece_len) - 1) / u64::from(piece_len))
                as usize;
        let last_piece_len = (download_len
            - u64::from(piece_len) * (piece_count as u64 - 1))
            as u32;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            files,
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn piece_hashes(payload: &[u8], piece_len: u32) -> Vec<u8> {
        payload
            .chunks(piece_len as usize)
            .flat_map(|piece| Sha1::digest(piece).to_vec())
            .collect()
    }

    fn peer() -> SocketAddr {
        ([127, 0, 0, 1], 50000).into()
    }

    /// Feeds the given blocks to a fresh disk task and returns the alerts it
    /// produced, in order.
    async fn run_disk(
        info: StorageInfo,
        hashes: Vec<u8>,
        blocks: Vec<(BlockInfo, Vec<u8>)>,
    ) -> Vec<Alert> {
        let (mut disk, cmd_chan, mut alert_port) =
            Disk::new(info, hashes).unwrap();
        for (block, data) in blocks {
            cmd_chan
                .send(Command::WriteBlock {
                    block,
                    data,
                    from: peer(),
                })
                .unwrap();
        }
        cmd_chan.send(Command::Shutdown).unwrap();
        disk.run().await.unwrap();

        let mut alerts = Vec::new();
        while let Ok(alert) = alert_port.try_recv() {
            alerts.push(alert);
        }
        alerts
    }

    fn blocks_of(payload: &[u8], piece_len: u32) -> Vec<(BlockInfo, Vec<u8>)> {
        payload
            .chunks(piece_len as usize)
            .enumerate()
            .map(|(piece_index, piece)| {
                // pieces in these tests are at most one block long
                (
                    BlockInfo {
                        piece_index,
                        offset: 0,
                        len: piece.len() as u32,
                    },
                    piece.to_vec(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_single_file_commit_and_readback() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = 32;
        let payload = payload(48);
        let info = storage_info(dir.path().join("out"), &[48], piece_len);
        let hashes = piece_hashes(&payload, piece_len);

        let alerts =
            run_disk(info.clone(), hashes, blocks_of(&payload, piece_len))
                .await;
        assert!(matches!(
            alerts[..],
            [
                Alert::PieceCompleted { index: 0 },
                Alert::PieceCompleted { index: 1 },
            ]
        ));

        let on_disk = fs::read(&info.files[0].path).unwrap();
        assert_eq!(on_disk, payload);
    }

    #[tokio::test]
    async fn test_straddling_piece_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = 32;
        let payload = payload(42);
        // piece 0 covers all of the first file and 22 bytes of the second
        let info = storage_info(dir.path().join("out"), &[10, 32], piece_len);
        let hashes = piece_hashes(&payload, piece_len);

        let alerts =
            run_disk(info.clone(), hashes, blocks_of(&payload, piece_len))
                .await;
        assert!(matches!(
            alerts[..],
            [
                Alert::PieceCompleted { index: 0 },
                Alert::PieceCompleted { index: 1 },
            ]
        ));

        assert_eq!(fs::read(&info.files[0].path).unwrap(), &payload[..10]);
        assert_eq!(fs::read(&info.files[1].path).unwrap(), &payload[10..]);
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_rejected_with_contributor() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = 32;
        let payload = payload(32);
        let info = storage_info(dir.path().join("out"), &[32], piece_len);
        let hashes = piece_hashes(&payload, piece_len);

        let mut corrupt = payload.clone();
        corrupt[7] ^= 0xff;
        let alerts = run_disk(
            info,
            hashes,
            vec![(
                BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: 32,
                },
                corrupt,
            )],
        )
        .await;

        match &alerts[..] {
            [Alert::PieceRejected {
                index: 0,
                contributors,
            }] => assert_eq!(contributors, &vec![peer()]),
            other => panic!("unexpected alerts: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_and_bogus_blocks_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = 32;
        let payload = payload(48);
        let info = storage_info(dir.path().join("out"), &[48], piece_len);
        let hashes = piece_hashes(&payload, piece_len);

        let mut blocks = blocks_of(&payload, piece_len);
        // duplicate of the first piece's block, after it commits
        blocks.insert(1, blocks[0].clone());
        // a block that lies about its piece
        blocks.push((
            BlockInfo {
                piece_index: 9,
                offset: 0,
                len: 32,
            },
            vec![0; 32],
        ));
        let alerts = run_disk(info.clone(), hashes, blocks).await;

        assert!(matches!(
            alerts[..],
            [
                Alert::PieceCompleted { index: 0 },
                Alert::DiscardedBlock { len: 32 },
                Alert::PieceCompleted { index: 1 },
                Alert::DiscardedBlock { len: 32 },
            ]
        ));

        // the duplicate didn't clobber anything
        assert_eq!(fs::read(&info.files[0].path).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_existing_download_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let info = storage_info(dir.path().join("out"), &[32], 32);
        fs::create_dir_all(&info.download_dir).unwrap();
        fs::write(&info.files[0].path, b"leftovers").unwrap();

        let hashes = vec![0; 20];
        assert!(matches!(
            Disk::new(info, hashes),
            Err(Error::Io(_))
        ));
    }
}
