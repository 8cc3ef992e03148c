//! Geometry of the download on disk: which bytes of the payload live in
//! which file, and how pieces map onto both.

use std::{ops::Range, path::PathBuf};

use crate::{
    error::{Error, Result},
    metainfo::Metainfo,
    FileIndex, PieceIndex,
};

/// Information about one file of the torrent.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// The file's path, download directory included.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for the first (or only) file.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// Returns the offset one past the file's last byte in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Returns the part of this file that overlaps with the byte range
    /// starting at `torrent_offset` and spanning at most `len` bytes. The
    /// returned slice is clamped to the file's end.
    ///
    /// # Panics
    ///
    /// Panics if `torrent_offset` doesn't fall within the file.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        assert!(
            torrent_offset >= self.torrent_offset,
            "byte range starts before file"
        );
        assert!(
            torrent_offset < self.torrent_end_offset(),
            "byte range starts past file end"
        );

        let offset = torrent_offset - self.torrent_offset;
        FileSlice {
            offset,
            len: len.min(self.len - offset),
        }
    }
}

/// A byte range within a single file, relative to the file's start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    pub offset: u64,
    pub len: u64,
}

/// Storage details of a torrent: piece geometry and the flattened file list
/// with prefix-summed offsets.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece, which may be shorter than the rest if
    /// the download size is not an exact multiple of the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The directory that directly contains the download's files. For
    /// archives this is the download directory joined with the torrent name,
    /// so that multiple top level entries don't scatter across it.
    pub download_dir: PathBuf,
    /// The torrent's files in payload order.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Extracts the storage geometry from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let piece_len = metainfo.piece_len;
        let download_len = metainfo.download_len();
        let last_piece_len = (download_len
            - u64::from(piece_len) * (piece_count as u64 - 1))
            as u32;

        let download_dir = if metainfo.is_archive {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };

        let mut files = Vec::with_capacity(metainfo.files.len());
        let mut torrent_offset = 0;
        for file in &metainfo.files {
            files.push(FileInfo {
                path: download_dir.join(&file.path),
                len: file.len,
                torrent_offset,
            });
            torrent_offset += file.len;
        }
        debug_assert_eq!(torrent_offset, download_len);

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            files,
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index + 1 == self.piece_count {
            Ok(self.last_piece_len)
        } else if index + 1 < self.piece_count {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the offset of the piece's first byte in the torrent.
    pub fn piece_torrent_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * u64::from(self.piece_len)
    }

    /// Returns the zero-based indices of the files that the piece overlaps
    /// with. A piece straddling a file boundary yields a range longer than
    /// one; the range may include zero length files, whose slices are empty.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        let piece_offset = self.piece_torrent_offset(index);
        let piece_end = piece_offset + u64::from(self.piece_len(index)?);

        // offsets are prefix sums, so both bounds can be found by binary
        // search
        let first = self
            .files
            .partition_point(|f| f.torrent_end_offset() <= piece_offset);
        let end = self
            .files
            .partition_point(|f| f.torrent_offset < piece_end);

        Ok(first..end)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn archive(file_lens: &[u64], piece_len: u32) -> StorageInfo {
        let mut files = Vec::new();
        let mut torrent_offset = 0;
        for (i, len) in file_lens.iter().enumerate() {
            files.push(FileInfo {
                path: PathBuf::from(format!("/download/f{}", i)),
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
            download_dir: PathBuf::from("/download"),
            files,
        }
    }

    #[test]
    fn test_piece_lens() {
        // 3 whole pieces and a 100 byte tail
        let info = archive(&[3 * 64 + 100], 64);
        // the tail still needs its own piece
        assert_eq!(info.piece_count, 5);
        assert_eq!(info.piece_len(0).unwrap(), 64);
        assert_eq!(info.piece_len(3).unwrap(), 64);
        assert_eq!(info.piece_len(4).unwrap(), 36);
        assert!(info.piece_len(5).is_err());
    }

    #[test]
    fn test_single_file_intersections() {
        let info = archive(&[200], 64);
        for index in 0..info.piece_count {
            assert_eq!(info.files_intersecting_piece(index).unwrap(), 0..1);
        }
    }

    #[test]
    fn test_straddling_piece_intersections() {
        // files:  |0: 0..50|1: 50..60|2: 60..200|
        // pieces: |0: 0..64|1: 64..128|2: 128..192|3: 192..200|
        let info = archive(&[50, 10, 140], 64);
        // piece 0 covers all of files 0 and 1 and the head of file 2
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..3);
        // the rest of the pieces are inside file 2
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 2..3);
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 2..3);
        assert_eq!(info.files_intersecting_piece(3).unwrap(), 2..3);
    }

    #[test]
    fn test_file_boundary_aligned_with_piece_boundary() {
        let info = archive(&[64, 64], 64);
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..1);
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 1..2);
    }

    #[test]
    fn test_get_slice_clamps_to_file_end() {
        let file = FileInfo {
            path: PathBuf::from("/download/f"),
            len: 100,
            torrent_offset: 50,
        };
        // a range longer than the file is cut at the file end
        assert_eq!(
            file.get_slice(70, 1000),
            FileSlice {
                offset: 20,
                len: 80,
            }
        );
        // a range inside the file is returned as is
        assert_eq!(file.get_slice(70, 10), FileSlice { offset: 20, len: 10 });
        assert_eq!(file.get_slice(50, 100), FileSlice { offset: 0, len: 100 });
    }

    #[test]
    #[should_panic(expected = "byte range starts before file")]
    fn test_get_slice_before_file_panics() {
        let file = FileInfo {
            path: PathBuf::from("/download/f"),
            len: 100,
            torrent_offset: 50,
        };
        file.get_slice(10, 20);
    }

    #[test]
    #[should_panic(expected = "byte range starts past file end")]
    fn test_get_slice_past_file_panics() {
        let file = FileInfo {
            path: PathBuf::from("/download/f"),
            len: 100,
            torrent_offset: 50,
        };
        file.get_slice(150, 20);
    }
}
