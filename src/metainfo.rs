//! Decoding of the `.torrent` metainfo format.
//!
//! Decoding happens in two steps: the bencoded dictionary is first
//! deserialized into raw serde structs mirroring the on-disk format, and then
//! projected once into the strongly typed [`Metainfo`], with precise errors
//! for anything inconsistent. The rest of the crate only ever sees the typed
//! form.

use std::path::{Component, Path, PathBuf};

use sha1::{Digest, Sha1};
use url::Url;

use crate::{
    error::{Error, Result},
    PieceIndex, Sha1Hash,
};

/// The typed projection of a torrent metainfo file.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The name of the torrent: the file name for single file torrents, the
    /// directory name for archives.
    pub name: String,
    /// The SHA-1 of the bencoded `info` dictionary, identifying the swarm.
    pub info_hash: Sha1Hash,
    /// The concatenation of each piece's expected SHA-1 hash, 20 bytes per
    /// piece.
    pub pieces: Vec<u8>,
    /// The nominal piece length. The last piece may be shorter.
    pub piece_len: u32,
    /// Whether the download is a directory of files rather than a single
    /// file. An archive with one file is still an archive.
    pub is_archive: bool,
    /// The torrent's files in payload order, with paths relative to the
    /// download root.
    pub files: Vec<MetaFile>,
    /// The announce URLs, grouped into tiers in client preference order.
    pub trackers: Vec<Vec<Url>>,
}

/// A single file entry of the torrent payload.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaFile {
    /// Path relative to the download root (for archives, relative to the
    /// torrent's own directory).
    pub path: PathBuf,
    /// The file's length in bytes.
    pub len: u64,
}

impl Metainfo {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let buf = std::fs::read(path)?;
        Self::from_bytes(&buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        raw.project()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// The total payload length, in bytes.
    pub fn download_len(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }

    /// Returns the expected hash of the piece at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of range.
    pub(crate) fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.pieces[index * 20..index * 20 + 20]);
        hash
    }
}

/// The wire format of the metainfo dictionary. Only used as a deserialization
/// target; everything else works with [`Metainfo`].
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: RawInfo,
    #[serde(default)]
    announce: Option<String>,
    #[serde(default, rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

// NOTE: field order matters: the bencode encoding of this struct must
// reproduce the original `info` dictionary byte for byte for the info hash to
// come out right, and bencode dictionaries are sorted by key.
#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files: Option<Vec<RawFile>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    md5sum: Option<String>,
    name: String,
    #[serde(rename = "piece length")]
    piece_len: i64,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    length: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    md5sum: Option<String>,
    path: Vec<String>,
}

impl RawMetainfo {
    fn project(self) -> Result<Metainfo> {
        let info_hash = self.info_hash()?;
        let info = self.info;

        if info.name.is_empty() {
            return Err(Error::InvalidMetainfo("empty name"));
        }
        // the name becomes a path component of the download, so it must not
        // escape the download directory
        if !is_clean_component(&info.name) {
            return Err(Error::InvalidMetainfo("name is not a valid filename"));
        }

        if info.piece_len <= 0 || info.piece_len > u64::from(u32::MAX) as i64 {
            return Err(Error::InvalidMetainfo("piece length out of range"));
        }
        let piece_len = info.piece_len as u32;

        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "pieces is not a multiple of 20 bytes",
            ));
        }
        let piece_count = info.pieces.len() / 20;

        let (is_archive, files) = match (info.length, info.files) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidMetainfo(
                    "both length and files present",
                ));
            }
            (Some(len), None) => {
                if len < 0 {
                    return Err(Error::InvalidMetainfo("negative file length"));
                }
                let file = MetaFile {
                    path: PathBuf::from(&info.name),
                    len: len as u64,
                };
                (false, vec![file])
            }
            (None, Some(raw_files)) => {
                if raw_files.is_empty() {
                    return Err(Error::InvalidMetainfo("empty files list"));
                }
                let mut files = Vec::with_capacity(raw_files.len());
                for raw in raw_files {
                    if raw.length < 0 {
                        return Err(Error::InvalidMetainfo(
                            "negative file length",
                        ));
                    }
                    files.push(MetaFile {
                        path: file_rel_path(&raw.path)?,
                        len: raw.length as u64,
                    });
                }
                (true, files)
            }
            (None, None) => {
                return Err(Error::InvalidMetainfo(
                    "neither length nor files present",
                ));
            }
        };

        let download_len: u64 = files.iter().map(|f| f.len).sum();
        if download_len == 0 {
            return Err(Error::InvalidMetainfo("zero length download"));
        }
        // the hash list must cover the payload exactly
        let expected_piece_count =
            (download_len + u64::from(piece_len) - 1) / u64::from(piece_len);
        if expected_piece_count != piece_count as u64 {
            return Err(Error::InvalidMetainfo(
                "piece count inconsistent with download length",
            ));
        }

        let trackers = trackers(self.announce, self.announce_list);

        Ok(Metainfo {
            name: info.name,
            info_hash,
            pieces: info.pieces,
            piece_len,
            is_archive,
            files,
            trackers,
        })
    }

    fn info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }
}

/// Builds the announce tiers. `announce-list` wins over `announce`; URLs that
/// don't parse are skipped with a warning rather than failing the whole
/// metainfo, and the result may be empty.
fn trackers(
    announce: Option<String>,
    announce_list: Option<Vec<Vec<String>>>,
) -> Vec<Vec<Url>> {
    let parse = |s: &str| match Url::parse(s) {
        Ok(url) => Some(url),
        Err(e) => {
            log::warn!("Skipping unparsable tracker URL {:?}: {}", s, e);
            None
        }
    };

    if let Some(tiers) = announce_list {
        tiers
            .iter()
            .map(|tier| tier.iter().filter_map(|s| parse(s)).collect())
            .filter(|tier: &Vec<Url>| !tier.is_empty())
            .collect()
    } else {
        announce
            .as_deref()
            .and_then(parse)
            .map(|url| vec![vec![url]])
            .unwrap_or_default()
    }
}

/// Joins the path components of a multi-file entry, refusing anything that
/// could escape the download directory.
fn file_rel_path(components: &[String]) -> Result<PathBuf> {
    if components.is_empty() {
        return Err(Error::InvalidMetainfo("file with empty path"));
    }
    let mut path = PathBuf::new();
    for component in components {
        if !is_clean_component(component) {
            return Err(Error::InvalidMetainfo("file path escapes download dir"));
        }
        path.push(component);
    }
    Ok(path)
}

fn is_clean_component(component: &str) -> bool {
    if component.is_empty() {
        return false;
    }
    let path = Path::new(component);
    let mut iter = path.components();
    matches!((iter.next(), iter.next()), (Some(Component::Normal(_)), None))
}
