//! The HTTP(S) tracker protocol: a GET request with the announce parameters
//! in the query string and a bencoded response body.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use url::Url;

use super::{Announce, AnnounceResponse, Event};
use crate::error::{Error, Result};

pub(crate) struct HttpTracker {
    client: reqwest::Client,
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn announce(
        &mut self,
        announce: &Announce,
    ) -> Result<AnnounceResponse> {
        // The query is assembled by hand: `info_hash` and `peer_id` are raw
        // byte strings that have to be escaped as-is, which a typed query
        // builder would re-encode.
        let mut url = format!(
            "{url}{sep}info_hash={info_hash}&peer_id={peer_id}\
             &port={port}&uploaded={uploaded}&downloaded={downloaded}\
             &left={left}&compact=1&numwant={num_want}",
            url = self.url,
            sep = if self.url.query().is_some() { '&' } else { '?' },
            info_hash =
                percent_encode(&announce.info_hash, NON_ALPHANUMERIC),
            peer_id = percent_encode(&announce.peer_id, NON_ALPHANUMERIC),
            port = announce.port,
            uploaded = announce.uploaded,
            downloaded = announce.downloaded,
            left = announce.left,
            num_want = announce.num_want,
        );
        let event = match announce.event {
            Event::None => None,
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
        };
        if let Some(event) = event {
            url.push_str("&event=");
            url.push_str(event);
        }
        log::debug!("Announcing: {}", url);

        let body = self.client.get(&url).send().await?.bytes().await?;
        let response: Response =
            serde_bencode::from_bytes(&body).map_err(|e| {
                Error::Tracker(format!("malformed announce response: {}", e))
            })?;

        if let Some(reason) = response.failure_reason {
            return Err(Error::Tracker(reason));
        }

        Ok(AnnounceResponse {
            interval: response.interval.map(Duration::from_secs),
            peers: response.peers.map(|p| p.0).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    peers: Option<PeerList>,
}

/// The `peers` key of an announce response, in either of its two encodings:
/// a compact byte string of `ip(4)||port(2)` entries (`ip(16)||port(2)` for
/// IPv6 trackers), or a list of dictionaries with `ip` and `port` keys.
#[derive(Debug)]
struct PeerList(Vec<SocketAddr>);

impl<'de> serde::de::Deserialize<'de> for PeerList {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        deserializer.deserialize_any(PeerListVisitor)
    }
}

struct PeerListVisitor;

impl<'de> serde::de::Visitor<'de> for PeerListVisitor {
    type Value = PeerList;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a compact peer string or a list of peer dictionaries")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<PeerList, E>
    where
        E: serde::de::Error,
    {
        let mut peers = Vec::new();
        if v.len() % 6 == 0 {
            for chunk in v.chunks(6) {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
        } else if v.len() % 18 == 0 {
            for chunk in v.chunks(18) {
                let mut octets = [0; 16];
                octets.copy_from_slice(&chunk[..16]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([chunk[16], chunk[17]]);
                peers.push(SocketAddr::new(IpAddr::V6(ip), port));
            }
        } else {
            return Err(E::custom("compact peer string length"));
        }
        Ok(PeerList(peers))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<PeerList, E>
    where
        E: serde::de::Error,
    {
        self.visit_bytes(&v)
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<PeerList, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        #[derive(Deserialize)]
        struct RawPeer {
            ip: String,
            port: u16,
        }

        let mut peers = Vec::new();
        while let Some(peer) = seq.next_element::<RawPeer>()? {
            let ip: IpAddr = peer
                .ip
                .parse()
                .map_err(|_| serde::de::Error::custom("peer ip"))?;
            peers.push(SocketAddr::new(ip, peer.port));
        }
        Ok(PeerList(peers))
    }
}

#[cfg(test)]
mod tests {
    use mockito::{mock, Matcher};
    use pretty_assertions::assert_eq;

    use super::*;

    fn announce_params() -> Announce {
        Announce {
            info_hash: [0xde; 20],
            peer_id: *b"-LE0010-123456789012",
            port: 6881,
            uploaded: 0,
            downloaded: 1000,
            left: 4000,
            event: Event::Started,
            num_want: 30,
        }
    }

    fn tracker(path: &str) -> HttpTracker {
        let url =
            Url::parse(&format!("{}{}", mockito::server_url(), path)).unwrap();
        HttpTracker::new(url)
    }

    #[tokio::test]
    async fn test_compact_peers_response() {
        let mut body = b"d8:intervali1800e5:peers12:".to_vec();
        body.extend_from_slice(&[
            127, 0, 0, 1, 0x1a, 0xe1, // 127.0.0.1:6881
            10, 0, 0, 2, 0x1a, 0xe2, // 10.0.0.2:6882
        ]);
        body.push(b'e');
        let _m = mock("GET", Matcher::Regex("^/compact".into()))
            .with_body(body)
            .create();

        let response = tracker("/compact")
            .announce(&announce_params())
            .await
            .unwrap();

        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
        assert_eq!(
            response.peers,
            vec![
                "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:6882".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_dict_peers_response() {
        let body = "d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eed2:ip\
                    8:10.0.0.24:porti6882eeee";
        let _m = mock("GET", Matcher::Regex("^/dict".into()))
            .with_body(body)
            .create();

        let response =
            tracker("/dict").announce(&announce_params()).await.unwrap();

        assert_eq!(response.interval, Some(Duration::from_secs(900)));
        assert_eq!(
            response.peers,
            vec![
                "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:6882".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_reason_is_surfaced() {
        let _m = mock("GET", Matcher::Regex("^/fail".into()))
            .with_body("d14:failure reason11:unregisterede")
            .create();

        match tracker("/fail").announce(&announce_params()).await {
            Err(Error::Tracker(reason)) => assert_eq!(reason, "unregistered"),
            other => panic!("expected tracker failure, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_query_carries_raw_escaped_hash() {
        let mut body = b"d8:intervali60e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.push(b'e');
        let _m = mock(
            "GET",
            Matcher::Regex(
                "^/query\\?info_hash=%DE%DE.*&compact=1.*&event=started"
                    .into(),
            ),
        )
        .with_body(body)
        .create();

        let response =
            tracker("/query").announce(&announce_params()).await.unwrap();
        assert_eq!(response.peers.len(), 1);
    }
}
