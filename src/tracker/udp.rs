//! The UDP tracker protocol (BEP 15): a connect exchange yielding a 60
//! second connection id, followed by announce exchanges. All integers are
//! big endian on the wire.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::{net::UdpSocket, time};
use url::Url;

use super::{Announce, AnnounceResponse, Event};
use crate::error::{Error, Result};

/// The magic constant identifying the protocol in connect requests.
const PROTOCOL_MAGIC: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// How long a connection id stays valid.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// Retransmit attempt `n` waits `15 * 2^n` seconds for the response. After
/// the last attempt the tracker is considered dead for this session.
const MAX_ATTEMPTS: u32 = 4;

pub(crate) struct UdpTracker {
    url: Url,
    /// The `host:port` pair the URL resolves from.
    target: String,
    /// The current connection id and when it was obtained.
    connection: Option<(u64, Instant)>,
    /// Set after a full retransmit schedule went unanswered; a dead tracker
    /// is not contacted again.
    is_dead: bool,
}

impl UdpTracker {
    /// UDP tracker URLs must name an explicit port; without one the tracker
    /// is unusable and `None` is returned.
    pub fn new(url: Url) -> Option<Self> {
        let host = url.host_str()?.to_string();
        let port = url.port()?;
        Some(Self {
            target: format!("{}:{}", host, port),
            url,
            connection: None,
            is_dead: false,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn announce(
        &mut self,
        announce: &Announce,
    ) -> Result<AnnounceResponse> {
        if self.is_dead {
            return Err(Error::Tracker("tracker is dead".to_string()));
        }

        let addr = tokio::net::lookup_host(&*self.target)
            .await?
            .next()
            .ok_or_else(|| {
                Error::Tracker(format!("cannot resolve {}", self.target))
            })?;
        let mut socket = UdpSocket::bind("0.0.0.0:0").await?;

        let connection_id = match self.connection {
            Some((id, obtained_at))
                if obtained_at.elapsed() < CONNECTION_ID_TTL =>
            {
                id
            }
            _ => {
                let id = self.connect(&mut socket, addr).await?;
                self.connection = Some((id, Instant::now()));
                id
            }
        };

        let transaction_id = rand::thread_rng().gen::<u32>();
        let mut request = BytesMut::with_capacity(98);
        request.put_u64(connection_id);
        request.put_u32(ACTION_ANNOUNCE);
        request.put_u32(transaction_id);
        request.put_slice(&announce.info_hash);
        request.put_slice(&announce.peer_id);
        request.put_u64(announce.downloaded);
        request.put_u64(announce.left);
        request.put_u64(announce.uploaded);
        request.put_u32(match announce.event {
            Event::None => 0,
            Event::Started => 2,
            Event::Stopped => 3,
        });
        // ip 0 means "use the sender address"
        request.put_u32(0);
        request.put_u32(rand::thread_rng().gen::<u32>());
        request.put_i32(if announce.num_want == 0 {
            -1
        } else {
            announce.num_want as i32
        });
        request.put_u16(announce.port);

        let mut response = self
            .exchange(
                &mut socket,
                addr,
                &request,
                transaction_id,
                ACTION_ANNOUNCE,
                20,
            )
            .await?;

        let interval = response.get_u32();
        let leechers = response.get_u32();
        let seeders = response.get_u32();
        log::debug!(
            "Tracker {}: {} seeders, {} leechers",
            self.url,
            seeders,
            leechers
        );

        if response.remaining() % 6 != 0 {
            return Err(Error::Tracker(
                "announce response peer list length".to_string(),
            ));
        }
        let mut peers = Vec::with_capacity(response.remaining() / 6);
        while response.has_remaining() {
            let mut ip = [0; 4];
            response.copy_to_slice(&mut ip);
            let port = response.get_u16();
            peers.push(SocketAddr::from((ip, port)));
        }

        Ok(AnnounceResponse {
            interval: Some(Duration::from_secs(u64::from(interval))),
            peers,
        })
    }

    /// Performs the connect exchange and returns the connection id.
    async fn connect(
        &mut self,
        socket: &mut UdpSocket,
        addr: SocketAddr,
    ) -> Result<u64> {
        let transaction_id = rand::thread_rng().gen::<u32>();
        let mut request = BytesMut::with_capacity(16);
        request.put_u64(PROTOCOL_MAGIC);
        request.put_u32(ACTION_CONNECT);
        request.put_u32(transaction_id);

        let mut response = self
            .exchange(socket, addr, &request, transaction_id, ACTION_CONNECT, 8)
            .await?;
        Ok(response.get_u64())
    }

    /// Sends the request and waits for a response with a matching
    /// transaction id, following the protocol's retransmit schedule.
    /// Datagrams from other senders, with foreign transaction ids, or too
    /// short to carry the expected action are discarded without consuming
    /// an attempt. The returned buffer starts after the action and
    /// transaction id words.
    async fn exchange(
        &mut self,
        socket: &mut UdpSocket,
        addr: SocketAddr,
        request: &[u8],
        transaction_id: u32,
        expected_action: u32,
        min_payload_len: usize,
    ) -> Result<BytesMut> {
        for attempt in 0..MAX_ATTEMPTS {
            socket.send_to(request, &addr).await?;

            let wait = Duration::from_secs(15 * (1 << attempt));
            let received = time::timeout(wait, async {
                let mut buf = [0; 1500];
                loop {
                    let (len, from) = socket.recv_from(&mut buf).await?;
                    if from != addr || len < 8 {
                        continue;
                    }
                    let mut response = BytesMut::from(&buf[..len]);
                    let action = response.get_u32();
                    if response.get_u32() != transaction_id {
                        log::debug!(
                            "Tracker {} transaction id mismatch",
                            self.url
                        );
                        continue;
                    }
                    if action == ACTION_ERROR {
                        let message =
                            String::from_utf8_lossy(&response).into_owned();
                        return Err(Error::Tracker(message));
                    }
                    if action != expected_action
                        || response.remaining() < min_payload_len
                    {
                        continue;
                    }
                    return Ok(response);
                }
            })
            .await;

            match received {
                Ok(result) => return result,
                Err(_) => log::debug!(
                    "Tracker {} attempt {} timed out",
                    self.url,
                    attempt
                ),
            }
        }

        log::warn!("Tracker {} unreachable, marking dead", self.url);
        self.is_dead = true;
        Err(Error::Tracker("tracker timed out".to_string()))
    }
}
