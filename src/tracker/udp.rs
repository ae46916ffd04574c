use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use url::Url;

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceResponse};
use super::AnnounceRequest;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const UDP_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 3;

/// A BEP-15 tracker session: one connect exchange, then announces.
pub struct UdpTracker {
    socket: UdpSocket,
    addr: SocketAddr,
    connection_id: u64,
}

impl UdpTracker {
    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        let addr = resolve(url).await?;
        let bind: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;

        let transaction_id: u32 = rand::rng().random();
        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());

        let response = send_and_receive(&socket, &request, 16).await?;
        if read_u32(&response, 0) != ACTION_CONNECT || read_u32(&response, 4) != transaction_id {
            return Err(TrackerError::InvalidResponse(
                "connect response mismatch".into(),
            ));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&response[8..16]);
        Ok(Self {
            socket,
            addr,
            connection_id: u64::from_be_bytes(id),
        })
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();

        let mut packet = Vec::with_capacity(98);
        packet.extend_from_slice(&self.connection_id.to_be_bytes());
        packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(request.info_hash.as_bytes());
        packet.extend_from_slice(request.peer_id.as_bytes());
        packet.extend_from_slice(&request.downloaded.to_be_bytes());
        packet.extend_from_slice(&request.left.to_be_bytes());
        packet.extend_from_slice(&request.uploaded.to_be_bytes());
        packet.extend_from_slice(&request.event.as_udp_id().to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // ip: use the sender's
        packet.extend_from_slice(&key.to_be_bytes());
        packet.extend_from_slice(&(-1i32).to_be_bytes()); // num_want: default
        packet.extend_from_slice(&request.port.to_be_bytes());

        let response = send_and_receive(&self.socket, &packet, 8).await?;
        let action = read_u32(&response, 0);
        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(&response[8..]).to_string();
            return Err(TrackerError::Failure(message));
        }
        if action != ACTION_ANNOUNCE || read_u32(&response, 4) != transaction_id {
            return Err(TrackerError::InvalidResponse(
                "announce response mismatch".into(),
            ));
        }
        if response.len() < 20 {
            return Err(TrackerError::InvalidResponse("response too short".into()));
        }

        let mut result = AnnounceResponse::new(read_u32(&response, 8));
        result.incomplete = Some(read_u32(&response, 12));
        result.complete = Some(read_u32(&response, 16));
        result.peers = parse_compact_peers(&response[20..]);
        Ok(result)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

async fn send_and_receive(
    socket: &UdpSocket,
    request: &[u8],
    min_response_size: usize,
) -> Result<Vec<u8>, TrackerError> {
    let mut buf = vec![0u8; 2048];

    for attempt in 0..MAX_RETRIES {
        socket.send(request).await?;

        match timeout(UDP_TIMEOUT * (1 << attempt), socket.recv(&mut buf)).await {
            Ok(Ok(n)) if n >= min_response_size => return Ok(buf[..n].to_vec()),
            Ok(Ok(_)) => {
                return Err(TrackerError::InvalidResponse("response too short".into()));
            }
            Ok(Err(e)) => return Err(TrackerError::Io(e)),
            Err(_) => continue,
        }
    }

    Err(TrackerError::Timeout)
}

async fn resolve(url: &str) -> Result<SocketAddr, TrackerError> {
    let parsed = Url::parse(url).map_err(|_| TrackerError::InvalidUrl(url.to_string()))?;
    let (Some(host), Some(port)) = (parsed.host_str(), parsed.port()) else {
        return Err(TrackerError::InvalidUrl(url.to_string()));
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()));
    addr
}
