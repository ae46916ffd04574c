use super::error::TrackerError;
use super::response::{parse_compact_peers, parse_compact_peers6, AnnounceResponse};
use super::AnnounceRequest;
use crate::bencode::{decode, Value};
use reqwest::Client;
use std::net::SocketAddr;

pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn with_client(client: Client, url: &str) -> Result<Self, TrackerError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url,
            separator,
            url_encode(request.info_hash.as_bytes()),
            url_encode(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left
        );

        let event = request.event.as_str();
        if !event.is_empty() {
            url.push_str("&event=");
            url.push_str(event);
        }

        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_announce(&decode(&body)?)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn parse_announce(value: &Value) -> Result<AnnounceResponse, TrackerError> {
    if value.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("expected dict".into()));
    }
    if let Some(failure) = value.get_str(b"failure reason") {
        return Err(TrackerError::Failure(failure.to_string()));
    }

    let interval = value
        .get_integer(b"interval")
        .ok_or_else(|| TrackerError::InvalidResponse("missing interval".into()))?;

    let mut response = AnnounceResponse::new(interval.clamp(0, u32::MAX as i64) as u32);
    response.min_interval = value.get_integer(b"min interval").map(|v| v as u32);
    response.complete = value.get_integer(b"complete").map(|v| v as u32);
    response.incomplete = value.get_integer(b"incomplete").map(|v| v as u32);
    response.warning_message = value.get_str(b"warning message").map(String::from);

    match value.get(b"peers") {
        Some(Value::Bytes(compact)) => response.peers = parse_compact_peers(compact),
        Some(Value::List(list)) => {
            for peer in list {
                let ip = peer.get_str(b"ip").and_then(|s| s.parse().ok());
                let port = peer.get_integer(b"port").map(|p| p as u16);
                if let (Some(ip), Some(port)) = (ip, port) {
                    response.peers.push(SocketAddr::new(ip, port));
                }
            }
        }
        _ => {}
    }

    if let Some(peers6) = value.get_bytes(b"peers6") {
        response.peers.extend(parse_compact_peers6(peers6));
    }

    Ok(response)
}

fn url_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~' {
                format!("{}", b as char)
            } else {
                format!("%{:02X}", b)
            }
        })
        .collect()
}
