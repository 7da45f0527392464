//! Change feed over a STOMP 1.2 broker.
//!
//! The database relays row changes to `/topic/{prefix}.{table}` as webhook
//! JSON. Each subscription owns one broker connection; the connection task
//! reconnects on failure and exits once the consumer drops the feed.

use super::{ChangeFeed, ChangeKind, EventFilter, RowChange};
use crate::error::StoreError;
use anyhow::{Result, anyhow};
use compact_str::CompactString;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct StompConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub prefix: String,
}

impl StompConfig {
    pub fn destination(&self, table: &str) -> String {
        format!("/topic/{}.{}", self.prefix, table)
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct Frame {
    pub command: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Database webhook payload as relayed by the broker.
#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(rename = "type")]
    kind: ChangeKind,
    table: CompactString,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

enum PumpExit {
    ConsumerGone,
}

#[derive(Clone)]
pub struct StompFeed {
    config: Arc<StompConfig>,
}

impl StompFeed {
    pub fn new(config: StompConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Connect and subscribe before returning, so a broker that cannot be
    /// reached surfaces as a subscription error to the caller.
    pub async fn subscribe(&self, table: &str, filter: EventFilter) -> Result<ChangeFeed, StoreError> {
        let destination = self.config.destination(table);
        let session = Session::open(&self.config, &destination)
            .await
            .map_err(|e| StoreError::Subscription(format!("{}: {}", destination, e)))?;

        let (tx, feed) = ChangeFeed::channel(table);
        let config = self.config.clone();
        let table = CompactString::from(table);
        tokio::spawn(async move {
            run_feed(config, destination, table, filter, session, tx).await;
        });
        Ok(feed)
    }
}

async fn run_feed(
    config: Arc<StompConfig>,
    destination: String,
    table: CompactString,
    filter: EventFilter,
    mut session: Session,
    tx: tokio::sync::mpsc::Sender<RowChange>,
) {
    loop {
        match pump(&mut session, &table, &filter, &tx).await {
            Ok(PumpExit::ConsumerGone) => {
                let _ = session.writer.write_all(b"DISCONNECT\n\n\0").await;
                debug!(%destination, "change feed released");
                return;
            }
            Err(e) => warn!(%destination, error = %e, "change feed connection lost"),
        }

        // Events committed while disconnected are not replayed.
        loop {
            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
            info!(host = %config.host, port = config.port, %destination, "reconnecting change feed");
            match Session::open(&config, &destination).await {
                Ok(s) => {
                    session = s;
                    break;
                }
                Err(e) => warn!(%destination, error = %e, "change feed reconnect failed"),
            }
        }
    }
}

async fn pump(
    session: &mut Session,
    table: &str,
    filter: &EventFilter,
    tx: &tokio::sync::mpsc::Sender<RowChange>,
) -> Result<PumpExit> {
    loop {
        let frame = tokio::select! {
            _ = tx.closed() => return Ok(PumpExit::ConsumerGone),
            frame = read_frame(&mut session.reader) => frame?,
        };

        match frame.command.as_str() {
            "MESSAGE" => {}
            "ERROR" => {
                let msg = frame.headers.get("message").cloned().unwrap_or_default();
                return Err(anyhow!("broker error: {}", msg));
            }
            _ => continue,
        }

        match decode_message(&frame) {
            Ok(Some(change)) if change.table == table && filter.admits(change.kind) => {
                if tx.send(change).await.is_err() {
                    return Ok(PumpExit::ConsumerGone);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(
                error = %e,
                body = %String::from_utf8_lossy(&frame.body),
                "undecodable change message"
            ),
        }

        // Some brokers put the ack id in `ack`, others only send `message-id`.
        if let Some(ack_id) = frame.headers.get("ack").or_else(|| frame.headers.get("message-id")) {
            let ack_frame = format!("ACK\nid:{}\n\n\0", ack_id);
            session.writer.write_all(ack_frame.as_bytes()).await?;
        }
    }
}

impl Session {
    async fn open(config: &StompConfig, destination: &str) -> Result<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let connect_frame = format!(
            "CONNECT\naccept-version:1.2\nhost:{}\nlogin:{}\npasscode:{}\n\n\0",
            config.host, config.user, config.pass
        );
        writer.write_all(connect_frame.as_bytes()).await?;

        let reply = read_frame(&mut reader).await?;
        if reply.command != "CONNECTED" {
            let msg = reply.headers.get("message").cloned().unwrap_or(reply.command);
            return Err(anyhow!("broker refused connection: {}", msg));
        }

        let subscribe_frame = format!(
            "SUBSCRIBE\nid:0\ndestination:{}\nack:client-individual\n\n\0",
            destination
        );
        writer.write_all(subscribe_frame.as_bytes()).await?;
        info!(%destination, "subscribed to change feed");

        Ok(Self { reader, writer })
    }
}

/// Read one frame. Leading EOLs are heartbeats and get skipped.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut command = String::new();
    loop {
        command.clear();
        let bytes = reader.read_line(&mut command).await?;
        if bytes == 0 {
            return Err(anyhow!("EOF"));
        }
        if command.trim_matches(|c| c == '\0' || char::is_whitespace(c)).is_empty() {
            continue;
        }
        break;
    }

    let mut headers = HashMap::new();
    let mut content_length = None;
    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line).await? == 0 {
            return Err(anyhow!("EOF in headers"));
        }
        let trimmed = header_line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((k, v)) = trimmed.split_once(':') {
            let key = k.trim().to_lowercase();
            let val = v.trim().to_string();
            if key == "content-length" {
                content_length = val.parse::<usize>().ok();
            }
            // First occurrence wins for repeated headers.
            headers.entry(key).or_insert(val);
        }
    }

    let body = match content_length {
        Some(len) => {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            let mut null_byte = [0u8; 1];
            reader.read_exact(&mut null_byte).await?;
            if null_byte[0] != 0 {
                return Err(anyhow!("frame not NUL-terminated"));
            }
            body
        }
        None => {
            let mut body = Vec::new();
            reader.read_until(0, &mut body).await?;
            if body.pop() != Some(0) {
                return Err(anyhow!("EOF in body"));
            }
            body
        }
    };

    Ok(Frame {
        command: command.trim().to_string(),
        headers,
        body,
    })
}

/// Turn a MESSAGE body into a row change. Empty bodies yield `None`.
pub fn decode_message(frame: &Frame) -> Result<Option<RowChange>> {
    if frame.body.is_empty() {
        return Ok(None);
    }

    let gzipped = frame
        .headers
        .get("content-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"))
        || frame.body.starts_with(&[0x1f, 0x8b]);

    let payload: WebhookPayload = if gzipped {
        let mut d = GzDecoder::new(&frame.body[..]);
        let mut json = String::new();
        d.read_to_string(&mut json)?;
        serde_json::from_str(&json)?
    } else {
        serde_json::from_slice(&frame.body)?
    };

    Ok(Some(RowChange {
        kind: payload.kind,
        table: payload.table,
        new: payload.record,
        old: payload.old_record,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use serde_json::json;
    use std::io::Write;

    #[tokio::test]
    async fn test_read_frames_with_and_without_length() {
        let wire: &[u8] = b"\n\nCONNECTED\nversion:1.2\n\n\0\nMESSAGE\nack:42\ncontent-length:5\n\nhello\0MESSAGE\nmessage-id:7\n\nworld\0";
        let mut reader = BufReader::new(wire);

        let f = read_frame(&mut reader).await.unwrap();
        assert_eq!(f.command, "CONNECTED");
        assert_eq!(f.headers.get("version").map(String::as_str), Some("1.2"));
        assert!(f.body.is_empty());

        let f = read_frame(&mut reader).await.unwrap();
        assert_eq!(f.command, "MESSAGE");
        assert_eq!(f.headers.get("ack").map(String::as_str), Some("42"));
        assert_eq!(f.body, b"hello");

        let f = read_frame(&mut reader).await.unwrap();
        assert_eq!(f.headers.get("message-id").map(String::as_str), Some("7"));
        assert_eq!(f.body, b"world");

        assert!(read_frame(&mut reader).await.is_err());
    }

    #[test]
    fn test_decode_webhook_payload() {
        let body = json!({
            "type": "UPDATE",
            "table": "trains",
            "schema": "public",
            "record": {"id": "a", "status": "delayed"},
            "old_record": {"id": "a", "status": "on-time"}
        });
        let frame = Frame {
            command: "MESSAGE".into(),
            headers: HashMap::new(),
            body: serde_json::to_vec(&body).unwrap(),
        };

        let change = decode_message(&frame).unwrap().unwrap();
        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(change.table, "trains");
        assert_eq!(change.new.unwrap()["status"], "delayed");
        assert_eq!(change.old.unwrap()["status"], "on-time");
    }

    #[test]
    fn test_decode_gzipped_delete() {
        let body = json!({"type": "DELETE", "table": "alerts", "record": null, "old_record": {"id": "x"}});
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(body.to_string().as_bytes()).unwrap();
        let frame = Frame {
            command: "MESSAGE".into(),
            headers: HashMap::from([("content-encoding".to_string(), "gzip".to_string())]),
            body: enc.finish().unwrap(),
        };

        let change = decode_message(&frame).unwrap().unwrap();
        assert_eq!(change.kind, ChangeKind::Delete);
        assert!(change.new.is_none());
        assert_eq!(change.old.unwrap()["id"], "x");
    }

    #[test]
    fn test_empty_body_is_ignored() {
        let frame = Frame {
            command: "MESSAGE".into(),
            ..Default::default()
        };
        assert!(decode_message(&frame).unwrap().is_none());
    }

    #[test]
    fn test_destination_naming() {
        let cfg = StompConfig {
            host: "localhost".into(),
            port: 61613,
            user: String::new(),
            pass: String::new(),
            prefix: "realtime.public".into(),
        };
        assert_eq!(cfg.destination("alerts"), "/topic/realtime.public.alerts");
    }
}
