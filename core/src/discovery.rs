use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::transport::{RunFlag, TransportError, POLL_TIMEOUT};

pub const DISCOVERY_KIND: &str = "jigboard";
pub const DISCOVERY_VERSION: u32 = 1;
pub const DEFAULT_DISCOVERY_PORT: u16 = 7778;

pub const SEEK: &str = "seek";
pub const ADVERTISE: &str = "advertise";

const MAX_DATAGRAM: usize = 1024;

/// What a server says about itself:
/// `type:jigboard version:1 port:7777 servername:<rest of line>`.
/// The servername comes last so it may contain spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub kind: String,
    pub version: u32,
    pub port: u16,
    pub servername: String,
}

impl Announcement {
    pub fn new(servername: impl Into<String>, port: u16) -> Self {
        Self {
            kind: DISCOVERY_KIND.to_string(),
            version: DISCOVERY_VERSION,
            port,
            servername: servername.into(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, AnnouncementError> {
        let value = value.trim();
        let (head, servername) = match value.find("servername:") {
            Some(at) => (&value[..at], value[at + "servername:".len()..].trim()),
            None => return Err(AnnouncementError::MissingField("servername")),
        };
        let mut kind = None;
        let mut version = None;
        let mut port = None;
        for token in head.split_whitespace() {
            let Some((key, raw)) = token.split_once(':') else {
                continue;
            };
            match key {
                "type" => kind = Some(raw.to_string()),
                "version" => {
                    version = Some(raw.parse().map_err(|_| AnnouncementError::InvalidNumber {
                        field: "version",
                        value: raw.to_string(),
                    })?)
                }
                "port" => {
                    port = Some(raw.parse().map_err(|_| AnnouncementError::InvalidNumber {
                        field: "port",
                        value: raw.to_string(),
                    })?)
                }
                _ => {}
            }
        }
        Ok(Self {
            kind: kind.ok_or(AnnouncementError::MissingField("type"))?,
            version: version.ok_or(AnnouncementError::MissingField("version"))?,
            port: port.ok_or(AnnouncementError::MissingField("port"))?,
            servername: servername.to_string(),
        })
    }

    pub fn is_compatible(&self) -> bool {
        self.kind == DISCOVERY_KIND && self.version == DISCOVERY_VERSION
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type:{} version:{} port:{} servername:{}",
            self.kind, self.version, self.port, self.servername
        )
    }
}

impl std::str::FromStr for Announcement {
    type Err = AnnouncementError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnouncementError {
    MissingField(&'static str),
    InvalidNumber { field: &'static str, value: String },
}

impl fmt::Display for AnnouncementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnouncementError::MissingField(field) => write!(f, "announcement lacks `{field}:`"),
            AnnouncementError::InvalidNumber { field, value } => {
                write!(f, "invalid {field} '{value}' in announcement")
            }
        }
    }
}

impl std::error::Error for AnnouncementError {}

pub struct DiscoveryResponder {
    socket: UdpSocket,
    announcement: Announcement,
    periodic: Option<(Duration, SocketAddr)>,
    running: RunFlag,
}

impl DiscoveryResponder {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        announcement: Announcement,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            announcement,
            periodic: None,
            running: RunFlag::default(),
        })
    }

    pub fn with_periodic(mut self, every: Duration, target: SocketAddr) -> Self {
        self.periodic = Some((every, target));
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn announcement(&self) -> &Announcement {
        &self.announcement
    }

    pub fn stop(&self) {
        self.running.stop();
    }

    pub async fn run(&self) -> Result<(), TransportError> {
        self.running.start();
        info!("discovery answering on {}", self.socket.local_addr()?);
        let reply = format!("{ADVERTISE} {}", self.announcement);
        let mut last_announce: Option<Instant> = None;
        let mut buf = [0u8; MAX_DATAGRAM];
        while self.running.is_running() {
            if let Some((every, target)) = self.periodic {
                if last_announce.map_or(true, |at| at.elapsed() >= every) {
                    if let Err(err) = self.socket.send_to(reply.as_bytes(), target).await {
                        warn!("announcement to {target} failed: {err}");
                    }
                    last_announce = Some(Instant::now());
                }
            }
            let (len, from) = match timeout(POLL_TIMEOUT, self.socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok(received)) => received,
                Ok(Err(err)) => {
                    debug!("discovery receive failed: {err}");
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&buf[..len]);
            if text.trim() != SEEK {
                debug!("discovery datagram ignored: not a seek (from={from})");
                continue;
            }
            debug!("answering seek from {from}");
            if let Err(err) = self.socket.send_to(reply.as_bytes(), from).await {
                warn!("advertise to {from} failed: {err}");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub from: SocketAddr,
    pub announcement: Announcement,
}

impl Discovered {
    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.from.ip(), self.announcement.port)
    }
}

fn remember(found: &mut Vec<Discovered>, from: SocketAddr, datagram: &str) {
    let Some(body) = datagram.trim().strip_prefix(ADVERTISE) else {
        debug!("discovery reply ignored: not an advertise (from={from})");
        return;
    };
    let announcement = match Announcement::parse(body) {
        Ok(announcement) => announcement,
        Err(err) => {
            debug!("discovery reply ignored: {err} (from={from})");
            return;
        }
    };
    if !announcement.is_compatible() {
        debug!("discovery reply ignored: {} v{}", announcement.kind, announcement.version);
        return;
    }
    if found
        .iter()
        .any(|known| known.announcement.servername == announcement.servername)
    {
        return;
    }
    found.push(Discovered { from, announcement });
}

pub async fn seek(port: u16, wait: Duration) -> Result<Vec<Discovered>, TransportError> {
    seek_at(SocketAddr::from((Ipv4Addr::BROADCAST, port)), wait).await
}

pub async fn seek_at(target: SocketAddr, wait: Duration) -> Result<Vec<Discovered>, TransportError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    socket.send_to(SEEK.as_bytes(), target).await?;
    let deadline = Instant::now() + wait;
    let mut found = Vec::new();
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Ok((len, from))) => remember(&mut found, from, &String::from_utf8_lossy(&buf[..len])),
            Ok(Err(err)) => return Err(err.into()),
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn announcement_text_round_trips() {
        let ann = Announcement::new("Kitchen table", 7777);
        let text = ann.to_string();
        assert_eq!(text, "type:jigboard version:1 port:7777 servername:Kitchen table");
        assert_eq!(text.parse::<Announcement>().unwrap(), ann);
    }

    #[test]
    fn announcement_errors() {
        assert_eq!(
            Announcement::parse("type:jigboard version:1 port:1"),
            Err(AnnouncementError::MissingField("servername"))
        );
        assert_eq!(
            Announcement::parse("type:jigboard port:1 servername:x"),
            Err(AnnouncementError::MissingField("version"))
        );
        assert!(matches!(
            Announcement::parse("type:jigboard version:1 port:http servername:x"),
            Err(AnnouncementError::InvalidNumber { field: "port", .. })
        ));
    }

    #[test]
    fn replies_are_deduplicated_by_servername() {
        let a: SocketAddr = "10.0.0.1:7778".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:7778".parse().unwrap();
        let mut found = Vec::new();
        remember(&mut found, a, "advertise type:jigboard version:1 port:7777 servername:one");
        remember(&mut found, b, "advertise type:jigboard version:1 port:7000 servername:one");
        remember(&mut found, b, "advertise type:other version:1 port:7000 servername:two");
        remember(&mut found, b, "seek");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].server_addr(), "10.0.0.1:7777".parse().unwrap());
    }

    #[tokio::test]
    async fn seek_finds_responder() {
        let responder = Arc::new(
            DiscoveryResponder::bind("127.0.0.1:0", Announcement::new("test", 4242))
                .await
                .unwrap(),
        );
        let addr = responder.local_addr().unwrap();
        let task = tokio::spawn({
            let responder = Arc::clone(&responder);
            async move { responder.run().await }
        });
        let found = seek_at(addr, Duration::from_millis(500)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].announcement.servername, "test");
        assert_eq!(found[0].server_addr().port(), 4242);
        responder.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn periodic_announcement_arrives_unasked() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let responder = Arc::new(
            DiscoveryResponder::bind("127.0.0.1:0", Announcement::new("attic", 7001))
                .await
                .unwrap()
                .with_periodic(Duration::from_millis(50), target),
        );
        let task = tokio::spawn({
            let responder = Arc::clone(&responder);
            async move { responder.run().await }
        });

        let mut buf = [0u8; MAX_DATAGRAM];
        for _ in 0..2 {
            let (len, _) = timeout(Duration::from_secs(2), listener.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let mut found = Vec::new();
            remember(&mut found, target, &String::from_utf8_lossy(&buf[..len]));
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].announcement.servername, "attic");
            assert_eq!(found[0].announcement.port, 7001);
        }
        responder.stop();
        task.await.unwrap().unwrap();
    }
}
