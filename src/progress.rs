use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;


#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub job_id: String,
    pub percent: f64,
}


/// Parses `PGUP/<pid>/<job-id>/<percent>`.
pub fn parse_datagram(datagram: &[u8]) -> Option<ProgressEvent> {
    let text = std::str::from_utf8(datagram).ok()?;
    let parts: Vec<&str> = text.trim_end().split('/').collect();
    if parts.len() != 4 || parts[0] != "PGUP" {
        return None;
    }

    let percent: f64 = parts[3].parse().ok()?;
    if percent.is_nan() {
        return None;
    }

    Some(ProgressEvent {
        job_id: parts[2].to_string(),
        percent,
    })
}


/// Listens for progress datagrams emitted by the engine and publishes them
/// to every subscriber.
pub struct ProgressReceiver {
    local_addr: SocketAddr,
    events: broadcast::Sender<ProgressEvent>,
}

impl ProgressReceiver {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (events, _) = broadcast::channel(256);

        tracing::info!(%local_addr, "Listening on UDP for progress updates");
        tokio::spawn(receive(socket, events.clone()));

        Ok(Self { local_addr, events })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }
}


async fn receive(socket: UdpSocket, events: broadcast::Sender<ProgressEvent>) {
    let mut buf = [0u8; 1024];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, _)) => {
                if let Some(event) = parse_datagram(&buf[..len]) {
                    // No subscribers is fine; the event is simply dropped.
                    let _ = events.send(event);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Progress listener error, closing");
                return;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_datagram() {
        assert_eq!(
            parse_datagram(b"PGUP/1234/8c5a-11/42.5"),
            Some(ProgressEvent { job_id: "8c5a-11".to_string(), percent: 42.5 })
        );
    }

    #[test]
    fn rejects_malformed_datagrams() {
        assert_eq!(parse_datagram(b"PGUP/1234/abc"), None);
        assert_eq!(parse_datagram(b"PGUP/1234/abc/50/extra"), None);
        assert_eq!(parse_datagram(b"PGUP/1234/abc/fifty"), None);
        assert_eq!(parse_datagram(b"PGUP/1234/abc/NaN"), None);
        assert_eq!(parse_datagram(b"XXXX/1234/abc/50"), None);
        assert_eq!(parse_datagram(&[0xff, 0xfe]), None);
    }
}
