//! Component B - database probe.
//!
//! Confirms the database accepts connections after a restart. Reads just
//! enough of the MySQL/MariaDB initial handshake packet to know something
//! is actually speaking the protocol on the other end; it does not own
//! reconnection retries - that is the orchestrator's job.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSpec<'a> {
    pub host: &'a str,
    pub port: u16,
}

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts a TCP connect and reads the handshake's leading length/sequence
/// header, which is enough to establish liveness without a full SQL client.
pub async fn verify(spec: ConnectionSpec<'_>) -> bool {
    verify_with_timeout(spec, DEFAULT_PROBE_TIMEOUT).await
}

pub async fn verify_with_timeout(spec: ConnectionSpec<'_>, bound: Duration) -> bool {
    let attempt = async {
        let mut stream = TcpStream::connect((spec.host, spec.port)).await.ok()?;
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.ok()?;
        // MySQL/MariaDB packets start with a 3-byte little-endian length
        // followed by a 1-byte sequence id; a zero-length handshake means
        // nothing real is listening.
        let declared_len = u32::from_le_bytes([header[0], header[1], header[2], 0]);
        Some(declared_len > 0)
    };

    matches!(timeout(bound, attempt).await, Ok(Some(true)))
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn verify_succeeds_against_a_handshake_like_packet() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[10, 0, 0, 0, b'5', b'.', b'7']).await.ok();
        });

        let ok = verify(ConnectionSpec {
            host: "127.0.0.1",
            port: addr.port(),
        })
        .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn verify_fails_when_nothing_is_listening() {
        let ok = verify_with_timeout(
            ConnectionSpec {
                host: "127.0.0.1",
                port: 1,
            },
            Duration::from_millis(200),
        )
        .await;
        assert!(!ok);
    }
}
