//! Reachability checks run by Load before a node is persisted.
//!
//! The check belongs to the remote-shell side of the system, so the directory
//! only sees the [`ReachabilityProbe`] trait. [`SshBannerProbe`] is the default:
//! it connects to the node's shell port and waits for the `SSH-` protocol
//! identification line.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::entity::Node;
use crate::error::{DirectoryError, Result};

/// Connect + banner budget per node.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(4);

#[async_trait]
pub trait ReachabilityProbe: Send + Sync + 'static {
    async fn check(&self, node: &Node) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
pub struct SshBannerProbe {
    timeout: Duration,
}

impl SshBannerProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SshBannerProbe {
    fn default() -> Self {
        Self::new(PROBE_TIMEOUT)
    }
}

#[async_trait]
impl ReachabilityProbe for SshBannerProbe {
    async fn check(&self, node: &Node) -> Result<()> {
        let target = format!("{}:{}", node.ip, node.port);
        let probe = async {
            let mut stream = TcpStream::connect(&target)
                .await
                .map_err(|e| DirectoryError::Reachability(format!("{}: {}", target, e)))?;
            let mut banner = [0u8; 4];
            stream
                .read_exact(&mut banner)
                .await
                .map_err(|e| DirectoryError::Reachability(format!("{}: {}", target, e)))?;
            if &banner != b"SSH-" {
                return Err(DirectoryError::Reachability(format!(
                    "{}: not a remote shell endpoint",
                    target
                )));
            }
            Ok(())
        };
        tokio::time::timeout(self.timeout, probe)
            .await
            .map_err(|_| DirectoryError::Reachability(format!("{}: timed out", target)))?
    }
}

/// Accepts every node. Used with `--skip-reachability` and in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysReachable;

#[async_trait]
impl ReachabilityProbe for AlwaysReachable {
    async fn check(&self, _node: &Node) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn node_at(port: u16) -> Node {
        Node {
            ip: "127.0.0.1".to_string(),
            port,
            ..Node::default()
        }
    }

    async fn serve_banner(banner: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(banner).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn ssh_banner_is_reachable() {
        let port = serve_banner(b"SSH-2.0-OpenSSH_9.6\r\n").await;
        SshBannerProbe::default().check(&node_at(port)).await.unwrap();
    }

    #[tokio::test]
    async fn other_protocol_is_rejected() {
        let port = serve_banner(b"HTTP/1.1 400 Bad Request\r\n").await;
        let err = SshBannerProbe::default().check(&node_at(port)).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Reachability(_)));
    }

    #[tokio::test]
    async fn closed_port_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = SshBannerProbe::new(Duration::from_millis(500));
        assert!(probe.check(&node_at(port)).await.is_err());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let probe = SshBannerProbe::new(Duration::from_millis(200));
        let err = probe.check(&node_at(port)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
