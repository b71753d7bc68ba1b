use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use taskd_core::config::NetworkConfig;
use taskd_core::protocol::BaseMessage;
use taskd_core::transport::Transport;
use taskd_core::TaskdError;

/// Newline-delimited JSON over short-lived TCP connections.
///
/// Receivers resolve by exact identity first (`Agent3`), then by role
/// (`Agent`), then through the default route.
pub struct TcpTransport {
    routes: HashMap<String, SocketAddr>,
    default_route: Option<SocketAddr>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            routes: config.routes.clone(),
            default_route: config.default_route,
            timeout: Duration::from_millis(config.send_timeout_ms),
        }
    }

    fn route(&self, name: &str, role: &str) -> Option<SocketAddr> {
        self.routes
            .get(name)
            .or_else(|| self.routes.get(role))
            .copied()
            .or(self.default_route)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, msg: &BaseMessage) -> Result<(), TaskdError> {
        let addr = self
            .route(&msg.dst.name, &msg.dst.role)
            .ok_or_else(|| TaskdError::Transport(format!("no route to {}", msg.dst)))?;

        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');

        let write = async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(&line).await?;
            stream.flush().await?;
            stream.shutdown().await
        };
        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(())) => {
                debug!("Sent {:?} {} to {} at {}", msg.biz_type, msg.uuid, msg.dst, addr);
                Ok(())
            }
            Ok(Err(e)) => Err(TaskdError::Transport(format!("{} at {}: {}", msg.dst, addr, e))),
            Err(_) => Err(TaskdError::Transport(format!(
                "{} at {}: timed out after {:?}",
                msg.dst, addr, self.timeout
            ))),
        }
    }

    fn can_reach(&self, receiver: &str) -> bool {
        let role = taskd_manager::sender::position_for(receiver).role;
        self.route(receiver, &role).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskd_core::protocol::{BizType, Position};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn frame(dst: Position) -> BaseMessage {
        BaseMessage {
            uuid: "s-1".into(),
            biz_type: BizType::Action,
            src: Position::new("Mgr", "Mgr"),
            dst,
            body: "{}".into(),
        }
    }

    #[test]
    fn test_route_precedence() {
        let exact: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let role: SocketAddr = "127.0.0.1:7002".parse().unwrap();
        let fallback: SocketAddr = "127.0.0.1:7003".parse().unwrap();
        let mut config = NetworkConfig::default();
        config.routes.insert("Agent0".into(), exact);
        config.routes.insert("Agent".into(), role);
        config.default_route = Some(fallback);
        let transport = TcpTransport::new(&config);

        assert_eq!(transport.route("Agent0", "Agent"), Some(exact));
        assert_eq!(transport.route("Agent5", "Agent"), Some(role));
        assert_eq!(transport.route("Controller", "Controller"), Some(fallback));
    }

    #[test]
    fn test_unrouted_receiver_unreachable() {
        let transport = TcpTransport::new(&NetworkConfig::default());
        assert!(!transport.can_reach("Controller"));
    }

    #[tokio::test]
    async fn test_send_writes_json_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = NetworkConfig::default();
        config.routes.insert("Controller".into(), listener.local_addr().unwrap());
        let transport = TcpTransport::new(&config);

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            lines.next_line().await.unwrap().unwrap()
        });

        let msg = frame(Position::new("Controller", "Controller"));
        transport.send(&msg).await.unwrap();

        let line = accept.await.unwrap();
        let received: BaseMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_send_without_route_fails() {
        let transport = TcpTransport::new(&NetworkConfig::default());
        let err = transport
            .send(&frame(Position::new("Agent", "Agent1")))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskdError::Transport(_)));
    }
}
