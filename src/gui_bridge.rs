use crate::config::Config;
use crate::session::SessionStatus;
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

#[derive(Debug, PartialEq)]
pub enum GuiEvent {
    CloseRequested,
}

#[derive(Deserialize)]
struct GuiMessage {
    #[serde(rename = "type")]
    msg_type: String,
}

/// The GUI runs as a separate process and talks to us over local UDP on the
/// configured ports. We push status snapshots, it may ask us to close.
pub struct GuiBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    tx: mpsc::Sender<GuiEvent>,
}

impl GuiBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<GuiEvent>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!("127.0.0.1:{}", config.gui_local_port)).await?;
        let target_addr = format!("127.0.0.1:{}", config.gui_remote_port);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            tx,
        })
    }

    /// Receive datagrams from the GUI until the event receiver goes away.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            let Some(event) = parse_gui_message(&buf[..len]) else {
                continue;
            };
            if self.tx.send(event).await.is_err() {
                log::debug!("GUI event receiver dropped");
                break;
            }
        }
        Ok(())
    }

    /// Forward every status change to the GUI until the session's status
    /// channel closes.
    pub async fn publish(&self, mut status_rx: watch::Receiver<SessionStatus>) -> anyhow::Result<()> {
        loop {
            let status = status_rx.borrow_and_update().clone();
            self.send_status(&status).await?;
            if status.state.is_terminal() || status_rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    pub async fn send_status(&self, status: &SessionStatus) -> anyhow::Result<()> {
        let msg = serde_json::to_string(status)?;
        self.send_message(&msg).await
    }

    pub async fn send_message(&self, msg: &str) -> anyhow::Result<()> {
        self.socket
            .send_to(msg.as_bytes(), &self.target_addr)
            .await?;
        Ok(())
    }
}

fn parse_gui_message(data: &[u8]) -> Option<GuiEvent> {
    let msg: GuiMessage = match serde_json::from_slice(data) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Ignoring malformed GUI message: {}", e);
            return None;
        }
    };
    match msg.msg_type.as_str() {
        "close" => Some(GuiEvent::CloseRequested),
        other => {
            log::debug!("Unhandled GUI message type: {}", other);
            None
        }
    }
}
