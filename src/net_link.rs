//! WebSocket transport for the duplex session channel.
//!
//! Translates between the service's JSON frames and [`InboundEvent`] /
//! [`OutboundEvent`]. A session gets exactly one connection: any failure is
//! reported as `SessionError` and the link exits without reconnecting.

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::config::Config;
use crate::error::VoiceError;
use crate::protocol::{
    InboundEvent, OutboundEvent, build_setup_message, encode_outbound, parse_server_message,
};

pub struct NetLink {
    config: Config,
    declarations: Vec<Value>,
    inbound: mpsc::Sender<InboundEvent>,
    outbound: mpsc::UnboundedReceiver<OutboundEvent>,
}

/// Whether the session is still listening after a forward.
enum Delivery {
    Delivered,
    SessionGone,
}

impl NetLink {
    pub fn new(
        config: Config,
        declarations: Vec<Value>,
        inbound: mpsc::Sender<InboundEvent>,
        outbound: mpsc::UnboundedReceiver<OutboundEvent>,
    ) -> Self {
        Self {
            config,
            declarations,
            inbound,
            outbound,
        }
    }

    pub async fn run(mut self) {
        match self.connect_and_loop().await {
            Ok(()) => log::info!("Channel closed"),
            Err(e) => {
                let err = VoiceError::Channel(format!("{:#}", e));
                log::error!("{}", err);
                let _ = self.inbound.send(InboundEvent::SessionError(err.to_string())).await;
            }
        }
    }

    /// The service URL with the API key attached as the `key` query parameter.
    fn endpoint(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.config.ws_url)
            .with_context(|| format!("invalid ws_url {:?}", self.config.ws_url))?;
        if !self.config.api_key.is_empty() {
            url.query_pairs_mut().append_pair("key", &self.config.api_key);
        }
        Ok(url)
    }

    async fn connect_and_loop(&mut self) -> anyhow::Result<()> {
        let url = self.endpoint()?;

        log::info!("Connecting to {}...", self.config.ws_url);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .context("websocket connect failed")?;
        log::info!("Connected!");

        let (mut write, mut read) = ws_stream.split();

        let setup = build_setup_message(&self.config, std::mem::take(&mut self.declarations));
        let setup_json = serde_json::to_string(&setup)?;
        log::debug!("Sending setup: {}", setup_json);
        write.send(Message::Text(setup_json.into())).await?;

        loop {
            tokio::select! {
                msg = read.next() => {
                    let delivery = match msg {
                        Some(Ok(Message::Text(text))) => self.forward(text.as_str()).await,
                        // The service also sends JSON in binary frames
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => self.forward(text).await,
                            Err(_) => {
                                log::warn!("Ignoring non-UTF-8 binary frame ({} bytes)", data.len());
                                Delivery::Delivered
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Server closed connection: {:?}", frame);
                            let _ = self.inbound.send(InboundEvent::SessionClosed).await;
                            return Ok(());
                        }
                        Some(Ok(_)) => Delivery::Delivered,
                        Some(Err(e)) => return Err(e.into()),
                        None => anyhow::bail!("connection closed without a close frame"),
                    };
                    if let Delivery::SessionGone = delivery {
                        log::info!("Session ended, dropping connection");
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                event = self.outbound.recv() => match event {
                    Some(OutboundEvent::Close) | None => {
                        log::info!("Closing connection");
                        if let Err(e) = write.send(Message::Close(None)).await {
                            log::debug!("Close frame not delivered: {}", e);
                        }
                        return Ok(());
                    }
                    Some(event) => {
                        if let Some(text) = encode_outbound(&event)? {
                            write.send(Message::Text(text.into())).await?;
                        }
                    }
                },
            }
        }
    }

    async fn forward(&self, text: &str) -> Delivery {
        for event in parse_server_message(text, self.config.output_sample_rate) {
            log::debug!("Inbound event: {}", describe(&event));
            if self.inbound.send(event).await.is_err() {
                return Delivery::SessionGone;
            }
        }
        Delivery::Delivered
    }
}

fn describe(event: &InboundEvent) -> String {
    match event {
        InboundEvent::AudioDelta { data, sample_rate, .. } => {
            format!("audio ({} base64 bytes @ {} Hz)", data.len(), sample_rate)
        }
        InboundEvent::ToolCallRequest(req) => format!("tool call {} ({})", req.id, req.name),
        other => format!("{:?}", other),
    }
}
