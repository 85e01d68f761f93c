use anyhow::Context;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::signal;
use tokio::sync::mpsc;
use voice_ledger_rs::audio::VolumeSample;
use voice_ledger_rs::config::Config;
use voice_ledger_rs::gui_bridge::{GuiBridge, GuiEvent};
use voice_ledger_rs::ledger::Transaction;
use voice_ledger_rs::{SessionState, SessionStatus, start_session};

/// Append-only JSON Lines file receiving every committed transaction.
struct LedgerFile {
    file: Mutex<std::fs::File>,
}

impl LedgerFile {
    fn open(path: &str) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open ledger file {}", path))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn append(&self, tx: &Transaction) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(tx)?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("ledger file lock poisoned"))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    log::info!("{} {} starting", env!("APP_NAME"), env!("APP_VERSION"));

    let config = Config::load().context("failed to load configuration")?;
    config.validate()?;

    let ledger = Arc::new(LedgerFile::open(&config.ledger_path)?);
    let ledger_path = config.ledger_path.clone();
    let commit = move |tx: Transaction| match ledger.append(&tx) {
        Ok(()) => log::info!(
            "Recorded {} {:?} of {:.2} ({:?}) in {}",
            tx.id,
            tx.kind,
            tx.amount,
            tx.account_origin,
            ledger_path
        ),
        Err(e) => log::error!("Failed to record transaction {}: {:#}", tx.id, e),
    };

    let (tx_gui_event, mut rx_gui_event) = mpsc::channel::<GuiEvent>(16);
    let gui_bridge = Arc::new(GuiBridge::new(&config, tx_gui_event).await?);
    {
        let gui_bridge = gui_bridge.clone();
        tokio::spawn(async move {
            if let Err(e) = gui_bridge.run().await {
                log::error!("GuiBridge error: {}", e);
            }
        });
    }

    let session = start_session(&config, commit).context("failed to start voice session")?;
    {
        let gui_bridge = gui_bridge.clone();
        let status_rx = session.subscribe();
        tokio::spawn(async move {
            if let Err(e) = gui_bridge.publish(status_rx).await {
                log::warn!("Failed to publish status to GUI: {}", e);
            }
        });
    }
    log::info!("Voice session started, say something like \"gastei 40 reais de Uber\"");

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
        }
        Some(GuiEvent::CloseRequested) = rx_gui_event.recv() => {
            log::info!("GUI requested close");
        }
        state = session.ended() => {
            log::info!("Session ended on its own: {}", state);
        }
    }

    let final_state = session.close().await;
    if let Err(e) = gui_bridge
        .send_status(&SessionStatus {
            state: final_state.clone(),
            volume: VolumeSample::SILENT,
        })
        .await
    {
        log::debug!("Final status not delivered to GUI: {}", e);
    }

    match final_state {
        SessionState::Errored(reason) => anyhow::bail!("voice session failed: {}", reason),
        _ => Ok(()),
    }
}
