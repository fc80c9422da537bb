//! Wake/idle lifecycle of the machine hosting the Inference Backend.
//!
//! The controller remembers one thing: whether *it* woke the host. A host
//! that was already answering when [`PowerController::ensure_available`]
//! ran is never shut down by the idle monitor, because someone else owns it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PowerConfig;
use crate::error::PowerError;
use crate::inference::InferenceBackend;

/// Parse `aa:bb:cc:dd:ee:ff` (or `-` separated) into six bytes.
pub fn parse_mac(raw: &str) -> Result<[u8; 6], PowerError> {
    let invalid = || PowerError::InvalidMac(raw.to_string());
    let parts: Vec<&str> = raw.trim().split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(invalid());
    }
    let mut mac = [0u8; 6];
    for (slot, part) in mac.iter_mut().zip(parts) {
        if part.len() != 2 {
            return Err(invalid());
        }
        *slot = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    Ok(mac)
}

/// Wake-on-LAN magic packet: six `0xFF` bytes then the address sixteen times.
pub fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut packet = [0xFFu8; 102];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac);
    }
    packet
}

/// The two primitives the controller needs from the outside world.
#[async_trait]
pub trait PowerOps: Send + Sync {
    async fn wake(&self) -> Result<(), PowerError>;

    async fn shutdown(&self) -> Result<(), PowerError>;
}

/// Wake-on-LAN broadcast for waking, `ssh` for shutting down.
pub struct WolSshOps {
    mac: [u8; 6],
    broadcast: String,
    port: u16,
    ssh_target: String,
    ssh_key: Option<std::path::PathBuf>,
    shutdown_command: String,
}

impl WolSshOps {
    pub fn from_config(config: &PowerConfig) -> Result<Self, PowerError> {
        let mac = config
            .mac
            .as_deref()
            .ok_or(PowerError::NotConfigured("power.mac"))?;
        let host = config
            .ssh_host
            .as_deref()
            .ok_or(PowerError::NotConfigured("power.ssh_host"))?;
        let ssh_target = match &config.ssh_user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_string(),
        };
        Ok(Self {
            mac: parse_mac(mac)?,
            broadcast: config.broadcast.clone(),
            port: config.port,
            ssh_target,
            ssh_key: config.ssh_key.clone(),
            shutdown_command: config.shutdown_command.clone(),
        })
    }
}

#[async_trait]
impl PowerOps for WolSshOps {
    async fn wake(&self) -> Result<(), PowerError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        let packet = magic_packet(self.mac);
        socket
            .send_to(&packet, (self.broadcast.as_str(), self.port))
            .await?;
        debug!(broadcast = %self.broadcast, port = self.port, "sent wake packet");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PowerError> {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"]);
        if let Some(key) = &self.ssh_key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(&self.ssh_target).arg(&self.shutdown_command);

        let output = cmd
            .output()
            .await
            .map_err(|e| PowerError::Shutdown(format!("failed to run ssh: {}", e)))?;
        if !output.status.success() {
            return Err(PowerError::Shutdown(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PowerState {
    woke_by_us: bool,
    last_activity: Option<Instant>,
}

/// Point-in-time view for the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct PowerSnapshot {
    pub enabled: bool,
    pub woke_by_us: bool,
    pub idle_secs: Option<u64>,
}

/// Marks one inference call in flight; the idle monitor never shuts the
/// host down while any is alive.
pub struct InferenceCall<'a> {
    in_flight: &'a AtomicUsize,
}

impl Drop for InferenceCall<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct PowerController {
    ops: Option<Arc<dyn PowerOps>>,
    backend: Arc<dyn InferenceBackend>,
    state: Mutex<PowerState>,
    in_flight: AtomicUsize,
    wake_timeout: Duration,
    poll_interval: Duration,
    idle_timeout: Duration,
}

impl PowerController {
    /// `ops = None` disables power management: the backend is either up or
    /// unavailable, and nothing is ever woken or shut down.
    pub fn new(
        ops: Option<Arc<dyn PowerOps>>,
        backend: Arc<dyn InferenceBackend>,
        config: &PowerConfig,
    ) -> Self {
        Self {
            ops,
            backend,
            state: Mutex::new(PowerState::default()),
            in_flight: AtomicUsize::new(0),
            wake_timeout: config.wake_timeout(),
            poll_interval: config.poll_interval(),
            idle_timeout: config.idle_timeout(),
        }
    }

    /// Build from config, using Wake-on-LAN and ssh when `power.enabled`.
    pub fn from_config(
        config: &PowerConfig,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, PowerError> {
        let ops: Option<Arc<dyn PowerOps>> = if config.enabled {
            Some(Arc::new(WolSshOps::from_config(config)?))
        } else {
            None
        };
        Ok(Self::new(ops, backend, config))
    }

    /// Return once the backend answers its health probe, waking it if needed.
    ///
    /// The state lock is held for the whole wake so concurrent callers wait
    /// for one wake instead of each sending their own.
    pub async fn ensure_available(&self) -> Result<(), PowerError> {
        let mut state = self.state.lock().await;

        if self.backend.health().await.is_ok() {
            // Work is about to start; keep the idle monitor off it.
            state.last_activity = Some(Instant::now());
            return Ok(());
        }

        let ops = self
            .ops
            .as_ref()
            .ok_or(PowerError::NotConfigured("inference backend unreachable and power control disabled"))?;

        info!("inference backend unreachable, sending wake signal");
        ops.wake().await?;

        let deadline = Instant::now() + self.wake_timeout;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if self.backend.health().await.is_ok() {
                state.woke_by_us = true;
                state.last_activity = Some(Instant::now());
                info!("inference backend is up");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PowerError::WakeTimeout(self.wake_timeout.as_secs()));
            }
        }
    }

    /// Hold the returned guard for the duration of an inference call.
    pub fn begin_call(&self) -> InferenceCall<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InferenceCall {
            in_flight: &self.in_flight,
        }
    }

    /// Reset the idle timer. Called after every inference call, whatever
    /// its outcome.
    pub async fn record_activity(&self) {
        self.state.lock().await.last_activity = Some(Instant::now());
    }

    pub async fn woke_by_us(&self) -> bool {
        self.state.lock().await.woke_by_us
    }

    pub async fn snapshot(&self) -> PowerSnapshot {
        let state = self.state.lock().await;
        PowerSnapshot {
            enabled: self.ops.is_some(),
            woke_by_us: state.woke_by_us,
            idle_secs: state.last_activity.map(|t| t.elapsed().as_secs()),
        }
    }

    /// Shut the backend down if we woke it and it has idled past the timeout.
    ///
    /// Returns `true` when a shutdown was issued. A host that stopped
    /// answering on its own is released rather than shut down: whoever
    /// boots it next owns it. A failed shutdown against a host that still
    /// answers keeps ownership so the next tick retries.
    pub async fn idle_tick(&self) -> Result<bool, PowerError> {
        let mut state = self.state.lock().await;
        if !state.woke_by_us {
            return Ok(false);
        }
        let Some(ops) = self.ops.as_ref() else {
            return Ok(false);
        };
        let idle = state
            .last_activity
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);
        if idle < self.idle_timeout || self.in_flight.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }

        if let Err(e) = self.backend.health().await {
            info!(error = %e, "inference backend went down without us, releasing it");
            *state = PowerState::default();
            return Ok(false);
        }

        info!(idle_secs = idle.as_secs(), "inference backend idle, shutting down");
        if let Err(e) = ops.shutdown().await {
            if self.backend.health().await.is_err() {
                warn!(error = %e, "shutdown failed and the backend is gone, releasing it");
                *state = PowerState::default();
            }
            return Err(e);
        }
        *state = PowerState::default();
        Ok(true)
    }

    /// Background idle monitor. Runs until `cancel` fires.
    pub async fn run_idle_monitor(self: Arc<Self>, tick: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {}
            }
            if let Err(e) = self.idle_tick().await {
                warn!(error = %e, "idle shutdown failed, will retry");
            }
        }
        debug!("power idle monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("AA:bb:0c:DD:ee:01").unwrap(),
            [0xAA, 0xBB, 0x0C, 0xDD, 0xEE, 0x01]
        );
        assert_eq!(
            parse_mac("aa-bb-cc-dd-ee-ff").unwrap(),
            [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
        );
        assert!(parse_mac("aa:bb:cc:dd:ee").is_err());
        assert!(parse_mac("aa:bb:cc:dd:ee:gg").is_err());
        assert!(parse_mac("aab:b:cc:dd:ee:ff").is_err());
    }

    #[test]
    fn test_magic_packet_layout() {
        let mac = [1, 2, 3, 4, 5, 6];
        let packet = magic_packet(mac);
        assert_eq!(&packet[..6], &[0xFF; 6]);
        for rep in 0..16 {
            let start = 6 + rep * 6;
            assert_eq!(&packet[start..start + 6], &mac);
        }
    }

    #[test]
    fn test_ops_require_mac_and_host() {
        let mut config = PowerConfig::default();
        assert!(matches!(
            WolSshOps::from_config(&config),
            Err(PowerError::NotConfigured("power.mac"))
        ));
        config.mac = Some("aa:bb:cc:dd:ee:ff".into());
        assert!(matches!(
            WolSshOps::from_config(&config),
            Err(PowerError::NotConfigured("power.ssh_host"))
        ));
        config.ssh_host = Some("gpu-box".into());
        config.ssh_user = Some("ops".into());
        let ops = WolSshOps::from_config(&config).unwrap();
        assert_eq!(ops.ssh_target, "ops@gpu-box");
    }
}
