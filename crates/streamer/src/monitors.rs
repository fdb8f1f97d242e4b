//! TURN configuration refresh monitors.
//!
//! HMAC credentials expire, REST services rotate them, and deployments
//! drop new RTC config files into place. Three monitor variants share one
//! contract: run until stopped, emit a freshly parsed config on every
//! refresh, swallow transient errors at warn.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use glint_protocol::rtc::{ParsedRtcConfig, make_rtc_config, parse_rtc_config};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Default refresh period for the periodic monitors.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

/// Stat cadence for the file monitor.
const FILE_POLL: Duration = Duration::from_secs(1);

/// Settings for the HMAC monitor: the same inputs as credential generation.
#[derive(Debug, Clone)]
pub struct HmacMonitorSettings {
    pub host: String,
    pub port: String,
    pub shared_secret: String,
    pub user: String,
    pub protocol: String,
    pub tls: bool,
    pub period: Duration,
}

/// Regenerate HMAC credentials every period and emit the parsed config.
pub async fn run_hmac_monitor(
    settings: HmacMonitorSettings,
    tx: mpsc::Sender<ParsedRtcConfig>,
    mut stop: watch::Receiver<bool>,
) {
    info!(period = ?settings.period, "HMAC TURN monitor started");
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(settings.period) => {}
        }
        let json = make_rtc_config(
            &settings.host,
            &settings.port,
            &settings.shared_secret,
            &settings.user,
            &settings.protocol,
            settings.tls,
        );
        match parse_rtc_config(&json) {
            Ok(parsed) => {
                if tx.send(parsed).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Could not refresh HMAC TURN config: {e}"),
        }
    }
    info!("HMAC TURN monitor stopped");
}

/// Settings for the REST monitor.
#[derive(Debug, Clone)]
pub struct RestMonitorSettings {
    pub uri: String,
    pub user: String,
    pub auth_user_header: String,
    pub protocol: String,
    pub protocol_header: String,
    pub tls: bool,
    pub tls_header: String,
    pub period: Duration,
}

/// One GET against the TURN REST service, parsed as an RTC config.
pub async fn fetch_turn_rest(
    client: &reqwest::Client,
    settings: &RestMonitorSettings,
) -> Result<ParsedRtcConfig> {
    let response = client
        .get(&settings.uri)
        .header(&settings.auth_user_header, &settings.user)
        .header(&settings.protocol_header, &settings.protocol)
        .header(
            &settings.tls_header,
            if settings.tls { "true" } else { "false" },
        )
        .send()
        .await
        .context("TURN REST request failed")?;
    let status = response.status();
    if status.as_u16() >= 400 {
        bail!("TURN REST service returned status {status}");
    }
    let body = response
        .text()
        .await
        .context("TURN REST response read failed")?;
    Ok(parse_rtc_config(&body)?)
}

/// Poll the TURN REST service every period.
pub async fn run_rest_monitor(
    settings: RestMonitorSettings,
    tx: mpsc::Sender<ParsedRtcConfig>,
    mut stop: watch::Receiver<bool>,
) {
    info!(uri = %settings.uri, period = ?settings.period, "TURN REST monitor started");
    let client = reqwest::Client::new();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(settings.period) => {}
        }
        match fetch_turn_rest(&client, &settings).await {
            Ok(parsed) => {
                if tx.send(parsed).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Could not fetch TURN REST config: {e:#}"),
        }
    }
    info!("TURN REST monitor stopped");
}

/// Detects writes by watching a file's mtime.
#[derive(Debug, Default)]
pub struct MtimeWatcher {
    last: Option<SystemTime>,
}

impl MtimeWatcher {
    /// Returns true when `current` is newer than the last observation.
    /// The first observation only establishes the baseline.
    pub fn changed(&mut self, current: Option<SystemTime>) -> bool {
        match (self.last, current) {
            (None, Some(mtime)) => {
                self.last = Some(mtime);
                false
            }
            (Some(last), Some(mtime)) if mtime > last => {
                self.last = Some(mtime);
                true
            }
            _ => false,
        }
    }
}

/// Re-read and re-parse the RTC config file whenever a writer finishes
/// with it (observed as an mtime bump on a 1 s stat cadence).
pub async fn run_file_monitor(
    path: PathBuf,
    tx: mpsc::Sender<ParsedRtcConfig>,
    mut stop: watch::Receiver<bool>,
) {
    info!(path = %path.display(), "RTC config file monitor started");
    let mut watcher = MtimeWatcher::default();
    // Seed the baseline so a pre-existing file does not fire immediately.
    watcher.changed(file_mtime(&path));
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(FILE_POLL) => {}
        }
        if !watcher.changed(file_mtime(&path)) {
            continue;
        }
        info!(path = %path.display(), "RTC config file changed");
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => match parse_rtc_config(&data) {
                Ok(parsed) => {
                    if tx.send(parsed).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(path = %path.display(), "Could not parse RTC config file: {e}"),
            },
            Err(e) => warn!(path = %path.display(), "Could not read RTC config file: {e}"),
        }
    }
    info!("RTC config file monitor stopped");
}

fn file_mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtime_watcher_baseline_does_not_fire() {
        let mut watcher = MtimeWatcher::default();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        assert!(!watcher.changed(Some(t0)));
    }

    #[test]
    fn mtime_watcher_fires_on_newer_mtime() {
        let mut watcher = MtimeWatcher::default();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(101);
        watcher.changed(Some(t0));
        assert!(watcher.changed(Some(t1)));
        // Same mtime again: no refire.
        assert!(!watcher.changed(Some(t1)));
    }

    #[test]
    fn mtime_watcher_ignores_missing_file() {
        let mut watcher = MtimeWatcher::default();
        assert!(!watcher.changed(None));
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        assert!(!watcher.changed(Some(t0)));
        // Deletion then recreation with an older mtime stays quiet.
        assert!(!watcher.changed(None));
        assert!(!watcher.changed(Some(t0)));
    }

    #[tokio::test]
    async fn file_monitor_emits_on_rewrite() {
        let dir = std::env::temp_dir().join(format!("glint-monitor-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("rtc.json");
        std::fs::write(&path, glint_protocol::rtc::default_rtc_config()).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_file_monitor(path.clone(), tx, stop_rx));

        // Rewrite with a bumped mtime after the baseline is seeded.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let json = glint_protocol::rtc::make_static_rtc_config(
            "turn.example",
            "3478",
            "u",
            "c",
            "udp",
            false,
        );
        std::fs::write(&path, &json).unwrap();
        let bumped = SystemTime::now() + Duration::from_secs(2);
        let _ = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|f| f.set_modified(bumped));

        let parsed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parsed.turn_uris.len(), 1);

        let _ = stop_tx.send(true);
        let _ = handle.await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}
