//! Virtual gamepad socket servers.
//!
//! Each created pad exposes two Unix listeners: one speaking the legacy
//! joystick API, one speaking evdev. An interposer library inside the game
//! process connects to whichever device node it shimmed, receives the
//! fixed-size config record, answers with its pointer word size, and then
//! consumes packed events. One in-process queue per pad feeds both
//! listeners, so event order is preserved across flavors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use glint_protocol::gamepad::{
    CONFIG_RECORD_SIZE, GamepadConfig, MappedEvent, WordSize, pack_ev_event, pack_js_event,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Highest pad index; browsers expose at most four gamepads.
pub const MAX_GAMEPADS: u8 = 4;

/// How long a freshly accepted client may take to answer the word-size
/// handshake before it is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Js,
    Ev,
}

struct Client {
    stream: UnixStream,
    word: WordSize,
}

struct PadHandle {
    config: Arc<GamepadConfig>,
    events: broadcast::Sender<MappedEvent>,
    shutdown: watch::Sender<bool>,
}

/// Owns every virtual pad and its listener tasks.
pub struct GamepadHub {
    socket_dir: PathBuf,
    pads: std::collections::HashMap<u8, PadHandle>,
}

impl GamepadHub {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            pads: std::collections::HashMap::new(),
        }
    }

    pub fn js_socket_path(&self, index: u8) -> PathBuf {
        self.socket_dir.join(format!("glint_js{index}.sock"))
    }

    pub fn ev_socket_path(&self, index: u8) -> PathBuf {
        self.socket_dir.join(format!("glint_ev{index}.sock"))
    }

    /// Create pad `index` and start both listeners.
    pub fn create(&mut self, index: u8, name: &str, num_btns: u8, num_axes: u8) -> Result<()> {
        if index >= MAX_GAMEPADS {
            bail!("gamepad index {index} out of range");
        }
        if self.pads.contains_key(&index) {
            debug!(index, "Replacing existing gamepad");
            self.destroy(index);
        }
        info!(index, name, num_btns, num_axes, "Creating virtual gamepad");

        let config = Arc::new(GamepadConfig::standard(name));
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);

        for (flavor, path) in [
            (Flavor::Js, self.js_socket_path(index)),
            (Flavor::Ev, self.ev_socket_path(index)),
        ] {
            let config = Arc::clone(&config);
            let events = events.subscribe();
            let shutdown = shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = run_listener(path.clone(), flavor, config, events, shutdown).await {
                    warn!(path = %path.display(), "Gamepad listener exited: {e:#}");
                }
            });
        }

        self.pads.insert(
            index,
            PadHandle {
                config,
                events,
                shutdown,
            },
        );
        Ok(())
    }

    pub fn destroy(&mut self, index: u8) {
        if let Some(pad) = self.pads.remove(&index) {
            info!(index, "Destroying virtual gamepad");
            let _ = pad.shutdown.send(true);
        }
    }

    pub fn destroy_all(&mut self) {
        let indices: Vec<u8> = self.pads.keys().copied().collect();
        for index in indices {
            self.destroy(index);
        }
    }

    pub fn send_button(&self, index: u8, button: u16, value: f64) {
        let Some(pad) = self.pads.get(&index) else {
            warn!(index, "Button event for unconnected gamepad");
            return;
        };
        match pad.config.map_button(button, value) {
            Some(event) => {
                let _ = pad.events.send(event);
            }
            None => warn!(index, button, "Button exceeds device button count"),
        }
    }

    pub fn send_axis(&self, index: u8, axis: u8, value: f64) {
        let Some(pad) = self.pads.get(&index) else {
            warn!(index, "Axis event for unconnected gamepad");
            return;
        };
        match pad.config.map_axis(axis, value) {
            Some(event) => {
                let _ = pad.events.send(event);
            }
            None => warn!(index, axis, "Axis exceeds device axis count"),
        }
    }
}

impl Drop for GamepadHub {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

/// Unlink a stale socket path; a path that exists and cannot be removed
/// makes the bind fail.
fn prepare_socket_path(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("cannot unlink {}", path.display())),
    }
}

async fn run_listener(
    path: PathBuf,
    flavor: Flavor,
    config: Arc<GamepadConfig>,
    mut events: broadcast::Receiver<MappedEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    prepare_socket_path(&path)?;
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("failed to bind {}", path.display()))?;
    info!(path = %path.display(), ?flavor, "Gamepad listener ready");

    let mut clients: Vec<Client> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(path = %path.display(), "Accept failed: {e}");
                        continue;
                    }
                };
                match setup_client(stream, &config).await {
                    Ok(client) => {
                        info!(path = %path.display(), word = ?client.word, "Gamepad client connected");
                        clients.push(client);
                    }
                    Err(e) => debug!(path = %path.display(), "Client handshake failed: {e:#}"),
                }
            }
            event = events.recv() => match event {
                Ok(event) => broadcast_event(&mut clients, flavor, &config, &event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(path = %path.display(), skipped = n, "Gamepad event queue lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let _ = std::fs::remove_file(&path);
    info!(path = %path.display(), "Gamepad listener stopped");
    Ok(())
}

/// Per-client handshake: the config record out, one word-size byte back.
async fn setup_client(mut stream: UnixStream, config: &GamepadConfig) -> Result<Client> {
    let record = config.config_record();
    debug_assert_eq!(record.len(), CONFIG_RECORD_SIZE);
    stream
        .write_all(&record)
        .await
        .context("failed to send config record")?;

    let mut byte = [0u8; 1];
    tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut byte))
        .await
        .context("word-size handshake timed out")?
        .context("failed to read word-size byte")?;
    let word = WordSize::from_byte(byte[0])
        .with_context(|| format!("invalid word size byte: {:#x}", byte[0]))?;
    Ok(Client { stream, word })
}

async fn broadcast_event(
    clients: &mut Vec<Client>,
    flavor: Flavor,
    config: &GamepadConfig,
    event: &MappedEvent,
) {
    if clients.is_empty() {
        return;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut closed = Vec::new();
    for (idx, client) in clients.iter_mut().enumerate() {
        let data = match flavor {
            Flavor::Js => Some(pack_js_event(
                event,
                (now.as_millis() % 1_000_000_000) as u32,
            )),
            Flavor::Ev => pack_ev_event(
                config,
                event,
                now.as_secs() as i64,
                now.subsec_micros() as i64,
                client.word,
            ),
        };
        let Some(data) = data else { continue };
        if let Err(e) = client.stream.write_all(&data).await {
            info!("Gamepad client disconnected: {e}");
            closed.push(idx);
        }
    }
    for idx in closed.into_iter().rev() {
        clients.remove(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glint_protocol::gamepad::{ABS_Z, EV_ABS, EV_SYN, SYN_REPORT};

    fn test_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "glint-gamepad-test-{}-{}",
            std::process::id(),
            rand_suffix()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn rand_suffix() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    }

    async fn connect_and_handshake(path: &Path, word_byte: u8) -> UnixStream {
        let mut stream = UnixStream::connect(path).await.unwrap();
        let mut record = vec![0u8; CONFIG_RECORD_SIZE];
        stream.read_exact(&mut record).await.unwrap();
        assert_eq!(record.len(), CONFIG_RECORD_SIZE);
        stream.write_all(&[word_byte]).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn js_client_receives_trigger_axis_event() {
        let dir = test_dir();
        let mut hub = GamepadHub::new(&dir);
        hub.create(0, "Glint Pad", 11, 8).unwrap();

        // Give the listener a moment to bind.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut stream = connect_and_handshake(&hub.js_socket_path(0), 0x08).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Browser button 6 at full travel: trigger axis 2, ABS_MAX.
        hub.send_button(0, 6, 1.0);

        let mut event = [0u8; 8];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut event))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(i16::from_le_bytes([event[4], event[5]]), 32767);
        assert_eq!(event[6], glint_protocol::gamepad::JS_EVENT_AXIS);
        assert_eq!(event[7], 2);

        hub.destroy_all();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn ev_client_receives_input_event_pair_for_word_size() {
        let dir = test_dir();
        let mut hub = GamepadHub::new(&dir);
        hub.create(1, "Pad", 11, 8).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut stream = connect_and_handshake(&hub.ev_socket_path(1), 0x08).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.send_button(1, 6, 1.0);

        let mut event = [0u8; 48];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut event))
            .await
            .unwrap()
            .unwrap();
        // Payload record after the 16-byte timeval.
        assert_eq!(u16::from_le_bytes([event[16], event[17]]), EV_ABS);
        assert_eq!(u16::from_le_bytes([event[18], event[19]]), ABS_Z as u16);
        assert_eq!(
            i32::from_le_bytes([event[20], event[21], event[22], event[23]]),
            32767
        );
        // EV_SYN / SYN_REPORT / 0 follows.
        assert_eq!(u16::from_le_bytes([event[40], event[41]]), EV_SYN);
        assert_eq!(u16::from_le_bytes([event[42], event[43]]), SYN_REPORT);

        hub.destroy_all();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn narrow_client_gets_32_byte_pairs() {
        let dir = test_dir();
        let mut hub = GamepadHub::new(&dir);
        hub.create(2, "Pad", 11, 8).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut stream = connect_and_handshake(&hub.ev_socket_path(2), 0x04).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.send_axis(2, 0, -1.0);

        let mut event = [0u8; 32];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut event))
            .await
            .unwrap()
            .unwrap();
        // 8-byte timeval, then EV_ABS / ABS_X / ABS_MIN.
        assert_eq!(u16::from_le_bytes([event[8], event[9]]), EV_ABS);
        assert_eq!(u16::from_le_bytes([event[10], event[11]]), 0);
        assert_eq!(
            i32::from_le_bytes([event[12], event[13], event[14], event[15]]),
            -32767
        );

        hub.destroy_all();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn invalid_word_size_drops_client() {
        let dir = test_dir();
        let mut hub = GamepadHub::new(&dir);
        hub.create(3, "Pad", 11, 8).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut stream = UnixStream::connect(hub.js_socket_path(3)).await.unwrap();
        let mut record = vec![0u8; CONFIG_RECORD_SIZE];
        stream.read_exact(&mut record).await.unwrap();
        stream.write_all(&[0x02]).await.unwrap();

        // The server closes the connection; the next read returns EOF.
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);

        hub.destroy_all();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn destroy_unlinks_socket_paths() {
        let dir = test_dir();
        let mut hub = GamepadHub::new(&dir);
        hub.create(0, "Pad", 11, 8).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hub.js_socket_path(0).exists());
        assert!(hub.ev_socket_path(0).exists());

        hub.destroy(0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!hub.js_socket_path(0).exists());
        assert!(!hub.ev_socket_path(0).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn out_of_range_index_rejected() {
        let dir = test_dir();
        let mut hub = GamepadHub::new(&dir);
        assert!(hub.create(MAX_GAMEPADS, "Pad", 11, 8).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
