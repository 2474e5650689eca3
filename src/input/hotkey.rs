use anyhow::{anyhow, Context, Result};
use global_hotkey::{
    hotkey::{Code, HotKey, Modifiers},
    GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HotkeyConfig;
use crate::session::HotkeyEvent;

/// Registers the global hotkey and forwards its edges into the session queue
///
/// This side only enqueues. The state machine lives with the session
/// controller, which dequeues on its own task; a full queue drops the event
/// rather than ever blocking the listener.
pub struct HotkeyListener {
    manager: GlobalHotKeyManager,
    hotkey: HotKey,
}

impl HotkeyListener {
    /// Register the configured hotkey with the platform
    ///
    /// # Errors
    /// Returns error if the manager cannot be created, the config names an
    /// unknown key or modifier, or registration is refused
    pub fn new(config: &HotkeyConfig) -> Result<Self> {
        let manager = GlobalHotKeyManager::new().context("failed to create hotkey manager")?;

        let modifiers = parse_modifiers(&config.modifiers)?;
        let code = parse_key(&config.key)?;

        let hotkey = HotKey::new(Some(modifiers), code);
        manager
            .register(hotkey)
            .context("failed to register hotkey")?;

        info!("registered hotkey: {:?} + {}", config.modifiers, config.key);

        Ok(Self { manager, hotkey })
    }

    /// Map a raw platform event onto the session queue
    pub fn forward(&self, event: &GlobalHotKeyEvent, queue: &mpsc::Sender<HotkeyEvent>) {
        if event.id != self.hotkey.id() {
            return;
        }

        let mapped = match event.state {
            HotKeyState::Pressed => HotkeyEvent::press(),
            HotKeyState::Released => HotkeyEvent::release(),
        };

        enqueue(queue, mapped);
    }
}

impl Drop for HotkeyListener {
    fn drop(&mut self) {
        if let Err(e) = self.manager.unregister(self.hotkey) {
            tracing::error!("failed to unregister hotkey: {}", e);
        }
    }
}

fn enqueue(queue: &mpsc::Sender<HotkeyEvent>, event: HotkeyEvent) {
    match queue.try_send(event) {
        Ok(()) => debug!(kind = ?event.kind, "hotkey event queued"),
        Err(mpsc::error::TrySendError::Full(_)) => {
            // Bounded queue: dropping beats blocking the listener thread
            warn!("hotkey queue full, event dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("session queue closed, event dropped");
        }
    }
}

fn parse_modifiers(modifiers: &[String]) -> Result<Modifiers> {
    let mut result = Modifiers::empty();
    for modifier in modifiers {
        match modifier.as_str() {
            "Control" | "Ctrl" => result |= Modifiers::CONTROL,
            "Option" | "Alt" => result |= Modifiers::ALT,
            "Command" | "Super" => result |= Modifiers::SUPER,
            "Shift" => result |= Modifiers::SHIFT,
            _ => return Err(anyhow!("unknown modifier: {}", modifier)),
        }
    }
    Ok(result)
}

fn parse_key(key: &str) -> Result<Code> {
    let code = match key {
        "Space" => Code::Space,
        "Enter" | "Return" => Code::Enter,
        "Tab" => Code::Tab,
        "A" => Code::KeyA,
        "B" => Code::KeyB,
        "C" => Code::KeyC,
        "D" => Code::KeyD,
        "E" => Code::KeyE,
        "F" => Code::KeyF,
        "G" => Code::KeyG,
        "H" => Code::KeyH,
        "I" => Code::KeyI,
        "J" => Code::KeyJ,
        "K" => Code::KeyK,
        "L" => Code::KeyL,
        "M" => Code::KeyM,
        "N" => Code::KeyN,
        "O" => Code::KeyO,
        "P" => Code::KeyP,
        "Q" => Code::KeyQ,
        "R" => Code::KeyR,
        "S" => Code::KeyS,
        "T" => Code::KeyT,
        "U" => Code::KeyU,
        "V" => Code::KeyV,
        "W" => Code::KeyW,
        "X" => Code::KeyX,
        "Y" => Code::KeyY,
        "Z" => Code::KeyZ,
        "0" => Code::Digit0,
        "1" => Code::Digit1,
        "2" => Code::Digit2,
        "3" => Code::Digit3,
        "4" => Code::Digit4,
        "5" => Code::Digit5,
        "6" => Code::Digit6,
        "7" => Code::Digit7,
        "8" => Code::Digit8,
        "9" => Code::Digit9,
        _ => return Err(anyhow!("unsupported key: {}", key)),
    };
    Ok(code)
}
