/// Global hotkey registration and event forwarding
pub mod hotkey;

pub use hotkey::HotkeyListener;
