//! Application settings persistence using dconf
//!
//! Settings are stored in dconf under `/com/parley/voice-client/`

use log::error;

const DCONF_PATH: &str = "/com/parley/voice-client/";

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Orus";

/// Keys for dconf settings
mod keys {
    pub const MODEL: &str = "model";
    pub const VOICE_NAME: &str = "voice-name";
}

/// Get the saved Live model name from dconf
pub fn get_model() -> Option<String> {
    let key = format!("{}{}", DCONF_PATH, keys::MODEL);
    dconf_rs::get_string(&key).ok().filter(|s| !s.is_empty())
}

/// Set the Live model name in dconf
pub fn set_model(model: &str) {
    let key = format!("{}{}", DCONF_PATH, keys::MODEL);
    if let Err(e) = dconf_rs::set_string(&key, model) {
        error!("Failed to save model to dconf: {}", e);
    }
}

/// Get the saved voice name from dconf
pub fn get_voice() -> Option<String> {
    let key = format!("{}{}", DCONF_PATH, keys::VOICE_NAME);
    dconf_rs::get_string(&key).ok().filter(|s| !s.is_empty())
}

/// Set the voice name in dconf
pub fn set_voice(voice: &str) {
    let key = format!("{}{}", DCONF_PATH, keys::VOICE_NAME);
    if let Err(e) = dconf_rs::set_string(&key, voice) {
        error!("Failed to save voice to dconf: {}", e);
    }
}

/// Command line value, then saved value, then built-in default
pub fn resolve(explicit: Option<&str>, saved: Option<String>, default: &str) -> String {
    explicit
        .map(str::to_string)
        .or(saved)
        .unwrap_or_else(|| default.to_string())
}
