// src/keymap.rs
//
// Key code lookup for synthetic key events. Intent mappings may carry a
// key-injection suffix ("<action>:<KEYCODE_NAME>,<0|1>"); the names and codes
// follow the Android KeyEvent constants the drivers were written against.

/// Resolve a `KEYCODE_*` name to its numeric code. Bare numbers are accepted
/// as-is.
pub fn key_code_from_string(name: &str) -> Option<u16> {
    if let Ok(code) = name.parse::<u16>() {
        return Some(code);
    }
    let code = match name {
        "KEYCODE_HOME" => 3,
        "KEYCODE_BACK" => 4,
        "KEYCODE_CALL" => 5,
        "KEYCODE_ENDCALL" => 6,
        "KEYCODE_DPAD_UP" => 19,
        "KEYCODE_DPAD_DOWN" => 20,
        "KEYCODE_DPAD_LEFT" => 21,
        "KEYCODE_DPAD_RIGHT" => 22,
        "KEYCODE_DPAD_CENTER" => 23,
        "KEYCODE_VOLUME_UP" => 24,
        "KEYCODE_VOLUME_DOWN" => 25,
        "KEYCODE_POWER" => 26,
        "KEYCODE_CAMERA" => 27,
        "KEYCODE_ENTER" => 66,
        "KEYCODE_HEADSETHOOK" => 79,
        "KEYCODE_FOCUS" => 80,
        "KEYCODE_MENU" => 82,
        "KEYCODE_SEARCH" => 84,
        "KEYCODE_MEDIA_PLAY_PAUSE" => 85,
        "KEYCODE_MEDIA_STOP" => 86,
        "KEYCODE_MEDIA_NEXT" => 87,
        "KEYCODE_MEDIA_PREVIOUS" => 88,
        "KEYCODE_MEDIA_REWIND" => 89,
        "KEYCODE_MEDIA_FAST_FORWARD" => 90,
        "KEYCODE_MUTE" => 91,
        "KEYCODE_PAGE_UP" => 92,
        "KEYCODE_PAGE_DOWN" => 93,
        "KEYCODE_MEDIA_PLAY" => 126,
        "KEYCODE_MEDIA_PAUSE" => 127,
        "KEYCODE_VOLUME_MUTE" => 164,
        "KEYCODE_CHANNEL_UP" => 166,
        "KEYCODE_CHANNEL_DOWN" => 167,
        "KEYCODE_F1" => 131,
        "KEYCODE_F2" => 132,
        "KEYCODE_F3" => 133,
        "KEYCODE_F4" => 134,
        "KEYCODE_STEM_1" => 265,
        "KEYCODE_STEM_2" => 266,
        "KEYCODE_STEM_3" => 267,
        _ => return None,
    };
    Some(code)
}
