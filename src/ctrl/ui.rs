use serde::{Deserialize, Serialize};

/// Which parts of the game UI are available or drawing attention.
///
/// Tutorials and challenges restrict these to guide the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiFlags {
    pub enable_connect_to_bot: bool,
    pub enable_disconnect_from_bot: bool,
    pub enable_help: bool,
    pub enable_pause: bool,
    pub enable_upload_bot: bool,
    pub highlight_pause: bool,
    pub highlight_upload_bot: bool,
    pub show_bot_list: bool,
}

impl Default for UiFlags {
    fn default() -> Self {
        Self {
            enable_connect_to_bot: true,
            enable_disconnect_from_bot: true,
            enable_help: true,
            enable_pause: true,
            enable_upload_bot: true,
            highlight_pause: false,
            highlight_upload_bot: false,
            show_bot_list: true,
        }
    }
}

impl UiFlags {
    /// Everything disabled and hidden
    pub fn locked() -> Self {
        Self {
            enable_connect_to_bot: false,
            enable_disconnect_from_bot: false,
            enable_help: false,
            enable_pause: false,
            enable_upload_bot: false,
            highlight_pause: false,
            highlight_upload_bot: false,
            show_bot_list: false,
        }
    }
}
