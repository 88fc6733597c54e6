//! Centralized configuration for the neovim client.

/// Client-level configuration.
pub struct ClientConfig;

impl ClientConfig {
    /// Reserved method id of the API discovery call.
    pub const BOOTSTRAP_METHOD_ID: u64 = 0;

    // Method name prefixes that select the call target
    pub const GLOBAL_PREFIX: &'static str = "vim_";
    pub const BUFFER_PREFIX: &'static str = "buffer_";
    pub const WINDOW_PREFIX: &'static str = "window_";
    pub const TABPAGE_PREFIX: &'static str = "tabpage_";
}
