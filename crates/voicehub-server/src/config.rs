use serde::Deserialize;

/// Server configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind on (default "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port for control connections.
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// UDP port for voice traffic.
    #[serde(default = "default_voice_port")]
    pub voice_port: u16,

    /// Path to the SQLite user database.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_control_port() -> u16 {
    8888
}

fn default_voice_port() -> u16 {
    8889
}

fn default_db_path() -> String {
    "voicehub_users.db".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            control_port: default_control_port(),
            voice_port: default_voice_port(),
            db_path: default_db_path(),
        }
    }
}
