use serde::{Deserialize, Serialize};

/// Default osu! beatmap mirror.
pub const DEFAULT_MIRROR_URL: &str = "http://b10.sayobot.cn:25225";

/// Where downloads are fetched from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadRoute {
    /// Beatmap mirror, addressed by online id.
    #[default]
    Mirror,
    /// The sync server's own file tree, addressed by relative path.
    Files,
}

/// Endpoints used by [`HttpTransport`](crate::HttpTransport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Sync server that accepts uploads and serves `/files`.
    pub base_url: String,
    pub mirror_url: String,
    /// Remote directory uploads are stored under.
    pub namespace: String,
    pub route: DownloadRoute,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            mirror_url: DEFAULT_MIRROR_URL.into(),
            namespace: "default".into(),
            route: DownloadRoute::Mirror,
        }
    }
}
