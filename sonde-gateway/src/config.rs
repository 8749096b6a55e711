use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub socket: SocketTuning,
    pub queue: QueueBackend,
    pub series: SeriesBackend,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the combined REST + socket server to listen on
    pub http_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
pub struct SocketTuning {
    /// Readings buffered per device before a queue handoff
    pub buffer_size: usize,
    /// How long a fresh socket may stay unidentified before it is parked
    pub identify_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueueBackend {
    Redis {
        host: String,
        port: u16,
        password: Option<String>,
        #[serde(default = "default_queue_prefix")]
        prefix: String,
    },
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SeriesBackend {
    Mongo {
        uri: String,
        #[serde(default = "default_database")]
        database: String,
    },
    Memory,
}

fn default_queue_prefix() -> String {
    sonde_core::QUEUE_PREFIX.to_owned()
}

fn default_database() -> String {
    "telemetry".to_owned()
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Deployment overrides recognized on top of the file: `PORT`,
    /// `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`, `QUEUE_PREFIX`,
    /// `MONGO_URI`, `BUFFER_SIZE`.
    pub fn apply_env(&mut self) {
        if let Some(port) = env_parsed::<u16>("PORT") {
            self.server.http_addr.set_port(port);
        }
        if let Some(size) = env_parsed::<usize>("BUFFER_SIZE") {
            self.socket.buffer_size = size;
        }

        if let QueueBackend::Redis {
            host,
            port,
            password,
            prefix,
        } = &mut self.queue
        {
            if let Ok(value) = std::env::var("REDIS_HOST") {
                *host = value;
            }
            if let Some(value) = env_parsed::<u16>("REDIS_PORT") {
                *port = value;
            }
            if let Ok(value) = std::env::var("REDIS_PASSWORD") {
                *password = Some(value);
            }
            if let Ok(value) = std::env::var("QUEUE_PREFIX") {
                *prefix = value;
            }
        }

        if let SeriesBackend::Mongo { uri, .. } = &mut self.series {
            if let Ok(value) = std::env::var("MONGO_URI") {
                *uri = value;
            }
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                http_addr: "0.0.0.0:3000".parse().unwrap(),
            },
            socket: SocketTuning {
                buffer_size: sonde_core::BUFFER_SIZE,
                identify_timeout_ms: sonde_core::IDENTIFY_TIMEOUT_MS,
            },
            queue: QueueBackend::Redis {
                host: "localhost".to_owned(),
                port: 6379,
                password: None,
                prefix: default_queue_prefix(),
            },
            series: SeriesBackend::Mongo {
                uri: "mongodb://localhost:27017".to_owned(),
                database: default_database(),
            },
        }
    }
}
