//! Process-wide configuration, read from the environment the same way
//! `hook-worker::config::Config` does with `envconfig`.

use envconfig::Envconfig;
use harvest_common::env::EnvMsDuration;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "9090")]
    pub port: u16,

    #[envconfig(default = "./harvest-data")]
    pub data_dir: String,

    #[envconfig(default = "4")]
    pub workers: usize,

    #[envconfig(default = "16")]
    pub worker_capacity: usize,

    #[envconfig(default = "200")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub heartbeat_interval: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub rate_acquire_timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
