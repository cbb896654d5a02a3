use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::identity::{AllowListPolicy, AuthorizationPolicy, LoopbackPolicy};
use crate::room::RoomSettings;

const MIB: u64 = 1024 * 1024;

/// LAN room server: ephemeral rooms for sharing files and text
#[derive(Parser, Debug, Clone)]
#[command(name = "lan-rooms")]
#[command(version)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Directory holding uploaded blobs (wiped at startup)
    #[arg(long, default_value = "lan-rooms-uploads")]
    pub upload_dir: PathBuf,

    /// Directory of static UI assets
    #[arg(long, default_value = "public")]
    pub static_dir: PathBuf,

    /// Hard ceiling for any single upload, in MiB
    #[arg(long, default_value_t = 500, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_upload_mb: u64,

    /// Per-room file size limit when the creator sets none, in MiB
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
    pub default_max_file_mb: u64,

    /// Extra address granted admin rights besides loopback (repeatable)
    #[arg(long = "admin-ip")]
    pub admin_ips: Vec<IpAddr>,

    /// Path to TLS certificate (PEM format)
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM format)
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Delete rooms left without anyone for this long; 0 keeps them forever
    #[arg(long, default_value_t = 0)]
    pub idle_room_ttl_secs: u64,
}

impl Config {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(MIB)
    }

    pub fn room_defaults(&self) -> RoomSettings {
        RoomSettings {
            max_file_size: self.default_max_file_mb.saturating_mul(MIB),
        }
    }

    pub fn idle_room_ttl(&self) -> Option<Duration> {
        (self.idle_room_ttl_secs > 0).then(|| Duration::from_secs(self.idle_room_ttl_secs))
    }

    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.tls_cert.as_ref().zip(self.tls_key.as_ref())
    }

    pub fn authorization_policy(&self) -> Arc<dyn AuthorizationPolicy> {
        if self.admin_ips.is_empty() {
            Arc::new(LoopbackPolicy)
        } else {
            Arc::new(AllowListPolicy::new(self.admin_ips.iter().copied()))
        }
    }
}
