use clap::Parser;

use crate::server::ServerProps;

#[derive(Debug, Parser)]
#[command(name = "beamly", about = "Live detector telemetry display server")]
pub struct Opt {
    /// TCP port to listen on (the PORT environment variable overrides).
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Default data namespace for unauthenticated connections.
    #[arg(long, default_value = "everyone")]
    pub namespace: String,

    /// Per-client best-effort rate cap (the MAX_NPR environment variable
    /// overrides).
    #[arg(long, default_value_t = 100.0)]
    pub max_npr: f64,

    /// Shut the server down once the last client disconnects.
    #[arg(long)]
    pub auto_shutdown: bool,
}

impl Opt {
    pub fn server_props(&self) -> ServerProps {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.port);
        let max_npr = std::env::var("MAX_NPR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.max_npr);
        ServerProps {
            port,
            namespace: self.namespace.clone(),
            max_npr,
            auto_shutdown: self.auto_shutdown,
        }
    }
}
