use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version, about = "Jumpgate opens SSH port-forwarding tunnels through a bastion host", long_about = None)]
pub(crate) struct JumpgateCli {
    /// custom properties file (defaults to config.properties)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// local port to bind on 127.0.0.1
    #[arg(short, long)]
    pub local_port: u16,
    /// host the bastion should forward to
    #[arg(long)]
    pub remote_host: String,
    /// port of the forwarded service on the remote host
    #[arg(long)]
    pub remote_port: u16,
    /// probe the tunnel and reconnect every N seconds
    #[arg(short, long, value_name = "SECONDS")]
    pub watch: Option<u64>,
}
