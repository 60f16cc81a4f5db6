use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use russh::{Channel, client};
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, error};

use super::{handler::ClientHandler, tunnel::TunnelError};

/// Channel-open failures in a row after which the session is considered dead
/// and the accept loop gives up (dropping the local listener with it).
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub(super) async fn bind_local(local_port: u16) -> Result<TcpListener, TunnelError> {
    let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
    TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TunnelError::Bind(local_port, e))
}

/// Accepts connections on the local listener and pipes each one through a
/// fresh `direct-tcpip` channel to `remote_host:remote_port`.
pub(super) async fn accept_loop(
    listener: TcpListener,
    session: Arc<client::Handle<ClientHandler>>,
    remote_host: String,
    remote_port: u16,
) {
    let mut consecutive_failures = 0;

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("failed to accept on the forwarding port: {e}");
                continue;
            }
        };
        debug!("accepted connection from {peer_addr}");

        let channel = match session
            .channel_open_direct_tcpip(
                &remote_host,
                remote_port as u32,
                &peer_addr.ip().to_string(),
                peer_addr.port() as u32,
            )
            .await
        {
            Ok(channel) => {
                consecutive_failures = 0;
                channel
            }
            Err(e) => {
                consecutive_failures += 1;
                error!(
                    "failed to open channel to {remote_host}:{remote_port} \
                     ({consecutive_failures}/{MAX_CONSECUTIVE_FAILURES}): {e}"
                );
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    error!("ssh session appears dead, dropping the forwarding port");
                    return;
                }
                continue;
            }
        };

        tokio::spawn(async move {
            if let Err(e) = pipe(stream, channel).await {
                debug!("forwarded connection ended: {e}");
            }
        });
    }
}

async fn pipe(
    mut stream: TcpStream,
    channel: Channel<client::Msg>,
) -> Result<(), std::io::Error> {
    let mut channel_stream = channel.into_stream();
    let (from_tcp, from_ssh) = copy_bidirectional(&mut stream, &mut channel_stream).await?;
    debug!("forwarded connection closed: {from_tcp} bytes out, {from_ssh} bytes back");
    Ok(())
}
