use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{error, warn};

use crate::state::ServerState;

/// Maximum accepted datagram size. Voice frames are far smaller; this
/// is the practical MTU ceiling.
const MAX_DATAGRAM_SIZE: usize = 1500;

/// Run the voice receive/forward loop.
///
/// Every datagram is attributed to a connection by its source
/// `(ip, port)` and forwarded byte-for-byte to the other members of
/// that connection's channel. The payload is opaque: clients encrypt
/// voice end-to-end under the channel key, and the relay neither
/// parses nor decrypts it. Datagrams from unknown sources, or from
/// members outside any channel, are dropped without a reply.
pub async fn run_voice_loop(socket: Arc<UdpSocket>, state: Arc<ServerState>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, src_addr) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(e) => {
                error!("voice recv error: {}", e);
                continue;
            }
        };

        let data = &buf[..len];
        if data.is_empty() {
            continue;
        }

        // Best-effort fan-out; a lost datagram is the client's
        // jitter buffer's problem, not ours.
        for target in state.voice_targets(src_addr).await {
            if let Err(e) = socket.send_to(data, target).await {
                warn!(%target, "failed to forward voice datagram: {}", e);
            }
        }
    }
}
