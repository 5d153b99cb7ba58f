// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-flow relay.
//!
//! Each accepted TCP flow is dialed through the outbound, handshaken, and
//! then copied bidirectionally. EOF on one direction half-closes the
//! peer's write side only; the flow ends when both directions have
//! drained, so trailing bytes of the still-open direction are never
//! dropped.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::Result;
use crate::outbound::Connector;
use crate::proto::Target;

/// Keepalive on kernel-TCP local sockets.
const KEEPALIVE: Duration = Duration::from_secs(30);
/// MSS clamp for tunnel-in-tunnel setups.
const TCP_MAXSEG: u32 = 1360;

/// Dial the outbound for `target` and relay `local` through it.
pub async fn run<S>(connector: &dyn Connector, local: S, target: &Target) -> Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = connector.connect(target).await?;
    relay(local, remote).await
}

/// Copy both directions until each source reaches EOF. Returns
/// (bytes up, bytes down).
pub async fn relay<L, R>(mut local: L, mut remote: R) -> Result<(u64, u64)>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (up, down) = tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
    Ok((up, down))
}

/// Socket tuning for a kernel-TCP local side (the loopback SOCKS5 path).
pub fn tune_local_socket(stream: &TcpStream, clamp_mss: bool) {
    let _ = stream.set_nodelay(true);

    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE);
    let _ = sock.set_tcp_keepalive(&keepalive);

    if clamp_mss {
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;
            let mss = TCP_MAXSEG as libc::c_int;
            unsafe {
                libc::setsockopt(
                    stream.as_raw_fd(),
                    libc::IPPROTO_TCP,
                    libc::TCP_MAXSEG,
                    &mss as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&mss) as libc::socklen_t,
                );
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = clamp_mss;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// One side writes 1 MiB then half-closes; the other echoes 512 KiB
    /// and half-closes later. Both payloads must arrive in full.
    #[tokio::test]
    async fn half_close_preserves_trailing_bytes() {
        let (local_near, mut local_far) = tokio::io::duplex(16 * 1024);
        let (remote_near, mut remote_far) = tokio::io::duplex(16 * 1024);

        let relay_task = tokio::spawn(relay(local_near, remote_near));

        let up_payload = vec![0xabu8; 1024 * 1024];
        let down_payload = vec![0xcdu8; 512 * 1024];

        let up_clone = up_payload.clone();
        let local_task = tokio::spawn(async move {
            local_far.write_all(&up_clone).await.unwrap();
            local_far.shutdown().await.unwrap();

            let mut down = Vec::new();
            local_far.read_to_end(&mut down).await.unwrap();
            down
        });

        let down_clone = down_payload.clone();
        let remote_task = tokio::spawn(async move {
            let mut up = Vec::new();
            // drain the upstream direction fully first
            remote_far.read_to_end(&mut up).await.unwrap();
            // upstream EOF must not have torn down the downstream path
            remote_far.write_all(&down_clone).await.unwrap();
            remote_far.shutdown().await.unwrap();
            up
        });

        let up_seen = remote_task.await.unwrap();
        let down_seen = local_task.await.unwrap();
        assert_eq!(up_seen.len(), up_payload.len());
        assert_eq!(down_seen.len(), down_payload.len());
        assert_eq!(up_seen, up_payload);
        assert_eq!(down_seen, down_payload);

        let (up, down) = relay_task.await.unwrap().unwrap();
        assert_eq!(up, 1024 * 1024);
        assert_eq!(down, 512 * 1024);
    }
}
