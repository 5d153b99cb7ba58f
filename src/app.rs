// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boundary and lifecycle.
//!
//! The host environment hands over a config JSON plus either a TUN fd or
//! a loopback port; the core owns a private runtime and a root
//! cancellation token until `stop`. Start operations return an empty
//! string on success and a human-readable error otherwise, and reject a
//! second start while running.

use std::sync::{Mutex, Once};
use std::time::Duration;

#[cfg(unix)]
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::outbound::{Connector, Outbound};
#[cfg(unix)]
use crate::proto::Target;
#[cfg(unix)]
use crate::relay;
use crate::socks::SocksServer;

static INSTANCE: Mutex<Option<Instance>> = Mutex::new(None);
static LOG_INIT: Once = Once::new();

struct Instance {
    runtime: tokio::runtime::Runtime,
    token: CancellationToken,
    mode: &'static str,
}

/// Start in TUN mode on a platform-provided descriptor.
pub fn start_vpn(fd: i64, mtu: i64, config_json: &str) -> String {
    result_to_boundary(start_vpn_inner(fd, mtu, config_json))
}

/// Start in loopback SOCKS5 mode.
pub fn start_socks(local_port: u16, config_json: &str) -> String {
    result_to_boundary(start_socks_inner(local_port, config_json))
}

/// Tear down whichever mode is active.
pub fn stop() {
    let instance = INSTANCE.lock().unwrap().take();
    if let Some(instance) = instance {
        log::info!("stopping {} mode", instance.mode);
        instance.token.cancel();
        instance.runtime.shutdown_timeout(Duration::from_secs(3));
    }
}

pub fn is_running() -> bool {
    INSTANCE.lock().unwrap().is_some()
}

fn result_to_boundary(result: Result<()>) -> String {
    match result {
        Ok(()) => String::new(),
        Err(e) => e.to_string(),
    }
}

fn init_logging(level: log::LevelFilter) {
    LOG_INIT.call_once(|| {
        let _ = simple_logger::init();
    });
    log::set_max_level(level);
}

#[cfg(unix)]
fn start_vpn_inner(fd: i64, mtu: i64, config_json: &str) -> Result<()> {
    let mut guard = INSTANCE.lock().unwrap();
    if guard.is_some() {
        return Err(Error::config("already running"));
    }

    let cfg = Config::from_json(config_json)?;
    init_logging(cfg.log_level);
    if fd < 0 {
        return Err(Error::config("invalid tun fd"));
    }
    let mtu = if (576..=65535).contains(&mtu) {
        mtu as usize
    } else {
        1500
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let token = CancellationToken::new();

    let protocol = cfg.outbound.protocol;
    let setup_token = token.clone();
    runtime.block_on(async move {
        let outbound: Arc<dyn Connector> = Arc::new(Outbound::new(cfg.outbound.clone())?);

        let stack = crate::tun::spawn(fd as std::os::fd::RawFd, mtu, setup_token.clone())?;

        let nat = crate::nat::UdpNatManager::new(outbound.clone(), setup_token.clone());
        let router = crate::tun::udp::UdpRouter::new(
            nat,
            outbound.clone(),
            stack.frames.clone(),
            cfg.outbound.settings.vpn_mode,
            setup_token.clone(),
        );
        tokio::spawn(router.run(stack.datagrams));
        tokio::spawn(accept_loop(stack.accepts, outbound, setup_token));
        Ok::<(), Error>(())
    })?;

    log::info!("vpn mode started, outbound {}", protocol);
    *guard = Some(Instance {
        runtime,
        token,
        mode: "vpn",
    });
    Ok(())
}

#[cfg(not(unix))]
fn start_vpn_inner(_fd: i64, _mtu: i64, _config_json: &str) -> Result<()> {
    Err(Error::config("tun mode requires a unix platform"))
}

fn start_socks_inner(local_port: u16, config_json: &str) -> Result<()> {
    let mut guard = INSTANCE.lock().unwrap();
    if guard.is_some() {
        return Err(Error::config("already running"));
    }

    let cfg = Config::from_json(config_json)?;
    init_logging(cfg.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let token = CancellationToken::new();

    let setup_token = token.clone();
    runtime.block_on(async move {
        let outbound: Arc<dyn Connector> = Arc::new(Outbound::new(cfg.outbound.clone())?);
        let server = SocksServer::bind(local_port, outbound, setup_token).await?;
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                log::info!("socks server exited: {}", e);
            }
        });
        Ok::<(), Error>(())
    })?;

    *guard = Some(Instance {
        runtime,
        token,
        mode: "socks",
    });
    Ok(())
}

/// Relay every accepted TUN flow through the outbound.
#[cfg(unix)]
pub(crate) async fn accept_loop(
    mut accepts: mpsc::Receiver<crate::tun::TcpFlow>,
    connector: Arc<dyn Connector>,
    token: CancellationToken,
) {
    loop {
        let flow = tokio::select! {
            f = accepts.recv() => match f {
                Some(f) => f,
                None => return,
            },
            _ = token.cancelled() => return,
        };

        let connector = connector.clone();
        let flow_token = token.clone();
        tokio::spawn(async move {
            let target = Target::from(flow.key.dst);
            let key = flow.key;
            tokio::select! {
                // a dial/handshake error drops the stream, which resets
                // the guest connection
                r = relay::run(&*connector, flow.stream, &target) => {
                    if let Err(e) = r {
                        log::info!("flow {}: {}", key, e);
                    }
                }
                _ = flow_token.cancelled() => {}
            }
        });
    }
}
