// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;

use log::LevelFilter;
use tokio_util::sync::CancellationToken;

use mandala_x::config::Config;
use mandala_x::outbound::{Connector, Outbound};
use mandala_x::socks::SocksServer;

fn main() {
    let _ = simple_logger::init();
    log::set_max_level(LevelFilter::Info);

    log::info!("mandala-socks v{}, license under MPL-2.0", env!("CARGO_PKG_VERSION"));

    let path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            log::warn!("no config file path provided, using config.json");
            String::from("config.json")
        }
    };

    let port = std::env::args()
        .nth(2)
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(1080);

    if let Err(e) = run_with_path(path, port) {
        log::error!("exited unexpectedly: {}", e);
    }
}

fn run_with_path(path: String, port: u16) -> io::Result<()> {
    let mut json = String::new();
    File::open(path)?.read_to_string(&mut json)?;
    let cfg = Config::from_json(&json).map_err(io::Error::other)?;

    log::set_max_level(cfg.log_level);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let token = CancellationToken::new();

    rt.block_on(async {
        let outbound: Arc<dyn Connector> =
            Arc::new(Outbound::new(cfg.outbound).map_err(io::Error::other)?);
        let server = SocksServer::bind(port, outbound, token.clone())
            .await
            .map_err(io::Error::other)?;

        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                log::error!("server fatal: {}", e);
            }
        });

        tokio::signal::ctrl_c().await?;
        log::info!("SIGINT received, exiting...");
        token.cancel();
        Ok(())
    })
}
