// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use reactor_rpc::{
    app::Application,
    cfg::{cli::resolve_config_path, config::AppConfig, logger::init_logger},
    demos::echo_service,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _init_logger = init_logger("config/logger.yaml")?;

    let cfg = resolve_config_path("config/app.yaml")
        .and_then(AppConfig::load_from_file)
        .context("failed to resolve or load config")?;

    let listen = cfg
        .listen
        .clone()
        .context("config/app.yaml must set listen.addr to run the echo server")?;
    let addr = listen.socket_addr()?;

    let app = Application::init(&cfg);
    let service = echo_service::build();

    app.listen(addr, echo_service::accept_handler(service), |ok| {
        if ok {
            info!(%addr, "echo server listening");
        } else {
            tracing::error!(%addr, "failed to bind echo server listener");
        }
    });

    app.run()
}
