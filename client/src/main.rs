use std::sync::Arc;

use client::camera::Camera;
use client::network::{ClientConfig, ClientSession};
use log::{error, info};
use shared::reactor::Reactor;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = ClientConfig::default();
    info!("connecting to {}", config.server_addr);

    let reactor = Reactor::new(config.reactor_threads)?;
    // The rendering pipeline would drive this camera; networking only reads
    // it on the upload timer.
    let camera = Arc::new(Camera::default());
    let session = ClientSession::connect(&reactor.handle(), Arc::clone(&camera), &config)?;

    let reason = session.run_until_disconnect();
    error!("session ended: {reason}");
    Err(Box::new(reason))
}
