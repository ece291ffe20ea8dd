use log::info;
use server::session::{Server, ServerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let server = Server::start(ServerConfig::default())?;
    info!("server ready on {}", server.local_addr());

    // All work happens on the reactor threads; this thread only keeps the
    // process (and with it the reactor) alive.
    loop {
        std::thread::park();
    }
}
