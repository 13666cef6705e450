use anyhow::{bail, Error};

use replicad::config::ServerConfig;
use replicad::server::Engine;

const DEFAULT_CONFIG: &str = "/etc/replicad/server.json";

fn run() -> Result<(), Error> {
    let mut args = std::env::args().skip(1);
    let config_path = match args.next() {
        Some(path) => path,
        None => DEFAULT_CONFIG.to_string(),
    };
    if args.next().is_some() {
        bail!("usage: replicad [CONFIG]");
    }

    let config = ServerConfig::load(&config_path)?;

    let mut engine = Engine::new(config)?;
    engine.run()
}

fn main() {
    env_logger::init();

    if let Err(err) = run() {
        log::error!("{:#}", err);
        std::process::exit(1);
    }
}
