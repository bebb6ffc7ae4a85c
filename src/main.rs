use clap::Parser;
use xvcd_ftdi::config::{Args, Config};
use xvcd_ftdi::server::Server;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(2);
        }
    };

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        log::error!("fatal runtime error: {e}");
        std::process::exit(2);
    }
}
