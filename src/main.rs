use beamly::cli;
use beamly::server::{self, ServerProps};

fn main() {
    env_logger::init();

    use clap::Parser;
    let opt = cli::Opt::parse();
    start_server_main(opt.server_props());
}

#[tokio::main]
async fn start_server_main(props: ServerProps) {
    if let Err(e) = server::run(props).await {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}
