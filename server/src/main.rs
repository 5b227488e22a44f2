use clap::Parser;
use log::{error, info};
use server::gameserver::auth::load_secret_from_env;
use server::gameserver::GameServer;
use server::gateway::Gateway;

/// Exit code for any startup failure.
const EXIT_STARTUP: i32 = 84;

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Base UDP endpoint the game server binds
    #[clap(short, long, default_value = "0.0.0.0:4242")]
    udp: String,

    /// Gateway stream endpoint (bound by the gateway role, dialed by the
    /// game server role)
    #[clap(short, long, default_value = "127.0.0.1:4243")]
    gateway: String,

    /// Advertised UDP endpoint, when it differs from the bind address
    /// (e.g. behind NAT)
    #[clap(short, long)]
    external: Option<String>,

    /// Worker thread hint for the runtime
    #[clap(short, long, default_value = "4")]
    workers: usize,
}

fn main() {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info rtype-server");
    }

    let args = Args::parse();

    // Never fall back to a baked-in secret.
    let secret = match load_secret_from_env() {
        Ok(secret) => secret,
        Err(e) => {
            error!("{}", e);
            eprintln!("startup error: {e}");
            std::process::exit(EXIT_STARTUP);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.workers.max(1))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("startup error: failed to build runtime: {e}");
            std::process::exit(EXIT_STARTUP);
        }
    };

    if let Err(code) = runtime.block_on(serve(args, secret)) {
        std::process::exit(code);
    }
}

async fn serve(args: Args, secret: Vec<u8>) -> Result<(), i32> {
    // Gateway first, so the game server can register against it.
    let gateway = match Gateway::bind(&args.gateway).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("cannot bind gateway on {}: {}", args.gateway, e);
            return Err(EXIT_STARTUP);
        }
    };

    let external = args
        .external
        .as_deref()
        .unwrap_or(&args.udp)
        .parse()
        .map_err(|e| {
            error!("invalid external endpoint: {}", e);
            EXIT_STARTUP
        })?;

    let game_server = match GameServer::new(&args.udp, &args.gateway, external, secret).await {
        Ok(game_server) => game_server,
        Err(e) => {
            error!("cannot start game server: {}", e);
            return Err(EXIT_STARTUP);
        }
    };

    info!(
        "serving games on {} (advertised {}), gateway on {}",
        args.udp, external, args.gateway
    );

    tokio::select! {
        _ = gateway.run() => {}
        _ = game_server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            // Let the writer tasks drain their queues best-effort.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
    Ok(())
}
