use std::io::BufRead;

use sentrymesh_net::config::ServerConfig;
use sentrymesh_net::{admin::AdminCommand, Server};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::arguments;

pub fn run(args: arguments::Args) -> eyre::Result<()> {
    init_tracing();

    let config = ServerConfig::new(args.role, args.peer_ip, args.p2p_port, args.client_listen_port);
    info!(role = %config.role, "starting sentrymesh server");

    let (admin_tx, admin_rx) = flume::unbounded();
    spawn_admin_console(admin_tx);

    let server = Server::new(config, admin_rx)?;
    let reason = server.run()?;
    info!(?reason, "server exited cleanly");

    Ok(())
}

/// Read admin commands from stdin on their own thread and forward parsed
/// commands to the event loop over a channel, so the loop never blocks on
/// a read it doesn't control. EOF is forwarded as `exit` (§4.5).
fn spawn_admin_console(tx: flume::Sender<AdminCommand>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => match line.parse::<AdminCommand>() {
                    Ok(cmd) => {
                        if tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%err, "admin command rejected"),
                },
                Err(err) => {
                    error!(%err, "error reading admin console");
                    break;
                }
            }
        }
        let _ = tx.send(AdminCommand::Exit);
    });
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .try_init()
        .ok();
}
