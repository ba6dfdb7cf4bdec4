use log::{error, info};
use slp_engine::logging;
use slp_engine::runtime::{AgentServer, MessageHandler, ServerOptions, SlpConfig};
use slp_engine::{DirectoryAgent, ServiceAgent};
use std::process::ExitCode;
use std::sync::Arc;

const USAGE: &str = "usage: slpd <da|sa> [config.json]";

fn run<H: MessageHandler>(handler: H, options: ServerOptions) -> slp_engine::Result<()> {
    let server = Arc::new(AgentServer::new(Arc::new(handler), options));
    let on_signal = Arc::clone(&server);
    ctrlc::set_handler(move || {
        info!("Shutting down...");
        on_signal.stop();
    })
    .map_err(|e| slp_engine::SlpError::Config(format!("cannot install signal handler: {}", e)))?;

    server.start()?;
    server.wait_stopped();
    Ok(())
}

fn main() -> ExitCode {
    logging::init();
    let args: Vec<String> = std::env::args().collect();
    let Some(role) = args.get(1) else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };

    let config = match args.get(2) {
        Some(path) => {
            info!("Loading config from: {}", path);
            SlpConfig::load(path)
        }
        None => Ok(SlpConfig::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = ServerOptions::from_config(&config).and_then(|options| match role.as_str() {
        "da" => run(DirectoryAgent::new(&config)?, options),
        "sa" => run(ServiceAgent::new(&config)?, options.with_tcp_loopback_only(true)),
        other => {
            eprintln!("unknown role '{}'\n{}", other, USAGE);
            Err(slp_engine::SlpError::Config(format!("unknown role '{}'", other)))
        }
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("slpd failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
