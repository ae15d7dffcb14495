use std::env;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "Usage: lendbot serve --config <path> | lendbot verify-audit <path>";

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    match cmd.as_str() {
        "serve" => serve(args).await,
        "verify-audit" => verify_audit(args.next()),
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn serve(mut args: impl Iterator<Item = String>) {
    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match lendbot_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log.filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = lendbot_server::serve(cfg).await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

fn verify_audit(path: Option<String>) {
    let Some(path) = path else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    match lendbot_server::verify_audit_chain(&path) {
        Ok(summary) => println!("{summary}"),
        Err(e) => {
            eprintln!("audit chain invalid: {e}");
            std::process::exit(1);
        }
    }
}
