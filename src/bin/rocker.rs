//! Binary entry point: parses the CLI, installs logging/cancellation, and
//! drives one subcommand to completion (spec §6).

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use rocker::cancel::CancelGuard;
use rocker::cli::{Cli, Command};
use rocker::daemon::{BollardDaemonClient, DaemonClient};
use rocker::engine;
use rocker::error::ErrorKind;
use rocker::plan;
use rocker::rockerfile;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    rocker::logging::init(cli.json, cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:?}");
            if ErrorKind::is_user_input(&e) {
                ExitCode::from(1)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> rocker::Result<()> {
    let daemon = BollardDaemonClient::connect_with_defaults()?;

    match cli.command {
        Command::Build(args) => {
            let directives = rockerfile::load_directives(&args.file, &args.var)?;
            if args.print {
                for d in &directives {
                    println!("{}", d.render());
                }
                return Ok(());
            }

            let compiled = plan::compile(&directives)?;
            let cache = args.cache();
            let config = args.engine_config(default_build_id());
            let cancel = CancelGuard::new();
            cancel.install()?;

            let report = engine::run_build(&compiled, &daemon, &cache, &config, &cancel).await?;
            for tagged in &report.tagged_images {
                println!("{} -> {}", tagged.reference, tagged.image_id);
            }
            Ok(())
        }
        Command::Show { reference, json } => {
            let info = daemon.inspect_image(&reference).await?;
            match info {
                Some(info) if json => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "id": info.id,
                            "env": info.env,
                            "cmd": info.cmd,
                            "entrypoint": info.entrypoint,
                            "labels": info.labels,
                        })
                    );
                    Ok(())
                }
                Some(info) => {
                    println!("{} {:?}", info.id, info.cmd);
                    Ok(())
                }
                None => Err(ErrorKind::user_input(format!("no such image: {reference}"))),
            }
        }
        Command::Clean => Ok(()),
        Command::Pull { reference } => daemon.ensure_image(&reference, true).await.map(|_| ()),
        Command::Info { all } => {
            println!("daemon: bollard (docker engine api)");
            if all {
                println!("host: {}", std::env::var("DOCKER_HOST").unwrap_or_else(|_| "local default socket".to_string()));
            }
            Ok(())
        }
    }
}

fn default_build_id() -> String {
    std::env::var("GIT_COMMIT").unwrap_or_else(|_| "local".to_string())
}
