use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use grader::config::CliArgs;
use grader::intake::Intake;
use grader::model::RunRequest;
use grader::pool::SlotPool;
use grader::web_server::build_server;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().expect("Failed to load configuration");

    let pool = SlotPool::new(config.engine.slots);
    let intake = Arc::new(Intake::from_config(&config, pool).expect("Failed to set up sandbox"));

    // ======= PREPARATION END, EXECUTION START =======

    if let Some(request_path) = &cli.run {
        let run = run_once(&intake, request_path);
        tokio::pin!(run);
        let res = tokio::select! {
            biased;
            res = &mut run => res,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-c received, cancelling run");
                intake.cancel_all();
                // The run returns only after its sandboxed programs are gone
                let _ = run.await;
                std::process::exit(130);
            }
        };
        if let Err(e) = res {
            log::error!("{e:#}");
            std::process::exit(1);
        }
        return Ok(());
    }

    let server = build_server(config.server, intake.clone()).expect("Failed to build server");
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    // 1. Stop runs still in flight so their requests return
    intake.cancel_all();

    // 2. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    log::info!("Shutdown complete");
    Ok(())
}

/// Grades one request file and prints the report to stdout
async fn run_once(intake: &Intake, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open request file {}", path.display()))?;
    let request: RunRequest = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("Failed to parse request file {}", path.display()))?;

    let report = intake.submit(request).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
