use std::process::ExitCode;

use clap::Parser;

use packetloss::{
    configuration::{Configuration, Mode},
    receiver::run_receiver,
    sender::run_sender,
    stats::OutputSink,
};

#[tokio::main]
async fn main() -> ExitCode {
    let conf = Configuration::parse();

    env_logger::Builder::new()
        .filter_level(conf.log_level.into())
        .parse_default_env()
        .init();

    match run(conf).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(conf: Configuration) -> Result<(), Box<dyn std::error::Error>> {
    conf.validate()?;
    log::info!("Configuration valid. Starting up...");

    let sink = OutputSink::new(conf.output_format);
    let report_interval = conf.report_interval();

    match &conf.mode {
        Mode::Client(args) => {
            let settings = args.probe_settings(report_interval)?;
            run_sender(settings, sink, shutdown_signal()).await?;
        }
        Mode::Server(args) => {
            let settings = args.collector_settings(report_interval)?;
            run_receiver(settings, sink, shutdown_signal()).await?;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
