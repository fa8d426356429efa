use std::process::ExitCode;

use equity_lake::{
    init_logging, logging_config_from_env, run_from_config, CsvPriceSource, HttpPriceSource,
    LocalObjectStore, PipelineConfig, PipelineContext, PriceSource, SourceSettings,
    StorageClient,
};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("daily pipeline failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let config = PipelineConfig::from_env()?;
    let source: Box<dyn PriceSource> = match &config.source {
        SourceSettings::Csv { path } => Box::new(CsvPriceSource::new(path.clone())),
        SourceSettings::Http(http) => Box::new(HttpPriceSource::new(http.clone())?),
    };
    let store = LocalObjectStore::new(config.storage_root.join(&config.bucket));
    let storage = StorageClient::new(Box::new(store), config.bucket.clone(), config.retry);
    let ctx = PipelineContext::from_config(&config, source, storage)?;

    // Stage failures are already logged by the pipeline.
    let outcome = run_from_config(&config, &ctx)?;
    println!(
        "run_date={} terminal={:?} stages={}",
        outcome.run_date,
        outcome.terminal,
        outcome
            .stages
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    Ok(())
}
