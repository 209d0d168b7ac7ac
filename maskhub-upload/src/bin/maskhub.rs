//! MaskHub upload tool
//!
//! Writes and checks configuration, inspects failed-upload files, and runs a
//! synthetic current ramp through the full upload pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use clap::{Parser, Subcommand};
use maskhub_upload::config::ConfigSource;
use maskhub_upload::logging::setup::{init_logging, LoggingConfig};
use maskhub_upload::prelude::*;
use maskhub_upload::storage::load_failed_uploads;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log debug output from this tool
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write an example configuration file
    ExampleConfig {
        #[arg(long, default_value = "maskhub_config.example.json")]
        output: PathBuf,
    },
    /// Show which credentials and settings would be used
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a synthetic current ramp and upload it
    Simulate {
        #[arg(long)]
        run_name: String,
        #[arg(long)]
        mask_id: i64,
        #[arg(long, value_delimiter = ',', default_value = "L1")]
        devices: Vec<String>,
        #[arg(long, default_value_t = 0.0)]
        start_ma: f64,
        #[arg(long, default_value_t = 50.0)]
        stop_ma: f64,
        #[arg(long, default_value_t = 5)]
        steps: u32,
        /// Skip the die analysis trigger after the run
        #[arg(long)]
        no_analysis: bool,
        #[arg(long, default_value = "laser_data")]
        data_dir: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Summarize a failed-uploads file
    ShowFailed { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let logging = if args.verbose {
        LoggingConfig::development()
    } else {
        LoggingConfig::default()
    }
    .with_json_format(args.json);
    init_logging(logging).map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    match args.command {
        Command::ExampleConfig { output } => {
            MaskHubConfigManager::create_example_config(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Example configuration written to {}", output.display());
        }
        Command::CheckConfig { config } => check_config(config),
        Command::Simulate {
            run_name,
            mask_id,
            devices,
            start_ma,
            stop_ma,
            steps,
            no_analysis,
            data_dir,
            config,
        } => {
            let ramp = Ramp {
                start_ma,
                stop_ma,
                steps,
            };
            simulate(
                RunConfig::new(mask_id, run_name),
                &devices,
                ramp,
                !no_analysis,
                IntegrationOptions::default().with_data_dir(data_dir),
                config,
            )
            .await?;
        }
        Command::ShowFailed { file } => {
            let records = load_failed_uploads(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            println!("{} failed uploads in {}", records.len(), file.display());
            for record in &records {
                let status = record
                    .status
                    .map_or_else(|| "no response".to_string(), |s| s.to_string());
                println!(
                    "  {} / {}  [{}] after {} attempt(s): {}",
                    record.measurement_data.run_name,
                    record.measurement_data.device_name,
                    status,
                    record.attempts,
                    record.error
                );
            }
        }
    }

    Ok(())
}

fn check_config(config: Option<PathBuf>) {
    let manager = MaskHubConfigManager::load(config.as_deref());

    match manager.credentials() {
        Some(credentials) => {
            let source = match manager.source() {
                Some(ConfigSource::Environment) => "environment".to_string(),
                Some(ConfigSource::File(path)) => path.display().to_string(),
                None => "programmatic".to_string(),
            };
            println!("Credentials from: {source}");
            println!("  api_url:    {}", credentials.api_url);
            println!("  api_v3_url: {}", credentials.api_v3_url);
            println!("  api_token:  {}", credentials.api_token.masked());
        }
        None => println!("No credentials found; uploads would run in local-only mode"),
    }

    let settings = manager.settings();
    println!("Settings:");
    println!("  timeout:          {}s", settings.timeout);
    println!("  max_retries:      {}", settings.max_retries);
    println!("  retry_min_wait:   {}s", settings.retry_min_wait);
    println!("  retry_multiplier: {}", settings.retry_multiplier);
}

#[derive(Debug, Clone, Copy)]
struct Ramp {
    start_ma: f64,
    stop_ma: f64,
    steps: u32,
}

impl Ramp {
    fn currents(&self) -> Vec<f64> {
        match self.steps {
            0 => Vec::new(),
            1 => vec![self.start_ma],
            n => (0..n)
                .map(|i| self.start_ma + (self.stop_ma - self.start_ma) * f64::from(i) / f64::from(n - 1))
                .collect(),
        }
    }
}

/// Optical output of an idealised diode: zero below threshold, linear above.
fn synthetic_power_mw(current_ma: f64) -> f64 {
    const THRESHOLD_MA: f64 = 10.0;
    const SLOPE_MW_PER_MA: f64 = 0.3;
    (current_ma - THRESHOLD_MA).max(0.0) * SLOPE_MW_PER_MA
}

fn synthetic_samples(current_ma: f64) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("sample", DataType::Int64, false),
        Field::new("current_ma", DataType::Float64, false),
        Field::new("power_mw", DataType::Float64, false),
    ]));
    let samples: Vec<i64> = (0..10).collect();
    let currents: Vec<f64> = samples.iter().map(|_| current_ma).collect();
    let powers: Vec<f64> = samples
        .iter()
        .map(|&i| synthetic_power_mw(current_ma) * (1.0 + (i as f64 - 4.5) * 1e-3))
        .collect();

    Ok(RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(samples)),
            Arc::new(Float64Array::from(currents)),
            Arc::new(Float64Array::from(powers)),
        ],
    )?)
}

async fn simulate(
    run: RunConfig,
    devices: &[String],
    ramp: Ramp,
    trigger_analysis: bool,
    options: IntegrationOptions,
    config: Option<PathBuf>,
) -> Result<()> {
    let currents = ramp.currents();
    let run = run.with_expected_measurements((devices.len() * currents.len()) as u32);

    let mut integration = LaserMaskHubIntegration::new(config.as_deref(), options)?;
    let run_id = integration.start(run).await?;
    println!("Started run {run_id}");

    for (x, device) in devices.iter().enumerate() {
        for &current in &currents {
            let measurement = Measurement::from_test_data(
                device.as_str(),
                current,
                current,
                1.2 + current * 0.01,
                Some(synthetic_power_mw(current)),
                Some(25.0),
            )
            .with_raw_data(synthetic_samples(current)?);
            integration.add_measurement(measurement, Some(DiePosition::new(x as i32, 0)))?;
        }
    }

    let summary = integration.finish(trigger_analysis).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let report = integration.close().await?;
    if let Some(path) = report.failed_uploads_file {
        println!("Failed uploads written to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramp_points() {
        let ramp = Ramp {
            start_ma: 0.0,
            stop_ma: 40.0,
            steps: 5,
        };
        assert_eq!(ramp.currents(), vec![0.0, 10.0, 20.0, 30.0, 40.0]);

        let single = Ramp { steps: 1, ..ramp };
        assert_eq!(single.currents(), vec![0.0]);
        assert!(Ramp { steps: 0, ..ramp }.currents().is_empty());
    }

    #[test]
    fn test_synthetic_power_threshold() {
        assert_eq!(synthetic_power_mw(5.0), 0.0);
        assert!((synthetic_power_mw(20.0) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_synthetic_samples_shape() {
        let batch = synthetic_samples(30.0).unwrap();
        assert_eq!(batch.num_rows(), 10);
        assert_eq!(batch.num_columns(), 3);
    }

    #[test]
    fn test_cli_parses_device_list() {
        let args = Args::parse_from([
            "maskhub", "simulate", "--run-name", "R1", "--mask-id", "7", "--devices", "L1,L2",
        ]);
        match args.command {
            Command::Simulate { devices, steps, .. } => {
                assert_eq!(devices, vec!["L1", "L2"]);
                assert_eq!(steps, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
