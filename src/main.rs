use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use flowsum::config::{Config, Criteria, HeuristicLevel, OutFormat};
use flowsum::output::{write_aguri_text, write_debug, write_json};
use flowsum::pipeline::{run_consumer, run_producer, Pipeline};
use flowsum::response::Query;

/// Hierarchical heavy-hitter traffic summarizer.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Input flow-record stream; reads stdin when omitted.
    input: Option<PathBuf>,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    interval: Option<u32>,

    #[arg(long)]
    output_interval: Option<u32>,

    #[arg(long)]
    threshold: Option<u32>,

    #[arg(long, value_enum)]
    criteria: Option<CliCriteria>,

    #[arg(long)]
    nflows: Option<usize>,

    #[arg(long)]
    max_hashentries: Option<u64>,

    /// 0 = all heuristics on, 1 = keep strict-sub-attribute threshold only, 2 = disable both.
    #[arg(long)]
    disable_heuristics: Option<u8>,

    #[arg(long, value_enum)]
    outfmt: Option<CliOutFormat>,

    /// Protocol-first view: top-level HHH runs over protocol/port space,
    /// with addresses as sub-attributes.
    #[arg(long)]
    protocol_view: bool,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum CliCriteria {
    Byte,
    Packet,
    Combination,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum CliOutFormat {
    Aguri,
    Json,
    Debug,
}

fn apply_overrides(mut config: Config, cli: &Cli) -> Config {
    if let Some(v) = cli.interval {
        config.interval = v;
    }
    if let Some(v) = cli.output_interval {
        config.output_interval = Some(v);
    }
    if let Some(v) = cli.threshold {
        config.threshold = v;
    }
    if let Some(v) = cli.criteria {
        config.criteria = match v {
            CliCriteria::Byte => Criteria::Byte,
            CliCriteria::Packet => Criteria::Packet,
            CliCriteria::Combination => Criteria::Combination,
        };
    }
    if let Some(v) = cli.nflows {
        config.nflows = Some(v);
    }
    if let Some(v) = cli.max_hashentries {
        config.max_hashentries = v;
    }
    if let Some(v) = cli.disable_heuristics {
        config.heuristics = match v {
            0 => HeuristicLevel::AllOn,
            1 => HeuristicLevel::StrictSubAttrOnly,
            _ => HeuristicLevel::AllOff,
        };
    }
    if let Some(v) = cli.outfmt {
        config.outfmt = match v {
            CliOutFormat::Aguri => OutFormat::Aguri,
            CliOutFormat::Json => OutFormat::Json,
            CliOutFormat::Debug => OutFormat::Debug,
        };
    }
    config
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let config = apply_overrides(config, &cli);
    config.validate()?;

    let pipeline = Pipeline::new(config.interval, config.threshold, cli.protocol_view);
    let query = Query::from_config(&config, cli.protocol_view);

    let flags = Arc::clone(&pipeline.flags);
    ctrlc::set_handler(move || {
        flags.close.store(true, Ordering::Release);
    })?;

    let hup_flags = Arc::clone(&pipeline.flags);
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGHUP, move || {
            hup_flags.hup.store(true, Ordering::Release);
        })?;
    }

    let output_interval = config.output_interval.filter(|out| *out > config.interval);
    let outfmt = config.outfmt;
    let query_for_consumer = query.clone();

    let consumer_pipeline: &Pipeline = &pipeline;
    std::thread::scope(|scope| -> anyhow::Result<()> {
        let consumer = scope.spawn(move || -> anyhow::Result<()> {
            let mut writer = BufWriter::new(io::stdout());
            run_consumer(consumer_pipeline, &query_for_consumer, output_interval, |response| {
                let result = match outfmt {
                    OutFormat::Aguri => write_aguri_text(&mut writer, response, &query_for_consumer),
                    OutFormat::Json => write_json(&mut writer, response, &query_for_consumer),
                    OutFormat::Debug => write_debug(&mut writer, response),
                };
                if let Err(e) = result {
                    error!(error = %e, "output write failed");
                }
            })?;
            Ok(())
        });

        match &cli.input {
            Some(path) => {
                let file = File::open(path)?;
                run_producer(&pipeline, file, &query)?;
            }
            None => {
                run_producer(&pipeline, io::stdin().lock(), &query)?;
            }
        }

        consumer.join().map_err(|_| anyhow::anyhow!("consumer thread panicked"))??;
        Ok(())
    })?;

    info!("shutdown complete");
    Ok(())
}
