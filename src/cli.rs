use std::{
    io::Write,
    path::PathBuf,
    sync::Arc,
};

use clap_derive::{Args, Parser, Subcommand};
use jiff::Timestamp;
use thiserror::Error;
use tracing::info;

use crate::{
    config::{ConfigError, Settings},
    merge::MergeDedupConsumer,
    partition::{PartitionedEventStream, StreamError, key_for_pv_name},
    registry::StaticTypeRegistry,
    retrieval::{RequestParams, RetrievalEngine, RetrievalError, RetrievalRequest},
    sample::StreamDescriptor,
    sink::{Sink, SinkError, TextSink},
    time::parse_instant,
};

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("invalid time '{0}'")]
    InvalidTime(String),
    #[error("'{0}' is not a partition file")]
    NotAPartition(PathBuf),
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file, defaults to ./permafrost.* when present
    #[arg(long, global = true)]
    pub config: Option<String>,
    #[command(subcommand)]
    pub command: CliCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommands {
    /// Retrieve a PV
    Get(GetArgs),
    /// Print the partition key of a PV name
    Key { pv: String },
    /// Print the samples of one partition file
    Dump(DumpArgs),
}

#[derive(Args, Debug, Clone)]
pub struct GetArgs {
    #[arg(long)]
    pub pv: String,
    #[arg(long)]
    pub from: Option<String>,
    #[arg(long)]
    pub to: Option<String>,
    /// t0,t1,t2,t3,... ascending start/end pairs
    #[arg(long)]
    pub timeranges: Option<String>,
    /// ie. optimized_160, firstSample_3600, lastFill
    #[arg(long)]
    pub pp: Option<String>,
    #[arg(long)]
    pub use_reduced: bool,
    /// Serve unknown PVs with this PV's type info
    #[arg(long)]
    pub retired_template: Option<String>,
    #[arg(long)]
    pub skip_search: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DumpArgs {
    pub file: PathBuf,
    #[arg(long)]
    pub from: Option<String>,
    #[arg(long)]
    pub to: Option<String>,
    #[arg(long)]
    pub skip_search: bool,
}

impl From<&GetArgs> for RequestParams {
    fn from(args: &GetArgs) -> Self {
        RequestParams {
            pv: args.pv.clone(),
            from: args.from.clone(),
            to: args.to.clone(),
            timeranges: args.timeranges.clone(),
            pp: args.pp.clone(),
            use_reduced: args.use_reduced,
            fetch_latest_metadata: false,
            skip_search: args.skip_search,
        }
    }
}

fn parse_time(input: &str) -> Result<Timestamp, CliError> {
    parse_instant(input).map_err(|_| CliError::InvalidTime(input.to_string()))
}

impl Cli {
    pub async fn dispatch<W: Write + Send>(self, out: W) -> Result<(), CliError> {
        let mut sink = TextSink::new(out);
        match self.command {
            CliCommands::Get(args) => {
                let mut settings = Settings::load(self.config.as_deref())?;
                if args.retired_template.is_some() {
                    settings.retrieval.retired_pv_template = args.retired_template.clone();
                }
                let registry = StaticTypeRegistry::from_file(&settings.registry_path)?;
                info!("loaded {} PVs from {}", registry.len(), settings.registry_path.display());

                let request = RetrievalRequest::parse(&(&args).into(), Timestamp::now())?;
                let engine = RetrievalEngine::new(Arc::new(registry), settings.retrieval);
                let outcome = engine.retrieve(&request, &mut sink).await?;
                info!("{outcome:?}");
            }
            CliCommands::Key { pv } => {
                let mut out = sink.into_inner();
                writeln!(out, "{}", key_for_pv_name(&pv)).map_err(SinkError::from)?;
            }
            CliCommands::Dump(args) => dump(&args, &mut sink)?,
        }
        Ok(())
    }
}

/// Whole file, or the window when `--from`/`--to` are given
fn dump(args: &DumpArgs, sink: &mut dyn Sink) -> Result<(), CliError> {
    let header = PartitionedEventStream::read_header(&args.file)?
        .ok_or_else(|| CliError::NotAPartition(args.file.clone()))?;
    let descriptor = StreamDescriptor::from_header(&header, args.file.display().to_string());

    let stream = match (&args.from, &args.to) {
        (None, None) => PartitionedEventStream::open_byte_range(
            &args.file,
            header.payload_type,
            &header.pv_name,
            0,
            u64::MAX,
        )?,
        (from, to) => {
            let start = match from {
                Some(from) => parse_time(from)?,
                None => Timestamp::MIN,
            };
            let end = match to {
                Some(to) => parse_time(to)?,
                None => Timestamp::MAX,
            };
            PartitionedEventStream::open_window(
                &args.file,
                header.payload_type,
                &header.pv_name,
                start,
                end,
                args.skip_search,
            )?
        }
    };

    let mut consumer = MergeDedupConsumer::new();
    consumer.processing_pv(sink, &descriptor)?;
    consumer.consume_stream(stream, sink)?;
    sink.end()?;
    Ok(())
}
