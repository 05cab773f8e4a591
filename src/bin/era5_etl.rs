use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use era5_etl::cds::{ArchiveCredential, CdsHttpClient};
use era5_etl::compact::compact;
use era5_etl::config::{ConfigLoader, ResolvedConfig};
use era5_etl::domain::{Kind, Period};
use era5_etl::error::EtlError;
use era5_etl::fetch::Fetcher;
use era5_etl::netcdf_reader::NetcdfReader;
use era5_etl::output::JsonOutput;
use era5_etl::pipeline::{Pipeline, PipelineSettings, RunOptions};
use era5_etl::stac;
use era5_etl::storage::{Protocol, StorageOptions};
use era5_etl::store::ZarrStore;

#[derive(Parser)]
#[command(name = "era5-etl")]
#[command(about = "Load ERA5 hourly reanalysis from the Copernicus archive into Zarr stores")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch, transform and append every pending month for a kind")]
    Run(RunArgs),
    #[command(about = "Rewrite a store's time axis as a single chunk")]
    Compact(CompactArgs),
    #[command(about = "Generate STAC documents for the stores")]
    Stac(StacArgs),
}

#[derive(Args)]
struct StoreArgs {
    /// SAS token for the output storage account.
    #[arg(long, env = "ETL_CREDENTIAL", hide_env_values = true)]
    credential: Option<String>,

    #[arg(long, default_value = "abfs")]
    output_protocol: Protocol,

    /// Defaults to `era5/<kind>.zarr`.
    #[arg(long)]
    output_path: Option<String>,

    #[arg(long)]
    config: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    kind: Kind,

    #[command(flatten)]
    store: StoreArgs,

    /// Archive key as `UID:KEY`.
    #[arg(long, env = "ETL_CDS_API_KEY", hide_env_values = true)]
    cds_api_key: Option<String>,

    #[arg(long)]
    start_period: Option<Period>,

    #[arg(long)]
    end_period: Option<Period>,
}

#[derive(Args)]
struct CompactArgs {
    kind: Kind,

    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Args)]
struct StacArgs {
    #[command(subcommand)]
    command: StacCommand,
}

#[derive(Subcommand)]
enum StacCommand {
    #[command(about = "Create a STAC collection from the stores under a root")]
    CreateCollection(CreateCollectionArgs),
    #[command(about = "Create a STAC item for one store")]
    CreateItem(CreateItemArgs),
}

#[derive(Args)]
struct CreateCollectionArgs {
    root_path: String,
    protocol: Protocol,
    destination: PathBuf,

    #[arg(long = "extra-field")]
    extra_fields: Vec<String>,

    #[arg(long = "storage-option")]
    storage_options: Vec<String>,
}

#[derive(Args)]
struct CreateItemArgs {
    source: String,
    destination: PathBuf,

    /// Taken from the store name when omitted.
    #[arg(long)]
    kind: Option<Kind>,

    #[arg(long, default_value = "abfs")]
    protocol: Protocol,

    #[arg(long = "storage-option")]
    storage_options: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<EtlError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &EtlError) -> u8 {
    if error.is_configuration() {
        return 2;
    }
    if error.is_invariant_violation() {
        return 4;
    }
    match error {
        EtlError::ConnectionReset(_)
        | EtlError::RetriesExhausted { .. }
        | EtlError::ArchiveHttp(_)
        | EtlError::ArchiveStatus { .. }
        | EtlError::ArchiveRequestFailed(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_pipeline(args),
        Commands::Compact(args) => run_compact(args),
        Commands::Stac(args) => match args.command {
            StacCommand::CreateCollection(args) => run_create_collection(args),
            StacCommand::CreateItem(args) => run_create_item(args),
        },
    }
}

fn open_store(kind: Kind, args: &StoreArgs, config: &ResolvedConfig) -> Result<ZarrStore, EtlError> {
    let path = args
        .output_path
        .clone()
        .unwrap_or_else(|| kind.default_output_path());
    let options = StorageOptions {
        account_name: Some(config.storage_account.clone()),
        credential: args.credential.clone(),
    };
    ZarrStore::open(args.output_protocol, &path, &options)
}

fn run_pipeline(args: RunArgs) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.store.config.as_deref())?;
    let key = args
        .cds_api_key
        .as_deref()
        .ok_or_else(|| EtlError::InvalidCredential("no archive key given".to_string()))?;
    let credential: ArchiveCredential = key.parse()?;
    let client = CdsHttpClient::new(&config.archive_url, credential, config.poll_interval)?;
    let fetcher = Fetcher::new(
        client,
        NetcdfReader,
        config.archive_dataset.clone(),
        config.retry,
    );
    let store = open_store(args.kind, &args.store, &config)?;
    info!("{}: writing to {}", args.kind, store.location());

    let pipeline = Pipeline::new(args.kind, fetcher, store, PipelineSettings::from(&config));
    let summary = pipeline.run(
        RunOptions {
            start_period: args.start_period,
            end_period: args.end_period,
        },
        Local::now().date_naive(),
    )?;
    JsonOutput::print_run(&summary).into_diagnostic()?;
    Ok(())
}

fn run_compact(args: CompactArgs) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.store.config.as_deref())?;
    let store = open_store(args.kind, &args.store, &config)?;
    let report = compact(&store)?;
    JsonOutput::print_compaction(&report).into_diagnostic()?;
    Ok(())
}

fn run_create_collection(args: CreateCollectionArgs) -> miette::Result<()> {
    let storage_options = StorageOptions::from_pairs(&args.storage_options)?;
    let extra_fields = stac::parse_extra_fields(&args.extra_fields)?;
    let collection =
        stac::create_collection(&args.root_path, args.protocol, &storage_options, extra_fields)?;
    JsonOutput::write_document(&args.destination, &collection)?;
    info!("wrote collection to {}", args.destination.display());
    Ok(())
}

fn run_create_item(args: CreateItemArgs) -> miette::Result<()> {
    let storage_options = StorageOptions::from_pairs(&args.storage_options)?;
    let kind = match args.kind {
        Some(kind) => kind,
        None => args.source.parse::<Kind>()?,
    };
    let store = ZarrStore::open(args.protocol, &args.source, &storage_options)?;
    let item = stac::create_item(kind, &args.source, args.protocol, &store, &storage_options)?;
    JsonOutput::write_document(&args.destination, &item)?;
    info!("wrote item {} to {}", item.id, args.destination.display());
    Ok(())
}
