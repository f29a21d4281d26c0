//! xml2csv CLI - Convert XML documents to CSV
//!
//! # Commands
//!
//! ```bash
//! xml2csv preview feed.xml                     # Infer record tag and columns
//! xml2csv preview --url https://host/feed.xml  # Preview a remote document
//! xml2csv convert feed.xml -o out.csv          # Convert (record tag inferred)
//! xml2csv convert feed.xml --record-tag Item --header-policy first-record
//! xml2csv convert --url https://host/feed.xml --stream
//! xml2csv serve                                # Start HTTP server (port 3000)
//! ```

use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use xml2csv::config::port_from_env;
use xml2csv::{
    convert_source, preview_source, ConvertOptions, Converter, EmptyLeafPolicy, FetchMode, HeaderPolicy, Mapping,
    RunState, XmlSource,
};

#[derive(Parser)]
#[command(name = "xml2csv")]
#[command(about = "Flatten XML records into CSV rows, streaming", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the document comes from.
#[derive(Args)]
struct InputArgs {
    /// Input XML file
    #[arg(required_unless_present = "url", conflicts_with = "url")]
    input: Option<PathBuf>,

    /// Fetch the document from a URL instead
    #[arg(long)]
    url: Option<String>,

    /// Parse a URL body while it downloads
    #[arg(long, requires = "url")]
    stream: bool,
}

impl InputArgs {
    fn source(self) -> XmlSource {
        match (self.input, self.url) {
            (Some(path), _) => XmlSource::File(path),
            (None, Some(url)) => {
                let mode = if self.stream { FetchMode::Streaming } else { FetchMode::Full };
                XmlSource::url(url, mode)
            }
            // clap enforces one of the two
            (None, None) => XmlSource::File(PathBuf::new()),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Infer the record tag and show a sample record
    Preview {
        #[command(flatten)]
        input: InputArgs,

        /// Scan the whole document instead of the first 40 KiB
        #[arg(long)]
        full: bool,
    },

    /// Convert a document to CSV
    Convert {
        #[command(flatten)]
        input: InputArgs,

        /// Record element tag (inferred if not specified)
        #[arg(short, long)]
        record_tag: Option<String>,

        /// Column mapping JSON file
        #[arg(short, long)]
        mapping: Option<PathBuf>,

        /// Rows per write batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Header discovery: first-record, two-pass or full-buffer
        #[arg(long)]
        header_policy: Option<HeaderPolicy>,

        /// Emit empty columns for bare leaf elements
        #[arg(long)]
        emit_empty: bool,

        /// Options JSON file (flags override it)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Start HTTP server
    Serve {
        /// Port to listen on (default: $XML2CSV_PORT or 3000)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (if present)
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Preview { input, full } => cmd_preview(input.source(), full).await,

        Commands::Convert {
            input,
            record_tag,
            mapping,
            batch_size,
            header_policy,
            emit_empty,
            config,
            output,
        } => {
            let overrides = Overrides {
                record_tag,
                mapping,
                batch_size,
                header_policy,
                emit_empty,
            };
            cmd_convert(input.source(), config.as_deref(), overrides, output.as_deref()).await
        }

        Commands::Serve { port } => cmd_serve(port).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Command-line values that override the options file.
struct Overrides {
    record_tag: Option<String>,
    mapping: Option<PathBuf>,
    batch_size: Option<usize>,
    header_policy: Option<HeaderPolicy>,
    emit_empty: bool,
}

fn load_options(config: Option<&Path>, overrides: Overrides) -> Result<ConvertOptions, Box<dyn std::error::Error>> {
    let mut options = match config {
        Some(path) => ConvertOptions::from_file(path)?,
        None => ConvertOptions::from_env()?,
    };

    if let Some(tag) = overrides.record_tag {
        options.record_tag = Some(tag);
    }
    if let Some(path) = overrides.mapping {
        let content = std::fs::read_to_string(&path)?;
        options.mapping = Some(Mapping::from_json(&content)?);
    }
    if let Some(batch_size) = overrides.batch_size {
        options.batch_size = batch_size;
    }
    if let Some(policy) = overrides.header_policy {
        options.header_policy = policy;
    }
    if overrides.emit_empty {
        options.empty_leaves = EmptyLeafPolicy::Emit;
    }

    options.validate()?;
    Ok(options)
}

async fn cmd_preview(source: XmlSource, full: bool) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("Previewing: {}", source);

    let options = ConvertOptions::from_env()?;
    let preview = preview_source(source, &options, full).await?;

    match &preview.record_tag {
        Some(tag) => {
            eprintln!("   Record tag: <{}>", tag);
            eprintln!("   Columns:    {}", preview.columns.join(", "));
            if let Some(sample) = &preview.xml_sample {
                eprintln!("\n{}\n", sample);
            }
        }
        None if preview.truncated => {
            eprintln!("   No record completed in the sample; try --full");
        }
        None => {
            eprintln!("   No record element found");
        }
    }

    println!("{}", serde_json::to_string_pretty(&preview.row)?);
    Ok(())
}

async fn cmd_convert(
    source: XmlSource,
    config: Option<&Path>,
    overrides: Overrides,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("Converting: {}", source);

    let options = load_options(config, overrides)?;
    let stop = Arc::new(AtomicBool::new(false));
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after the current record...");
            ctrl_c.store(true, Ordering::SeqCst);
        }
    });

    let converter = Converter::new(options).with_stop_signal(stop);
    let sink: Box<dyn Write + Send> = match output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let outcome = convert_source(&converter, source, sink).await?;
    let mut sink = outcome.output;
    sink.flush()?;

    eprintln!("   Record tag: <{}>", outcome.record_tag.as_deref().unwrap_or("-"));
    eprintln!("   Rows:       {}", outcome.rows_written);
    eprintln!("   Columns:    {}", outcome.columns.len());
    if !outcome.dropped_columns.is_empty() {
        eprintln!("   Dropped:    {}", outcome.dropped_columns.join(", "));
    }
    for warning in &outcome.mapping_warnings {
        eprintln!("   Warning:    {}", warning);
    }
    if let Some(path) = output {
        eprintln!("Output written to: {}", path.display());
    }

    match (outcome.status, outcome.error) {
        (_, Some(e)) => Err(e.into()),
        (RunState::Stopped, None) => {
            eprintln!("Stopped.");
            Ok(())
        }
        _ => {
            eprintln!("Done!");
            Ok(())
        }
    }
}

async fn cmd_serve(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let port = match port {
        Some(port) => port,
        None => port_from_env()?,
    };
    let defaults = ConvertOptions::from_env()?;
    xml2csv::server::start_server(port, defaults).await
}
