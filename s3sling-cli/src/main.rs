use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

mod progress;

/// Move files between local storage and S3-compatible object storage, fast.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    #[clap(flatten)]
    config: s3sling::Config,

    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file, or a tar bundle of many local files, as a single object.
    ///
    /// The object is streamed straight from the local files; a tar bundle is never materialized
    /// on local disk.  Objects larger than the part size go up as a concurrent multipart upload.
    #[clap(group(ArgGroup::new("source").required(true)))]
    Upload {
        /// The bucket to upload into
        bucket: String,

        /// The key of the object to create
        key: String,

        /// Upload a single local file byte for byte
        #[clap(short = 'f', long, group = "source", value_name = "PATH")]
        file: Option<PathBuf>,

        /// Bundle the given local files (comma separated) into one tar stream and upload that.
        ///
        /// The layout of the resulting archive is printed before the upload starts, so
        /// individual files can later be pulled back out with `extract`.
        #[clap(long, group = "source", value_delimiter = ',', value_name = "PATHS")]
        filelist: Vec<PathBuf>,
    },

    /// Download an object to a local file with concurrent chunked reads
    Download {
        /// The bucket to download from
        bucket: String,

        /// The key of the object to download
        key: String,

        /// Write the object to this local file
        #[clap(short = 'f', long, value_name = "PATH")]
        file: PathBuf,
    },

    /// Retrieve one archived file out of a tar-bundle object with a single ranged read.
    ///
    /// The offset and size come from the archive layout printed when the bundle was uploaded.
    /// Only the file's own bytes are transferred; the rest of the archive is never downloaded.
    Extract {
        /// The bucket holding the archive object
        bucket: String,

        /// The key of the archive object
        key: String,

        /// Offset of the file's entry within the archive
        #[clap(long)]
        offset: u64,

        /// Size in bytes of the archived file
        #[clap(long)]
        size: u64,

        /// Write the retrieved file here
        #[clap(short = 'f', long, value_name = "PATH")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals);

    match args.command {
        Command::Upload {
            bucket,
            key,
            file,
            filelist,
        } => {
            let source = match file {
                Some(file) => s3sling::UploadSource::File(file),
                None => s3sling::UploadSource::TarBundle(filelist),
            };

            let job = progress::with_spinner(
                &args.globals,
                "Planning upload...",
                s3sling::UploadJobBuilder::new(args.globals.config.clone(), bucket, key, source)
                    .build(),
            )
            .await?;

            if let Some(manifest) = job.manifest() {
                println!("### TAR INFO ###");
                for entry in manifest {
                    println!(
                        " File: {} Offset: {} Size: {}",
                        entry.name, entry.offset, entry.size
                    );
                }
                println!("################");
            }

            let result = progress::run_upload_job(&args.globals, job).await?;

            println!(
                "Uploaded: {} ({}) in {:.2}s, {:.2} MB/s",
                result.location(),
                human_bytes(result.total_bytes),
                result.elapsed.as_secs_f64(),
                mb_per_sec(result.throughput_bytes_per_sec()),
            );
        }

        Command::Download { bucket, key, file } => {
            let job = progress::with_spinner(
                &args.globals,
                "Checking object...",
                s3sling::DownloadJobBuilder::new(args.globals.config.clone(), bucket, key, file)
                    .build(),
            )
            .await?;

            let result = progress::run_download_job(&args.globals, job).await?;

            println!(
                "Downloaded: {} ({}) in {:.2}s, {:.2} MB/s",
                result.dest.display(),
                human_bytes(result.total_bytes),
                result.elapsed.as_secs_f64(),
                mb_per_sec(result.throughput_bytes_per_sec()),
            );
        }

        Command::Extract {
            bucket,
            key,
            offset,
            size,
            file,
        } => {
            let name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());

            let entry = s3sling::ManifestEntry { name, offset, size };

            let job = progress::with_spinner(
                &args.globals,
                "Checking archive...",
                s3sling::RetrieveEntryJobBuilder::new(
                    args.globals.config.clone(),
                    bucket,
                    key,
                    entry,
                    file,
                )
                .build(),
            )
            .await?;

            let result =
                progress::with_spinner(&args.globals, "Retrieving archived file...", job.run())
                    .await?;

            println!(
                "Extracted: {} ({}) in {:.2}s, {:.2} MB/s",
                result.dest.display(),
                human_bytes(result.total_bytes),
                result.elapsed.as_secs_f64(),
                mb_per_sec(result.throughput_bytes_per_sec()),
            );
        }
    }

    Ok(())
}

fn init_logging(globals: &Globals) {
    use tracing_subscriber::EnvFilter;

    let filter = if globals.verbose {
        EnvFilter::new("s3sling=debug,info")
    } else if globals.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn human_bytes(bytes: u64) -> String {
    byte_unit::Byte::from_bytes(bytes as u128)
        .get_appropriate_unit(true)
        .to_string()
}

fn mb_per_sec(bytes_per_sec: f64) -> f64 {
    bytes_per_sec / (1024.0 * 1024.0)
}
