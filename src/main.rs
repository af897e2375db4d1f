use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use dexnative::config::ProtectConfig;
use dexnative::dex::container::Container;
use dexnative::protect::Protector;
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "dexnative",
    about = "Moves DEX methods into native code and repackages the APK",
    version,
    propagate_version = true,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Protect an APK.
    Protect {
        /// Input APK.
        input: PathBuf,

        /// Output APK. It is unsigned and has to be signed again.
        #[arg(short, long, value_name = "APK")]
        output: PathBuf,

        /// JSON configuration file.
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Directory for the run's scratch files (default: system temp dir).
        #[arg(long, value_name = "DIR")]
        work_dir: Option<PathBuf>,

        /// Do not compile the native library.
        #[arg(long, action = ArgAction::SetTrue)]
        skip_native_build: bool,
    },
    /// Print class and pool counts of a DEX file.
    DexInfo {
        file: PathBuf,

        /// Also list the class descriptors.
        #[arg(long, action = ArgAction::SetTrue)]
        classes: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Protect {
            input,
            output,
            config,
            work_dir,
            skip_native_build,
        } => {
            let config = match config {
                Some(path) => ProtectConfig::load(&path)?,
                None => ProtectConfig::default(),
            };
            let mut protector = Protector::new(config)?;
            if let Some(dir) = work_dir {
                protector = protector.with_work_dir(dir);
            }
            if skip_native_build {
                protector = protector.without_native_build();
            }
            let report = protector
                .protect(&input, &output)
                .with_context(|| format!("protecting {}", input.display()))?;
            info!(
                "{}: {} native methods in {} classes, {} -> {} containers",
                report.package,
                report.native_methods,
                report.native_classes,
                report.input_containers,
                report.output_containers
            );
            println!("{}", output.display());
            Ok(())
        }
        Commands::DexInfo { file, classes } => {
            let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let container = Container::from_bytes(&bytes).with_context(|| format!("parsing {}", file.display()))?;
            println!("{}: {} classes", file.display(), container.len());
            println!("{}", container.pool_counts());
            if classes {
                for class in container.classes() {
                    println!("  {}", class.descriptor);
                }
            }
            Ok(())
        }
    }
}
