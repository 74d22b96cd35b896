use std::{
    path::{Path, PathBuf},
    process,
};

use clap::{Parser, Subcommand};

mod manifest;
mod run;
mod token;

use manifest::Manifest;

#[derive(Clone, Debug)]
pub struct Context {
    pub manifest: Manifest,
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "durastream - durable append-log streams over HTTP", long_about = None)]
struct Opts {
    /// Path to the durastream.yaml manifest file
    #[arg(
        long = "manifest-path",
        short = 'm',
        global = true,
        default_value = "./durastream.yaml"
    )]
    manifest_path: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Start the streams server
    Run(run::RunCommand),
    /// Sign a project token offline
    Token(token::TokenCommand),
    /// Print the reader key of a stream
    ReaderKey(token::ReaderKeyCommand),
    /// Validate the manifest and print the effective options
    Check,
}

#[tokio::main]
async fn main() {
    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            let _ = e.print();
            process::exit(e.exit_code());
        }
    };

    let manifest_dir = opts
        .manifest_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    load_env_file(&manifest_dir);

    let manifest = if opts.manifest_path.exists() {
        match Manifest::load(&opts.manifest_path) {
            Ok(manifest) => {
                eprintln!("✓ Loaded manifest from {}", opts.manifest_path.display());
                manifest
            }
            Err(e) => {
                eprintln!("Error: {e:#}");
                process::exit(1);
            }
        }
    } else {
        Manifest::default()
    };

    let ctx = Context { manifest };
    if let Err(e) = handle_command(opts.command, &ctx).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

/// Load environment variables from .env file in the manifest directory
fn load_env_file(manifest_dir: &Path) {
    let env_file_path = manifest_dir.join(".env");

    match dotenvy::from_path(&env_file_path) {
        Ok(_) => {
            eprintln!("✓ Loaded environment from {}", env_file_path.display());
        }
        Err(e) if e.not_found() => {}
        Err(e) => {
            eprintln!(
                "Warning: Failed to load .env file at {}: {}",
                env_file_path.display(),
                e
            );
        }
    }
}

async fn handle_command(command: Command, ctx: &Context) -> anyhow::Result<()> {
    match command {
        Command::Run(cmd) => cmd.execute(ctx).await,
        Command::Token(cmd) => {
            println!("{}", cmd.execute(ctx)?);
            Ok(())
        }
        Command::ReaderKey(cmd) => {
            println!("{}", cmd.execute(ctx)?);
            Ok(())
        }
        Command::Check => {
            let mut options = ctx.manifest.options.clone();
            options.admin_token = options.admin_token.map(|_| "<redacted>".to_string());
            for project in &mut options.projects {
                project.signing_secret = project.signing_secret.take().map(|_| "<redacted>".into());
                project.reader_secret = project.reader_secret.take().map(|_| "<redacted>".into());
            }
            print!("{}", serde_yml::to_string(&options)?);
            Ok(())
        }
    }
}
