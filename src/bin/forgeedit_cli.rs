//! ForgeEdit CLI - Bridge interface for the web layer
//!
//! Commands: register, login, upload, edit, compress, gallery, fetch
//! Outputs JSON to stdout, logs to stderr (RUST_LOG)
//! Exit 2 on client errors, 1 on server errors

use base64::Engine as _;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use forgeedit_core::{
    AccountError, Accounts, CookieIdentity, EditPipeline, EditRequest, EngineConfig, FsStore,
    InMemoryDirectory, Operation, PipelineError, RequestContext, SnapshotLock,
};

#[derive(Parser)]
#[command(name = "forgeedit-cli")]
#[command(about = "ForgeEdit CLI - owned image artifact pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to engine config (JSON)
    #[arg(short, long, default_value = "forgeedit.json")]
    config: PathBuf,

    /// Path to the user directory snapshot
    #[arg(short, long, default_value = "forgeedit-state.json")]
    state: PathBuf,

    /// Act as this user (identity cookie)
    #[arg(short, long)]
    user: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a user
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },

    /// Check credentials
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },

    /// Upload an image file
    Upload {
        file: PathBuf,
    },

    /// Apply an operation
    Edit {
        /// Image reference (/uploads/...)
        #[arg(short, long)]
        image: String,

        /// JSON payload (Operation), e.g. {"op":"rotate","angle":90}
        #[arg(short, long)]
        payload: String,
    },

    /// Re-encode as JPEG and report size statistics
    Compress {
        #[arg(short, long)]
        image: String,

        #[arg(short, long)]
        quality: i64,
    },

    /// List the user's images
    Gallery,

    /// Print an artifact as base64
    Fetch {
        image: String,
    },
}

enum Failure {
    Client(Value),
    Server(Value),
}

impl From<PipelineError> for Failure {
    fn from(e: PipelineError) -> Self {
        let body = json!({
            "success": false,
            "error": e.to_string(),
            "kind": e.kind(),
            "status": e.status_code(),
        });
        if e.is_client_error() {
            Failure::Client(body)
        } else {
            Failure::Server(body)
        }
    }
}

impl From<AccountError> for Failure {
    fn from(e: AccountError) -> Self {
        let body = json!({ "success": false, "error": e.to_string() });
        match e {
            AccountError::Directory(_) => Failure::Server(body),
            _ => Failure::Client(body),
        }
    }
}

fn server_failure(message: String) -> Failure {
    Failure::Server(json!({ "success": false, "error": message }))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(output) => {
            emit(&output);
            ExitCode::SUCCESS
        }
        Err(Failure::Client(output)) => {
            emit(&output);
            ExitCode::from(2)
        }
        Err(Failure::Server(output)) => {
            emit(&output);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<Value, Failure> {
    let config = EngineConfig::load_from_file(&cli.config)
        .map_err(|e| server_failure(format!("Failed to load config: {}", e)))?;
    let store = FsStore::open(&config.storage_root)
        .map_err(|e| server_failure(format!("Failed to open storage: {}", e)))?;

    // held from load through save
    let _lock = SnapshotLock::acquire(&cli.state)
        .map_err(|e| server_failure(format!("Failed to lock state: {}", e)))?;
    let directory = Arc::new(
        InMemoryDirectory::load(&cli.state)
            .map_err(|e| server_failure(format!("Failed to load state: {}", e)))?,
    );

    let accounts = Accounts::new(directory.clone()).with_iterations(config.credential_iterations);
    if let Some(admin) = &config.bootstrap_admin {
        accounts.bootstrap_admin(admin)?;
    }

    let identity = Arc::new(CookieIdentity::new(directory.clone()));
    let pipeline = EditPipeline::new(Arc::new(store), directory.clone(), identity, &config);
    let ctx = match &cli.user {
        Some(name) => RequestContext::for_user(name.clone()),
        None => RequestContext::anonymous(),
    };

    let output = match cli.command {
        Commands::Register { username, password } => {
            let user = accounts.register(&username, &password)?;
            json!({ "success": true, "user": { "id": user.id, "name": user.name } })
        }

        Commands::Login { username, password } => {
            let user = accounts.login(&username, &password)?;
            json!({ "success": true, "user": { "id": user.id, "name": user.name } })
        }

        Commands::Upload { file } => {
            let bytes = fs::read(&file).map_err(|e| {
                Failure::Client(json!({
                    "success": false,
                    "error": format!("Cannot read {}: {}", file.display(), e),
                }))
            })?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let outcome = pipeline.upload(&ctx, &filename, &bytes)?;
            json!({ "success": true, "result": outcome })
        }

        Commands::Edit { image, payload } => {
            let operation: Operation = serde_json::from_str(&payload).map_err(|e| {
                Failure::Client(json!({
                    "success": false,
                    "error": format!("Invalid payload: {}", e),
                }))
            })?;
            let outcome = pipeline.apply(&ctx, &EditRequest::new(image, operation))?;
            json!({ "success": true, "result": outcome })
        }

        Commands::Compress { image, quality } => {
            let outcome = pipeline.compress(&ctx, &image, quality)?;
            json!({ "success": true, "result": outcome })
        }

        Commands::Gallery => {
            let images = pipeline.gallery(&ctx)?;
            json!({ "success": true, "images": images })
        }

        Commands::Fetch { image } => {
            let bytes = pipeline.fetch(&image)?;
            json!({
                "success": true,
                "image_url": image,
                "size": bytes.len(),
                "data_base64": base64::engine::general_purpose::STANDARD.encode(&bytes),
            })
        }
    };

    directory
        .save(&cli.state)
        .map_err(|e| server_failure(format!("Failed to save state: {}", e)))?;

    Ok(output)
}

fn emit(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => println!(r#"{{"success": false, "error": "Cannot serialize output: {}"}}"#, e),
    }
}
