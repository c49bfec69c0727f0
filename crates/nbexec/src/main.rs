use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jupyter_wire::{MimeBundle, StreamName};
use kernel_session::{
    load_settings, CellError, CellState, CellType, CommRegistry, ExecuteOptions, JsonFileStore,
    JupyterServerProvider, KernelPreference, Notebook, Output, Session,
};
use log::{info, warn};
use serde_json::Value;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Jupyter server URL
    #[arg(long, global = true, default_value = "http://localhost:8888")]
    server: String,

    /// Server token (defaults to $JUPYTER_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Kernel to start
    #[arg(long, global = true, default_value = "python3")]
    kernel: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute code in a fresh kernel (reads stdin if no code is given)
    Exec { code: Option<String> },
    /// Run every code cell of a notebook in order
    Run {
        /// Path to the .ipynb file
        path: PathBuf,
        /// Write outputs back to the notebook
        #[arg(long)]
        save: bool,
        /// Keep going after a cell fails
        #[arg(long)]
        allow_errors: bool,
    },
    /// List kernels running on the server
    Kernels {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Start a kernel and print its kernel_info
    Info {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let token = cli.token.or_else(|| std::env::var("JUPYTER_TOKEN").ok());
    let provider = JupyterServerProvider::new(&cli.server, token)?;

    let succeeded = match cli.command {
        Commands::Kernels { json } => {
            list_kernels(&provider, json).await?;
            true
        }
        Commands::Info { json } => {
            let session = start_session(provider, &cli.kernel, "").await?;
            let outcome = print_kernel_info(&session, json);
            finish(session, outcome).await?
        }
        Commands::Exec { code } => {
            let code = match code {
                Some(code) => code,
                None => {
                    let mut buffer = String::new();
                    io::stdin().read_to_string(&mut buffer)?;
                    buffer
                }
            };
            let session = start_session(provider, &cli.kernel, "").await?;
            let outcome = exec(&session, &code).await;
            finish(session, outcome).await?
        }
        Commands::Run {
            path,
            save,
            allow_errors,
        } => {
            let notebook = Notebook::load(&JsonFileStore, &path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            let session =
                start_session(provider, &cli.kernel, &path.display().to_string()).await?;
            let outcome = run_notebook(&session, &notebook, allow_errors).await;
            if save {
                notebook.save(&JsonFileStore, &path)?;
                info!("Saved outputs to {}", path.display());
            }
            finish(session, outcome).await?
        }
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

async fn start_session(
    provider: JupyterServerProvider,
    kernel: &str,
    path: &str,
) -> Result<Session> {
    let session = Session::new(
        path,
        KernelPreference::new(kernel),
        Arc::new(provider),
        load_settings(),
        CommRegistry::new(),
    );
    session
        .start()
        .await
        .with_context(|| format!("Failed to start {} kernel", kernel))?;
    session.ready().await?;
    Ok(session)
}

/// Shut the kernel down whatever happened, then report the outcome.
async fn finish(session: Session, outcome: Result<bool>) -> Result<bool> {
    if let Err(e) = session.shutdown().await {
        warn!("Kernel shutdown failed: {}", e);
    }
    outcome
}

async fn list_kernels(provider: &JupyterServerProvider, json: bool) -> Result<()> {
    let kernels = provider.list_kernels().await?;
    if json {
        let rows: Vec<Value> = kernels
            .iter()
            .map(|k| {
                serde_json::json!({
                    "id": k.id,
                    "name": k.name,
                    "execution_state": k.execution_state,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if kernels.is_empty() {
        println!("No kernels running on {}", provider.base_url());
        return Ok(());
    }
    println!("{:<38} {:<12} STATE", "ID", "NAME");
    for kernel in &kernels {
        println!(
            "{:<38} {:<12} {}",
            kernel.id,
            kernel.name,
            kernel.execution_state.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn print_kernel_info(session: &Session, json: bool) -> Result<bool> {
    let info = session
        .connection()
        .and_then(|connection| connection.kernel_info())
        .context("Kernel did not send kernel_info")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(true);
    }

    let language = info
        .language_info
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    println!("Implementation: {} {}", info.implementation, info.implementation_version);
    println!("Language:       {}", language);
    println!("Protocol:       {}", info.protocol_version);
    if !info.banner.is_empty() {
        println!();
        println!("{}", info.banner.trim_end());
    }
    Ok(true)
}

async fn exec(session: &Session, code: &str) -> Result<bool> {
    let connection = session.connection().context("Kernel is not running")?;
    let future = connection.request_execute(code, ExecuteOptions::default());
    future.on_any(|message| {
        if let Some(output) = Output::from_content(&message.content) {
            print_output(&output);
        }
    });

    tokio::select! {
        result = future.done() => Ok(result.is_ok()),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupting kernel...");
            let _interrupt = connection.interrupt();
            Ok(future.done().await.is_ok())
        }
    }
}

async fn run_notebook(session: &Session, notebook: &Notebook, allow_errors: bool) -> Result<bool> {
    let connection = session.connection().context("Kernel is not running")?;
    let _busy = session.subscribe_status(notebook.status_listener());
    let mut succeeded = true;

    for id in notebook.cell_ids() {
        let Some(cell) = notebook.cell(&id) else {
            continue;
        };
        if cell.cell_type != CellType::Code || cell.source.trim().is_empty() {
            continue;
        }

        let future = notebook.execute_cell(&id, &connection)?;
        tokio::select! {
            _ = future.done() => {}
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupting kernel...");
                let _interrupt = notebook.interrupt_cell(&id, &connection)?;
                let _ = future.done().await;
            }
        }

        let Some(cell) = notebook.cell(&id) else {
            continue;
        };
        match cell.execution_count {
            Some(count) => println!("In [{}]:", count),
            None => println!("In [ ]:"),
        }
        for output in &cell.outputs {
            print_output(output);
        }

        if let CellState::Error(error) = &cell.state {
            succeeded = false;
            if *error == CellError::Interrupted || !allow_errors {
                warn!("Stopping after cell {}: {:?}", id, error);
                break;
            }
        }
    }
    Ok(succeeded)
}

fn print_output(output: &Output) {
    match output {
        Output::Stream {
            name: StreamName::Stdout,
            text,
        } => {
            print!("{}", text);
            let _ = io::stdout().flush();
        }
        Output::Stream {
            name: StreamName::Stderr,
            text,
        } => {
            eprint!("{}", text);
            let _ = io::stderr().flush();
        }
        Output::Error {
            ename,
            evalue,
            traceback,
        } => {
            eprintln!("{}: {}", ename, evalue);
            for line in traceback {
                eprintln!("{}", line);
            }
        }
        rich => match rich.data().and_then(plain_text) {
            Some(text) => println!("{}", text),
            None => println!("<{}>", rich.output_type()),
        },
    }
}

/// `text/plain` may be a string or a list of lines.
fn plain_text(data: &MimeBundle) -> Option<String> {
    match data.get("text/plain")? {
        Value::String(text) => Some(text.clone()),
        Value::Array(lines) => Some(lines.iter().filter_map(Value::as_str).collect()),
        _ => None,
    }
}
