use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate gallery CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List enrolled identities
    List,
    /// Enroll a precomputed embedding
    Enroll {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// JSON file holding the embedding as an array of numbers
        #[arg(long)]
        embedding: PathBuf,
    },
    /// Delete every gallery entry of an identity
    Delete {
        /// Real-world identifier (id_real)
        id: String,
    },
    /// Find the best gallery match for an embedding
    Match {
        #[arg(long)]
        embedding: PathBuf,
        #[arg(long, default_value_t = 0.65)]
        threshold: f64,
    },
    /// Reload the gallery from the remote store
    Reload,
}

#[zbus::proxy(
    interface = "org.facegate.Gallery1",
    default_service = "org.facegate.Gallery1",
    default_path = "/org/facegate/Gallery1"
)]
trait Gallery {
    fn enroll(&self, id_real: &str, full_name: &str, embedding: &[f64]) -> zbus::Result<String>;
    fn delete(&self, id_real: &str) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    #[zbus(name = "Match")]
    fn match_embedding(&self, embedding: &[f64], threshold: f64) -> zbus::Result<String>;
    fn reload(&self) -> zbus::Result<u32>;
    fn status(&self) -> zbus::Result<String>;
}

/// Load an embedding stored as a JSON array of numbers.
fn read_embedding(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let values: Vec<f64> =
        serde_json::from_str(&text).with_context(|| format!("{} is not a JSON number array", path.display()))?;
    if values.is_empty() {
        bail!("{} holds an empty embedding", path.display());
    }
    Ok(values)
}

/// Re-indent a JSON reply for the terminal; non-JSON is printed as is.
fn pretty(reply: &str) -> String {
    serde_json::from_str::<serde_json::Value>(reply)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| reply.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = GalleryProxy::new(&conn)
        .await
        .context("facegated not reachable")?;

    match cli.command {
        Commands::Status => println!("{}", pretty(&proxy.status().await?)),
        Commands::List => println!("{}", pretty(&proxy.list_identities().await?)),
        Commands::Enroll { id, name, embedding } => {
            let values = read_embedding(&embedding)?;
            tracing::debug!(dim = values.len(), "enrolling");
            println!("{}", pretty(&proxy.enroll(&id, &name, &values).await?));
        }
        Commands::Delete { id } => println!("{}", pretty(&proxy.delete(&id).await?)),
        Commands::Match { embedding, threshold } => {
            let values = read_embedding(&embedding)?;
            println!("{}", pretty(&proxy.match_embedding(&values, threshold).await?));
        }
        Commands::Reload => {
            let count = proxy.reload().await?;
            println!("gallery reloaded: {count} records");
        }
    }

    Ok(())
}
