//! keepr: end-to-end encrypted secret manager.
//!
//! One binary, two roles: every subcommand except `serve` is the offline-
//! first client (local vault + store + sync engine); `serve` runs the REST
//! sync server. Record contents are encrypted on the client under the
//! master password; the server only ever sees ciphertext.

mod cli;
mod config;
mod error;
mod protocol;
mod server;
mod store;
mod sync;
mod transport;
mod util;
mod vault;

use clap::{Parser, Subcommand};
use cli::App;
use error::Error;
use store::record::{Meta, RecordKind, RecordPayload};

#[derive(Parser)]
#[command(name = "keepr", version, about = "End-to-end encrypted secret manager with sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the local vault with a master password
    Init,
    /// Unlock the vault for a bounded session
    Unlock,
    /// Lock the vault and drop the crypto session
    Lock,
    /// Change the master password (records stay as they are)
    ChangeMaster,

    /// Create a server account
    Register {
        #[arg(long)]
        login: String,
    },
    /// Sign in and store the session token
    Login {
        #[arg(long)]
        login: String,
    },
    /// Sign out (drops the local token)
    Logout,
    /// Change the server account password
    ChangePassword,

    /// Add a record
    Add {
        #[command(subcommand)]
        record: AddCommand,
    },
    /// List local records
    List {
        /// Filter by kind: login|text|card|binary
        #[arg(long)]
        kind: Option<String>,
        /// Include soft-deleted records
        #[arg(long)]
        deleted: bool,
        #[arg(long, default_value_t = 100)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Decrypt and print one record
    Show { id: i64 },
    /// Write a binary record's content to a file
    Export {
        id: i64,
        #[arg(long)]
        out: std::path::PathBuf,
    },
    /// Rename a record
    Edit {
        id: i64,
        #[arg(long)]
        title: String,
    },
    /// Soft-delete a record (--purge removes the row outright)
    Rm {
        id: i64,
        #[arg(long)]
        purge: bool,
    },

    /// Run one sync pass now
    Sync,
    /// Local and server status summary
    Status,
    /// Inspect or resolve server-side conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommand,
    },
    /// Manage registered devices
    Devices {
        #[command(subcommand)]
        command: DeviceCommand,
    },
    /// Foreground periodic sync loop (ctrl-c to stop)
    Watch,

    /// Run the sync server (configured via environment)
    Serve,
}

#[derive(Subcommand)]
enum AddCommand {
    /// Site credentials (password is prompted)
    Login {
        #[arg(long)]
        title: String,
        #[arg(long)]
        username: String,
        #[arg(long, default_value = "")]
        url: String,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Free text
    Text {
        #[arg(long)]
        title: String,
        content: String,
    },
    /// Payment card (number and CVV are prompted)
    Card {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        holder: String,
        /// MM/YYYY
        #[arg(long)]
        expiry: String,
    },
    /// Binary blob from a file
    Binary {
        #[arg(long)]
        title: String,
        path: std::path::PathBuf,
    },
}

#[derive(Subcommand)]
enum ConflictCommand {
    /// List open conflicts
    List,
    /// Close a conflict: --use client|server
    Resolve {
        id: i64,
        #[arg(long = "use", value_parser = parse_resolution)]
        resolution: protocol::Resolution,
    },
}

#[derive(Subcommand)]
enum DeviceCommand {
    /// List registered devices
    List,
    /// Unregister a device
    Rm { id: String },
}

fn parse_resolution(s: &str) -> Result<protocol::Resolution, String> {
    match s {
        "client" => Ok(protocol::Resolution::Client),
        "server" => Ok(protocol::Resolution::Server),
        other => Err(format!("'{other}' is not client|server")),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli.command).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    // The server role has no client-side state at all.
    if let Command::Serve = command {
        let config = config::ServerConfig::from_env()?;
        return server::run_server(config).await;
    }

    let app = App::bootstrap()?;
    match command {
        Command::Serve => unreachable!("handled above"),

        Command::Init => app.init()?,
        Command::Unlock => app.unlock()?,
        Command::Lock => app.lock()?,
        Command::ChangeMaster => app.change_master()?,

        Command::Register { login } => app.register(&login).await?,
        Command::Login { login } => app.login(&login).await?,
        Command::Logout => app.logout()?,
        Command::ChangePassword => app.change_password().await?,

        Command::Add { record } => add(&app, record)?,
        Command::List {
            kind,
            deleted,
            limit,
            offset,
        } => {
            let kind = kind.as_deref().map(RecordKind::parse).transpose()?;
            app.list(kind, deleted, limit, offset)?;
        }
        Command::Show { id } => app.show(id)?,
        Command::Export { id, out } => app.export(id, &out)?,
        Command::Edit { id, title } => app.edit_title(id, &title)?,
        Command::Rm { id, purge } => app.remove(id, purge)?,

        Command::Sync => app.sync().await?,
        Command::Status => app.status().await?,
        Command::Conflicts { command } => match command {
            ConflictCommand::List => app.conflicts_list().await?,
            ConflictCommand::Resolve { id, resolution } => {
                app.conflicts_resolve(id, resolution).await?
            }
        },
        Command::Devices { command } => match command {
            DeviceCommand::List => app.devices_list().await?,
            DeviceCommand::Rm { id } => app.devices_remove(&id).await?,
        },
        Command::Watch => app.watch().await?,
    }
    Ok(())
}

fn add(app: &App, record: AddCommand) -> Result<(), Error> {
    match record {
        AddCommand::Login {
            title,
            username,
            url,
            notes,
        } => {
            let password = prompt_secret("Password")?;
            let payload = RecordPayload::Login {
                username,
                password,
                url,
                notes,
            };
            app.add_record(payload, &title, Meta::new())?;
        }
        AddCommand::Text { title, content } => {
            let payload = RecordPayload::Text { content };
            app.add_record(payload, &title, Meta::new())?;
        }
        AddCommand::Card {
            title,
            holder,
            expiry,
        } => {
            let number = prompt_secret("Card number")?;
            let cvv = prompt_secret("CVV")?;
            let payload = RecordPayload::Card {
                number,
                holder,
                expiry,
                cvv,
            };
            app.add_record(payload, &title, Meta::new())?;
        }
        AddCommand::Binary { title, path } => {
            let data = std::fs::read(&path)?;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("blob")
                .to_string();
            let mut meta = Meta::new();
            meta.insert("filename".into(), filename.clone());
            let payload = RecordPayload::Binary { filename, data };
            app.add_record(payload, &title, meta)?;
        }
    }
    Ok(())
}

fn prompt_secret(prompt: &str) -> Result<String, Error> {
    dialoguer::Password::new()
        .with_prompt(prompt)
        .interact()
        .map_err(|e| Error::Storage(format!("prompt failed: {e}")))
}
