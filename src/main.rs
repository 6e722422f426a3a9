//! scratchpush CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scratchpush::bundle::parts::PART_PUSHKEY;
use scratchpush::client::{self, PushOptions};
use scratchpush::server;
use scratchpush::transport::{ClientSession, SshTarget};
use scratchpush::wire::frame_from_human_string;

#[derive(Parser)]
#[command(name = "scratchpush", version, about = "Scratch-branch bundle server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Speak the wire protocol over stdin/stdout (invoked remotely).
    Serve {
        /// Backend and policy configuration.
        #[arg(long, env = "SCRATCHPUSH_CONFIG")]
        config: PathBuf,
        /// Served root; relative backend paths resolve against it.
        #[arg(default_value = ".")]
        root: PathBuf,
    },
    /// Push a changegroup file to a server's scratch store.
    Push {
        #[command(flatten)]
        remote: RemoteArgs,
        /// Changegroup file to push.
        bundle: PathBuf,
        /// Push revs to this bookmark.
        #[arg(long)]
        to: Option<String>,
        /// Create a new remote bookmark.
        #[arg(long)]
        create: bool,
        /// Allows moving a remote bookmark to an arbitrary place.
        #[arg(long)]
        non_forward_move: bool,
    },
    /// Resolve a bookmark or node on the server.
    Lookup {
        #[command(flatten)]
        remote: RemoteArgs,
        key: String,
    },
    /// List remote bookmarks. Positional arguments are patterns; the
    /// only allowed wildcard is '*' at the end of the pattern.
    Bookmarks {
        #[command(flatten)]
        remote: RemoteArgs,
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// Debug: encode a frame from "<type> <flags> <payload>" notation
    /// and print it as hex.
    Frame { spec: String },
}

#[derive(clap::Args)]
struct RemoteArgs {
    /// Remote host; omit to spawn a local server process.
    #[arg(long)]
    ssh: Option<String>,
    /// Remote user.
    #[arg(long)]
    user: Option<String>,
    /// Remote SSH port.
    #[arg(long)]
    port: Option<u16>,
    /// Server-side configuration path.
    #[arg(long, env = "SCRATCHPUSH_CONFIG")]
    config: PathBuf,
    /// Served root on the remote side.
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

impl RemoteArgs {
    async fn connect(&self) -> Result<ClientSession> {
        match &self.ssh {
            Some(host) => {
                let target = SshTarget {
                    hostname: host.clone(),
                    user: self.user.clone(),
                    port: self.port,
                };
                ClientSession::connect_ssh(&target, &self.config, &self.root).await
            }
            None => ClientSession::connect_local(&self.config, &self.root).await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, root } => server::run_server(&config, &root).await,
        Command::Push {
            remote,
            bundle,
            to,
            create,
            non_forward_move,
        } => {
            let session = remote.connect().await?;
            let (mut stdin, mut stdout) = session.split();
            let options = PushOptions {
                bookmark: to,
                prev_node: None,
                create,
                force: non_forward_move,
                pushback: true,
            };
            let replies =
                client::push_bundle(&mut stdout, &mut stdin, &bundle, &options).await?;
            for part in replies {
                if part.kind() == PART_PUSHKEY {
                    if let (Some(key), Some(new)) = (part.param("key"), part.param("new")) {
                        println!("{} {}", key, new);
                    }
                }
            }
            Ok(())
        }
        Command::Lookup { remote, key } => {
            let session = remote.connect().await?;
            let (mut stdin, mut stdout) = session.split();
            match client::lookup(&mut stdout, &mut stdin, &key).await? {
                Some(node) => {
                    println!("{}", node);
                    Ok(())
                }
                None => bail!("unknown key {}", key),
            }
        }
        Command::Bookmarks { remote, patterns } => {
            let session = remote.connect().await?;
            let (mut stdin, mut stdout) = session.split();
            let bookmarks: BTreeMap<String, String> =
                client::list_bookmarks(&mut stdout, &mut stdin, &patterns).await?;
            for (name, node) in bookmarks {
                println!("{:<25} {}", name, node);
            }
            Ok(())
        }
        Command::Frame { spec } => {
            let frame = frame_from_human_string(&spec)?;
            println!("{}", hex::encode(frame.encode()?));
            Ok(())
        }
    }
}
