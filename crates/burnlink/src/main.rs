use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use burnlink::{Client, DestroyReason, Payload, ShareLink, ViewPolicy, ViewingSession};
use burnlink_server::handlers::{MAX_EXPIRES_IN, MIN_EXPIRES_IN};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const DEFAULT_SERVER: &str = "http://localhost:8080";
/// How many `name-N.ext` variants `view` tries before giving up.
const MAX_NAME_ATTEMPTS: usize = 100;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "burnlink", about = "burnlink: one-time secret links, encrypted before they leave your machine", version)]
struct Cli {
    /// burnlink server URL (default: http://localhost:8080, or the link's origin for `view`)
    #[arg(long, env = "BURNLINK_SERVER", global = true)]
    server: Option<String>,

    /// Bearer token for servers that protect secret creation ($BURNLINK_TOKEN)
    #[arg(long, env = "BURNLINK_TOKEN", global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the burnlink HTTP server
    Serve {
        /// Port to listen on (default: $BURNLINK_PORT or 8080)
        #[arg(long)]
        port: Option<u16>,
        /// Host to bind (default: $BURNLINK_HOST or 0.0.0.0)
        #[arg(long)]
        host: Option<String>,
    },
    /// Encrypt a secret locally, upload it, and print its one-time link
    Send {
        /// Secret text (read from stdin when neither --text nor --file is given)
        #[arg(long, conflicts_with = "file")]
        text: Option<String>,
        /// Share a file instead of text
        #[arg(long)]
        file: Option<PathBuf>,
        /// Viewing window once opened, e.g. 30s, 2m (10s to 5m)
        #[arg(long, default_value = "30s")]
        expires_in: String,
        /// MIME type for --file (guessed from the extension otherwise)
        #[arg(long, requires = "file")]
        content_type: Option<String>,
        /// Origin to put in the link when it differs from --server
        #[arg(long, env = "BURNLINK_PUBLIC_URL")]
        origin: Option<String>,
    },
    /// Open a one-time link. The secret is destroyed when viewing ends.
    View {
        /// The full link, including the #key fragment
        link: String,
        /// Where to write a shared file (default: its original name in the current directory)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BURNLINK_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Send {
            text,
            file,
            expires_in,
            content_type,
            origin,
        } => {
            let server = cli.server.as_deref().unwrap_or(DEFAULT_SERVER);
            let payload = read_payload(text, file.as_deref(), content_type)?;
            cmd_send(server, cli.token, origin, &payload, &expires_in).await
        }

        Commands::View { link, out } => cmd_view(cli.server.as_deref(), &link, out).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let defaults = burnlink_server::ServerConfig::default();
    let cfg = burnlink_server::ServerConfig {
        host: host.unwrap_or_else(|| defaults.host.clone()),
        port: port.unwrap_or(defaults.port),
        ..defaults
    };

    burnlink_server::run(cfg).await
}

async fn cmd_send(
    server: &str,
    token: Option<String>,
    origin: Option<String>,
    payload: &Payload,
    expires_in: &str,
) -> Result<()> {
    let secs = parse_duration(expires_in)?;
    let secs = u32::try_from(secs)
        .ok()
        .filter(|s| (MIN_EXPIRES_IN..=MAX_EXPIRES_IN).contains(s))
        .with_context(|| {
            format!("--expires-in must be between {MIN_EXPIRES_IN}s and {MAX_EXPIRES_IN}s")
        })?;

    let mut client = Client::new(server).with_token(token);
    if let Some(origin) = origin {
        client = client.with_public_origin(origin);
    }

    let link = client
        .submit(payload, secs)
        .await
        .context("could not create secret")?;

    println!("{link}");
    eprintln!("✓ one-time link created; it can be opened once and shows the secret for {secs}s");
    Ok(())
}

async fn cmd_view(server: Option<&str>, raw: &str, out: Option<PathBuf>) -> Result<()> {
    let link: ShareLink = raw.parse().context("invalid link")?;
    let api_base = server.unwrap_or(link.origin()).to_owned();
    let client = Client::new(api_base);

    let session = ViewingSession::new(link, ViewPolicy::default());
    session
        .open(&client, None)
        .await
        .context("could not open secret")?;

    // Copy out under the content lock; disk and terminal I/O happen after it.
    let revealed = session.with_content(|opened| match opened.as_text() {
        Some(text) => Revealed::Text(Zeroizing::new(text.to_owned())),
        None => Revealed::File {
            name: safe_filename(opened.filename.as_deref()),
            bytes: Zeroizing::new(opened.plaintext.to_vec()),
        },
    });

    let written = match revealed {
        Some(Revealed::Text(text)) => {
            println!("{}", text.as_str());
            None
        }
        Some(Revealed::File { name, bytes }) => {
            let created = match &out {
                Some(path) => write_new(path, &bytes)
                    .with_context(|| format!("write {}", path.display()))
                    .map(|()| path.clone()),
                None => write_unique(Path::new("."), &name, &bytes),
            };
            let path = match created {
                Ok(path) => path,
                Err(e) => {
                    session.destroy(DestroyReason::Closed);
                    return Err(e);
                }
            };
            println!("secret file written to {}", path.display());
            Some(path)
        }
        None => None,
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let reason = loop {
        tokio::select! {
            reason = session.closed() => break reason,
            _ = tokio::signal::ctrl_c() => {
                session.destroy(DestroyReason::Closed);
            }
            _ = ticker.tick() => {
                if let Some(left) = session.remaining() {
                    eprint!("\r  self-destructs in {:>3}s (Ctrl-C to destroy now) ", left.as_secs());
                }
            }
        }
    };

    // Only a file this session created is removed.
    if let Some(path) = written {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "could not remove secret file");
        }
    }

    // Clear the terminal so the secret does not linger in scrollback view.
    print!("\x1b[2J\x1b[H");
    println!("This secret has been destroyed: {reason}.");
    std::io::stdout().flush().context("flush stdout")?;
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read_payload(
    text: Option<String>,
    file: Option<&Path>,
    content_type: Option<String>,
) -> Result<Payload> {
    if let Some(path) = file {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("file path has no usable file name")?
            .to_owned();
        let content_type = content_type.unwrap_or_else(|| guess_content_type(path).to_owned());
        return Ok(Payload::File {
            filename,
            content_type,
            bytes,
        });
    }

    let text = match text {
        Some(text) => text,
        None => {
            let raw = std::io::read_to_string(std::io::stdin()).context("read secret from stdin")?;
            raw.trim_end_matches(['\r', '\n']).to_owned()
        }
    };
    if text.is_empty() {
        anyhow::bail!("nothing to share: the secret is empty");
    }
    Ok(Payload::Text(text))
}

/// Parse human duration strings like "30s", "2m" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Secret content copied out of a viewing session.
enum Revealed {
    Text(Zeroizing<String>),
    File {
        name: String,
        bytes: Zeroizing<Vec<u8>>,
    },
}

/// Create `path` and write `bytes`, failing if anything already exists there.
fn write_new(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = file.write_all(bytes).and_then(|()| file.flush()) {
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

/// Write `bytes` to a new file in `dir`, named `name` or `stem-N.ext` if taken.
fn write_unique(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let ext = Path::new(name).extension().and_then(|e| e.to_str());
    for n in 0..MAX_NAME_ATTEMPTS {
        let candidate = match (n, ext) {
            (0, _) => name.to_owned(),
            (n, Some(ext)) => format!("{stem}-{n}.{ext}"),
            (n, None) => format!("{stem}-{n}"),
        };
        let path = dir.join(candidate);
        match write_new(&path, bytes) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).with_context(|| format!("write {}", path.display())),
        }
    }
    anyhow::bail!("no free file name for {name} in {}", dir.display())
}

/// A bare file name with no directory parts, safe to create in the current directory.
fn safe_filename(name: Option<&str>) -> String {
    let base = name
        .and_then(|n| Path::new(n).file_name())
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '/' | '\\' | ':'))
        .collect();
    if cleaned.is_empty() || cleaned.starts_with('.') {
        "burnlink-secret.bin".to_owned()
    } else {
        cleaned
    }
}
