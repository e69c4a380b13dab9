//! A configurable milter server: binds a TCP or Unix-domain listener and
//! hands every accepted connection to a permissive passthrough filter.
//!
//! ```sh
//! cargo run --example milter_server -- --transport unix --address /tmp/milter.sock
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::compat::TokioAsyncReadCompatExt;

use miltr_common::actions::{Action, Continue};
use miltr_server::{Milter, Server};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Transport {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "A milter server accepting every message", long_about = None)]
struct Args {
    /// Transport to listen on.
    #[arg(long, value_enum, default_value = "tcp")]
    transport: Transport,

    /// Address to bind: `host:port` for `tcp`/`tcp4`/`tcp6`, a filesystem
    /// path for `unix`.
    #[arg(long, default_value = "127.0.0.1:8890")]
    address: String,
}

struct PassthroughMilter;

#[async_trait]
impl Milter for PassthroughMilter {
    type Error = std::convert::Infallible;

    async fn abort(&mut self) -> Result<Action, Self::Error> {
        Ok(Continue.into())
    }
}

async fn serve<RW>(socket: RW)
where
    RW: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
{
    let mut milter = PassthroughMilter;
    let mut server = Server::default_postfix(&mut milter);
    if let Err(err) = server.handle_connection(socket).await {
        eprintln!("connection ended with an error: {err}");
    }
}

async fn run_tcp(address: &str) {
    let listener = TcpListener::bind(address)
        .await
        .expect("failed to bind tcp listener");
    println!("listening on tcp://{address}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        println!("accepted connection from {peer}");
                        tokio::spawn(serve(stream.compat()));
                    }
                    Err(err) => eprintln!("failed to accept connection: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("shutting down");
                break;
            }
        }
    }
}

async fn run_unix(path: PathBuf) {
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).expect("failed to bind unix listener");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o660))
            .expect("failed to set socket permissions");
    }

    println!("listening on unix://{}", path.display());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        tokio::spawn(serve(stream.compat()));
                    }
                    Err(err) => eprintln!("failed to accept connection: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("shutting down, removing {}", path.display());
                let _ = std::fs::remove_file(&path);
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.transport {
        Transport::Tcp | Transport::Tcp4 | Transport::Tcp6 => run_tcp(&args.address).await,
        Transport::Unix => run_unix(PathBuf::from(&args.address)).await,
    }
}
