//! A configurable milter client: connects to a milter server, drives one
//! full session for a message read from stdin, and reports the final
//! decision.
//!
//! ```sh
//! cat message.eml | cargo run --example milter_client -- \
//!     --transport tcp --address 127.0.0.1:8890 \
//!     --hostname mail.example.com --family inet --conn-addr 192.0.2.10 \
//!     --helo mail.example.com --from sender@example.com --rcpt rcpt@example.com
//! ```

use std::io::Read;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::compat::TokioAsyncReadCompatExt;

use miltr_client::Client;
use miltr_common::{
    actions::Action,
    commands::{Connect, Family as MilterFamily, Header},
    optneg::{Capability, OptNeg, Protocol},
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Transport {
    Tcp,
    Unix,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Family {
    Unknown,
    Unix,
    Inet,
    Inet6,
}

impl From<Family> for MilterFamily {
    fn from(value: Family) -> Self {
        match value {
            Family::Unknown => MilterFamily::Unknown,
            Family::Unix => MilterFamily::Unix,
            Family::Inet => MilterFamily::Inet,
            Family::Inet6 => MilterFamily::Inet6,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive one milter session for a message read from stdin", long_about = None)]
struct Args {
    /// Transport used to reach the milter server.
    #[arg(long, value_enum, default_value = "tcp")]
    transport: Transport,

    /// `host:port` for `tcp`, a filesystem path for `unix`.
    #[arg(long, default_value = "127.0.0.1:8890")]
    address: String,

    /// The SMTP client's hostname, as sent in the `CONNECT` command.
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// The SMTP client's connection family.
    #[arg(long, value_enum, default_value = "inet")]
    family: Family,

    /// The SMTP client's source port. Ignored for `unix`/`unknown` families.
    #[arg(long)]
    port: Option<u16>,

    /// The SMTP client's source address (an IP or a unix socket path).
    #[arg(long, default_value = "127.0.0.1")]
    conn_addr: String,

    /// The HELO/EHLO hostname.
    #[arg(long, default_value = "localhost")]
    helo: String,

    /// The envelope sender.
    #[arg(long, default_value = "sender@example.com")]
    from: String,

    /// Comma-separated envelope recipients.
    #[arg(long, default_value = "rcpt@example.com")]
    rcpt: String,

    /// Raw `Capability` bitmask to offer during option negotiation.
    #[arg(long, default_value_t = Capability::all().bits())]
    actions: u32,

    /// Raw `Protocol` bitmask of stages to suppress during option
    /// negotiation.
    #[arg(long, default_value_t = 0)]
    disabled_msgs: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut message = Vec::new();
    if let Err(err) = std::io::stdin().read_to_end(&mut message) {
        eprintln!("failed reading message from stdin: {err}");
        return ExitCode::FAILURE;
    }
    let (headers, body) = split_message(&message);

    let options = OptNeg {
        capabilities: Capability::from_bits_truncate(args.actions),
        protocol: Protocol::from_bits_truncate(args.disabled_msgs),
        ..OptNeg::default()
    };

    match run(&args, options, &headers, body).await {
        Ok(action) => {
            println!("final decision: {action:?}");
            if decision_is_success(&action) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            eprintln!("session failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn decision_is_success(action: &Action) -> bool {
    matches!(action, Action::Continue(_) | Action::Accept(_))
}

/// Split a raw RFC 5322 message into its header lines and body, on the
/// first blank line.
fn split_message(message: &[u8]) -> (Vec<(Vec<u8>, Vec<u8>)>, &[u8]) {
    let text = String::from_utf8_lossy(message);
    let mut lines = text.split("\r\n").flat_map(|line| line.split('\n'));

    let mut headers = Vec::new();
    let mut header_bytes_consumed = 0;
    for line in lines.by_ref() {
        header_bytes_consumed += line.len() + 1;
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((
                name.trim().as_bytes().to_vec(),
                value.trim().as_bytes().to_vec(),
            ));
        }
    }

    let body = message.get(header_bytes_consumed..).unwrap_or_default();
    (headers, body)
}

async fn run(
    args: &Args,
    options: OptNeg,
    headers: &[(Vec<u8>, Vec<u8>)],
    body: &[u8],
) -> Result<Action, Box<dyn std::error::Error>> {
    let client = Client::new(options);
    let family: MilterFamily = args.family.into();

    match args.transport {
        Transport::Tcp => {
            let stream = TcpStream::connect(&args.address).await?.compat();
            drive_session(client, stream, args, family, headers, body).await
        }
        Transport::Unix => {
            let stream = UnixStream::connect(&args.address).await?.compat();
            drive_session(client, stream, args, family, headers, body).await
        }
    }
}

async fn drive_session<RW>(
    client: Client,
    stream: RW,
    args: &Args,
    family: MilterFamily,
    headers: &[(Vec<u8>, Vec<u8>)],
    body: &[u8],
) -> Result<Action, Box<dyn std::error::Error>>
where
    RW: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    let mut connection = client.connect_via(stream).await?;

    connection
        .connect(Connect::new(
            args.hostname.as_bytes(),
            family,
            args.port,
            args.conn_addr.as_bytes(),
        ))
        .await?;
    connection.helo(args.helo.as_bytes()).await?;
    connection.mail(args.from.as_bytes()).await?;
    for rcpt in args.rcpt.split(',').map(str::trim).filter(|r| !r.is_empty()) {
        connection.recipient(rcpt.as_bytes()).await?;
    }
    connection.data().await?;

    for (name, value) in headers {
        connection.header(Header::new(name, value)).await?;
    }
    connection.end_of_header().await?;

    let response = connection.body_read_from(futures::io::Cursor::new(body)).await?;

    for modification in response.modifications() {
        println!("modification: {modification:?}");
    }
    let final_action = response.final_action().clone();

    connection.close().await?;

    Ok(final_action)
}
