use clap::{Parser, Subcommand};
use ninep_client::client;
use ninep_client::client::vop;
use ninep_client::fcall::DEFAULT_MSIZE;
use ninep_client::Result;
use ninep_client::utils::parse_proto;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

/// A minimal mount helper: resolves `proto!address!port`, connects a
/// byte-stream endpoint, and drives the `ninep-client` core through a single
/// operation against the attached export. The DNS/connect step here plays the
/// "enclosing mount orchestrator" role the protocol core itself stays
/// agnostic to.
#[derive(Debug, Parser)]
#[command(name = "mount9pu", about = "Drive a 9P2000.u export from the command line")]
struct Cli {
    /// proto!address!port, e.g. tcp!127.0.0.1!564, or unix!/path/to/socket!0
    address: String,

    /// User name to attach as.
    #[arg(long, default_value = "none")]
    uname: String,

    /// Attach tree (aname) to mount.
    #[arg(long, default_value = "/")]
    aname: String,

    /// Numeric uid to attach as; defaults to the real uid of this process.
    #[arg(long)]
    uid: Option<u32>,

    /// Proposed maximum message size.
    #[arg(long, default_value_t = DEFAULT_MSIZE)]
    msize: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Walk to a path, stat it, and print the result.
    Stat { path: String },
    /// Walk to a path, open it for reading, and copy its contents to stdout.
    Cat { path: String },
    /// Walk to a path, open it for writing (truncating), and copy stdin's
    /// contents to it.
    Put { path: String },
}

async fn run<T>(stream: T, cli: &Cli) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let uid = cli.uid.unwrap_or_else(|| nix::unistd::Uid::current().as_raw());

    let session = client::session_start(stream, cli.msize).await?;
    let (root_fid, root_qid) = client::attach(&session, &cli.uname, &cli.aname, uid).await?;
    log::debug!("attached: root fid {root_fid}, qid {root_qid:?}, uid {uid}");

    let result = match &cli.command {
        Command::Stat { path } => do_stat(&session, root_fid, path).await,
        Command::Cat { path } => do_cat(&session, root_fid, path).await,
        Command::Put { path } => do_put(&session, root_fid, path).await,
    };

    client::session_close(&session).await;
    result
}

async fn do_stat<W>(session: &ninep_client::Session<W>, root_fid: u32, path: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (fid, _qid) = client::walk_path(session, root_fid, path).await?;
    let result = client::stat(session, fid).await;
    let _ = client::clunk(session, fid).await;
    let stat = result?;

    println!("name:      {}", stat.name);
    println!("qid:       {:?}", stat.qid);
    println!("mode:      {:#o}", stat.mode);
    println!("length:    {}", stat.length);
    println!("uid/gid:   {}/{}", stat.uid, stat.gid);
    println!("directory: {}", stat.is_dir());
    println!("symlink:   {}", stat.is_symlink());
    Ok(())
}

async fn do_cat<W>(session: &ninep_client::Session<W>, root_fid: u32, path: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (fid, _qid, _iounit) = client::open_path(session, root_fid, path, vop::FREAD).await?;
    let result = client::read_all(session, fid, 0, u64::MAX).await;
    let _ = client::clunk(session, fid).await;
    let data = result?;

    tokio::io::stdout().write_all(&data).await?;
    Ok(())
}

async fn do_put<W>(session: &ninep_client::Session<W>, root_fid: u32, path: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    use tokio::io::AsyncReadExt;
    let mut data = Vec::new();
    tokio::io::stdin().read_to_end(&mut data).await?;

    let (fid, _qid, _iounit) =
        client::open_path(session, root_fid, path, vop::FWRITE | vop::O_TRUNC).await?;
    let result = client::write_all(session, fid, 0, &data).await;
    let _ = client::clunk(session, fid).await;
    let written = result?;

    eprintln!("wrote {written} bytes to {path}");
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let (proto, addr, port) = match parse_proto(&cli.address) {
        Some(parts) => parts,
        None => {
            eprintln!("address must be proto!address!port, e.g. tcp!127.0.0.1!564");
            std::process::exit(2);
        }
    };

    let outcome = match proto {
        "tcp" => match TcpStream::connect(format!("{addr}:{port}")).await {
            Ok(stream) => run(stream, &cli).await,
            Err(e) => Err(e.into()),
        },
        "unix" => match UnixStream::connect(addr).await {
            Ok(stream) => run(stream, &cli).await,
            Err(e) => Err(e.into()),
        },
        other => {
            eprintln!("unsupported protocol: {other}");
            std::process::exit(2);
        }
    };

    if let Err(e) = outcome {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
