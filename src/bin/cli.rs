use clap::Parser;
use redline::{connection, Command, CommandName, Config, Connection, Error, Frame, DEFAULT_PORT};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Server host
    #[arg(short = 'H', long, env = "REDLINE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, env = "REDLINE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Close the connection on malformed replies instead of skipping them
    #[arg(long, env = "REDLINE_STRICT")]
    strict: bool,

    /// Command to run, e.g. `GET key`. Reads one command per line from stdin when omitted.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();

    // MAX_FRAME_SIZE and the other variables come from the environment, flags win.
    let mut config = Config::from_env()?;
    config.host = args.host;
    config.port = args.port;
    config.strict_decoding = args.strict;

    let conn = Connection::connect(config);

    if !args.command.is_empty() {
        let cmd = args
            .command
            .iter()
            .skip(1)
            .fold(Command::new(args.command[0].as_str()), |cmd, arg| cmd.arg(arg));
        note_unknown_name(&cmd);
        let res = conn.issue(cmd).await;
        print_result(res);
        conn.close();
        conn.closed().await;
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let cmd = Command::parse_line(&line)?;
        note_unknown_name(&cmd);
        print_result(conn.issue(cmd).await);
    }

    conn.close();
    conn.closed().await;

    Ok(())
}

/// Unknown names are still sent, the server has the final word.
fn note_unknown_name(cmd: &Command) {
    if let Err(err) = CommandName::parse(cmd.name()) {
        debug!(%err, "sending a command redline has no name for");
    }
}

fn print_result(res: Result<Frame, connection::Error>) {
    match res {
        Ok(frame) => println!("{}", render(&frame, 0)),
        Err(connection::Error::Reply(msg)) => println!("(error) {}", msg),
        Err(err) => eprintln!("{}", err),
    }
}

fn render(frame: &Frame, depth: usize) -> String {
    match frame {
        Frame::Simple(s) => s.clone(),
        Frame::Error(s) => format!("(error) {}", s),
        Frame::Integer(i) => format!("(integer) {}", i),
        Frame::Bulk(bytes) => format!("{:?}", String::from_utf8_lossy(bytes)),
        Frame::Null | Frame::NullArray => "(nil)".to_string(),
        Frame::Array(arr) if arr.is_empty() => "(empty array)".to_string(),
        Frame::Array(arr) => arr
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                let indent = if i == 0 { String::new() } else { " ".repeat(depth * 3) };
                format!("{}{}) {}", indent, i + 1, render(frame, depth + 1))
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
