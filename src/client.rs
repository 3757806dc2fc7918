//! Client side of the control protocol.

use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::Context;

use crate::ipc::{self, Request};
use crate::worker::EXIT_PREFIX;

/// What the daemon did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The command ran in process `pid` and exited with `code`.
    Finished { pid: Option<u32>, code: i32 },
    /// The daemon does not know the command.
    UnknownCommand,
}

/// Send `request` to the daemon at `socket` and copy the command's output to
/// `out` until it exits.
pub fn run(socket: &Path, request: &Request, out: &mut impl Write) -> anyhow::Result<Outcome> {
    let mut control = UnixStream::connect(socket)
        .with_context(|| format!("connecting to {}", socket.display()))?;
    let (mut ours, theirs) = UnixStream::pair()?;

    ipc::fd::send_fd(&control, theirs.as_fd())?;
    drop(theirs);
    request.write_to(&mut control)?;
    request.write_to(&mut ours)?;

    let mut replies = BufReader::new(&control);
    let Some(_) = read_line(&mut replies)? else {
        return Ok(Outcome::UnknownCommand);
    };
    let pid = read_line(&mut replies)?.as_deref().and_then(ipc::parse_pid);
    tracing::debug!("command running in {:?}", pid);

    let mut output = BufReader::new(&ours);
    while let Some(line) = read_line(&mut output)? {
        if let Some(code) = line.strip_prefix(EXIT_PREFIX) {
            let code = code.trim().parse().context("malformed exit status")?;
            return Ok(Outcome::Finished { pid, code });
        }
        writeln!(out, "{}", line)?;
    }
    // Nothing to report when the worker died before the command could start.
    Ok(Outcome::Finished { pid, code: 1 })
}

fn read_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}
