//! Client request line, sent both to the daemon and, over the application
//! connection, to the worker.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Command name followed by its arguments.
    pub args: Vec<String>,
    /// The client's environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Request {
    pub fn new(args: Vec<String>) -> Self {
        Self { args, env: HashMap::new() }
    }

    pub fn command(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Arguments after the command name.
    pub fn tail(&self) -> &[String] {
        self.args.get(1..).unwrap_or(&[])
    }

    pub fn read_from(reader: &mut impl BufRead) -> anyhow::Result<Self> {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            anyhow::bail!("connection closed before the request was sent");
        }
        serde_json::from_str(line.trim_end()).context("malformed request")
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        let json = serde_json::to_string(self).map_err(io::Error::other)?;
        writer.write_all(json.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}
