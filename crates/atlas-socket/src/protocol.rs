//! Wire format of the command socket.
//!
//! One JSON object per line in each direction:
//!
//! ```text
//! -> {"method":"insert_feature","datasource":"d1","feature":{...}}
//! <- {"status":"ok","data":{"datasource":"d1","geo_id":"..."}}
//! <- {"status":"error","error":"method not found: drop"}
//! ```
//!
//! `help` is the exception: it answers with plain text.

use atlas_engine::command::METHODS;
use atlas_engine::{Caller, Command, CommandArgs};
use atlas_types::AccessKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded request line.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Operation name, possibly an alias.
    pub method: String,
    /// Everything else on the line.
    #[serde(flatten)]
    pub args: CommandArgs,
}

impl Request {
    /// Parse one request line.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// A response line.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok { data: Value },
    Error { error: String },
}

impl Response {
    /// Serialize as a single line including the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Plain-text answer to `help`.
pub fn help_text() -> String {
    let mut text = String::from("Methods:\n");
    for method in METHODS {
        text.push_str("\t ");
        text.push_str(method);
        text.push('\n');
    }
    text
}

/// Pick the caller a socket command runs as.
///
/// The loopback socket is a trust boundary: reads and administrative commands
/// run as [`Caller::Trusted`]. Layer and ownership writes that carry a
/// top-level `apikey` run as that customer, so the key gains ownership of
/// what it creates and is held to ownership for what it changes.
pub fn caller_for(command: &Command, apikey: Option<AccessKey>) -> Caller {
    match apikey {
        Some(key) if !key.is_empty() && command.is_mutation() && !command.is_administrative() => {
            Caller::Key(key)
        }
        _ => Caller::Trusted,
    }
}
