//! cjdns credential loading
//!
//! `~/.cjdnsadmin` is strict JSON naming the admin endpoint, its password and
//! the path of cjdroute.conf. cjdroute.conf is usually JSON with comments; it
//! is parsed strictly first and then through [`legacy::normalize`].

use elvisp_common::{Error, PublicKey, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn default_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    11234
}

/// Contents of the cjdns admin credential file
#[derive(Clone, Serialize, Deserialize)]
pub struct AdminCredentials {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub password: String,
    /// Path to cjdroute.conf
    pub config: PathBuf,
}

impl AdminCredentials {
    /// `addr:port` of the admin UDP endpoint
    pub fn endpoint(&self) -> String {
        if self.addr.contains(':') && !self.addr.starts_with('[') {
            format!("[{}]:{}", self.addr, self.port)
        } else {
            format!("{}:{}", self.addr, self.port)
        }
    }
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Everything the server needs to know about its local cjdns instance
#[derive(Debug, Clone)]
pub struct DaemonIdentity {
    pub admin: AdminCredentials,
    /// Public key of the local node; clients open tunnels towards it
    pub public_key: PublicKey,
}

#[derive(Deserialize)]
struct CjdrouteConf {
    #[serde(rename = "publicKey")]
    public_key: String,
}

/// Load the admin credential file and the node key it points to
pub fn load(path: &Path) -> Result<DaemonIdentity> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
    })?;
    let admin: AdminCredentials = serde_json::from_str(&text).map_err(|e| {
        Error::InvalidConfig(format!("invalid credential file {}: {}", path.display(), e))
    })?;

    let conf = std::fs::read_to_string(&admin.config).map_err(|e| {
        Error::InvalidConfig(format!("cannot read {}: {}", admin.config.display(), e))
    })?;
    let public_key = parse_public_key(&conf)?;

    debug!("Loaded cjdns identity {} from {:?}", public_key, admin.config);
    Ok(DaemonIdentity { admin, public_key })
}

/// Extract `publicKey` from cjdroute.conf
pub fn parse_public_key(text: &str) -> Result<PublicKey> {
    let conf: CjdrouteConf = match serde_json::from_str(text) {
        Ok(conf) => conf,
        Err(strict) => {
            warn!("cjdroute config is not strict JSON ({}), trying legacy format", strict);
            serde_json::from_str(&legacy::normalize(text)).map_err(|e| {
                Error::InvalidConfig(format!("cannot parse cjdroute config: {}", e))
            })?
        }
    };
    conf.public_key.parse()
}

pub mod legacy {
    //! cjdroute.conf as written by `cjdroute --genconf`: JSON plus `//` and
    //! `/* */` comments and trailing commas.

    /// Rewrite legacy text into strict JSON. String literals are preserved.
    pub fn normalize(text: &str) -> String {
        strip_trailing_commas(&strip_comments(text))
    }

    fn strip_comments(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();
        let mut in_string = false;

        while let Some(c) = chars.next() {
            if in_string {
                out.push(c);
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    }
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }

            let next = chars.peek().copied();
            match (c, next) {
                ('"', _) => {
                    in_string = true;
                    out.push(c);
                }
                ('/', Some('/')) => {
                    for skipped in chars.by_ref() {
                        if skipped == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                }
                ('/', Some('*')) => {
                    chars.next();
                    let mut prev = '\0';
                    for skipped in chars.by_ref() {
                        if prev == '*' && skipped == '/' {
                            break;
                        }
                        prev = skipped;
                    }
                    out.push(' ');
                }
                _ => out.push(c),
            }
        }
        out
    }

    fn strip_trailing_commas(text: &str) -> String {
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len());
        let mut in_string = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if in_string {
                out.push(c);
                if c == '\\' && i + 1 < chars.len() {
                    out.push(chars[i + 1]);
                    i += 1;
                } else if c == '"' {
                    in_string = false;
                }
            } else if c == '"' {
                in_string = true;
                out.push(c);
            } else if c == ',' {
                let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            } else {
                out.push(c);
            }
            i += 1;
        }
        out
    }
}
