use serde::Deserialize;

// =======================================================
// UPSTREAM SERVER LIST + PARSING
// =======================================================
//
// Accepted `servers` formats:
// - "127.0.0.1:8081"
// - ["127.0.0.1:8081", "127.0.0.1:8082"]
//
// INI sources often hand the array over as one raw string with
// brackets still in place; normalization strips that form too.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerList {
    One(String),
    Many(Vec<String>),
}

impl Default for ServerList {
    fn default() -> Self {
        ServerList::Many(vec![
            "127.0.0.1:8081".to_string(),
            "127.0.0.1:8082".to_string(),
            "127.0.0.1:8083".to_string(),
        ])
    }
}

impl ServerList {
    /// Flatten into a plain list of `host:port` strings.
    pub fn normalized(&self) -> Vec<String> {
        match self {
            ServerList::One(raw) => parse_servers_from_one(raw),
            ServerList::Many(list) => list
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.normalized().is_empty()
    }
}

fn parse_servers_from_one(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();

    // Array-as-text case: ["a","b"]
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        let inner = &trimmed[1..trimmed.len() - 1];
        inner
            .split(',')
            .filter_map(|part| {
                let part = part.trim().trim_matches('"');
                if part.is_empty() {
                    None
                } else {
                    Some(part.to_string())
                }
            })
            .collect()
    } else if trimmed.is_empty() {
        Vec::new()
    } else {
        vec![trimmed.to_string()]
    }
}

/// Split a `host:port` address into its parts.
///
/// Returns `None` when the port is missing or not a u16. The host side is
/// not resolved here; DNS names are accepted as-is.
pub fn parse_server_addr(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}
