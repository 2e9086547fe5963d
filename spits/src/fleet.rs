//! Fleet membership: the plain-text node list.
//!
//! One directive per line; leading whitespace is ignored and lines that do
//! not start with a known directive are skipped:
//!
//! ```text
//! proxy <name> <protocol>:<address>:<port>
//! node  <host>:<port>
//! node  <host>:<port> through <proxy-name>
//! ```
//!
//! `<host>:<port>` is the node's identity key; a later line with the same
//! key replaces the earlier entry in place. Nodes routed `through` a proxy
//! are parsed for validity but skipped from the active list, since proxy
//! relaying is not implemented.

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// One task manager endpoint. `port <= 0` means `address` is a UDS path.
#[derive(Clone, Debug, PartialEq)]
pub struct TmNode {
    pub name: String,
    pub address: String,
    pub port: i32,
}

#[derive(Debug)]
struct Proxy {
    protocol: String,
    address: String,
    port: i32,
}

/// The active task manager list, in file order.
#[derive(Debug, Default)]
pub struct Fleet {
    nodes: Vec<TmNode>,
}

impl Fleet {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TmNode> {
        self.nodes.iter()
    }

    fn upsert(&mut self, node: TmNode) {
        match self.nodes.iter_mut().find(|n| n.name == node.name) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    /// Re-read the node list, keeping the current one when the new list
    /// fails to parse or comes back empty.
    pub fn refresh_from<P: AsRef<Path>>(&mut self, path: P) {
        match load_fleet(path) {
            Ok(fleet) if !fleet.is_empty() => *self = fleet,
            Ok(_) => warn!("new list of task managers is empty and will not be used"),
            Err(err) => error!("failed parsing the task manager list: {:#}", err),
        }
    }
}

/// Load and parse the node list file.
pub fn load_fleet<P: AsRef<Path>>(path: P) -> Result<Fleet> {
    let path = path.as_ref();
    debug!("loading task manager list from {}...", path.display());

    let contents = fs::read_to_string(path)
        .with_context(|| format!("could not read the node list at {}", path.display()))?;
    let fleet = parse_fleet(&contents)?;

    debug!("loaded {} task managers", fleet.len());
    Ok(fleet)
}

fn parse_fleet(contents: &str) -> Result<Fleet> {
    // Proxies first, so a node may reference a proxy declared after it.
    let mut proxies = HashMap::new();
    for line in directives(contents, "proxy") {
        let (name, proxy) = parse_proxy(line)?;
        proxies.insert(name, proxy);
    }

    let mut fleet = Fleet::default();
    for line in directives(contents, "node") {
        if let Some(node) = parse_node(line, &proxies)? {
            fleet.upsert(node);
        }
    }
    Ok(fleet)
}

fn directives<'a>(contents: &'a str, keyword: &'a str) -> impl Iterator<Item = &'a str> {
    contents
        .lines()
        .map(str::trim_start)
        .filter(move |line| line.split_whitespace().next() == Some(keyword))
}

fn parse_proxy(line: &str) -> Result<(String, Proxy)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 3 {
        bail!("malformed proxy directive: {:?}", line);
    }

    let gate: Vec<&str> = fields[2].split(':').collect();
    if gate.len() != 3 {
        bail!("malformed proxy gateway in {:?}", line);
    }
    let port = gate[2]
        .parse::<i32>()
        .with_context(|| format!("bad proxy port in {:?}", line))?;

    let proxy = Proxy {
        protocol: gate[0].to_string(),
        address: gate[1].to_string(),
        port,
    };
    debug!(
        "proxy {} at {}:{}:{}",
        fields[1], proxy.protocol, proxy.address, proxy.port
    );
    Ok((fields[1].to_string(), proxy))
}

fn parse_node(line: &str, proxies: &HashMap<String, Proxy>) -> Result<Option<TmNode>> {
    let fields: Vec<&str> = line.split_whitespace().collect();

    let name = match fields.len() {
        2 | 4 => fields[1],
        _ => bail!("malformed node directive: {:?}", line),
    };
    debug!("node {}", name);

    // host:port, where host may itself contain colons only for UDS paths
    // with an explicit trailing :0; split on the last colon.
    let (address, port_str) = match name.rfind(':') {
        Some(i) => (&name[..i], &name[i + 1..]),
        None => bail!("node {:?} is missing a port", name),
    };
    let port = port_str
        .parse::<i32>()
        .with_context(|| format!("bad node port in {:?}", line))?;

    if fields.len() == 4 {
        if fields[2] != "through" {
            bail!("malformed node directive: {:?}", line);
        }
        let proxy = fields[3];
        if !proxies.contains_key(proxy) {
            bail!("node {} references unknown proxy {}", name, proxy);
        }
        info!("node {} is behind a proxy and will be ignored", name);
        return Ok(None);
    }

    Ok(Some(TmNode {
        name: name.to_string(),
        address: address.to_string(),
        port,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use test_case::test_case;

    fn names(fleet: &Fleet) -> Vec<&str> {
        fleet.iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn test_parse_single_node() {
        let fleet = parse_fleet("node 127.0.0.1:7727\n").unwrap();
        assert_eq!(
            fleet.iter().collect::<Vec<_>>(),
            vec![&TmNode {
                name: "127.0.0.1:7727".to_string(),
                address: "127.0.0.1".to_string(),
                port: 7727,
            }]
        );
    }

    #[test]
    fn test_parse_uds_node() {
        let fleet = parse_fleet("node /tmp/spits.sock:0\n").unwrap();
        let node = fleet.iter().next().unwrap();
        assert_eq!(node.address, "/tmp/spits.sock");
        assert_eq!(node.port, 0);
    }

    #[test]
    fn test_proxied_node_is_skipped() {
        let fleet = parse_fleet(
            "proxy gate tcp:10.0.0.1:7700\n\
             node worker-1:7727 through gate\n\
             node worker-2:7727\n",
        )
        .unwrap();
        assert_eq!(names(&fleet), vec!["worker-2:7727"]);
    }

    #[test]
    fn test_proxy_may_be_declared_after_node() {
        let fleet = parse_fleet(
            "node worker-1:7727 through gate\n\
             proxy gate tcp:10.0.0.1:7700\n",
        )
        .unwrap();
        assert!(fleet.is_empty());
    }

    #[test]
    fn test_same_key_overwrites_in_place() {
        let fleet = parse_fleet(
            "node a:1\n\
             node b:2\n\
             node a:1\n",
        )
        .unwrap();
        assert_eq!(names(&fleet), vec!["a:1", "b:2"]);
    }

    #[test]
    fn test_unknown_lines_are_ignored() {
        let fleet = parse_fleet(
            "# a comment\n\
             \n\
             nodes-of-interest below\n\
             \t node 127.0.0.1:7727\n",
        )
        .unwrap();
        assert_eq!(fleet.len(), 1);
    }

    #[test_case("node onlyhost" ; "missing port")]
    #[test_case("node a:xyz" ; "non numeric port")]
    #[test_case("node a:1 through ghost" ; "unknown proxy")]
    #[test_case("node a:1 extra junk" ; "wrong keyword")]
    #[test_case("proxy short" ; "truncated proxy")]
    #[test_case("proxy gate tcp:addr" ; "truncated gateway")]
    fn test_malformed_directive_fails(line: &str) {
        assert!(parse_fleet(line).is_err());
    }

    #[test]
    fn test_refresh_keeps_previous_on_failure() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node 127.0.0.1:7727").unwrap();

        let mut fleet = Fleet::default();
        fleet.refresh_from(file.path());
        assert_eq!(fleet.len(), 1);

        // An empty reread must not clobber the working list.
        fs::write(file.path(), "").unwrap();
        fleet.refresh_from(file.path());
        assert_eq!(fleet.len(), 1);

        // Nor may a vanished file.
        let gone = file.path().with_extension("gone");
        fleet.refresh_from(&gone);
        assert_eq!(fleet.len(), 1);
    }
}
