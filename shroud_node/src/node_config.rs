//! Command line and config file handling for the daemon.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::{Arg, Command};
use config::{Config, File as CfgFile};

use shroud::core::router::RouterConfig;

/// Options taken from the command line.
#[derive(Clone, Debug)]
pub struct NodeOpts {
    /// Path of the config file, when given.
    pub config_file: Option<PathBuf>,
    /// Directory keys, contacts and profiles live under.
    pub data_dir: PathBuf,
    /// Worker threads of the runtime; 0 picks the core count.
    pub threads: usize,
}

/// Parse command line arguments.
pub fn parse_args() -> NodeOpts {
    let matches = Command::new("shroud-node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Onion-routed overlay network router")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .takes_value(true)
                .help("Path to the config file"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .takes_value(true)
                .default_value(".")
                .help("Directory for keys, contacts and profiles"),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .takes_value(true)
                .default_value("0")
                .help("Worker threads, 0 = number of cores"),
        )
        .get_matches();

    NodeOpts {
        config_file: matches.value_of("config").map(PathBuf::from),
        data_dir: PathBuf::from(matches.value_of("data-dir").unwrap_or(".")),
        threads: matches
            .value_of("threads")
            .and_then(|threads| threads.parse().ok())
            .unwrap_or(0),
    }
}

/** Load the config file and flatten it into `(section, key, value)`
triples for the orchestrator.

Every value is coerced to its string form; the orchestrator warns about
anything it does not recognise.
*/
pub fn load_router_config(path: Option<&Path>) -> anyhow::Result<RouterConfig> {
    let mut router_config = RouterConfig::default();
    let path = match path {
        Some(path) => path,
        None => return Ok(router_config),
    };

    let parsed = Config::builder()
        .add_source(CfgFile::from(path))
        .build()?;
    let sections: HashMap<String, HashMap<String, String>> = parsed.try_deserialize()?;

    let mut triples: Vec<(String, String, String)> = sections
        .into_iter()
        .flat_map(|(section, entries)| {
            entries
                .into_iter()
                .map(move |(key, value)| (section.clone(), key, value))
        })
        .collect();
    // deterministic application order
    triples.sort();
    for (section, key, value) in triples {
        router_config.apply(&section, &key, &value);
    }
    Ok(router_config)
}

/// Anchor the relative paths of the config under the data directory.
pub fn anchor_paths(config: &mut RouterConfig, data_dir: &Path) {
    for path in [
        &mut config.encryption_keyfile,
        &mut config.ident_keyfile,
        &mut config.transport_keyfile,
        &mut config.contact_file,
        &mut config.profiles_path,
        &mut config.netdb_dir,
    ] {
        if path.is_relative() {
            let anchored = data_dir.join(path.as_path());
            *path = anchored;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn missing_config_uses_defaults() {
        let config = load_router_config(None).unwrap();
        assert_eq!(config.netid, shroud::packet::rc::DEFAULT_NET_ID);
        assert!(config.binds.is_empty());
    }

    #[test]
    fn toml_sections_become_triples() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[router]
netid = "testnet"
nickname = "edge-1"
public-address = "203.0.113.5"
public-port = 1090

[bind]
eth0 = 1090

[netdb]
dir = "/var/lib/shroud/netdb"
"#
        )
        .unwrap();

        let config = load_router_config(Some(file.path())).unwrap();
        assert_eq!(config.netid, b"testnet");
        assert_eq!(config.nickname, "edge-1");
        assert_eq!(config.public_port, Some(1090));
        assert_eq!(config.binds, vec!["eth0"]);
        assert_eq!(config.netdb_dir, PathBuf::from("/var/lib/shroud/netdb"));
    }

    #[test]
    fn anchor_only_relative_paths() {
        let mut config = RouterConfig::default();
        config.contact_file = PathBuf::from("/etc/shroud/self.signed");
        anchor_paths(&mut config, Path::new("/data"));
        assert_eq!(config.ident_keyfile, PathBuf::from("/data/identity.key"));
        assert_eq!(config.contact_file, PathBuf::from("/etc/shroud/self.signed"));
    }
}
