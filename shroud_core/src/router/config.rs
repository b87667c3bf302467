/*! Orchestrator configuration.

The daemon parses its config file and feeds the result in here as a
stream of `(section, key, value)` triples; unknown keys are ignored with
a warning so old configs keep working.
*/

use std::net::IpAddr;
use std::path::PathBuf;

use hex::FromHex;
use shroud_crypto::RouterId;
use shroud_packet::rc::DEFAULT_NET_ID;

/// Fewer known routers than this triggers bootstrapping.
pub const MIN_REQUIRED_ROUTERS: usize = 6;

/// Fewer connected routers than this triggers random dials.
pub const MIN_CONNECTED_ROUTERS: usize = 4;

/// Settings the orchestrator consumes at startup.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub netid: Vec<u8>,
    pub nickname: String,
    pub encryption_keyfile: PathBuf,
    pub ident_keyfile: PathBuf,
    pub transport_keyfile: PathBuf,
    pub contact_file: PathBuf,
    pub public_address: Option<IpAddr>,
    pub public_port: Option<u16>,
    /// Interfaces to accept sessions on; a non-empty list makes this node
    /// a service node.
    pub binds: Vec<String>,
    pub profiles_path: PathBuf,
    /// When non-empty, only these peers may be dialed.
    pub strict_connect: Vec<RouterId>,
    /// Files with bencoded bootstrap contacts.
    pub bootstrap_files: Vec<PathBuf>,
    pub netdb_dir: PathBuf,
    /// Whether to advertise and grant internet egress.
    pub exit: bool,
    pub min_required_routers: usize,
    pub min_connected_routers: usize,
}

impl Default for RouterConfig {
    fn default() -> RouterConfig {
        RouterConfig {
            netid: DEFAULT_NET_ID.to_vec(),
            nickname: String::new(),
            encryption_keyfile: PathBuf::from("encryption.key"),
            ident_keyfile: PathBuf::from("identity.key"),
            transport_keyfile: PathBuf::from("transport.key"),
            contact_file: PathBuf::from("self.signed"),
            public_address: None,
            public_port: None,
            binds: Vec::new(),
            profiles_path: PathBuf::from("profiles.dat"),
            strict_connect: Vec::new(),
            bootstrap_files: Vec::new(),
            netdb_dir: PathBuf::from("netdb"),
            exit: false,
            min_required_routers: MIN_REQUIRED_ROUTERS,
            min_connected_routers: MIN_CONNECTED_ROUTERS,
        }
    }
}

impl RouterConfig {
    /// Apply one `(section, key, value)` triple from the config parser.
    pub fn apply(&mut self, section: &str, key: &str, value: &str) {
        match (section, key) {
            ("router", "netid") => {
                self.netid = value.as_bytes().to_vec();
            }
            ("router", "nickname") => {
                self.nickname = value.to_string();
            }
            ("router", "encryption-privkey") => {
                self.encryption_keyfile = PathBuf::from(value);
            }
            ("router", "ident-privkey") => {
                self.ident_keyfile = PathBuf::from(value);
            }
            ("router", "transport-privkey") => {
                self.transport_keyfile = PathBuf::from(value);
            }
            ("router", "contact-file") => {
                self.contact_file = PathBuf::from(value);
            }
            ("router", "public-address") => match value.parse() {
                Ok(addr) => self.public_address = Some(addr),
                Err(error) => warn!("bad public-address '{}': {}", value, error),
            },
            ("router", "public-port") => match value.parse() {
                Ok(port) => self.public_port = Some(port),
                Err(error) => warn!("bad public-port '{}': {}", value, error),
            },
            ("router", "min-routers") => match value.parse() {
                Ok(n) => self.min_required_routers = n,
                Err(error) => warn!("bad min-routers '{}': {}", value, error),
            },
            ("router", "min-connections") => match value.parse() {
                Ok(n) => self.min_connected_routers = n,
                Err(error) => warn!("bad min-connections '{}': {}", value, error),
            },
            ("bind", iface) => {
                debug!("bind interface {} ({})", iface, value);
                self.binds.push(iface.to_string());
            }
            ("network", "profiles") => {
                self.profiles_path = PathBuf::from(value);
            }
            ("network", "strict-connect") => {
                match <[u8; 32]>::from_hex(value) {
                    Ok(bytes) => self.strict_connect.push(RouterId(bytes)),
                    Err(error) => warn!("bad strict-connect key '{}': {}", value, error),
                }
            }
            ("network", "exit") => {
                self.exit = matches!(value, "1" | "true" | "yes");
            }
            ("connect", _) | ("bootstrap", "add-node") => {
                self.bootstrap_files.push(PathBuf::from(value));
            }
            ("netdb", "dir") => {
                self.netdb_dir = PathBuf::from(value);
            }
            ("rpc", _) => {
                // the admin control surface lives outside the core
                debug!("rpc option {}={} handled by the control layer", key, value);
            }
            _ => {
                warn!("unknown config option [{}]{}={}", section, key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_router_section() {
        let mut config = RouterConfig::default();
        config.apply("router", "netid", "testnet");
        config.apply("router", "nickname", "edge-1");
        config.apply("router", "public-address", "203.0.113.5");
        config.apply("router", "public-port", "1090");
        assert_eq!(config.netid, b"testnet");
        assert_eq!(config.nickname, "edge-1");
        assert_eq!(config.public_address, Some("203.0.113.5".parse().unwrap()));
        assert_eq!(config.public_port, Some(1090));
    }

    #[test]
    fn apply_bind_and_bootstrap() {
        let mut config = RouterConfig::default();
        config.apply("bind", "eth0", "1090");
        config.apply("bootstrap", "add-node", "/var/lib/shroud/seed.signed");
        config.apply("connect", "seed2", "/var/lib/shroud/seed2.signed");
        assert_eq!(config.binds, vec!["eth0"]);
        assert_eq!(config.bootstrap_files.len(), 2);
    }

    #[test]
    fn apply_strict_connect() {
        let mut config = RouterConfig::default();
        config.apply("network", "strict-connect", &"ab".repeat(32));
        assert_eq!(config.strict_connect.len(), 1);
        config.apply("network", "strict-connect", "not-hex");
        assert_eq!(config.strict_connect.len(), 1);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = RouterConfig::default();
        let before = format!("{:?}", config);
        config.apply("dns", "upstream", "9.9.9.9");
        assert_eq!(before, format!("{:?}", config));
    }
}
