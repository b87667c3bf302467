//! Facade crate tying the shroud workspace together.

pub use shroud_binary_io as binary_io;
pub use shroud_core as core;
pub use shroud_crypto as crypto;
pub use shroud_packet as packet;

/// Version of the shroud crates, for startup banners.
pub fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
