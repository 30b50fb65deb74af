//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Quillmap.
//
// Quillmap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Quillmap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Quillmap. If not, see <http://www.gnu.org/licenses/>.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Quillmap.
///
/// This is stored in a file named `quillmap.toml` under the Quillmap system
/// root, which is typically `/usr/local/etc/quillmap` or `/etc/quillmap`.
/// Every section is optional.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Where and how to accept connections.
    #[serde(default)]
    pub server: ServerConfig,

    /// Limits on the size of requests.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Repeat throttling and per-account serialisation.
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// The folder snapshot cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Per-connection session behaviour.
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The address to listen on.
    pub listen: String,
    /// The text of the untagged OK greeting.
    pub greeting: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: "127.0.0.1:1143".to_owned(),
            greeting: "Quillmap ready".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// The maximum total size of one command, counting every line and every
    /// literal.
    pub max_request_size: u64,
    /// The maximum size of any single literal.
    pub max_literal_size: u64,
    /// The maximum length of a single line of a command, excluding literals.
    pub max_line_length: usize,
    /// Literals larger than this are spooled to disk instead of being held in
    /// memory. `APPEND` literals are always spooled.
    pub spool_threshold: u64,
    /// Where spooled literals are written. Empty means the system temporary
    /// directory.
    pub spool_dir: PathBuf,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_request_size: 64 * 1024 * 1024,
            max_literal_size: 48 * 1024 * 1024,
            max_line_length: 20480,
            spool_threshold: 65536,
            spool_dir: PathBuf::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// How many times the same command may be repeated back-to-back before
    /// further repeats are rejected. 0 disables repeat throttling.
    pub command_limit: u32,
    /// A repeat only counts if it arrives within this many milliseconds of
    /// the previous command.
    pub repeat_window_ms: u64,
    /// Verbs which are throttled on the verb alone, regardless of arguments.
    pub self_limited_commands: Vec<String>,
    /// Verbs subject to repeat throttling. Any other verb resets the repeat
    /// count.
    pub throttle_aware_commands: Vec<String>,
    /// Peer IP addresses which are exempt from repeat and rate throttling.
    pub exempt_addresses: Vec<String>,
    /// Whether expensive commands are serialised per account.
    pub serialize_expensive: bool,
    /// The verbs which take the per-account lock.
    pub expensive_commands: Vec<String>,
    /// How long to wait for the per-account lock before giving up.
    pub account_lock_timeout_ms: u64,
    /// Unused account lock slots are forgotten after this many seconds.
    pub account_lock_idle_expiry_secs: u64,
    /// Requests one account may make per rate window, across all its
    /// connections. 0 disables the limit.
    pub account_request_limit: u32,
    /// Requests one peer address may make per rate window. 0 disables the
    /// limit.
    pub address_request_limit: u32,
    /// The length of a request rate window.
    pub request_rate_window_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            command_limit: 25,
            repeat_window_ms: 1000,
            self_limited_commands: vec!["CREATE".to_owned()],
            throttle_aware_commands: [
                "APPEND", "COPY", "CREATE", "EXAMINE", "FETCH", "LIST",
                "LSUB", "SEARCH", "SELECT", "SORT", "STORE", "XLIST",
            ]
            .iter()
            .map(|&s| s.to_owned())
            .collect(),
            exempt_addresses: vec![],
            serialize_expensive: true,
            expensive_commands: vec![
                "FETCH".to_owned(),
                "SEARCH".to_owned(),
                "SORT".to_owned(),
            ],
            account_lock_timeout_ms: 10_000,
            account_lock_idle_expiry_secs: 3600,
            account_request_limit: 0,
            address_request_limit: 0,
            request_rate_window_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// The directory holding durable folder snapshots. Empty disables the
    /// durable cache.
    pub dir: PathBuf,
    /// The number of recently used folders tracked before idle ones are
    /// evicted.
    pub active_threshold: usize,
    /// How long a folder must go untouched before it may be evicted.
    pub idle_secs: u64,
    /// Extra time added to `idle_secs` before eviction.
    pub grace_secs: u64,
    /// `host:port` of a memcached server used for the inactive partition.
    /// Empty means the inactive partition shares the durable cache.
    pub memcached: String,
    /// Expiry of entries written to memcached.
    pub memcached_ttl_secs: u32,
    /// Network timeout for memcached requests.
    pub memcached_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            dir: PathBuf::new(),
            active_threshold: 1000,
            idle_secs: 1800,
            grace_secs: 300,
            memcached: String::new(),
            memcached_ttl_secs: 86400,
            memcached_timeout_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// A selected folder is written to the cache and dropped from memory
    /// after the connection has been idle this long. 0 disables paging out.
    pub page_out_after_secs: u64,
    /// Idle connections are closed after this long.
    pub idle_timeout_secs: u64,
    /// The connection is closed after this many consecutive failed commands.
    /// 0 means no limit.
    pub max_consecutive_errors: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            page_out_after_secs: 300,
            idle_timeout_secs: 1800,
            max_consecutive_errors: 5,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: SystemConfig = toml::from_str("").unwrap();
        assert_eq!(20480, config.limits.max_line_length);
        assert_eq!(25, config.throttle.command_limit);
        assert!(config.cache.memcached.is_empty());
    }

    #[test]
    fn partial_sections() {
        let config: SystemConfig = toml::from_str(
            r#"
[limits]
max_request_size = 1024

[throttle]
command_limit = 3
exempt_addresses = ["10.0.0.1"]
address_request_limit = 200

[cache]
dir = "/var/cache/quillmap"
memcached = "127.0.0.1:11211"
"#,
        )
        .unwrap();

        assert_eq!(1024, config.limits.max_request_size);
        assert_eq!(65536, config.limits.spool_threshold);
        assert_eq!(3, config.throttle.command_limit);
        assert_eq!(200, config.throttle.address_request_limit);
        assert_eq!(0, config.throttle.account_request_limit);
        assert_eq!(1000, config.throttle.request_rate_window_ms);
        assert_eq!(vec!["10.0.0.1".to_owned()], config.throttle.exempt_addresses);
        assert_eq!(vec!["CREATE".to_owned()], config.throttle.self_limited_commands);
        assert_eq!(PathBuf::from("/var/cache/quillmap"), config.cache.dir);
        assert_eq!("127.0.0.1:11211", config.cache.memcached);
        assert_eq!(300, config.session.page_out_after_secs);
    }
}
