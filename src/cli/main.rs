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

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use structopt::StructOpt;

use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Accept IMAP connections on the configured address.
    ///
    /// Every connection is served on its own thread. All connections share
    /// the folder cache and the per-account locks.
    Serve(ServerCommonOptions),
    /// Sweep the durable folder cache once and exit.
    ///
    /// Leftover staging files are removed, and for each folder only the most
    /// recent snapshot is kept. The same sweep runs whenever `serve` starts.
    SweepCache(ServerCommonOptions),
    /// Commands used in the development or testing of Quillmap.
    #[cfg(feature = "dev-tools")]
    Dev(DevSubcommand),
}

#[cfg(feature = "dev-tools")]
#[derive(StructOpt)]
enum DevSubcommand {
    /// Run Quillmap in a scratch environment for testing.
    ///
    /// Quillmap will listen for TCP connections on port 14143 with a folder
    /// cache in a fresh directory under /tmp and log to standard error.
    ///
    /// There is no way to configure this.
    ImapTest,
}

#[derive(StructOpt, Default)]
struct ServerCommonOptions {
    /// The directory containing `quillmap.toml` etc
    /// [default: /etc/quillmap or /usr/local/etc/quillmap]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    match cmd {
        #[cfg(feature = "dev-tools")]
        Command::Dev(DevSubcommand::ImapTest) => super::imap_test::imap_test(),
        Command::Serve(common) => {
            let (root, system_config) = load_config(common);
            init_logging(&root);
            super::serve::serve(system_config);
        }
        Command::SweepCache(common) => {
            let (_, system_config) = load_config(common);
            crate::init_simple_log();
            super::serve::sweep_cache(&system_config);
        }
    }
}

fn load_config(common: ServerCommonOptions) -> (PathBuf, SystemConfig) {
    let root = common.root.unwrap_or_else(|| {
        if Path::new("/etc/quillmap/quillmap.toml").is_file() {
            "/etc/quillmap".to_owned().into()
        } else if Path::new("/usr/local/etc/quillmap/quillmap.toml").is_file()
        {
            "/usr/local/etc/quillmap".to_owned().into()
        } else {
            eprintln!(
                "Neither /etc/quillmap nor /usr/local/etc/quillmap looks like\n\
                 the Quillmap root; use --root=/path/to/quillmap if your\n\
                 installation is elsewhere."
            );
            EX_CONFIG.exit()
        }
    });

    let system_config_path = root.join("quillmap.toml");
    let mut system_config_toml = Vec::new();
    if let Err(e) = fs::File::open(&system_config_path)
        .and_then(|mut f| f.read_to_end(&mut system_config_toml))
    {
        eprintln!("Error reading '{}': {}", system_config_path.display(), e);
        EX_CONFIG.exit();
    }

    let mut system_config: SystemConfig =
        match toml::from_slice(&system_config_toml) {
            Ok(config) => config,
            Err(e) => {
                eprintln!(
                    "Error in config file at '{}': {}",
                    system_config_path.display(),
                    e
                );
                EX_CONFIG.exit()
            }
        };

    // Relative paths in the config are relative to the root
    for path in [
        &mut system_config.cache.dir,
        &mut system_config.limits.spool_dir,
    ] {
        if !path.as_os_str().is_empty() && path.is_relative() {
            *path = root.join(&*path);
        }
    }

    (root, system_config)
}

fn init_logging(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
        return;
    }

    // log4rs if configured, syslog otherwise. Nothing is logged yet, so
    // failures here can only go to stderr.
    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            eprintln!(
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
            EX_CONFIG.exit();
        }
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        let result = syslog::unix(formatter)
            .map_err(|e| e.to_string())
            .and_then(|logger| {
                log::set_boxed_logger(Box::new(syslog::BasicLogger::new(
                    logger,
                )))
                .map_err(|e| e.to_string())
            });
        match result {
            Ok(()) => log::set_max_level(log::LevelFilter::Info),
            Err(e) => {
                eprintln!("Failed to connect to syslog: {}", e);
                EX_UNAVAILABLE.exit();
            }
        }
    }
}
