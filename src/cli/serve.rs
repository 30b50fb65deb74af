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

use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::folder_cache::DiskFolderCache;
use crate::imap::account_lock::AccountLocks;
use crate::imap::dispatch::BaselineDispatcher;
use crate::imap::rate_limit::RequestRateLimits;
use crate::imap::session::{Session, SessionServices, StreamTransport};
use crate::support::system_config::SystemConfig;

/// How long a read may block before the session gets an idle tick.
const IDLE_TICK: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

// Need to use a this and not die! so that errors go to syslog/etc
macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        crate::support::sysexits::$ex.exit()
    }}
}

pub fn serve(system_config: SystemConfig) {
    let services = match SessionServices::from_config(system_config) {
        Ok(services) => services,
        Err(e) => fatal!(EX_CANTCREAT, "Unable to open folder cache: {}", e),
    };

    let listener = match TcpListener::bind(&services.config.server.listen) {
        Ok(listener) => listener,
        Err(e) => fatal!(
            EX_UNAVAILABLE,
            "Unable to listen on {}: {}",
            services.config.server.listen,
            e
        ),
    };

    info!("Listening on {}", services.config.server.listen);
    spawn_housekeeping(
        Arc::clone(&services.locks),
        Arc::clone(&services.rates),
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => spawn_connection(stream, services.clone()),
            Err(e) => warn!("Failed to accept connection: {}", e),
        }
    }

    services.locks.shutdown();
}

pub fn sweep_cache(system_config: &SystemConfig) {
    let dir = &system_config.cache.dir;
    if dir == Path::new("") {
        fatal!(EX_CONFIG, "No cache directory is configured");
    }

    match DiskFolderCache::open(dir) {
        Ok((_, pruned)) => {
            info!("Pruned {} entries from {}", pruned, dir.display())
        }
        Err(e) => fatal!(EX_IOERR, "Failed to sweep {}: {}", dir.display(), e),
    }
}

fn spawn_housekeeping(
    locks: Arc<AccountLocks>,
    rates: Arc<RequestRateLimits>,
) {
    let result = thread::Builder::new()
        .name("housekeeping".to_owned())
        .spawn(move || loop {
            thread::sleep(HOUSEKEEPING_INTERVAL);
            locks.prune();
            rates.prune();
        });
    if let Err(e) = result {
        fatal!(EX_OSERR, "Unable to start housekeeping thread: {}", e);
    }
}

fn spawn_connection(stream: TcpStream, services: SessionServices) {
    let peer = stream.peer_addr().ok();
    let peer_name = peer
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown-socket".to_owned());

    if let Err(e) = stream
        .set_read_timeout(Some(IDLE_TICK))
        .and_then(|_| stream.set_write_timeout(Some(WRITE_TIMEOUT)))
    {
        warn!("{} Unable to configure timeouts: {}", peer_name, e);
        return;
    }
    let _ = stream.set_nodelay(true);

    let stream_out = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("{} Failed to duplicate socket handle: {}", peer_name, e);
            return;
        }
    };

    let result = thread::Builder::new()
        .name(format!("conn-{}", peer_name))
        .spawn(move || {
            let append_limit = services.config.limits.max_literal_size;
            let dispatcher = BaselineDispatcher::new(append_limit);
            let mut session = Session::new(
                StreamTransport::new(stream, stream_out),
                dispatcher,
                services,
                peer_name,
                peer.map(|p| p.ip()),
            );
            // Outcome already logged by the session
            let _ = session.run();
        });

    if let Err(e) = result {
        error!("Unable to start connection thread: {}", e);
    }
}
