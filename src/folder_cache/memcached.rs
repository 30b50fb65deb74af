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

//! A minimal memcached client, speaking the text protocol.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};

use super::distributed::SharedCacheClient;
use crate::support::error::Error;

/// Responses larger than this are treated as protocol errors.
const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;
/// Longest response line accepted, including the CRLF.
const MAX_LINE: u64 = 1024;

/// A client holding at most one connection to one memcached server.
///
/// Requests are serialised over the connection. Any error drops the
/// connection; the next request reconnects.
pub struct MemcachedClient {
    address: String,
    timeout: Duration,
    conn: Mutex<Option<BufReader<TcpStream>>>,
}

impl MemcachedClient {
    pub fn new(address: String, timeout: Duration) -> Self {
        MemcachedClient {
            address,
            timeout,
            conn: Mutex::new(None),
        }
    }

    fn connect(&self) -> io::Result<BufReader<TcpStream>> {
        let mut last_error = io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} did not resolve to any address", self.address),
        );

        for addr in self.address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    stream.set_nodelay(true)?;
                    debug!("Connected to memcached at {}", addr);
                    return Ok(BufReader::new(stream));
                }
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }

    /// Run `f` against the connection, (re)connecting first if needed and
    /// dropping the connection if `f` fails.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut BufReader<TcpStream>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut guard = self.conn.lock().unwrap();
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.connect().map_err(|e| {
                Error::CacheBackend(format!(
                    "Connecting to {}: {}",
                    self.address, e
                ))
            })?,
        };

        let result = f(&mut conn);
        match result {
            Ok(_) => *guard = Some(conn),
            Err(ref e) => warn!(
                "Dropping memcached connection to {}: {}",
                self.address, e
            ),
        }
        result
    }
}

fn read_line(conn: &mut BufReader<TcpStream>) -> Result<String, Error> {
    let mut line = String::new();
    if 0 == conn.by_ref().take(MAX_LINE).read_line(&mut line)? {
        return Err(Error::CacheBackend("Connection closed".to_owned()));
    }
    if !line.ends_with("\r\n") && line.len() as u64 >= MAX_LINE {
        return Err(Error::CacheBackend("Response line too long".to_owned()));
    }
    if !line.ends_with("\r\n") {
        return Err(Error::CacheBackend("Truncated response".to_owned()));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn unexpected(line: &str) -> Error {
    Error::CacheBackend(format!("Unexpected response: {}", line))
}

fn send(conn: &mut BufReader<TcpStream>, data: &[u8]) -> Result<(), Error> {
    let stream = conn.get_mut();
    stream.write_all(data)?;
    stream.flush()?;
    Ok(())
}

impl SharedCacheClient for MemcachedClient {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.with_conn(|conn| {
            send(conn, format!("get {}\r\n", key).as_bytes())?;

            let header = read_line(conn)?;
            if "END" == header {
                return Ok(None);
            }

            let mut parts = header.split(' ');
            if Some("VALUE") != parts.next() || Some(key) != parts.next() {
                return Err(unexpected(&header));
            }
            let len = parts
                .nth(1)
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|&len| len <= MAX_VALUE_SIZE)
                .ok_or_else(|| unexpected(&header))?;

            let mut data = vec![0u8; len + 2];
            conn.read_exact(&mut data)?;
            if !data.ends_with(b"\r\n") {
                return Err(Error::CacheBackend("Malformed value".to_owned()));
            }
            data.truncate(len);

            let trailer = read_line(conn)?;
            if "END" != trailer {
                return Err(unexpected(&trailer));
            }

            Ok(Some(data))
        })
    }

    fn set(&self, key: &str, value: &[u8], ttl_secs: u32) -> Result<(), Error> {
        self.with_conn(|conn| {
            let mut request =
                format!("set {} 0 {} {}\r\n", key, ttl_secs, value.len())
                    .into_bytes();
            request.extend_from_slice(value);
            request.extend_from_slice(b"\r\n");
            send(conn, &request)?;

            match read_line(conn)?.as_str() {
                "STORED" => Ok(()),
                // The server declined (e.g. too large); not a connection fault
                "NOT_STORED" => Ok(()),
                line => Err(unexpected(line)),
            }
        })
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        self.with_conn(|conn| {
            send(conn, format!("delete {}\r\n", key).as_bytes())?;
            match read_line(conn)?.as_str() {
                "DELETED" | "NOT_FOUND" => Ok(()),
                line => Err(unexpected(line)),
            }
        })
    }

    fn touch(&self, key: &str, ttl_secs: u32) -> Result<(), Error> {
        self.with_conn(|conn| {
            send(conn, format!("touch {} {}\r\n", key, ttl_secs).as_bytes())?;
            match read_line(conn)?.as_str() {
                "TOUCHED" | "NOT_FOUND" => Ok(()),
                line => Err(unexpected(line)),
            }
        })
    }
}
