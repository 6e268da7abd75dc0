// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::Prober;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Checks reachability by opening (and immediately dropping) a TCP
/// connection.
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> std::io::Result<()> {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
        {
            Ok(stream) => stream.map(drop),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no connection within {timeout:?}"),
            )),
        }
    }
}
