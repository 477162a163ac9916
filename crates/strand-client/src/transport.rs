// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! TCP adapter: framed CBOR packets ↔ typed frame channels.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use strand_proto::wire::{decode_frame, encode_frame, WireError};
use strand_proto::{ClientFrame, ServerFrame};

use crate::client::Connection;

impl Connection {
    /// Connects to a hub over TCP and returns the typed frame channels.
    /// Reader and writer tasks own the socket halves; dropping either
    /// channel end tears the connection down.
    ///
    /// # Errors
    /// Connection-establishment failures.
    pub async fn tcp(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(256);
        let (in_tx, in_rx) = mpsc::channel::<ServerFrame>(256);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let packet = match encode_frame(&frame) {
                    Ok(packet) => packet,
                    Err(err) => {
                        warn!(%err, "dropping unencodable frame");
                        continue;
                    }
                };
                if writer.write_all(&packet).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::with_capacity(32 * 1024);
            let mut chunk = vec![0u8; 16 * 1024];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
                loop {
                    match decode_frame::<ServerFrame>(&buf) {
                        Ok((frame, used)) => {
                            buf.drain(..used);
                            if in_tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Err(WireError::Incomplete { .. }) => break,
                        Err(err) => {
                            warn!(%err, "closing connection on undecodable frame");
                            return;
                        }
                    }
                }
            }
            debug!("server connection closed");
        });

        Ok(Self {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
