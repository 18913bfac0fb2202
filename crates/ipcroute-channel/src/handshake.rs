//! Rendezvous handshake: two unidirectional streams make one duplex link.
//!
//! ```text
//! client                                   server (listening on N)
//!   connect N  ─────────────────────────▶  accept
//!   bind R (fresh uuid)
//!   frame "R"  ─────────────────────────▶  read first frame = R
//!   accept on R ◀─────────────────────────  connect R
//! ```
//!
//! The client writes on its stream to `N` and reads from the stream accepted
//! on `R`; the server does the opposite.

use std::time::Duration;

use ipcroute_frame::{FrameReader, FrameWriter};
use ipcroute_transport::{validate_name, IpcStream, Transport};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ChannelError, Result};

/// Timeouts for one rendezvous.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// How long to wait for a listener to exist on the target name.
    pub connect_timeout: Duration,
    /// How long to wait for the peer's half of the rendezvous: the reply name
    /// on the server, the reverse connection on the client.
    pub rendezvous_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            rendezvous_timeout: Duration::from_secs(2),
        }
    }
}

impl HandshakeConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }
}

/// Both halves of a completed rendezvous.
pub struct RendezvousStreams {
    /// Inbound half.
    pub reader: FrameReader<IpcStream>,
    /// Outbound half.
    pub writer: FrameWriter<IpcStream>,
    /// The reply name announced by the client.
    pub reply_name: String,
}

impl std::fmt::Debug for RendezvousStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousStreams")
            .field("reply_name", &self.reply_name)
            .finish_non_exhaustive()
    }
}

/// Client side: open a duplex link to the listener on `name`.
pub fn rendezvous_client(
    transport: &dyn Transport,
    name: &str,
    config: &HandshakeConfig,
) -> Result<RendezvousStreams> {
    let outbound = transport.connect(name, config.connect_timeout)?;
    let reply_name = Uuid::new_v4().to_string();

    // The reply name must be bound before it is announced.
    let reply_listener = transport.bind(&reply_name)?;
    let mut writer = FrameWriter::new(outbound);
    writer.write_text(&reply_name)?;
    debug!(name, reply_name = %reply_name, "announced reply name");

    let inbound = reply_listener
        .accept_timeout(config.rendezvous_timeout)
        .map_err(|err| {
            if err.is_timeout() {
                ChannelError::HandshakeFailed(format!(
                    "'{name}' did not connect back on '{reply_name}' within {:?}",
                    config.rendezvous_timeout
                ))
            } else {
                err.into()
            }
        })?;
    drop(reply_listener);
    debug!(name, reply_name = %reply_name, "rendezvous complete");

    Ok(RendezvousStreams {
        reader: FrameReader::new(inbound),
        writer,
        reply_name,
    })
}

/// Server side: complete the rendezvous for a stream accepted on the
/// well-known name.
pub fn rendezvous_server(
    transport: &dyn Transport,
    inbound: IpcStream,
    config: &HandshakeConfig,
) -> Result<RendezvousStreams> {
    inbound.set_read_timeout(Some(config.rendezvous_timeout))?;
    let mut reader = FrameReader::new(inbound);

    let reply_name = match reader.read_text() {
        Ok(Some(name)) => name,
        Ok(None) => {
            return Err(ChannelError::HandshakeFailed(
                "peer closed before announcing its reply name".to_string(),
            ))
        }
        Err(err) if err.is_timeout() => {
            return Err(ChannelError::HandshakeFailed(format!(
                "no reply name within {:?}",
                config.rendezvous_timeout
            )))
        }
        Err(err) => return Err(err.into()),
    };
    validate_channel_name(&reply_name)?;

    let outbound = transport.connect(&reply_name, config.connect_timeout)?;
    reader.get_ref().set_read_timeout(None)?;
    debug!(reply_name = %reply_name, "connected back to peer");

    Ok(RendezvousStreams {
        reader,
        writer: FrameWriter::new(outbound),
        reply_name,
    })
}

/// Reject reply names that are not plain transport names.
pub fn validate_channel_name(name: &str) -> Result<()> {
    validate_name(name).map_err(|err| ChannelError::HandshakeFailed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::testutil::TempTransport;

    #[test]
    fn rendezvous_builds_duplex_link() {
        let transport = TempTransport::new("rdv");
        let listener = transport.bind("Test").expect("bind well-known name");
        let config = HandshakeConfig::default();

        let server_transport = transport.clone();
        let server = thread::spawn(move || {
            let inbound = listener
                .accept_timeout(Duration::from_secs(2))
                .expect("accept");
            let mut streams =
                rendezvous_server(&*server_transport, inbound, &HandshakeConfig::default())
                    .expect("server rendezvous");
            let ping = streams.reader.read_text().expect("read").expect("frame");
            streams.writer.write_text(&format!("{ping}-pong")).expect("write");
            streams.reply_name
        });

        let mut client = rendezvous_client(&*transport, "Test", &config).expect("client rendezvous");
        client.writer.write_text("ping").expect("write");
        let reply = client.reader.read_text().expect("read").expect("frame");
        assert_eq!(reply, "ping-pong");

        let server_reply_name = server.join().expect("server thread");
        assert_eq!(server_reply_name, client.reply_name);
        assert!(Uuid::parse_str(&client.reply_name).is_ok());
        assert!(
            !transport.dir().join(format!("{}.sock", client.reply_name)).exists(),
            "reply socket is released after the rendezvous"
        );
    }

    #[test]
    fn client_times_out_when_peer_never_connects_back() {
        let transport = TempTransport::new("rdv-mute");
        let listener = transport.bind("Mute").expect("bind");
        let config = HandshakeConfig::default().with_rendezvous_timeout(Duration::from_millis(50));

        let holder = thread::spawn(move || {
            let stream = listener
                .accept_timeout(Duration::from_secs(2))
                .expect("accept");
            thread::sleep(Duration::from_millis(200));
            drop(stream);
        });

        let err = rendezvous_client(&*transport, "Mute", &config).unwrap_err();
        assert!(matches!(err, ChannelError::HandshakeFailed(_)), "{err}");
        holder.join().expect("holder thread");
    }

    #[test]
    fn client_fails_when_nobody_listens() {
        let transport = TempTransport::new("rdv-none");
        let config = HandshakeConfig::default().with_connect_timeout(Duration::from_millis(30));
        let err = rendezvous_client(&*transport, "Nobody", &config).unwrap_err();
        assert!(matches!(err, ChannelError::Transport(_)), "{err}");
        assert!(err.is_connection_broken());
    }

    #[test]
    fn server_rejects_path_like_reply_name() {
        let transport = TempTransport::new("rdv-evil");
        let (client, server) = IpcStream::pair().expect("pair");
        let mut writer = FrameWriter::new(client);
        writer.write_text("../../etc/evil").expect("write");

        let err = rendezvous_server(&*transport, server, &HandshakeConfig::default()).unwrap_err();
        assert!(matches!(err, ChannelError::HandshakeFailed(_)), "{err}");
    }

    #[test]
    fn server_times_out_without_reply_name() {
        let transport = TempTransport::new("rdv-silent");
        let (_client, server) = IpcStream::pair().expect("pair");
        let config = HandshakeConfig::default().with_rendezvous_timeout(Duration::from_millis(30));

        let err = rendezvous_server(&*transport, server, &config).unwrap_err();
        assert!(matches!(err, ChannelError::HandshakeFailed(_)), "{err}");
    }

    #[test]
    fn server_reports_closed_peer() {
        let transport = TempTransport::new("rdv-closed");
        let (client, server) = IpcStream::pair().expect("pair");
        drop(client);
        let err = rendezvous_server(&*transport, server, &HandshakeConfig::default()).unwrap_err();
        assert!(matches!(err, ChannelError::HandshakeFailed(_)), "{err}");
    }
}
