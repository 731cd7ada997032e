//! Re-publish bridge: read a presentation from one server, publish it to
//! another.
//!
//! The bridge wires a consuming client in Playing to a producing client
//! in Recording over the same media list. RTP packets cross without
//! payload inspection; sequence numbers and timestamps are preserved,
//! and SSRCs too unless rewriting is enabled. RTCP is not forwarded: the
//! producer emits its own Sender Reports from the RTP it observes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::RngExt;

use crate::client::{Client, ClientConfig};
use crate::error::{Result, RtspError};
use crate::transport::PortAllocator;
use crate::url::RtspUrl;

/// Bridge configuration.
#[derive(Clone, Default)]
pub struct BridgeConfig {
    pub reader: ClientConfig,
    pub publisher: ClientConfig,
    /// Replace each media's SSRC with a fresh random one. Off by
    /// default: the source stream passes through untouched.
    pub rewrite_ssrc: bool,
}

/// A running bridge between two servers.
pub struct Bridge {
    reader: Client,
    publisher: Client,
}

impl Bridge {
    /// Connect the bridge: DESCRIBE + SETUP + PLAY on `source`,
    /// ANNOUNCE + SETUP(record) + RECORD on `destination`, forwarding
    /// every RTP packet in between.
    pub fn connect(
        source: &RtspUrl,
        destination: &RtspUrl,
        config: BridgeConfig,
        allocator: Arc<PortAllocator>,
    ) -> Result<Bridge> {
        let mut reader = Client::with_config(config.reader, allocator.clone());
        reader.start(source.scheme, &source.host_port())?;
        let (medias, base_url, _) = reader.describe(source)?;
        tracing::info!(medias = medias.len(), source = %base_url, "bridging");

        // SETUP before recording: the publisher needs the same media
        // list, with controls resolved.
        reader.setup_all(&medias, &base_url)?;

        let mut publisher = Client::with_config(config.publisher, allocator);
        publisher.start_recording(destination, &medias)?;

        let writer = publisher.packet_writer();
        let ssrcs: Option<Vec<u32>> = config
            .rewrite_ssrc
            .then(|| medias.iter().map(|_| rand::rng().random()).collect());
        reader.on_packet_rtp(move |media_index, packet| {
            let result = match &ssrcs {
                Some(ssrcs) => {
                    let mut rewritten = packet.clone();
                    rewritten.header.ssrc = ssrcs[media_index];
                    writer.write_packet_rtp(media_index, &rewritten)
                }
                None => writer.write_packet_rtp(media_index, packet),
            };
            if let Err(e) = result {
                tracing::debug!(media_index, error = %e, "forwarding failed");
            }
        });

        reader.play(None)?;
        Ok(Bridge { reader, publisher })
    }

    /// Block until either side fails, and return that error.
    pub fn wait(&self) -> RtspError {
        loop {
            if self.reader.is_ended() {
                return self.reader.wait();
            }
            if self.publisher.is_ended() {
                return self.publisher.wait();
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    pub fn close(&mut self) {
        self.reader.close();
        self.publisher.close();
    }
}
