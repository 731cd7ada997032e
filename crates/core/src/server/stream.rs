//! Server stream registry: published media, per-format RTCP senders, and
//! packet fan-out to playing sessions.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::media::{Format, Media};
use crate::rtcp::RtcpSender;
use crate::rtcp::sender::DEFAULT_REPORT_PERIOD;
use crate::rtp::RtpPacket;
use crate::transport::{Endpoint, UdpEndpoint};
use crate::url::RtspUrl;

/// First multicast RTP port, one even/odd pair per media.
const MULTICAST_BASE_PORT: u16 = 5004;

/// Allocates multicast groups for streams out of the configured range.
pub struct MulticastAllocator {
    range: (u32, u32),
    next: Mutex<u32>,
}

impl MulticastAllocator {
    pub fn new(range: (Ipv4Addr, Ipv4Addr)) -> Self {
        let range = (u32::from(range.0), u32::from(range.1));
        MulticastAllocator {
            range,
            next: Mutex::new(range.0),
        }
    }

    pub fn next_group(&self) -> Ipv4Addr {
        let mut next = self.next.lock();
        let group = *next;
        *next = if group >= self.range.1 {
            self.range.0
        } else {
            group + 1
        };
        Ipv4Addr::from(group)
    }
}

impl Default for MulticastAllocator {
    fn default() -> Self {
        MulticastAllocator::new((Ipv4Addr::new(224, 1, 0, 0), Ipv4Addr::new(224, 255, 255, 255)))
    }
}

/// One format of one stream media: the format descriptor paired with the
/// RTCP sender that observes its outgoing packets.
pub struct ServerStreamFormat {
    pub format: Format,
    pub rtcp_sender: Mutex<RtcpSender>,
    next_report: Mutex<Instant>,
}

impl ServerStreamFormat {
    fn new(format: Format) -> Self {
        let rtcp_sender = RtcpSender::new(format.clock_rate(), DEFAULT_REPORT_PERIOD);
        let next_report = Instant::now() + rtcp_sender.next_interval();
        ServerStreamFormat {
            format,
            rtcp_sender: Mutex::new(rtcp_sender),
            next_report: Mutex::new(next_report),
        }
    }
}

struct Subscriber {
    session_id: String,
    media_index: usize,
    endpoint: Arc<Endpoint>,
}

/// A published stream: its media list, per-(media, format) RTCP senders,
/// and the set of playing subscribers.
///
/// Applications feed packets with [`write_packet_rtp`](Self::write_packet_rtp);
/// the stream serializes once and fans the bytes out to every subscribed
/// endpoint, feeding the RTCP sender on the way so Sender Reports stay
/// consistent with the delivered RTP timeline.
pub struct ServerStream {
    medias: Vec<Media>,
    formats: Vec<Vec<Arc<ServerStreamFormat>>>,
    subscribers: RwLock<Vec<Subscriber>>,
    multicast_group: Mutex<Option<Ipv4Addr>>,
    multicast: Mutex<HashMap<usize, Arc<UdpEndpoint>>>,
    udp_max_payload_size: usize,
}

impl ServerStream {
    /// Build a stream from its media list. Media without a control
    /// attribute get `trackID=N` assigned by position.
    pub fn new(mut medias: Vec<Media>, udp_max_payload_size: usize) -> Arc<Self> {
        for (index, media) in medias.iter_mut().enumerate() {
            if media.control.is_empty() {
                media.control = format!("trackID={index}");
            }
        }
        let formats = medias
            .iter()
            .map(|media| {
                media
                    .formats
                    .iter()
                    .map(|format| Arc::new(ServerStreamFormat::new(format.clone())))
                    .collect()
            })
            .collect();
        Arc::new(ServerStream {
            medias,
            formats,
            subscribers: RwLock::new(Vec::new()),
            multicast_group: Mutex::new(None),
            multicast: Mutex::new(HashMap::new()),
            udp_max_payload_size,
        })
    }

    pub fn medias(&self) -> &[Media] {
        &self.medias
    }

    /// Media index whose control attribute terminates the SETUP target.
    pub fn find_media_by_control(&self, uri: &str) -> Option<usize> {
        let position = self.medias.iter().position(|media| {
            !media.control.is_empty()
                && (uri.ends_with(&media.control)
                    || uri.ends_with(&format!("{}/", media.control)))
        });
        position.or_else(|| (self.medias.len() == 1).then_some(0))
    }

    pub fn format_state(&self, media_index: usize, payload_type: u8) -> Option<Arc<ServerStreamFormat>> {
        self.formats
            .get(media_index)?
            .iter()
            .find(|f| f.format.payload_type() == payload_type)
            .cloned()
    }

    /// First format of a media, the common single-format case.
    pub fn primary_format(&self, media_index: usize) -> Option<Arc<ServerStreamFormat>> {
        self.formats.get(media_index)?.first().cloned()
    }

    /// Deliver one RTP packet of a media to every playing subscriber.
    pub fn write_packet_rtp(&self, media_index: usize, packet: &RtpPacket) -> Result<()> {
        let bytes = packet.serialize();
        let now = SystemTime::now();

        if let Some(format) = self.format_state(media_index, packet.header.payload_type) {
            format
                .rtcp_sender
                .lock()
                .process_packet(&packet.header, packet.payload.len(), now);
        }

        let oversized_for_udp = bytes.len() > self.udp_max_payload_size;
        for subscriber in self.subscribers.read().iter() {
            if subscriber.media_index != media_index {
                continue;
            }
            if oversized_for_udp && matches!(*subscriber.endpoint, Endpoint::Udp(_)) {
                tracing::warn!(
                    len = bytes.len(),
                    "RTP packet exceeds UDP payload limit, dropped for UDP subscriber"
                );
                continue;
            }
            if let Err(e) = subscriber.endpoint.send_rtp(bytes.clone()) {
                tracing::debug!(session_id = %subscriber.session_id, error = %e, "RTP fan-out failed");
            }
        }
        if let Some(endpoint) = self.multicast.lock().get(&media_index) {
            if !oversized_for_udp {
                let _ = endpoint.send_rtp(bytes);
            }
        }
        Ok(())
    }

    /// Emit Sender Reports for every format whose schedule is due.
    pub fn emit_due_reports(&self, now: Instant) {
        for (media_index, media_formats) in self.formats.iter().enumerate() {
            for format in media_formats {
                {
                    let mut next = format.next_report.lock();
                    if *next > now {
                        continue;
                    }
                    *next = now + format.rtcp_sender.lock().next_interval();
                }
                let Some(report) = format.rtcp_sender.lock().report(SystemTime::now()) else {
                    continue;
                };
                let bytes = report.marshal();
                for subscriber in self.subscribers.read().iter() {
                    if subscriber.media_index == media_index {
                        let _ = subscriber.endpoint.send_rtcp(bytes.clone());
                    }
                }
                if let Some(endpoint) = self.multicast.lock().get(&media_index) {
                    let _ = endpoint.send_rtcp(bytes);
                }
            }
        }
    }

    /// Shared multicast sender for a media, created on first use. All
    /// multicast sessions of the stream share the group and port pair.
    pub fn multicast_endpoint(
        &self,
        media_index: usize,
        groups: &MulticastAllocator,
        ttl: u32,
    ) -> Result<(Arc<UdpEndpoint>, Ipv4Addr, u16)> {
        let group = {
            let mut current = self.multicast_group.lock();
            *current.get_or_insert_with(|| groups.next_group())
        };
        let port = MULTICAST_BASE_PORT + (media_index as u16) * 2;

        let mut endpoints = self.multicast.lock();
        if let Some(endpoint) = endpoints.get(&media_index) {
            return Ok((endpoint.clone(), group, port));
        }
        let endpoint = Arc::new(UdpEndpoint::multicast_sender(group, port, ttl)?);
        endpoint.start_sender();
        endpoints.insert(media_index, endpoint.clone());
        Ok((endpoint.clone(), group, port))
    }

    pub fn subscribe(&self, session_id: &str, media_index: usize, endpoint: Arc<Endpoint>) {
        let mut subscribers = self.subscribers.write();
        let exists = subscribers
            .iter()
            .any(|s| s.session_id == session_id && s.media_index == media_index);
        if !exists {
            tracing::debug!(session_id, media_index, "session subscribed");
            subscribers.push(Subscriber {
                session_id: session_id.to_string(),
                media_index,
                endpoint,
            });
        }
    }

    pub fn unsubscribe_session(&self, session_id: &str) {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.session_id != session_id);
        if subscribers.len() != before {
            tracing::debug!(session_id, "session unsubscribed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Tear down the shared multicast endpoints.
    pub fn close(&self) {
        for (_, endpoint) in self.multicast.lock().drain() {
            endpoint.close();
        }
    }
}

/// Registry of published streams, keyed by path.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<RwLock<HashMap<String, Arc<ServerStream>>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream, replacing any previous stream at the path.
    pub fn add(&self, path: &str, stream: Arc<ServerStream>) {
        tracing::info!(path, "stream registered");
        self.streams.write().insert(path.to_string(), stream);
    }

    pub fn get(&self, path: &str) -> Option<Arc<ServerStream>> {
        self.streams.read().get(path).cloned()
    }

    pub fn remove(&self, path: &str) -> Option<Arc<ServerStream>> {
        let removed = self.streams.write().remove(path);
        if removed.is_some() {
            tracing::info!(path, "stream removed");
        }
        removed
    }

    /// Resolve a request URI to a registered stream.
    ///
    /// Tries the full path, then the path with the final segment (a media
    /// control like `trackID=0`) stripped.
    pub fn resolve(&self, uri: &str) -> Option<(String, Arc<ServerStream>)> {
        let path = match RtspUrl::parse(uri) {
            Ok(url) => url.path,
            Err(_) => uri.to_string(),
        };
        let streams = self.streams.read();
        if let Some(stream) = streams.get(&path) {
            return Some((path, stream.clone()));
        }
        let parent = path.rsplit_once('/').map(|(p, _)| p)?;
        streams.get(parent).map(|s| (parent.to_string(), s.clone()))
    }

    pub fn unsubscribe_session(&self, session_id: &str) {
        for stream in self.streams.read().values() {
            stream.unsubscribe_session(session_id);
        }
    }

    /// Snapshot of every registered stream, for report scheduling.
    pub fn all(&self) -> Vec<(String, Arc<ServerStream>)> {
        self.streams
            .read()
            .iter()
            .map(|(path, stream)| (path.clone(), stream.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;

    fn stream() -> Arc<ServerStream> {
        ServerStream::new(
            vec![
                Media::new(MediaKind::Video, vec![Format::h264(96)]),
                Media::new(MediaKind::Audio, vec![Format::G711 { mu_law: true }]),
            ],
            1472,
        )
    }

    #[test]
    fn controls_assigned_by_position() {
        let stream = stream();
        assert_eq!(stream.medias()[0].control, "trackID=0");
        assert_eq!(stream.medias()[1].control, "trackID=1");
    }

    #[test]
    fn media_resolution_by_control() {
        let stream = stream();
        assert_eq!(
            stream.find_media_by_control("rtsp://host:8554/cam/trackID=1"),
            Some(1)
        );
        assert_eq!(
            stream.find_media_by_control("rtsp://host:8554/cam/trackID=0"),
            Some(0)
        );
        assert_eq!(stream.find_media_by_control("rtsp://host:8554/cam"), None);
    }

    #[test]
    fn single_media_falls_back_to_zero() {
        let stream = ServerStream::new(
            vec![Media::new(MediaKind::Video, vec![Format::h264(96)])],
            1472,
        );
        assert_eq!(stream.find_media_by_control("rtsp://host/cam"), Some(0));
    }

    #[test]
    fn registry_resolution_strips_control() {
        let registry = StreamRegistry::new();
        registry.add("/cam", stream());

        let (path, _) = registry.resolve("rtsp://host:8554/cam").unwrap();
        assert_eq!(path, "/cam");
        let (path, _) = registry.resolve("rtsp://host:8554/cam/trackID=0").unwrap();
        assert_eq!(path, "/cam");
        assert!(registry.resolve("rtsp://host:8554/other").is_none());
    }

    #[test]
    fn format_lookup() {
        let stream = stream();
        assert!(stream.format_state(0, 96).is_some());
        assert!(stream.format_state(0, 97).is_none());
        assert!(stream.format_state(1, 0).is_some());
    }

    #[test]
    fn multicast_group_shared_across_medias() {
        let stream = stream();
        let groups = MulticastAllocator::default();
        let (_, group_a, port_a) = stream.multicast_endpoint(0, &groups, 1).unwrap();
        let (_, group_b, port_b) = stream.multicast_endpoint(1, &groups, 1).unwrap();
        assert_eq!(group_a, group_b);
        assert_eq!(port_a, MULTICAST_BASE_PORT);
        assert_eq!(port_b, MULTICAST_BASE_PORT + 2);
        stream.close();
    }

    #[test]
    fn multicast_allocator_wraps() {
        let allocator = MulticastAllocator::new((
            Ipv4Addr::new(224, 1, 0, 0),
            Ipv4Addr::new(224, 1, 0, 1),
        ));
        assert_eq!(allocator.next_group(), Ipv4Addr::new(224, 1, 0, 0));
        assert_eq!(allocator.next_group(), Ipv4Addr::new(224, 1, 0, 1));
        assert_eq!(allocator.next_group(), Ipv4Addr::new(224, 1, 0, 0));
    }
}
