//! Room state and the room manager.
//!
//! A room instantiates one session on the relay: at most one audio source,
//! any number of transcript subscribers, and (exactly while a source is
//! attached) one transcription backend client. Rooms are created lazily on
//! first attach/subscribe (or explicitly over REST to pin configuration) and
//! are removed as soon as they hold neither a source nor a subscriber.
//!
//! Fan-out uses one broadcast channel per room: transcripts are serialized
//! once, and every subscriber drains its own receiver in FIFO order. A
//! subscriber that cannot keep up loses the oldest messages instead of
//! stalling the room.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use scribear_proto::{RoomInfo, TranscriptMessage, TranscriptionSessionConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use axum::extract::ws::Utf8Bytes;

use crate::error::RelayError;
use crate::transcription::{BackendSettings, TranscriptionClient, TranscriptionEvent};

/// Per-room transcript buffer. Subscribers that fall further behind than
/// this lose the oldest messages.
const BROADCAST_CAPACITY: usize = 256;

/// The audio source slot: the backend client exists exactly as long as a
/// source is attached.
#[derive(Debug)]
struct SourceSlot {
    client: TranscriptionClient,
    /// Pump translating client events into broadcasts; ends on its own when
    /// the client's event channel closes.
    _pump: JoinHandle<()>,
}

#[derive(Debug)]
pub struct Room {
    session_id: String,
    config: TranscriptionSessionConfig,
    created_at: DateTime<Utc>,
    transcripts: broadcast::Sender<Utf8Bytes>,
    shutdown: watch::Sender<bool>,
    subscriber_count: AtomicUsize,
    source: Mutex<Option<SourceSlot>>,
}

impl Room {
    fn new(session_id: &str, config: TranscriptionSessionConfig) -> Self {
        let (transcripts, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            session_id: session_id.to_string(),
            config,
            created_at: Utc::now(),
            transcripts,
            shutdown,
            subscriber_count: AtomicUsize::new(0),
            source: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &TranscriptionSessionConfig {
        &self.config
    }

    pub fn has_source(&self) -> bool {
        self.lock_source().is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Acquire)
    }

    pub fn transcription_connected(&self) -> bool {
        self.lock_source()
            .as_ref()
            .is_some_and(|slot| slot.client.is_connected())
    }

    fn is_empty(&self) -> bool {
        !self.has_source() && self.subscriber_count() == 0
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            session_id: self.session_id.clone(),
            has_source: self.has_source(),
            subscriber_count: self.subscriber_count(),
            transcription_connected: self.transcription_connected(),
            created_at: self.created_at,
            transcription_session_config: self.config.clone(),
        }
    }

    /// Serializes once and fans out to every live subscriber; send errors
    /// only mean there is currently no receiver.
    pub fn broadcast(&self, message: &TranscriptMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "failed to serialize transcript");
                return;
            }
        };
        let _ = self.transcripts.send(Utf8Bytes::from(text));
    }

    /// Routes one binary audio frame to the backend client. A room without a
    /// source, or with a client that is not yet (or no longer) connected,
    /// drops the frame.
    pub fn forward_audio(&self, frame: Bytes) {
        if let Some(slot) = self.lock_source().as_ref() {
            slot.client.send_audio(frame);
        }
    }

    fn subscribe(&self) -> (broadcast::Receiver<Utf8Bytes>, watch::Receiver<bool>) {
        self.subscriber_count.fetch_add(1, Ordering::AcqRel);
        (self.transcripts.subscribe(), self.shutdown.subscribe())
    }

    fn unsubscribe(&self) {
        let _ = self
            .subscriber_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn detach_source(&self) {
        if let Some(slot) = self.lock_source().take() {
            slot.client.disconnect();
        }
    }

    fn shut_down(&self) {
        self.detach_source();
        let _ = self.shutdown.send(true);
    }

    fn lock_source(&self) -> MutexGuard<'_, Option<SourceSlot>> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What an audio ingress handler holds while its socket is the room's
/// source. `shutdown` flips to `true` when the room is removed.
pub struct SourceAttachment {
    pub room: Arc<Room>,
    pub shutdown: watch::Receiver<bool>,
}

/// What a transcript egress handler holds: its private FIFO of serialized
/// transcripts plus the room-removal signal.
pub struct Subscription {
    pub room: Arc<Room>,
    pub transcripts: broadcast::Receiver<Utf8Bytes>,
    pub shutdown: watch::Receiver<bool>,
}

/// The authoritative `sessionId → Room` map.
pub struct RoomManager {
    rooms: DashMap<String, Arc<Room>>,
    backend: BackendSettings,
}

impl RoomManager {
    pub fn new(backend: BackendSettings) -> Self {
        Self {
            rooms: DashMap::new(),
            backend,
        }
    }

    /// Creates a room with pinned configuration; fails if the session
    /// already has one.
    pub fn create_room(
        &self,
        session_id: &str,
        config: Option<TranscriptionSessionConfig>,
    ) -> Result<Arc<Room>, RelayError> {
        match self.rooms.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(RelayError::RoomExists(session_id.to_string())),
            Entry::Vacant(slot) => {
                let room = Arc::new(Room::new(session_id, config.unwrap_or_default()));
                slot.insert(Arc::clone(&room));
                info!(session_id, "room created");
                Ok(room)
            }
        }
    }

    pub fn get_or_create_room(
        &self,
        session_id: &str,
        config: Option<TranscriptionSessionConfig>,
    ) -> Arc<Room> {
        Arc::clone(self.room_entry(session_id, config).value())
    }

    /// Shared lazy-creation path; the returned guard holds the map shard so
    /// callers can mutate room membership without a removal interleaving.
    fn room_entry(
        &self,
        session_id: &str,
        config: Option<TranscriptionSessionConfig>,
    ) -> dashmap::mapref::one::RefMut<'_, String, Arc<Room>> {
        self.rooms.entry(session_id.to_string()).or_insert_with(|| {
            info!(session_id, "room created lazily");
            Arc::new(Room::new(session_id, config.unwrap_or_default()))
        })
    }

    pub fn get_room(&self, session_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(session_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes the room outright: backend client disconnected, every owned
    /// socket told to close with 1000 "Room closed". Idempotent.
    pub fn remove_room(&self, session_id: &str) {
        if let Some((_, room)) = self.rooms.remove(session_id) {
            info!(session_id, "room removed");
            room.shut_down();
        }
    }

    /// Attaches the calling socket as the room's single audio source,
    /// creating the room (and the backend client) as needed. Returns `None`
    /// when the slot is already taken.
    pub fn set_audio_source(&self, session_id: &str) -> Option<SourceAttachment> {
        let entry = self.room_entry(session_id, None);
        let room = Arc::clone(entry.value());

        let mut slot = room.lock_source();
        if slot.is_some() {
            return None;
        }
        let (client, events) = TranscriptionClient::connect(&self.backend, &room.config);
        let pump = spawn_event_pump(Arc::clone(&room), events);
        *slot = Some(SourceSlot {
            client,
            _pump: pump,
        });
        drop(slot);

        let shutdown = room.shutdown.subscribe();
        info!(session_id, "audio source attached");
        Some(SourceAttachment { room, shutdown })
    }

    /// Detaches the source and disconnects the backend client; removes the
    /// room when no subscriber remains. Safe to call again after the room is
    /// gone.
    pub fn remove_audio_source(&self, room: &Arc<Room>) {
        room.detach_source();
        self.collect_if_empty(room);
    }

    /// Routes a binary frame to the session's backend client; a no-op for
    /// unknown sessions or rooms without a source.
    pub fn forward_audio(&self, session_id: &str, frame: Bytes) {
        if let Some(room) = self.get_room(session_id) {
            room.forward_audio(frame);
        }
    }

    /// Registers a subscriber, creating an empty room (default config) if
    /// the session has none yet.
    pub fn add_subscriber(&self, session_id: &str) -> Subscription {
        let entry = self.room_entry(session_id, None);
        // Count while holding the map entry so removal cannot interleave.
        let (transcripts, shutdown) = entry.value().subscribe();
        let room = Arc::clone(entry.value());
        Subscription {
            room,
            transcripts,
            shutdown,
        }
    }

    /// Unregisters a subscriber; removes the room when it holds neither a
    /// source nor another subscriber.
    pub fn remove_subscriber(&self, room: &Arc<Room>) {
        room.unsubscribe();
        self.collect_if_empty(room);
    }

    pub fn list_rooms(&self) -> Vec<RoomInfo> {
        self.rooms.iter().map(|entry| entry.value().info()).collect()
    }

    /// Tears down every room; used on process shutdown.
    pub fn shutdown_all(&self) {
        let ids: Vec<String> = self.rooms.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.remove_room(&id);
        }
    }

    /// A room exists iff it has a source or at least one subscriber. The
    /// identity check keeps a stale handle from collecting a room that was
    /// re-created under the same session id.
    fn collect_if_empty(&self, room: &Arc<Room>) {
        let removed = self
            .rooms
            .remove_if(room.session_id(), |_, current| {
                Arc::ptr_eq(current, room) && current.is_empty()
            });
        if removed.is_some() {
            info!(session_id = %room.session_id(), "room removed (empty)");
        }
    }
}

/// Translates backend client events into subscriber broadcasts.
fn spawn_event_pump(
    room: Arc<Room>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<TranscriptionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TranscriptionEvent::Connected => {
                    info!(session_id = %room.session_id(), "transcription backend connected");
                }
                TranscriptionEvent::IpTranscript(segments) => {
                    room.broadcast(&TranscriptMessage::IpTranscript(segments));
                }
                TranscriptionEvent::FinalTranscript(segments) => {
                    room.broadcast(&TranscriptMessage::FinalTranscript(segments));
                }
                TranscriptionEvent::Disconnected { code, reason } => {
                    // Transcript flow ceases until a new source attach
                    // rebuilds the client; subscribers stay connected.
                    info!(
                        session_id = %room.session_id(),
                        ?code,
                        reason,
                        "transcription backend disconnected"
                    );
                }
                TranscriptionEvent::Error(error) => {
                    warn!(session_id = %room.session_id(), error, "transcription stream error");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribear_proto::TranscriptSegments;

    fn manager() -> RoomManager {
        RoomManager::new(BackendSettings {
            // Loopback port 1 refuses; attach semantics do not depend on the
            // backend being reachable.
            authority: "127.0.0.1:1".to_string(),
            api_key: "test-key".to_string(),
        })
    }

    fn segments(words: &[&str]) -> TranscriptSegments {
        TranscriptSegments {
            text: words.iter().map(ToString::to_string).collect(),
            starts: None,
            ends: None,
        }
    }

    #[tokio::test]
    async fn create_room_conflicts_on_duplicate() {
        let manager = manager();
        manager.create_room("S1", None).unwrap();
        assert_eq!(
            manager.create_room("S1", None).unwrap_err(),
            RelayError::RoomExists("S1".to_string())
        );
        // The original room is untouched.
        assert_eq!(manager.list_rooms().len(), 1);
    }

    #[tokio::test]
    async fn pinned_config_is_immutable_and_echoed() {
        let manager = manager();
        let config = TranscriptionSessionConfig {
            provider_key: "azure".to_string(),
            use_ssl: true,
            sample_rate: 48_000,
            num_channels: 2,
        };
        let room = manager.create_room("S1", Some(config.clone())).unwrap();
        assert_eq!(room.config(), &config);
        assert_eq!(
            manager.get_room("S1").unwrap().info().transcription_session_config,
            config
        );
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_session() {
        let manager = manager();
        let config = TranscriptionSessionConfig {
            provider_key: "azure".to_string(),
            ..TranscriptionSessionConfig::default()
        };
        let first = manager.get_or_create_room("S1", Some(config.clone()));
        assert_eq!(first.config(), &config);

        // Config is pinned at creation; a later call cannot change it.
        let second = manager.get_or_create_room("S1", None);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config(), &config);

        // Collection only runs on detach events; an explicitly created empty
        // room lists until then.
        assert_eq!(manager.list_rooms().len(), 1);
        manager.remove_room("S1");
        assert!(manager.get_room("S1").is_none());
    }

    #[tokio::test]
    async fn a_room_exists_iff_it_has_a_source_or_subscribers() {
        let manager = manager();

        // Subscriber-only room: exists, then collected on last departure.
        let sub = manager.add_subscriber("S1");
        assert!(manager.get_room("S1").is_some());
        manager.remove_subscriber(&sub.room);
        assert!(manager.get_room("S1").is_none());

        // Source-only room: exists, then collected on detach.
        let attach = manager.set_audio_source("S2").unwrap();
        assert!(manager.get_room("S2").is_some());
        manager.remove_audio_source(&attach.room);
        assert!(manager.get_room("S2").is_none());
    }

    #[tokio::test]
    async fn backend_client_exists_iff_source_is_attached() {
        let manager = manager();
        let sub = manager.add_subscriber("S1");
        assert!(!sub.room.has_source());
        assert!(!sub.room.transcription_connected());

        let attach = manager.set_audio_source("S1").unwrap();
        assert!(attach.room.has_source());

        manager.remove_audio_source(&attach.room);
        assert!(!attach.room.has_source());
        assert!(!attach.room.transcription_connected());
        // Still alive: a subscriber remains.
        assert!(manager.get_room("S1").is_some());

        manager.remove_subscriber(&sub.room);
        assert!(manager.get_room("S1").is_none());
    }

    #[tokio::test]
    async fn second_source_is_refused() {
        let manager = manager();
        let attach = manager.set_audio_source("S1").unwrap();
        assert!(manager.set_audio_source("S1").is_none());
        // The first attachment is unaffected.
        assert!(attach.room.has_source());
        manager.remove_audio_source(&attach.room);
    }

    #[tokio::test]
    async fn source_can_reattach_after_detach() {
        let manager = manager();
        let sub = manager.add_subscriber("S1");
        let first = manager.set_audio_source("S1").unwrap();
        manager.remove_audio_source(&first.room);
        assert!(manager.set_audio_source("S1").is_some());
        manager.remove_subscriber(&sub.room);
    }

    #[tokio::test]
    async fn double_detach_has_one_observable_effect() {
        let manager = manager();
        let attach = manager.set_audio_source("S1").unwrap();
        manager.remove_audio_source(&attach.room);
        // A late close event finds the room gone; nothing happens.
        manager.remove_audio_source(&attach.room);
        assert!(manager.get_room("S1").is_none());
    }

    #[tokio::test]
    async fn stale_handle_cannot_collect_a_recreated_room() {
        let manager = manager();
        let old = manager.add_subscriber("S1");
        manager.remove_subscriber(&old.room);
        assert!(manager.get_room("S1").is_none());

        // Same session id, new room, live subscriber.
        let fresh = manager.add_subscriber("S1");
        // A duplicate close event for the old subscription arrives late.
        manager.remove_subscriber(&old.room);
        assert!(manager.get_room("S1").is_some());
        assert_eq!(fresh.room.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn forward_audio_without_a_source_is_a_noop() {
        let manager = manager();
        manager.forward_audio("nope", Bytes::from_static(b"\x00"));

        let sub = manager.add_subscriber("S1");
        manager.forward_audio("S1", Bytes::from_static(b"\x00"));
        manager.remove_subscriber(&sub.room);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_in_order() {
        let manager = manager();
        let mut first = manager.add_subscriber("S1");
        let mut second = manager.add_subscriber("S1");
        let room = Arc::clone(&first.room);

        room.broadcast(&TranscriptMessage::IpTranscript(segments(&["hel"])));
        room.broadcast(&TranscriptMessage::IpTranscript(segments(&["hello"])));
        room.broadcast(&TranscriptMessage::FinalTranscript(segments(&["hello"])));

        for sub in [&mut first, &mut second] {
            let a = sub.transcripts.recv().await.unwrap();
            let b = sub.transcripts.recv().await.unwrap();
            let c = sub.transcripts.recv().await.unwrap();
            assert!(a.as_str().contains("ip_transcript") && a.as_str().contains("hel"));
            assert!(b.as_str().contains("hello"));
            assert!(c.as_str().contains("final_transcript"));
        }

        manager.remove_subscriber(&first.room);
        manager.remove_subscriber(&second.room);
    }

    #[tokio::test]
    async fn late_subscribers_see_no_history() {
        let manager = manager();
        let early = manager.add_subscriber("S1");
        early
            .room
            .broadcast(&TranscriptMessage::FinalTranscript(segments(&["gone"])));

        let mut late = manager.add_subscriber("S1");
        assert!(matches!(
            late.transcripts.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        manager.remove_subscriber(&early.room);
        manager.remove_subscriber(&late.room);
    }

    #[tokio::test]
    async fn remove_room_signals_every_attachment() {
        let manager = manager();
        let mut sub = manager.add_subscriber("S1");
        let mut attach = manager.set_audio_source("S1").unwrap();

        manager.remove_room("S1");
        assert!(manager.get_room("S1").is_none());

        sub.shutdown.changed().await.unwrap();
        assert!(*sub.shutdown.borrow());
        attach.shutdown.changed().await.unwrap();
        assert!(*attach.shutdown.borrow());
        assert!(!attach.room.has_source());

        // Idempotent.
        manager.remove_room("S1");
    }

    #[tokio::test]
    async fn list_rooms_reflects_membership() {
        let manager = manager();
        assert!(manager.list_rooms().is_empty());

        let sub = manager.add_subscriber("S1");
        let attach = manager.set_audio_source("S2").unwrap();

        let mut infos = manager.list_rooms();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].session_id, "S1");
        assert!(!infos[0].has_source);
        assert_eq!(infos[0].subscriber_count, 1);
        assert_eq!(infos[1].session_id, "S2");
        assert!(infos[1].has_source);
        assert_eq!(infos[1].subscriber_count, 0);

        manager.remove_subscriber(&sub.room);
        manager.remove_audio_source(&attach.room);
        assert!(manager.list_rooms().is_empty());
    }

    #[tokio::test]
    async fn shutdown_all_empties_the_map() {
        let manager = manager();
        let _s1 = manager.add_subscriber("S1");
        let _s2 = manager.add_subscriber("S2");
        let _a3 = manager.set_audio_source("S3").unwrap();

        manager.shutdown_all();
        assert!(manager.list_rooms().is_empty());
    }
}
