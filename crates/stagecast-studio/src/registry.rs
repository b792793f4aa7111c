//! Authoritative set of participants: the host plus up to four guest slots.
//!
//! The registry performs no I/O. It stores connection *indices* into the
//! connection manager's arena, never the connections themselves.

use stagecast_common::{Error, Result};
use stagecast_media::{AudioTap, MediaSource, VideoTrack};
use tracing::debug;

use crate::ids::{ConnectionId, GuestSlot, ParticipantId, MAX_GUESTS};

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_id: String,
    pub connection: Option<ConnectionId>,
    pub media: Option<MediaSource>,
    /// Decayed visual level in 0..=100.
    pub audio_level: f32,
    pub speaking: bool,
}

impl Participant {
    fn new(id: ParticipantId, display_id: String) -> Self {
        Self {
            id,
            display_id,
            connection: None,
            media: None,
            audio_level: 0.0,
            speaking: false,
        }
    }

    pub fn video(&self) -> Option<&VideoTrack> {
        self.media.as_ref().and_then(|m| m.video.as_ref())
    }

    pub fn audio(&self) -> Option<&AudioTap> {
        self.media.as_ref().and_then(|m| m.audio.as_ref())
    }

    fn media_mut(&mut self) -> &mut MediaSource {
        let id = self.id.to_string();
        self.media.get_or_insert_with(|| MediaSource::new(id))
    }
}

#[derive(Debug, Clone, Default)]
enum SlotState {
    #[default]
    Vacant,
    Occupied(Participant),
    /// Participant moved out; its connection and media are being released.
    Releasing,
}

#[derive(Debug)]
pub struct Registry {
    host: Participant,
    guests: [SlotState; MAX_GUESTS],
    active_speaker: Option<ParticipantId>,
}

impl Registry {
    pub fn new(host_display_id: impl Into<String>) -> Self {
        Self {
            host: Participant::new(ParticipantId::Host, host_display_id.into()),
            guests: Default::default(),
            active_speaker: None,
        }
    }

    /// Fails with `DuplicateSlot` when the slot is occupied or still releasing.
    pub fn ensure_vacant(&self, slot: GuestSlot) -> Result<()> {
        match self.guests[slot.index()] {
            SlotState::Vacant => Ok(()),
            _ => Err(Error::DuplicateSlot(slot.get())),
        }
    }

    pub fn first_vacant(&self) -> Option<GuestSlot> {
        GuestSlot::ALL
            .into_iter()
            .find(|slot| matches!(self.guests[slot.index()], SlotState::Vacant))
    }

    pub fn add_guest(&mut self, slot: GuestSlot, display_id: &str) -> Result<&Participant> {
        if display_id.trim().is_empty() {
            return Err(Error::invalid("guest display id must not be empty"));
        }
        self.ensure_vacant(slot)?;

        let id = ParticipantId::Guest(slot);
        debug!("registry: {} joined as '{}'", id, display_id);
        let state = &mut self.guests[slot.index()];
        *state = SlotState::Occupied(Participant::new(id, display_id.to_string()));
        match state {
            SlotState::Occupied(p) => Ok(p),
            _ => Err(Error::not_found(id)),
        }
    }

    /// Move the participant out of its slot and mark the slot releasing.
    /// Returns `None` when the slot is vacant or already releasing.
    pub fn begin_removal(&mut self, slot: GuestSlot) -> Option<Participant> {
        let state = &mut self.guests[slot.index()];
        let SlotState::Occupied(_) = state else {
            return None;
        };
        let SlotState::Occupied(participant) = std::mem::replace(state, SlotState::Releasing)
        else {
            return None;
        };
        if self.active_speaker == Some(participant.id) {
            self.active_speaker = None;
        }
        debug!("registry: releasing {}", participant.id);
        Some(participant)
    }

    /// Free a slot whose participant handles have been released.
    pub fn finish_removal(&mut self, slot: GuestSlot) {
        let state = &mut self.guests[slot.index()];
        if matches!(state, SlotState::Releasing) {
            *state = SlotState::Vacant;
            debug!("registry: slot {} is free", slot);
        }
    }

    pub fn is_releasing(&self, slot: GuestSlot) -> bool {
        matches!(self.guests[slot.index()], SlotState::Releasing)
    }

    pub fn get(&self, id: ParticipantId) -> Option<&Participant> {
        match id {
            ParticipantId::Host => Some(&self.host),
            ParticipantId::Guest(slot) => match &self.guests[slot.index()] {
                SlotState::Occupied(p) => Some(p),
                _ => None,
            },
        }
    }

    pub fn get_mut(&mut self, id: ParticipantId) -> Option<&mut Participant> {
        match id {
            ParticipantId::Host => Some(&mut self.host),
            ParticipantId::Guest(slot) => match &mut self.guests[slot.index()] {
                SlotState::Occupied(p) => Some(p),
                _ => None,
            },
        }
    }

    pub fn host(&self) -> &Participant {
        &self.host
    }

    /// Occupied guests in slot order.
    pub fn guests(&self) -> impl Iterator<Item = &Participant> {
        self.guests.iter().filter_map(|state| match state {
            SlotState::Occupied(p) => Some(p),
            _ => None,
        })
    }

    /// Host followed by every guest, in canonical order.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        std::iter::once(&self.host).chain(self.guests())
    }

    pub fn guest_count(&self) -> usize {
        self.guests().count()
    }

    /// Participants including the host.
    pub fn len(&self) -> usize {
        1 + self.guest_count()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn set_host_media(&mut self, media: Option<MediaSource>) -> Option<MediaSource> {
        std::mem::replace(&mut self.host.media, media)
    }

    pub fn attach_video(&mut self, id: ParticipantId, track: VideoTrack) -> Result<()> {
        let participant = self
            .get_mut(id)
            .ok_or_else(|| Error::not_found(id))?;
        participant.media_mut().video = Some(track);
        Ok(())
    }

    pub fn attach_audio(&mut self, id: ParticipantId, tap: AudioTap) -> Result<()> {
        let participant = self
            .get_mut(id)
            .ok_or_else(|| Error::not_found(id))?;
        participant.media_mut().audio = Some(tap);
        Ok(())
    }

    pub fn set_connection(&mut self, slot: GuestSlot, connection: Option<ConnectionId>) -> Result<()> {
        let participant = self
            .get_mut(ParticipantId::Guest(slot))
            .ok_or_else(|| Error::not_found(ParticipantId::Guest(slot)))?;
        participant.connection = connection;
        Ok(())
    }

    pub fn set_level(&mut self, id: ParticipantId, level: f32, speaking: bool) {
        if let Some(participant) = self.get_mut(id) {
            participant.audio_level = level;
            participant.speaking = speaking;
        }
    }

    pub fn active_speaker(&self) -> Option<ParticipantId> {
        self.active_speaker
    }

    pub fn set_active_speaker(&mut self, id: Option<ParticipantId>) {
        self.active_speaker = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(n: u8) -> GuestSlot {
        GuestSlot::new(n).unwrap()
    }

    #[test]
    fn test_add_and_get() {
        let mut registry = Registry::new("studio");
        assert_eq!(registry.len(), 1);

        let p = registry.add_guest(slot(2), "alice").unwrap();
        assert_eq!(p.id.to_string(), "guest-2");
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get(ParticipantId::Guest(slot(2))).unwrap().display_id,
            "alice"
        );
        assert!(registry.get(ParticipantId::Guest(slot(1))).is_none());
        assert_eq!(registry.first_vacant(), Some(slot(1)));
    }

    #[test]
    fn test_rejects_duplicate_and_empty() {
        let mut registry = Registry::new("studio");
        registry.add_guest(slot(1), "alice").unwrap();
        assert!(matches!(
            registry.add_guest(slot(1), "bob"),
            Err(Error::DuplicateSlot(1))
        ));
        assert!(matches!(
            registry.add_guest(slot(3), "  "),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(registry.guest_count(), 1);
    }

    #[test]
    fn test_releasing_slot_is_not_reusable() {
        let mut registry = Registry::new("studio");
        registry.add_guest(slot(1), "alice").unwrap();
        registry.set_connection(slot(1), Some(ConnectionId(0))).unwrap();

        let removed = registry.begin_removal(slot(1)).unwrap();
        assert_eq!(removed.connection, Some(ConnectionId(0)));
        assert!(registry.is_releasing(slot(1)));
        assert!(matches!(
            registry.add_guest(slot(1), "bob"),
            Err(Error::DuplicateSlot(1))
        ));
        assert!(registry.begin_removal(slot(1)).is_none());

        registry.finish_removal(slot(1));
        registry.add_guest(slot(1), "bob").unwrap();
    }

    #[test]
    fn test_remove_vacant_is_noop() {
        let mut registry = Registry::new("studio");
        assert!(registry.begin_removal(slot(4)).is_none());
        registry.finish_removal(slot(4));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_removal_clears_active_speaker() {
        let mut registry = Registry::new("studio");
        registry.add_guest(slot(3), "carol").unwrap();
        registry.set_active_speaker(Some(ParticipantId::Guest(slot(3))));
        registry.begin_removal(slot(3));
        assert_eq!(registry.active_speaker(), None);
    }

    #[test]
    fn test_attach_media_merges_tracks() {
        let mut registry = Registry::new("studio");
        let id = ParticipantId::Guest(slot(1));
        assert!(registry.attach_video(id, VideoTrack::new("v")).is_err());

        registry.add_guest(slot(1), "alice").unwrap();
        registry.attach_video(id, VideoTrack::new("v")).unwrap();
        registry.attach_audio(id, AudioTap::new("a")).unwrap();
        let p = registry.get(id).unwrap();
        assert!(p.video().is_some());
        assert!(p.audio().is_some());
    }

    #[test]
    fn test_guests_in_slot_order() {
        let mut registry = Registry::new("studio");
        registry.add_guest(slot(4), "d").unwrap();
        registry.add_guest(slot(2), "b").unwrap();
        let order: Vec<_> = registry.participants().map(|p| p.id.to_string()).collect();
        assert_eq!(order, ["host", "guest-2", "guest-4"]);
    }
}
