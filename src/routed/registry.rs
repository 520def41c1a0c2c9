use std::{collections::HashMap, sync::Arc};

use crate::{
    remote_stream::{RemoteStream, RemoteTrack},
    track::MediaKind,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerEntry {
    pub producer_id: String,
    pub kind: MediaKind,
    pub track_id: String,
    pub paused: bool,
}

/// Local producers, at most one per kind.
#[derive(Debug, Default)]
pub struct ProducerRegistry {
    producers: HashMap<MediaKind, ProducerEntry>,
}

impl ProducerRegistry {
    pub fn insert(&mut self, entry: ProducerEntry) -> Option<ProducerEntry> {
        self.producers.insert(entry.kind, entry)
    }

    pub fn get(&self, kind: MediaKind) -> Option<&ProducerEntry> {
        self.producers.get(&kind)
    }

    pub fn get_mut(&mut self, kind: MediaKind) -> Option<&mut ProducerEntry> {
        self.producers.get_mut(&kind)
    }

    pub fn remove(&mut self, kind: MediaKind) -> Option<ProducerEntry> {
        self.producers.remove(&kind)
    }

    pub fn clear(&mut self) {
        self.producers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    pub consumer_id: String,
    pub producer_id: String,
    pub participant_id: String,
    pub kind: MediaKind,
    pub track: Arc<RemoteTrack>,
    pub paused: bool,
}

/// Remote tracks received through the router, keyed by consumer id.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, ConsumerEntry>,
}

impl ConsumerRegistry {
    pub fn insert(&mut self, entry: ConsumerEntry) {
        self.consumers.insert(entry.consumer_id.clone(), entry);
    }

    pub fn has_producer(&self, producer_id: &str) -> bool {
        self.consumers
            .values()
            .any(|entry| entry.producer_id == producer_id)
    }

    pub fn remove_by_producer(&mut self, producer_id: &str) -> Option<ConsumerEntry> {
        let consumer_id = self
            .consumers
            .values()
            .find(|entry| entry.producer_id == producer_id)
            .map(|entry| entry.consumer_id.clone())?;
        self.consumers.remove(&consumer_id)
    }

    pub fn remove_participant(&mut self, participant_id: &str) -> Vec<ConsumerEntry> {
        let ids: Vec<String> = self
            .consumers
            .values()
            .filter(|entry| entry.participant_id == participant_id)
            .map(|entry| entry.consumer_id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.consumers.remove(id))
            .collect()
    }

    pub fn audio_consumers_mut(&mut self) -> impl Iterator<Item = &mut ConsumerEntry> {
        self.consumers
            .values_mut()
            .filter(|entry| entry.kind == MediaKind::Audio)
    }

    pub fn values(&self) -> impl Iterator<Item = &ConsumerEntry> {
        self.consumers.values()
    }

    pub fn participants(&self) -> Vec<String> {
        let mut participants: Vec<String> = self
            .consumers
            .values()
            .map(|entry| entry.participant_id.clone())
            .collect();
        participants.sort();
        participants.dedup();
        participants
    }

    pub fn drain(&mut self) -> Vec<ConsumerEntry> {
        self.consumers.drain().map(|(_, entry)| entry).collect()
    }

    /// One stream holding every track consumed from `participant_id`, audio first.
    pub fn compose(&self, participant_id: &str) -> Option<RemoteStream> {
        let mut entries: Vec<&ConsumerEntry> = self
            .consumers
            .values()
            .filter(|entry| entry.participant_id == participant_id)
            .collect();
        if entries.is_empty() {
            return None;
        }
        entries.sort_by(|a, b| {
            (a.kind != MediaKind::Audio, &a.consumer_id)
                .cmp(&(b.kind != MediaKind::Audio, &b.consumer_id))
        });
        let mut stream = RemoteStream::new(participant_id.to_string());
        for entry in entries {
            stream.add_track(entry.track.clone());
        }
        Some(stream)
    }
}
