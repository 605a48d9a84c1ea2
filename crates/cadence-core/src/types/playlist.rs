//! The active playlist and its playback position.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use serde::{Deserialize, Serialize};

use super::Track;

/// Outcome of moving backwards through the playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retreat {
    /// The position moved to the previous track.
    Moved,
    /// Already on the first track; the caller should rewind it instead.
    AtStart,
}

/// Ordered tracks plus the index of the one being played.
///
/// The position may sit one past the last track, which marks the playlist
/// as exhausted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Playlist {
    tracks: Vec<Track>,
    position: usize,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tracks(tracks: Vec<Track>) -> Self {
        Self {
            tracks,
            position: 0,
        }
    }

    /// Get all tracks.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Index of the current track (equal to `len()` once exhausted).
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Get the current track.
    pub fn current(&self) -> Option<&Track> {
        self.tracks.get(self.position)
    }

    /// Whether the position points at a track.
    pub fn has_current(&self) -> bool {
        self.position < self.tracks.len()
    }

    /// Index of the track after the current one, if there is one.
    pub fn next_index(&self) -> Option<usize> {
        let next = self.position + 1;
        (next < self.tracks.len()).then_some(next)
    }

    /// Add a track to the end.
    pub fn push(&mut self, track: Track) {
        self.tracks.push(track);
    }

    /// Move to the next track. Returns the new current track, or `None`
    /// once the playlist is exhausted.
    pub fn advance(&mut self) -> Option<&Track> {
        if self.position < self.tracks.len() {
            self.position += 1;
        }
        self.current()
    }

    /// Move to the previous track.
    pub fn retreat(&mut self) -> Retreat {
        if self.position == 0 {
            return Retreat::AtStart;
        }
        self.position = self.position.min(self.tracks.len()) - 1;
        Retreat::Moved
    }

    /// Jump to a specific index.
    pub fn jump_to(&mut self, index: usize) -> Option<&Track> {
        if index < self.tracks.len() {
            self.position = index;
            self.tracks.get(index)
        } else {
            None
        }
    }

    /// Back to the first track.
    pub fn rewind(&mut self) {
        self.position = 0;
    }
}
