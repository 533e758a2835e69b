use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use ulid::Ulid;

use crate::model::RoomInfo;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("reading catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("room {0} listed twice")]
    DuplicateRoom(Ulid),
    #[error("room {0} has a negative nightly rate")]
    NegativeRate(Ulid),
}

/// Read side of the room/hotel catalog. The engine never writes to it.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_room(&self, id: Ulid) -> Option<RoomInfo>;
    async fn list_rooms(&self) -> Vec<RoomInfo>;
}

#[derive(Deserialize)]
struct CatalogFile {
    rooms: Vec<RoomInfo>,
}

/// Catalog held in memory, seeded from a JSON file or by hand.
#[derive(Default)]
pub struct InMemoryCatalog {
    rooms: DashMap<Ulid, RoomInfo>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{"rooms": [...]}`. Prices are decimal strings, e.g. `"120.00"`.
    pub fn load_json(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(raw)?;
        let catalog = Self::new();
        for room in file.rooms {
            let id = room.id;
            if room.price_per_night.is_sign_negative() {
                return Err(CatalogError::NegativeRate(id));
            }
            if catalog.rooms.insert(id, room).is_some() {
                return Err(CatalogError::DuplicateRoom(id));
            }
        }
        Ok(catalog)
    }

    pub fn insert_room(&self, room: RoomInfo) {
        self.rooms.insert(room.id, room);
    }

    /// Flip a room's bookable flag. Returns false for unknown rooms.
    pub fn set_available(&self, id: Ulid, available: bool) -> bool {
        match self.rooms.get_mut(&id) {
            Some(mut room) => {
                room.is_available = available;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn get_room(&self, id: Ulid) -> Option<RoomInfo> {
        self.rooms.get(&id).map(|r| r.value().clone())
    }

    async fn list_rooms(&self) -> Vec<RoomInfo> {
        self.rooms.iter().map(|r| r.value().clone()).collect()
    }
}
