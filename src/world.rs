//! Collaborator interfaces the core calls out to, but never implements
//! (spec §6). Persistence and map data are a different system's problem;
//! these traits exist so handlers and the embedding application can hand
//! the core a concrete implementation without the core depending on it.

use async_trait::async_trait;

/// A single in-world cell. Left deliberately opaque here: what a cell
/// carries (terrain id, flags, whatever) is a map-format concern outside
/// this crate's scope.
pub type CellGrid = Vec<Vec<u32>>;

/// Player identity as far as persistence is concerned.
pub type PlayerId = u32;

/// Opaque player save data. The core moves this around without reading
/// its contents.
pub type PlayerRecord = Vec<u8>;

/// Opaque map identity, matching [`crate::manager::MapId`].
pub type MapRecord = Vec<u8>;

/// Loads and saves player state. Implemented by whatever the embedding
/// application uses for persistence (a database, a save-file format);
/// this crate only calls through the trait.
#[async_trait]
pub trait WorldRepository: Send + Sync {
    async fn load_player(&self, id: PlayerId) -> anyhow::Result<PlayerRecord>;
    async fn save_player(&self, id: PlayerId, record: &PlayerRecord) -> anyhow::Result<()>;
    async fn get_map(&self, map_id: crate::manager::MapId) -> anyhow::Result<MapRecord>;
}

/// Loads a map's cell grid from whatever on-disk format the embedding
/// application uses.
pub trait MapLoader: Send + Sync {
    fn load(&self, file: &std::path::Path) -> anyhow::Result<CellGrid>;
}
