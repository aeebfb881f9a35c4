//! Content-addressed DAT index backed by SQLite.
//!
//! Pool setup and the pragma string follow `database.rs::establish_connection`;
//! the schema and incremental ingest algorithm follow
//! `dat_index_sqlite.py` (`DatIndexSqlite::_init_schema`/`_apply_pragmas`)
//! rather than a curated `system`/`game`/`rom`/`romfile` table set, since
//! this index is a content-addressed lookup table, not a library catalog.
//!
//! Sharding (optional, `config::ShardingConfig`) routes `rom_hashes` rows
//! to one of N sibling databases by a stable hash on the row's SHA-1 (or
//! CRC32 when SHA-1 is absent). A SHA-1 lookup goes straight to its shard;
//! a CRC+size lookup doesn't know which shard a row landed in ahead of
//! time, so it fans out to every shard in parallel via `JoinSet`.
//! `dat_files`/`game_names` stay in the primary pool regardless of
//! sharding — they're small, source-keyed metadata, not the
//! content-addressed rows sharding exists to spread out.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::task::JoinSet;

use crate::config::ShardingConfig;
use crate::dat_parser::ParsedDat;
use crate::error::{Result, RomSorterError};
use crate::index_lock::{self, IndexLockGuard};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone, FromRow)]
pub struct DatFileRow {
    pub dat_id: i64,
    pub source_path: String,
    pub mtime: i64,
    pub size_bytes: i64,
    pub content_hash: String,
    pub active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct RomMatch {
    pub dat_id: i64,
    pub platform_id: String,
    pub rom_name: String,
    pub set_name: String,
    pub crc32: Option<String>,
    pub sha1: Option<String>,
    pub md5: Option<String>,
    pub size_bytes: Option<i64>,
}

const ROM_MATCH_COLUMNS: &str =
    "dat_id, platform_id, rom_name, set_name, crc32, sha1, md5, size_bytes";

pub struct DatIndex {
    pool: SqlitePool,
    shards: Option<Vec<SqlitePool>>,
    _lock: Option<IndexLockGuard>,
}

impl DatIndex {
    /// Open (creating if absent) the index at `path`, applying pragmas and
    /// running migrations. Acquiring the companion lock is optional so
    /// read-only callers (identification during a scan) don't contend with
    /// each other for it; only ingest takes the lock.
    pub async fn open(path: &Path, sharding: &ShardingConfig) -> Result<Self> {
        let pool = open_pool(path).await?;
        let shards = open_shards(path, sharding).await?;
        Ok(Self { pool, shards, _lock: None })
    }

    /// Open the index for ingest: acquires the advisory lock and holds it
    /// until `self` is dropped.
    pub async fn open_for_ingest(
        path: &Path,
        lock_path: &Path,
        sharding: &ShardingConfig,
    ) -> Result<Self> {
        let lock = index_lock::acquire_index_lock(lock_path, path)?;
        let mut index = Self::open(path, sharding).await?;
        index._lock = Some(lock);
        Ok(index)
    }

    fn shard_pool(&self, key: &str) -> &SqlitePool {
        match &self.shards {
            Some(shards) if !shards.is_empty() => &shards[shard_for(key, shards.len())],
            _ => &self.pool,
        }
    }

    /// Ingest a parsed DAT under `source_path`, skipping re-insertion if
    /// its content hash and mtime are unchanged since the last ingest.
    /// `platform_id` is the caller's best guess at which catalog entry
    /// this DAT corresponds to (typically resolved from its header name).
    pub async fn ingest(
        &self,
        source_path: &Path,
        platform_id: &str,
        parsed: &ParsedDat,
    ) -> Result<IngestOutcome> {
        let metadata = std::fs::metadata(source_path).map_err(|e| RomSorterError::io(source_path, e))?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let size_bytes = metadata.len() as i64;
        let content_hash = hash_parsed_dat(parsed);
        let source_path_str = source_path.to_string_lossy().to_string();

        let existing = sqlx::query_as::<_, DatFileRow>(
            "SELECT dat_id, source_path, mtime, size_bytes, content_hash, active FROM dat_files WHERE source_path = ?",
        )
        .bind(&source_path_str)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = &existing {
            if row.content_hash == content_hash && row.mtime == mtime {
                return Ok(IngestOutcome::Unchanged { dat_id: row.dat_id });
            }
        }

        if let Some(row) = &existing {
            self.delete_shard_rows(row.dat_id).await?;
        }

        let mut tx = self.pool.begin().await?;

        let dat_id = if let Some(row) = existing {
            sqlx::query("DELETE FROM rom_hashes WHERE dat_id = ?")
                .bind(row.dat_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM game_names WHERE dat_id = ?")
                .bind(row.dat_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE dat_files SET mtime = ?, size_bytes = ?, content_hash = ?, active = 1 WHERE dat_id = ?",
            )
            .bind(mtime)
            .bind(size_bytes)
            .bind(&content_hash)
            .bind(row.dat_id)
            .execute(&mut *tx)
            .await?;
            row.dat_id
        } else {
            let result = sqlx::query(
                "INSERT INTO dat_files (source_path, mtime, size_bytes, content_hash, active) VALUES (?, ?, ?, ?, 1)",
            )
            .bind(&source_path_str)
            .bind(mtime)
            .bind(size_bytes)
            .bind(&content_hash)
            .execute(&mut *tx)
            .await?;
            result.last_insert_rowid()
        };

        for game in &parsed.games {
            sqlx::query("INSERT INTO game_names (dat_id, platform_id, game_name) VALUES (?, ?, ?)")
                .bind(dat_id)
                .bind(platform_id)
                .bind(&game.name)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        for game in &parsed.games {
            for rom in &game.roms {
                let routing_key = rom.sha1.as_deref().or(rom.crc.as_deref()).unwrap_or(&rom.name);
                let pool = self.shard_pool(routing_key);
                sqlx::query(&format!(
                    "INSERT INTO rom_hashes ({ROM_MATCH_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
                ))
                .bind(dat_id)
                .bind(platform_id)
                .bind(&rom.name)
                .bind(&game.name)
                .bind(&rom.crc)
                .bind(&rom.sha1)
                .bind(&rom.md5)
                .bind(rom.size.map(|s| s as i64))
                .execute(pool)
                .await?;
            }
        }

        Ok(IngestOutcome::Ingested { dat_id })
    }

    async fn delete_shard_rows(&self, dat_id: i64) -> Result<()> {
        let Some(shards) = &self.shards else {
            return Ok(());
        };
        for pool in shards {
            sqlx::query("DELETE FROM rom_hashes WHERE dat_id = ?")
                .bind(dat_id)
                .execute(pool)
                .await?;
        }
        Ok(())
    }

    /// Exact SHA-1 match. Authoritative: if this returns a hit, the item
    /// is considered identified even if a separate `lookup_crc_size` hit
    /// names a different `dat_id` (recorded as `DAT_CROSS_CHECK` evidence
    /// by the caller, not surfaced here).
    pub async fn lookup_sha1(&self, sha1_hex: &str) -> Result<Option<RomMatch>> {
        let sha1_hex = sha1_hex.to_lowercase();
        let pool = self.shard_pool(&sha1_hex);
        let row = sqlx::query_as::<_, RomMatch>(&format!(
            "SELECT {ROM_MATCH_COLUMNS} FROM rom_hashes WHERE sha1 = ? LIMIT 1"
        ))
        .bind(&sha1_hex)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// CRC32+size match, consulted when SHA-1 is absent from the DAT row
    /// (matches the original's `lookup_crc_size_when_sha1_missing`) or as
    /// a secondary cross-check when a SHA-1 hit already exists. When
    /// sharded, the row's shard can't be derived from CRC32 alone (rows
    /// with a SHA-1 were routed by it), so every shard is queried in
    /// parallel and the results concatenated.
    pub async fn lookup_crc_size(&self, crc32_hex: &str, size_bytes: u64) -> Result<Vec<RomMatch>> {
        let crc32_hex = crc32_hex.to_lowercase();
        let query = format!("SELECT {ROM_MATCH_COLUMNS} FROM rom_hashes WHERE crc32 = ? AND size_bytes = ?");

        let Some(shards) = &self.shards else {
            let rows = sqlx::query_as::<_, RomMatch>(&query)
                .bind(&crc32_hex)
                .bind(size_bytes as i64)
                .fetch_all(&self.pool)
                .await?;
            return Ok(rows);
        };

        let mut set = JoinSet::new();
        for pool in shards.clone() {
            let query = query.clone();
            let crc32_hex = crc32_hex.clone();
            set.spawn(async move {
                sqlx::query_as::<_, RomMatch>(&query)
                    .bind(crc32_hex)
                    .bind(size_bytes as i64)
                    .fetch_all(&pool)
                    .await
            });
        }

        let mut rows = Vec::new();
        while let Some(joined) = set.join_next().await {
            let fetched = joined
                .map_err(|e| RomSorterError::invalid_path(Path::new("dat shard"), e.to_string()))??;
            rows.extend(fetched);
        }
        Ok(rows)
    }

    pub async fn lookup_game_name(&self, platform_id: &str, game_name: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM game_names WHERE platform_id = ? AND game_name = ? LIMIT 1",
        )
        .bind(platform_id)
        .bind(game_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn active_dat_sources(&self) -> Result<Vec<PathBuf>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT source_path FROM dat_files WHERE active = 1")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(p,)| PathBuf::from(p)).collect())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn shard_count(&self) -> usize {
        self.shards.as_ref().map(|s| s.len()).unwrap_or(0)
    }
}

async fn open_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RomSorterError::io(parent, e))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .pragma("journal_mode", "WAL")
        .pragma("synchronous", "NORMAL")
        .pragma("temp_store", "MEMORY")
        .pragma("cache_size", "-20000")
        .pragma("mmap_size", "268435456")
        .pragma("wal_autocheckpoint", "1000")
        .pragma("journal_size_limit", "67108864")
        .pragma("busy_timeout", "3000");

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

async fn open_shards(path: &Path, sharding: &ShardingConfig) -> Result<Option<Vec<SqlitePool>>> {
    if !sharding.enabled || sharding.shard_count == 0 {
        return Ok(None);
    }
    let shard_dir = sharding
        .shard_dir
        .clone()
        .unwrap_or_else(|| path.parent().unwrap_or_else(|| Path::new(".")).join("shards"));
    std::fs::create_dir_all(&shard_dir).map_err(|e| RomSorterError::io(&shard_dir, e))?;

    let mut pools = Vec::with_capacity(sharding.shard_count);
    for i in 0..sharding.shard_count {
        let shard_path = shard_dir.join(format!("shard_{i:03}.sqlite"));
        pools.push(open_pool(&shard_path).await?);
    }
    Ok(Some(pools))
}

fn shard_for(key: &str, shard_count: usize) -> usize {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let n = u64::from_be_bytes(digest[0..8].try_into().unwrap());
    (n % shard_count as u64) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested { dat_id: i64 },
    Unchanged { dat_id: i64 },
}

fn hash_parsed_dat(parsed: &ParsedDat) -> String {
    let mut hasher = Sha1::new();
    hasher.update(parsed.header.name.as_bytes());
    for game in &parsed.games {
        hasher.update(game.name.as_bytes());
        for rom in &game.roms {
            hasher.update(rom.name.as_bytes());
            hasher.update(rom.crc.as_deref().unwrap_or("").as_bytes());
            hasher.update(rom.sha1.as_deref().unwrap_or("").as_bytes());
            if let Some(size) = rom.size {
                hasher.update(size.to_le_bytes());
            }
        }
    }
    format!("{:040x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dat_parser::{DatGame, DatHeader, DatRom};
    use tempfile::tempdir;

    fn sample_dat() -> ParsedDat {
        ParsedDat {
            header: DatHeader {
                name: "Test System".to_string(),
                ..Default::default()
            },
            games: vec![DatGame {
                name: "Super Game (USA)".to_string(),
                roms: vec![DatRom {
                    name: "Super Game (USA).nes".to_string(),
                    size: Some(131088),
                    crc: Some("abcd1234".to_string()),
                    sha1: Some("da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string()),
                    md5: None,
                }],
            }],
        }
    }

    #[tokio::test]
    async fn ingests_and_looks_up_by_sha1() {
        let dir = tempdir().unwrap();
        let index_path = dir.path().join("index.sqlite");
        let dat_path = dir.path().join("test.dat");
        std::fs::write(&dat_path, b"placeholder").unwrap();

        let index = DatIndex::open(&index_path, &ShardingConfig::default()).await.unwrap();
        let outcome = index.ingest(&dat_path, "nes", &sample_dat()).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Ingested { .. }));

        let hit = index
            .lookup_sha1("da39a3ee5e6b4b0d3255bfef95601890afd80709")
            .await
            .unwrap();
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().rom_name, "Super Game (USA).nes");
    }

    #[tokio::test]
    async fn reingest_of_unchanged_dat_is_skipped() {
        let dir = tempdir().unwrap();
        let index_path = dir.path().join("index.sqlite");
        let dat_path = dir.path().join("test.dat");
        std::fs::write(&dat_path, b"placeholder").unwrap();

        let index = DatIndex::open(&index_path, &ShardingConfig::default()).await.unwrap();
        let dat = sample_dat();
        index.ingest(&dat_path, "nes", &dat).await.unwrap();
        let second = index.ingest(&dat_path, "nes", &dat).await.unwrap();
        assert!(matches!(second, IngestOutcome::Unchanged { .. }));
    }

    #[tokio::test]
    async fn crc_size_lookup_finds_match_across_dats() {
        let dir = tempdir().unwrap();
        let index_path = dir.path().join("index.sqlite");
        let dat_path = dir.path().join("test.dat");
        std::fs::write(&dat_path, b"placeholder").unwrap();

        let index = DatIndex::open(&index_path, &ShardingConfig::default()).await.unwrap();
        index.ingest(&dat_path, "nes", &sample_dat()).await.unwrap();

        let hits = index.lookup_crc_size("abcd1234", 131088).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].platform_id, "nes");
    }

    #[tokio::test]
    async fn sharded_ingest_routes_lookups_to_the_right_shard() {
        let dir = tempdir().unwrap();
        let index_path = dir.path().join("index.sqlite");
        let dat_path = dir.path().join("test.dat");
        std::fs::write(&dat_path, b"placeholder").unwrap();

        let sharding = ShardingConfig {
            enabled: true,
            shard_count: 4,
            shard_dir: Some(dir.path().join("shards")),
        };
        let index = DatIndex::open(&index_path, &sharding).await.unwrap();
        assert_eq!(index.shard_count(), 4);
        index.ingest(&dat_path, "nes", &sample_dat()).await.unwrap();

        let hit = index
            .lookup_sha1("da39a3ee5e6b4b0d3255bfef95601890afd80709")
            .await
            .unwrap();
        assert!(hit.is_some());

        let hits = index.lookup_crc_size("abcd1234", 131088).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
