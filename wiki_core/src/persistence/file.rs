//! JSON-file repository: one file per record under a root directory.
//!
//! Layout per narrative (directory names are hex-encoded so any id is a safe
//! path component):
//!
//! ```text
//! <root>/<narrative>/entities/<entity-id>.json
//! <root>/<narrative>/articles/<article>/<snapshot-id>.json
//! <root>/<narrative>/summaries/<chapter>.json
//! <root>/<narrative>/committed.json
//! ```
//!
//! Every write goes to a temporary file in the target directory and is then
//! renamed into place, so readers never see a half-written record.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use story_bible::{ArticleId, ArticleSnapshot, Chapter, EntityRecord, NarrativeId};
use tempfile::NamedTempFile;
use tracing::warn;

use super::KnowledgeRepository;
use crate::context_window::ChapterSummary;
use crate::error::Result;

const COMMIT_MARKER: &str = "committed.json";

#[derive(Debug, Serialize, Deserialize)]
struct CommitMarker {
    chapter: Chapter,
}

#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    root: PathBuf,
}

impl JsonFileRepository {
    /// Open (creating if needed) a repository rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn narrative_dir(&self, narrative: &NarrativeId) -> PathBuf {
        self.root.join(encode_component(narrative.as_str()))
    }

    fn entities_dir(&self, narrative: &NarrativeId) -> PathBuf {
        self.narrative_dir(narrative).join("entities")
    }

    fn articles_dir(&self, narrative: &NarrativeId) -> PathBuf {
        self.narrative_dir(narrative).join("articles")
    }

    fn article_dir(&self, narrative: &NarrativeId, article_id: &ArticleId) -> PathBuf {
        self.articles_dir(narrative)
            .join(encode_component(article_id.as_str()))
    }

    fn summaries_dir(&self, narrative: &NarrativeId) -> PathBuf {
        self.narrative_dir(narrative).join("summaries")
    }
}

impl KnowledgeRepository for JsonFileRepository {
    fn load_entities(&self, narrative: &NarrativeId) -> Result<Vec<EntityRecord>> {
        read_all(&self.entities_dir(narrative))
    }

    fn save_entity(&mut self, narrative: &NarrativeId, record: &EntityRecord) -> Result<()> {
        let dir = self.entities_dir(narrative);
        write_atomic(&dir, &format!("{}.json", record.id), record)
    }

    fn list_articles(&self, narrative: &NarrativeId) -> Result<Vec<ArticleId>> {
        let entries = match fs::read_dir(self.articles_dir(narrative)) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(decode_component) {
                Some(id) => ids.push(ArticleId::new(id)),
                None => warn!(
                    directory = ?name,
                    "skipping article directory with undecodable name"
                ),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn load_snapshots(
        &self,
        narrative: &NarrativeId,
        article_id: &ArticleId,
    ) -> Result<Vec<ArticleSnapshot>> {
        read_all(&self.article_dir(narrative, article_id))
    }

    fn save_snapshot(
        &mut self,
        narrative: &NarrativeId,
        snapshot: &ArticleSnapshot,
    ) -> Result<()> {
        let dir = self.article_dir(narrative, &snapshot.article_id);
        let file_name = format!("{}.json", snapshot.id);
        if dir.join(&file_name).exists() {
            return Ok(());
        }
        write_atomic(&dir, &file_name, snapshot)
    }

    fn load_summaries(&self, narrative: &NarrativeId) -> Result<Vec<ChapterSummary>> {
        let mut summaries: Vec<ChapterSummary> = read_all(&self.summaries_dir(narrative))?;
        summaries.sort_by_key(|s| s.chapter());
        Ok(summaries)
    }

    fn save_summary(&mut self, narrative: &NarrativeId, summary: &ChapterSummary) -> Result<()> {
        let dir = self.summaries_dir(narrative);
        write_atomic(&dir, &format!("{:010}.json", summary.chapter()), summary)
    }

    fn load_last_committed(&self, narrative: &NarrativeId) -> Result<Option<Chapter>> {
        let path = self.narrative_dir(narrative).join(COMMIT_MARKER);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let marker: CommitMarker = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(marker.chapter))
    }

    fn save_last_committed(&mut self, narrative: &NarrativeId, chapter: Chapter) -> Result<()> {
        let dir = self.narrative_dir(narrative);
        write_atomic(&dir, COMMIT_MARKER, &CommitMarker { chapter })
    }
}

/// Hex-encode a string into a filesystem-safe path component.
fn encode_component(value: &str) -> String {
    value.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_component(encoded: &str) -> Option<String> {
    if encoded.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..encoded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(encoded.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// Deserialize every `.json` file in `dir`. A missing directory is empty.
fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut items = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        items.push(serde_json::from_reader(reader)?);
    }
    Ok(items)
}

fn write_atomic<T: Serialize>(dir: &Path, file_name: &str, value: &T) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(dir.join(file_name)).map_err(|err| err.error)?;
    Ok(())
}
