//! NZB index builder (C8, §4.8): in-memory accumulation of posted-article
//! metadata, grouped by original filename, finalized to an NZB file on disk
//! when the owning job completes.

use crate::config::{NzbCompressionConfig, NzbCompressionType};
use crate::error::Result;
use crate::types::Article;
use std::io::Write;
use std::path::{Path, PathBuf};

struct FileEntry {
    original_name: String,
    subject: String,
    poster: String,
    date: chrono::DateTime<chrono::Utc>,
    groups: Vec<String>,
    segments: Vec<(u32, u64, String)>,
    content_hash: Option<String>,
}

/// Accumulates posted-article metadata for one job. Consumed once, at job
/// completion, to produce a single NZB file.
#[derive(Default)]
pub struct NzbAccumulator {
    files: Vec<FileEntry>,
    index_by_name: std::collections::HashMap<String, usize>,
}

impl NzbAccumulator {
    /// Construct an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one posted article under its original file's group. The
    /// file's `<file>` element inherits subject/poster/date from the first
    /// article recorded for it.
    pub fn add_article(&mut self, article: &Article) {
        let idx = match self.index_by_name.get(&article.original_name) {
            Some(&idx) => idx,
            None => {
                let idx = self.files.len();
                self.files.push(FileEntry {
                    original_name: article.original_name.clone(),
                    subject: article.subject.clone(),
                    poster: article.from.clone(),
                    date: article.date,
                    groups: article.newsgroups.clone(),
                    segments: Vec::new(),
                    content_hash: None,
                });
                self.index_by_name.insert(article.original_name.clone(), idx);
                idx
            }
        };

        let entry = &mut self.files[idx];
        entry.segments.push((
            article.part_number,
            article.part_size,
            article.message_id.trim_start_matches('<').trim_end_matches('>').to_string(),
        ));
        for group in &article.newsgroups {
            if !entry.groups.contains(group) {
                entry.groups.push(group.clone());
            }
        }
    }

    /// Record the aggregate `sha256(concat(article_hashes))` for a file,
    /// computed once every article of that file has posted (§4.5.2 step 5).
    /// Not part of the NZB wire format; retained for caller inspection.
    pub fn add_file_hash(&mut self, original_name: &str, hash: String) {
        if let Some(&idx) = self.index_by_name.get(original_name) {
            self.files[idx].content_hash = Some(hash);
        }
    }

    /// The aggregate content hash recorded for `original_name`, if any.
    pub fn file_hash(&self, original_name: &str) -> Option<&str> {
        self.index_by_name
            .get(original_name)
            .and_then(|&idx| self.files[idx].content_hash.as_deref())
    }

    /// Number of distinct files accumulated so far.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Serialize the accumulated files to `{output_dir}/{basename}.nzb`
    /// (optionally compressed per `compression`), grouping articles by
    /// original filename and ordering each group's segments by part number
    /// ascending. Returns the absolute path written.
    pub fn finalize(
        &self,
        output_dir: &Path,
        basename: &str,
        compression: &NzbCompressionConfig,
    ) -> Result<PathBuf> {
        let xml = self.render_xml();

        let extension = match (compression.enabled, compression.r#type) {
            (true, NzbCompressionType::Zstd) => "nzb.zst",
            (true, NzbCompressionType::Brotli) => "nzb.br",
            _ => "nzb",
        };
        let path = output_dir.join(format!("{basename}.{extension}"));

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match (compression.enabled, compression.r#type) {
            (true, NzbCompressionType::Zstd) => {
                let encoded = zstd::encode_all(xml.as_bytes(), compression.level)?;
                std::fs::write(&path, encoded)?;
            }
            (true, NzbCompressionType::Brotli) => {
                let mut out = Vec::new();
                {
                    let quality = compression.level.clamp(0, 11) as u32;
                    let mut writer = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
                    writer.write_all(xml.as_bytes())?;
                }
                std::fs::write(&path, out)?;
            }
            _ => {
                std::fs::write(&path, xml.as_bytes())?;
            }
        }

        Ok(path)
    }

    fn render_xml(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n");
        out.push_str(
            "<!DOCTYPE nzb PUBLIC \"-//newzBin//DTD NZB 1.1//EN\" \"http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd\">\r\n",
        );
        out.push_str("<nzb xmlns=\"http://www.newzbin.com/DTD/2003/nzb\">\r\n");

        for entry in &self.files {
            let mut segments = entry.segments.clone();
            segments.sort_by_key(|(part_number, _, _)| *part_number);

            out.push_str(&format!(
                "  <file poster=\"{}\" date=\"{}\" subject=\"{}\">\r\n",
                escape_xml(&entry.poster),
                entry.date.timestamp(),
                escape_xml(&entry.subject),
            ));
            out.push_str("    <groups>\r\n");
            for group in &entry.groups {
                out.push_str(&format!("      <group>{}</group>\r\n", escape_xml(group)));
            }
            out.push_str("    </groups>\r\n");
            out.push_str("    <segments>\r\n");
            for (part_number, bytes, message_id) in &segments {
                out.push_str(&format!(
                    "      <segment bytes=\"{bytes}\" number=\"{part_number}\">{}</segment>\r\n",
                    escape_xml(message_id)
                ));
            }
            out.push_str("    </segments>\r\n");
            out.push_str("  </file>\r\n");
        }

        out.push_str("</nzb>\r\n");
        out
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartType;
    use std::collections::HashMap as StdHashMap;

    fn article(original_name: &str, part_number: u32, message_id: &str) -> Article {
        Article {
            message_id: message_id.to_string(),
            subject: format!("[1/1] \"{original_name}\" - yEnc ({part_number}/3)"),
            from: "poster@example.com".to_string(),
            newsgroups: vec!["alt.binaries.test".to_string()],
            part_number,
            total_parts: 3,
            file_name: original_name.to_string(),
            original_name: original_name.to_string(),
            file_size: 2_250_000,
            offset: (part_number as u64 - 1) * 750_000,
            part_size: 750_000,
            date: chrono::Utc::now(),
            x_nxg: None,
            custom_headers: StdHashMap::new(),
            content_hash: None,
            part_type: PartType::Data,
        }
    }

    #[test]
    fn groups_segments_by_file_ordered_by_part_number() {
        let mut acc = NzbAccumulator::new();
        acc.add_article(&article("movie.mkv", 2, "<b@x>"));
        acc.add_article(&article("movie.mkv", 1, "<a@x>"));
        acc.add_article(&article("movie.mkv", 3, "<c@x>"));

        let xml = acc.render_xml();
        let a_pos = xml.find("a@x").unwrap();
        let b_pos = xml.find("b@x").unwrap();
        let c_pos = xml.find("c@x").unwrap();
        assert!(a_pos < b_pos && b_pos < c_pos);
        assert_eq!(acc.file_count(), 1);
    }

    #[test]
    fn finalize_writes_readable_nzb_file() {
        let mut acc = NzbAccumulator::new();
        acc.add_article(&article("movie.mkv", 1, "<a@x>"));
        acc.add_file_hash("movie.mkv", "deadbeef".to_string());

        let dir = tempfile::tempdir().unwrap();
        let cfg = NzbCompressionConfig::default();
        let path = acc.finalize(dir.path(), "movie", &cfg).unwrap();
        assert_eq!(path.extension().unwrap(), "nzb");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("<segment bytes=\"750000\" number=\"1\">a@x</segment>"));
        assert_eq!(acc.file_hash("movie.mkv"), Some("deadbeef"));
    }

    #[test]
    fn finalize_with_zstd_compression_uses_zst_extension() {
        let mut acc = NzbAccumulator::new();
        acc.add_article(&article("movie.mkv", 1, "<a@x>"));

        let dir = tempfile::tempdir().unwrap();
        let cfg = NzbCompressionConfig {
            enabled: true,
            r#type: NzbCompressionType::Zstd,
            level: 3,
        };
        let path = acc.finalize(dir.path(), "movie", &cfg).unwrap();
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "movie.nzb.zst");
        let compressed = std::fs::read(&path).unwrap();
        let decoded = zstd::decode_all(compressed.as_slice()).unwrap();
        assert!(String::from_utf8(decoded).unwrap().contains("a@x"));
    }
}
