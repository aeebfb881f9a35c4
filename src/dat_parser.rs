//! DAT catalog parsing: Logiqx XML and ClrMamePro text, including entries
//! embedded inside `.zip` containers.
//!
//! Logiqx parsing follows `model.rs`'s XML structs
//! (`DatfileXml`/`SystemXml`/`GameXml`/`RomXml`) and `import_dats.rs`'s use
//! of `quick_xml::de::from_str`. ClrMamePro text has no XML counterpart to
//! crib from, so the tokenizer below is hand-rolled, covering the same
//! field set the XML structs already model. Zip-embedded DAT discovery
//! reuses the `zip` crate the way `import_roms.rs` walks archive entries.

use std::io::Read;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

use crate::error::{Result, RomSorterError};
use crate::path_safety;

#[derive(Debug, Clone, Default)]
pub struct DatHeader {
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub author: Option<String>,
    pub homepage: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatRom {
    pub name: String,
    pub size: Option<u64>,
    pub crc: Option<String>,
    pub sha1: Option<String>,
    pub md5: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatGame {
    pub name: String,
    pub roms: Vec<DatRom>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedDat {
    pub header: DatHeader,
    pub games: Vec<DatGame>,
}

#[derive(Debug, Deserialize)]
struct DatafileXml {
    header: Option<HeaderXml>,
    #[serde(rename = "game", default)]
    games: Vec<GameXml>,
}

#[derive(Debug, Deserialize)]
struct HeaderXml {
    name: Option<String>,
    description: Option<String>,
    version: Option<String>,
    author: Option<String>,
    homepage: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GameXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "rom", default)]
    roms: Vec<RomXml>,
}

#[derive(Debug, Deserialize)]
struct RomXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@size")]
    size: Option<u64>,
    #[serde(rename = "@crc")]
    crc: Option<String>,
    #[serde(rename = "@sha1")]
    sha1: Option<String>,
    #[serde(rename = "@md5")]
    md5: Option<String>,
}

/// Parse a DAT file from disk, dispatching on extension/content: `.zip`
/// containers are searched for `.dat`/`.xml` members, everything else is
/// sniffed as Logiqx XML or ClrMamePro text.
pub fn parse_dat_file(path: &Path) -> Result<Vec<ParsedDat>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    if extension.as_deref() == Some("zip") {
        return parse_zip_dat(path);
    }

    let bytes = std::fs::read(path).map_err(|e| RomSorterError::io(path, e))?;
    Ok(vec![parse_dat_bytes(&bytes, path)?])
}

/// Find `.dat`/`.xml` members inside a zip and parse each. Member names
/// are validated through `path_safety` before being surfaced anywhere.
pub fn parse_zip_dat(path: &Path) -> Result<Vec<ParsedDat>> {
    let file = std::fs::File::open(path).map_err(|e| RomSorterError::io(path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| RomSorterError::DatParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut parsed = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| RomSorterError::DatParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let name = entry.name().to_string();
        path_safety::validate_archive_member_name(&name)?;

        let lower = name.to_lowercase();
        if !(lower.ends_with(".dat") || lower.ends_with(".xml")) {
            continue;
        }

        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|e| RomSorterError::io(path, e))?;
        parsed.push(parse_dat_bytes(&buf, path)?);
    }

    if parsed.is_empty() {
        return Err(RomSorterError::DatParse {
            path: path.to_path_buf(),
            reason: "zip contains no .dat/.xml members".to_string(),
        });
    }
    Ok(parsed)
}

pub fn parse_dat_bytes(bytes: &[u8], path: &Path) -> Result<ParsedDat> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_start();
    if trimmed.starts_with('<') {
        parse_logiqx_xml(&text, path)
    } else {
        parse_clrmamepro_text(&text, path)
    }
}

fn parse_logiqx_xml(text: &str, path: &Path) -> Result<ParsedDat> {
    let datafile: DatafileXml = quick_xml::de::from_str(text).map_err(|e| RomSorterError::DatParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let header = datafile
        .header
        .map(|h| DatHeader {
            name: h.name.unwrap_or_default(),
            description: h.description,
            version: h.version,
            author: h.author,
            homepage: h.homepage,
            url: h.url,
        })
        .unwrap_or_default();

    let games = datafile
        .games
        .into_iter()
        .map(|g| DatGame {
            name: g.name,
            roms: g
                .roms
                .into_iter()
                .map(|r| DatRom {
                    name: r.name,
                    size: r.size,
                    crc: r.crc.map(|c| c.to_lowercase()),
                    sha1: r.sha1.map(|s| s.to_lowercase()),
                    md5: r.md5.map(|m| m.to_lowercase()),
                })
                .collect(),
        })
        .collect();

    Ok(ParsedDat { header, games })
}

lazy_static! {
    static ref QUOTED_FIELD: Regex = Regex::new(r#"(?m)^\s*(\w+)\s+"([^"]*)"\s*$"#).unwrap();
    static ref ROM_LINE: Regex = Regex::new(
        r#"(?m)^\s*rom\s*\(\s*name\s+"([^"]*)"(?:\s+size\s+(\d+))?(?:\s+crc\s+([0-9a-fA-F]+))?(?:\s+sha1\s+([0-9a-fA-F]+))?(?:\s+md5\s+([0-9a-fA-F]+))?.*\)\s*$"#
    ).unwrap();
}

/// Parse a ClrMamePro-format text DAT. These files are a sequence of
/// `keyword ( key "value" ... )` blocks; we split on balanced parens at
/// the top level, then pull fields out of each block with regexes rather
/// than a full grammar, matching the flat, line-oriented nature of the
/// format.
fn parse_clrmamepro_text(text: &str, path: &Path) -> Result<ParsedDat> {
    let blocks = split_top_level_blocks(text, path)?;

    let mut header = DatHeader::default();
    let mut games = Vec::new();

    for (keyword, body) in blocks {
        match keyword.as_str() {
            "clrmamepro" | "header" => {
                header = parse_header_block(&body);
            }
            "game" | "machine" => {
                games.push(parse_game_block(&body)?);
            }
            _ => {}
        }
    }

    if games.is_empty() && header.name.is_empty() {
        return Err(RomSorterError::DatParse {
            path: path.to_path_buf(),
            reason: "no recognizable clrmamepro blocks found".to_string(),
        });
    }

    Ok(ParsedDat { header, games })
}

fn split_top_level_blocks(text: &str, path: &Path) -> Result<Vec<(String, String)>> {
    let mut blocks = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }
        let start = i;
        while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
            i += 1;
        }
        let keyword: String = chars[start..i].iter().collect();
        if keyword.is_empty() {
            i += 1;
            continue;
        }
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() || chars[i] != '(' {
            continue;
        }
        let body_start = i + 1;
        let mut depth = 1;
        i += 1;
        while i < chars.len() && depth > 0 {
            match chars[i] {
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
            i += 1;
        }
        if depth != 0 {
            return Err(RomSorterError::DatParse {
                path: path.to_path_buf(),
                reason: format!("unbalanced parentheses in {keyword} block"),
            });
        }
        let body_end = i - 1;
        let body: String = chars[body_start..body_end].iter().collect();
        blocks.push((keyword, body));
    }

    Ok(blocks)
}

fn parse_header_block(body: &str) -> DatHeader {
    let mut header = DatHeader::default();
    for cap in QUOTED_FIELD.captures_iter(body) {
        let key = &cap[1];
        let value = cap[2].to_string();
        match key {
            "name" => header.name = value,
            "description" => header.description = Some(value),
            "version" => header.version = Some(value),
            "author" => header.author = Some(value),
            "homepage" => header.homepage = Some(value),
            "url" => header.url = Some(value),
            _ => {}
        }
    }
    header
}

fn parse_game_block(body: &str) -> Result<DatGame> {
    let name = QUOTED_FIELD
        .captures_iter(body)
        .find(|cap| &cap[1] == "name")
        .map(|cap| cap[2].to_string())
        .unwrap_or_default();

    let roms = ROM_LINE
        .captures_iter(body)
        .map(|cap| DatRom {
            name: cap[1].to_string(),
            size: cap.get(2).and_then(|m| m.as_str().parse().ok()),
            crc: cap.get(3).map(|m| m.as_str().to_lowercase()),
            sha1: cap.get(4).map(|m| m.as_str().to_lowercase()),
            md5: cap.get(5).map(|m| m.as_str().to_lowercase()),
        })
        .collect();

    Ok(DatGame { name, roms })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_logiqx_xml() {
        let xml = r#"<?xml version="1.0"?>
<datafile>
  <header>
    <name>Test System</name>
    <description>Test DAT</description>
  </header>
  <game name="Super Game (USA)">
    <rom name="Super Game (USA).nes" size="131088" crc="ABCD1234" sha1="DA39A3EE5E6B4B0D3255BFEF95601890AFD80709"/>
  </game>
</datafile>"#;
        let dat = parse_dat_bytes(xml.as_bytes(), Path::new("test.dat")).unwrap();
        assert_eq!(dat.header.name, "Test System");
        assert_eq!(dat.games.len(), 1);
        assert_eq!(dat.games[0].roms[0].crc.as_deref(), Some("abcd1234"));
        assert_eq!(dat.games[0].roms[0].size, Some(131088));
    }

    #[test]
    fn parses_clrmamepro_text() {
        let text = r#"
clrmamepro (
	name "Test System"
	description "Test DAT"
)

game (
	name "Super Game (USA)"
	rom ( name "Super Game (USA).nes" size 131088 crc abcd1234 sha1 da39a3ee5e6b4b0d3255bfef95601890afd80709 )
)
"#;
        let dat = parse_dat_bytes(text.as_bytes(), Path::new("test.dat")).unwrap();
        assert_eq!(dat.header.name, "Test System");
        assert_eq!(dat.games.len(), 1);
        assert_eq!(dat.games[0].name, "Super Game (USA)");
        assert_eq!(dat.games[0].roms[0].crc.as_deref(), Some("abcd1234"));
    }

    #[test]
    fn rejects_unbalanced_clrmamepro_text() {
        let text = "game (\n  name \"Broken\"\n";
        let result = parse_dat_bytes(text.as_bytes(), Path::new("broken.dat"));
        assert!(result.is_err());
    }
}
