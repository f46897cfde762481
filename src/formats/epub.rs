//! EPUB package parser.

use crate::error::{AppError, Result};
use crate::library::naming::{author_sort, normalize_name};
use roxmltree::{Document, Node};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use zip::ZipArchive;
use zip::result::ZipError;

const MIMETYPE_ENTRY: &str = "mimetype";
const CONTAINER_ENTRY: &str = "META-INF/container.xml";
const EPUB_MIME: &str = "application/epub+zip";

/// Metadata read from an EPUB package document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageMetadata {
    /// First `dc:title`, or the file stem when the package has none.
    pub title: String,
    /// Primary author.
    pub author: Option<Creator>,
    /// First `dc:date`.
    pub publish_date: Option<String>,
    /// First `dc:publisher`.
    pub publisher: Option<String>,
    /// ISBN identifier.
    pub isbn: Option<String>,
    /// UUID identifier.
    pub uuid: Option<String>,
    /// First `dc:language`.
    pub language: Option<String>,
    /// First `dc:description`.
    pub description: Option<String>,
    /// Archive path of the cover image.
    pub cover: Option<String>,
    /// Archive paths of the content documents in reading order.
    pub toc: Vec<String>,
}

/// A `dc:creator` with its sort form.
#[derive(Debug, Clone, PartialEq)]
pub struct Creator {
    /// Display name.
    pub name: String,
    /// "Last, First" form.
    pub sort: String,
}

/// Parse the package document of the EPUB at `path`.
pub fn parse(path: &Path) -> Result<PackageMetadata> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)?;

    let fallback_title = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Unknown");

    parse_archive(&mut archive, fallback_title)
}

/// Parse an already opened EPUB archive.
pub fn parse_archive<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    fallback_title: &str,
) -> Result<PackageMetadata> {
    let mimetype = read_entry(archive, MIMETYPE_ENTRY)?
        .ok_or_else(|| AppError::MetadataParse("missing mimetype file".into()))?;
    if mimetype.trim() != EPUB_MIME {
        return Err(AppError::MetadataParse(format!(
            "unexpected mimetype '{}'",
            mimetype.trim()
        )));
    }

    let container = read_entry(archive, CONTAINER_ENTRY)?
        .ok_or_else(|| AppError::MetadataParse("missing META-INF/container.xml".into()))?;
    let opf_path = find_opf_path(&container)?;

    let opf = read_entry(archive, &opf_path)?.ok_or_else(|| {
        AppError::MetadataParse(format!("missing package document {}", opf_path))
    })?;
    let opf_dir = opf_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");

    parse_opf(&opf, opf_dir, fallback_title)
}

/// Copy the cover image out of the archive into `dest_dir` as
/// `cover.<ext>`.
///
/// Returns `None` when the package has no cover or the referenced entry is
/// missing.
pub fn extract_cover(
    path: &Path,
    meta: &PackageMetadata,
    dest_dir: &Path,
) -> Result<Option<PathBuf>> {
    let Some(cover) = meta.cover.as_deref() else {
        return Ok(None);
    };

    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)?;

    // Some packages reference the cover with a wrong directory, so fall
    // back to the first entry with the same file name.
    let entry_name = if archive.index_for_name(cover).is_some() {
        cover.to_string()
    } else {
        let base = basename(cover);
        match archive.file_names().find(|name| basename(name) == base) {
            Some(name) => name.to_string(),
            None => {
                tracing::debug!(cover, "Cover entry not found in archive");
                return Ok(None);
            }
        }
    };

    let ext = Path::new(&entry_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "jpg".to_string());
    let dest = dest_dir.join(format!("{}.{}", super::cover::COVER_STEM, ext));

    let mut entry = archive.by_name(&entry_name)?;
    let mut out = File::create(&dest)?;
    std::io::copy(&mut entry, &mut out)?;

    Ok(Some(dest))
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Option<String>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| AppError::MetadataParse(format!("Failed to read {}: {}", name, e)))?;

    Ok(Some(content.trim_start_matches('\u{feff}').to_string()))
}

fn find_opf_path(container: &str) -> Result<String> {
    let doc = Document::parse(container)
        .map_err(|e| AppError::MetadataParse(format!("invalid container.xml: {}", e)))?;

    doc.descendants()
        .find(|n| n.has_tag_name("rootfile"))
        .and_then(|n| n.attribute("full-path"))
        .map(|p| p.trim_start_matches('/').to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::MetadataParse("no rootfile in container.xml".into()))
}

struct ManifestItem<'a> {
    href: &'a str,
    media_type: &'a str,
    properties: &'a str,
}

fn parse_opf(content: &str, opf_dir: &str, fallback_title: &str) -> Result<PackageMetadata> {
    let doc = Document::parse(content)
        .map_err(|e| AppError::MetadataParse(format!("invalid package document: {}", e)))?;

    let package = doc.root_element();
    if !package.has_tag_name("package") {
        return Err(AppError::MetadataParse(format!(
            "unexpected root element <{}>",
            package.tag_name().name()
        )));
    }

    let metadata = child(package, "metadata")
        .ok_or_else(|| AppError::MetadataParse("package has no metadata".into()))?;

    let mut manifest: HashMap<&str, ManifestItem<'_>> = HashMap::new();
    if let Some(node) = child(package, "manifest") {
        for item in node.children().filter(|n| n.has_tag_name("item")) {
            if let (Some(id), Some(href)) = (item.attribute("id"), item.attribute("href")) {
                manifest.insert(
                    id,
                    ManifestItem {
                        href,
                        media_type: item.attribute("media-type").unwrap_or(""),
                        properties: item.attribute("properties").unwrap_or(""),
                    },
                );
            }
        }
    }

    // EPUB 3 attaches creator roles and file-as names through
    // <meta refines="#id" property="...">.
    let mut refinements: HashMap<(&str, &str), String> = HashMap::new();
    let mut cover_meta: Option<&str> = None;
    for meta in metadata.children().filter(|n| n.has_tag_name("meta")) {
        if meta.attribute("name") == Some("cover") {
            cover_meta = meta.attribute("content");
        }
        if let (Some(target), Some(property)) = (meta.attribute("refines"), meta.attribute("property"))
            && let Some(value) = text(meta)
        {
            refinements.insert((target.trim_start_matches('#'), property), value);
        }
    }

    let mut meta = PackageMetadata {
        title: first_text(metadata, "title").unwrap_or_else(|| fallback_title.to_string()),
        publish_date: first_text(metadata, "date"),
        publisher: first_text(metadata, "publisher").map(|p| normalize_name(&p)),
        language: first_text(metadata, "language"),
        description: first_text(metadata, "description"),
        ..Default::default()
    };

    for creator in metadata.children().filter(|n| n.has_tag_name("creator")) {
        let Some(name) = text(creator).map(|n| normalize_name(&n)) else {
            continue;
        };
        let id = creator.attribute("id").unwrap_or("");
        let role = attr_local(creator, "role")
            .map(str::to_string)
            .or_else(|| refinements.get(&(id, "role")).cloned());

        if matches!(role.as_deref(), None | Some("aut")) {
            let sort = attr_local(creator, "file-as")
                .map(str::to_string)
                .or_else(|| refinements.get(&(id, "file-as")).cloned())
                .unwrap_or_else(|| author_sort(&name));
            meta.author = Some(Creator { name, sort });
            break;
        }
    }

    let identifiers: Vec<(Option<String>, String)> = metadata
        .children()
        .filter(|n| n.has_tag_name("identifier"))
        .filter_map(|n| {
            let value = text(n)?;
            Some(classify_identifier(attr_local(n, "scheme"), value))
        })
        .collect();
    meta.isbn = pick_identifier(&identifiers, "ISBN");
    meta.uuid = pick_identifier(&identifiers, "UUID");

    meta.cover = find_cover_href(cover_meta, &manifest).map(|href| resolve_href(opf_dir, href));

    if let Some(spine) = child(package, "spine") {
        meta.toc = spine
            .children()
            .filter(|n| n.has_tag_name("itemref"))
            .filter_map(|n| n.attribute("idref"))
            .filter_map(|idref| manifest.get(idref))
            .map(|item| resolve_href(opf_dir, item.href))
            .collect();
    }

    Ok(meta)
}

/// Cover href: the `<meta name="cover">` pointer (an href or a manifest
/// id), then an EPUB 3 `cover-image` item, then an image item with id
/// "cover".
fn find_cover_href<'a>(
    cover_meta: Option<&'a str>,
    manifest: &HashMap<&str, ManifestItem<'a>>,
) -> Option<&'a str> {
    if let Some(pointer) = cover_meta.map(str::trim).filter(|p| !p.is_empty()) {
        if Path::new(pointer).extension().is_some() && !manifest.contains_key(pointer) {
            return Some(pointer);
        }
        if let Some(item) = manifest.get(pointer)
            && item.media_type.starts_with("image/")
        {
            return Some(item.href);
        }
    }

    if let Some(item) = manifest.values().find(|item| {
        item.properties
            .split_whitespace()
            .any(|p| p == "cover-image")
    }) {
        return Some(item.href);
    }

    manifest
        .iter()
        .find(|(id, item)| id.eq_ignore_ascii_case("cover") && item.media_type.starts_with("image/"))
        .map(|(_, item)| item.href)
}

/// Split `urn:isbn:` and `urn:uuid:` prefixes into a scheme.
fn classify_identifier(scheme: Option<&str>, value: String) -> (Option<String>, String) {
    if let Some(scheme) = scheme.map(str::trim).filter(|s| !s.is_empty()) {
        return (Some(scheme.to_ascii_uppercase()), value);
    }

    let lower = value.to_ascii_lowercase();
    for (prefix, scheme) in [("urn:isbn:", "ISBN"), ("urn:uuid:", "UUID")] {
        if lower.starts_with(prefix) {
            return (Some(scheme.to_string()), value[prefix.len()..].to_string());
        }
    }
    (None, value)
}

/// Identifier tagged with `scheme`, else the first untagged one.
fn pick_identifier(identifiers: &[(Option<String>, String)], scheme: &str) -> Option<String> {
    identifiers
        .iter()
        .find(|(s, _)| s.as_deref() == Some(scheme))
        .or_else(|| identifiers.iter().find(|(s, _)| s.is_none()))
        .map(|(_, value)| value.clone())
}

/// Resolve a manifest href against the package document directory.
fn resolve_href(opf_dir: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href);
    let href = urlencoding::decode(href)
        .map(|h| h.into_owned())
        .unwrap_or_else(|_| href.to_string());

    let mut parts: Vec<&str> = opf_dir.split('/').filter(|p| !p.is_empty()).collect();
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn first_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    node.children()
        .filter(|n| n.has_tag_name(name))
        .find_map(text)
}

fn text(node: Node<'_, '_>) -> Option<String> {
    node.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

/// Attribute by local name, ignoring its namespace (`opf:role`, `opf:scheme`).
fn attr_local<'a>(node: Node<'a, '_>, local: &str) -> Option<&'a str> {
    node.attributes()
        .find(|a| a.name() == local)
        .map(|a| a.value())
}
